use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Unknown sparse method: {0} (expected tfidf or bm25)")]
    UnknownSparseMethod(String),

    #[error("{0} embedding has not been built; call the matching get_*_embedding first")]
    EmbeddingNotBuilt(&'static str),

    #[error("Hybrid model has not been fitted or loaded")]
    ModelNotFitted,

    #[error("Invalid labels: {0}")]
    InvalidLabels(String),

    #[error("Artifact {artifact} was built for {expected} passages but the corpus has {actual}")]
    CorpusMismatch {
        artifact: String,
        expected: usize,
        actual: usize,
    },

    #[error("Dataset split '{split}' not found under {dir}")]
    MissingSplit { split: String, dir: String },

    #[error("Passage corpus is empty")]
    EmptyCorpus,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
