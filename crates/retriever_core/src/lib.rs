pub mod config;
pub mod dataset;
pub mod dense;
pub mod encoder;
pub mod error;
pub mod hybrid;
pub mod logistic;
pub mod metrics;
pub mod model;
pub mod orchestration;
pub mod sparse;
pub mod storage;
pub mod timer;
pub mod tokenize;

pub use config::{
    DenseMethod, DeviceKind, RunMode, TrainingArgs, DEFAULT_CONTEXT_PATH, DEFAULT_DATASET,
    DEFAULT_DATA_PATH, DEFAULT_MODEL, DEFAULT_NUM_NEG, DEFAULT_SEED, DEFAULT_TOPK,
    HYBRID_MODEL_FILE,
};
pub use dataset::{concatenate, load_contexts, load_dataset, preview, Corpus};
pub use dense::DenseRetrieval;
pub use encoder::{BertConfig, BertEncoder};
pub use error::RetrievalError;
pub use hybrid::HybridLogisticRetrieval;
pub use logistic::LogisticRegression;
pub use metrics::{mrr, topk_hit, RetrievalSummary};
pub use model::{Answers, QaDataset, QaExample, RetrievalResult, ScoredIndices, ScoredPassage};
pub use orchestration::{PipelineRun, RunStatus};
pub use sparse::{SparseMethod, SparseRetrieval};
pub use storage::{load_results_jsonl, save_results};
pub use timer::Timer;
pub use tokenize::{load_tokenizer, HashTokenizer, HfTokenizer, Tokenize};
