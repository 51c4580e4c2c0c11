//! Lexical retrieval over the passage corpus.
//!
//! Two scorers share one inverted-index layout:
//!
//! - **TF-IDF** over unigram and bigram features, smoothed idf
//!   `ln((1 + n) / (1 + df)) + 1`, L2-normalized rows. The query is scored
//!   by cosine similarity against every passage.
//! - **BM25 (Okapi)** over unigrams with `k1 = 1.5`, `b = 0.75`. Terms with a
//!   negative idf fall back to `epsilon * mean idf`.
//!
//! Built indexes are cached under the data path and reused when they were
//! built from a corpus of the same size.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::dataset::{load_contexts, Corpus};
use crate::error::RetrievalError;
use crate::model::{top_k_scores, ScoredIndices};
use crate::tokenize::Tokenize;

pub const TFIDF_FILE: &str = "sparse_embedding.bin";
pub const BM25_FILE: &str = "bm25.bin";
pub const MAX_FEATURES: usize = 50_000;

pub const BM25_K1: f32 = 1.5;
pub const BM25_B: f32 = 0.75;
pub const BM25_EPSILON: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparseMethod {
    Tfidf,
    Bm25,
}

impl SparseMethod {
    pub fn artifact_name(self) -> &'static str {
        match self {
            SparseMethod::Tfidf => TFIDF_FILE,
            SparseMethod::Bm25 => BM25_FILE,
        }
    }
}

impl fmt::Display for SparseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SparseMethod::Tfidf => f.write_str("tfidf"),
            SparseMethod::Bm25 => f.write_str("bm25"),
        }
    }
}

impl FromStr for SparseMethod {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tfidf" => Ok(SparseMethod::Tfidf),
            "bm25" => Ok(SparseMethod::Bm25),
            other => Err(RetrievalError::UnknownSparseMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfIndex {
    vocab: HashMap<String, u32>,
    idf: Vec<f32>,
    /// term -> (passage, normalized weight)
    postings: Vec<Vec<(u32, f32)>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    vocab: HashMap<String, u32>,
    idf: Vec<f32>,
    /// term -> (passage, term frequency)
    postings: Vec<Vec<(u32, u32)>>,
    doc_len: Vec<u32>,
    avgdl: f32,
    k1: f32,
    b: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SparseIndex {
    Tfidf(TfidfIndex),
    Bm25(Bm25Index),
}

#[derive(Debug, Serialize, Deserialize)]
struct SparseArtifact {
    num_passages: usize,
    #[serde(default)]
    tokenizer: String,
    index: SparseIndex,
}

fn unigrams_and_bigrams(tokens: &[String]) -> Vec<String> {
    let mut features = tokens.to_vec();
    features.extend(tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])));
    features
}

fn count_terms(terms: Vec<String>) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for t in terms {
        *counts.entry(t).or_insert(0) += 1;
    }
    counts
}

impl TfidfIndex {
    pub fn build(docs: &[Vec<String>], max_features: usize) -> Self {
        let n = docs.len();
        let doc_counts: Vec<HashMap<String, u32>> = docs
            .par_iter()
            .map(|tokens| count_terms(unigrams_and_bigrams(tokens)))
            .collect();

        let mut totals: HashMap<&str, (u64, u32)> = HashMap::new();
        for counts in &doc_counts {
            for (term, &tf) in counts {
                let entry = totals.entry(term.as_str()).or_insert((0, 0));
                entry.0 += tf as u64;
                entry.1 += 1;
            }
        }

        let mut ranked: Vec<(&str, u64, u32)> =
            totals.into_iter().map(|(t, (tf, df))| (t, tf, df)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked.truncate(max_features);
        ranked.sort_by(|a, b| a.0.cmp(b.0));

        let mut vocab = HashMap::with_capacity(ranked.len());
        let mut idf = Vec::with_capacity(ranked.len());
        for (i, (term, _, df)) in ranked.iter().enumerate() {
            vocab.insert(term.to_string(), i as u32);
            idf.push(((1.0 + n as f32) / (1.0 + *df as f32)).ln() + 1.0);
        }

        let mut postings: Vec<Vec<(u32, f32)>> = vec![Vec::new(); vocab.len()];
        for (doc, counts) in doc_counts.iter().enumerate() {
            let weights: Vec<(u32, f32)> = counts
                .iter()
                .filter_map(|(term, &tf)| {
                    vocab
                        .get(term)
                        .map(|&id| (id, tf as f32 * idf[id as usize]))
                })
                .collect();
            let norm = weights.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
            if norm == 0.0 {
                continue;
            }
            for (id, w) in weights {
                postings[id as usize].push((doc as u32, w / norm));
            }
        }

        Self {
            vocab,
            idf,
            postings,
        }
    }

    pub fn num_features(&self) -> usize {
        self.vocab.len()
    }

    fn scores(&self, query_tokens: &[String], num_passages: usize) -> Vec<f32> {
        let mut scores = vec![0.0f32; num_passages];
        let counts = count_terms(unigrams_and_bigrams(query_tokens));

        let weights: Vec<(u32, f32)> = counts
            .iter()
            .filter_map(|(term, &tf)| {
                self.vocab
                    .get(term)
                    .map(|&id| (id, tf as f32 * self.idf[id as usize]))
            })
            .collect();
        let norm = weights.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
        if norm == 0.0 {
            return scores;
        }

        for (id, w) in weights {
            let qw = w / norm;
            for &(doc, dw) in &self.postings[id as usize] {
                scores[doc as usize] += qw * dw;
            }
        }
        scores
    }
}

impl Bm25Index {
    pub fn build(docs: &[Vec<String>], k1: f32, b: f32, epsilon: f32) -> Self {
        let n = docs.len();
        let doc_counts: Vec<HashMap<String, u32>> = docs
            .par_iter()
            .map(|tokens| count_terms(tokens.clone()))
            .collect();
        let doc_len: Vec<u32> = docs.iter().map(|d| d.len() as u32).collect();
        let avgdl = if n == 0 {
            0.0
        } else {
            doc_len.iter().map(|&l| l as f32).sum::<f32>() / n as f32
        };

        let mut vocab: HashMap<String, u32> = HashMap::new();
        let mut postings: Vec<Vec<(u32, u32)>> = Vec::new();
        for (doc, counts) in doc_counts.into_iter().enumerate() {
            for (term, tf) in counts {
                let next = vocab.len() as u32;
                let id = *vocab.entry(term).or_insert(next);
                if id as usize == postings.len() {
                    postings.push(Vec::new());
                }
                postings[id as usize].push((doc as u32, tf));
            }
        }
        for list in &mut postings {
            list.sort_unstable_by_key(|&(doc, _)| doc);
        }

        let mut idf: Vec<f32> = postings
            .iter()
            .map(|list| {
                let df = list.len() as f32;
                (n as f32 - df + 0.5).ln() - (df + 0.5).ln()
            })
            .collect();
        if !idf.is_empty() {
            let floor = epsilon * idf.iter().sum::<f32>() / idf.len() as f32;
            for v in &mut idf {
                if *v < 0.0 {
                    *v = floor;
                }
            }
        }

        Self {
            vocab,
            idf,
            postings,
            doc_len,
            avgdl,
            k1,
            b,
        }
    }

    fn scores(&self, query_tokens: &[String], num_passages: usize) -> Vec<f32> {
        let mut scores = vec![0.0f32; num_passages];
        if self.avgdl == 0.0 {
            return scores;
        }
        // repeated query terms contribute once per occurrence
        for term in query_tokens {
            let Some(&id) = self.vocab.get(term) else {
                continue;
            };
            let idf = self.idf[id as usize];
            for &(doc, tf) in &self.postings[id as usize] {
                let tf = tf as f32;
                let len_norm = 1.0 - self.b + self.b * self.doc_len[doc as usize] as f32 / self.avgdl;
                scores[doc as usize] += idf * (tf * (self.k1 + 1.0)) / (tf + self.k1 * len_norm);
            }
        }
        scores
    }
}

impl SparseIndex {
    pub fn method(&self) -> SparseMethod {
        match self {
            SparseIndex::Tfidf(_) => SparseMethod::Tfidf,
            SparseIndex::Bm25(_) => SparseMethod::Bm25,
        }
    }

    fn scores(&self, query_tokens: &[String], num_passages: usize) -> Vec<f32> {
        match self {
            SparseIndex::Tfidf(idx) => idx.scores(query_tokens, num_passages),
            SparseIndex::Bm25(idx) => idx.scores(query_tokens, num_passages),
        }
    }
}

pub struct SparseRetrieval {
    tokenizer: Arc<dyn Tokenize>,
    data_path: PathBuf,
    corpus: Arc<Corpus>,
    index: Option<SparseIndex>,
}

impl SparseRetrieval {
    pub fn new(tokenizer: Arc<dyn Tokenize>, data_path: &Path, context_path: &str) -> Result<Self> {
        let corpus = Arc::new(load_contexts(data_path, context_path)?);
        Ok(Self::with_corpus(tokenizer, data_path, corpus))
    }

    pub fn with_corpus(tokenizer: Arc<dyn Tokenize>, data_path: &Path, corpus: Arc<Corpus>) -> Self {
        Self {
            tokenizer,
            data_path: data_path.to_path_buf(),
            corpus,
            index: None,
        }
    }

    pub fn corpus(&self) -> &Arc<Corpus> {
        &self.corpus
    }

    pub fn method(&self) -> Option<SparseMethod> {
        self.index.as_ref().map(SparseIndex::method)
    }

    /// Build or reuse the TF-IDF index.
    pub fn get_sparse_embedding(&mut self) -> Result<()> {
        self.get_embedding(SparseMethod::Tfidf)
    }

    /// Build or reuse the BM25 index.
    pub fn get_bm25_embedding(&mut self) -> Result<()> {
        self.get_embedding(SparseMethod::Bm25)
    }

    #[instrument(skip(self), fields(passages = self.corpus.len()))]
    pub fn get_embedding(&mut self, method: SparseMethod) -> Result<()> {
        let path = self.data_path.join(method.artifact_name());

        let fingerprint = self.tokenizer.fingerprint();

        if path.exists() {
            match read_artifact(&path)? {
                artifact
                    if artifact.num_passages == self.corpus.len()
                        && artifact.index.method() == method
                        && artifact.tokenizer == fingerprint =>
                {
                    info!("loaded {method} index from {}", path.display());
                    self.index = Some(artifact.index);
                    return Ok(());
                }
                artifact => warn!(
                    cached = artifact.num_passages,
                    cached_tokenizer = %artifact.tokenizer,
                    tokenizer = %fingerprint,
                    "cached {method} index does not match the corpus or tokenizer; rebuilding"
                ),
            }
        }

        let docs = self.tokenize_corpus()?;
        let index = match method {
            SparseMethod::Tfidf => {
                let idx = TfidfIndex::build(&docs, MAX_FEATURES);
                debug!(features = idx.num_features(), "built tfidf vocabulary");
                SparseIndex::Tfidf(idx)
            }
            SparseMethod::Bm25 => {
                SparseIndex::Bm25(Bm25Index::build(&docs, BM25_K1, BM25_B, BM25_EPSILON))
            }
        };

        let artifact = SparseArtifact {
            num_passages: self.corpus.len(),
            tokenizer: fingerprint,
            index,
        };
        write_artifact(&path, &artifact)?;
        info!("saved {method} index to {}", path.display());
        self.index = Some(artifact.index);
        Ok(())
    }

    fn tokenize_corpus(&self) -> Result<Vec<Vec<String>>> {
        self.corpus
            .contexts()
            .par_iter()
            .map(|text| self.tokenizer.tokenize(text))
            .collect()
    }

    /// Score of every passage for `query`, indexed by corpus position.
    pub fn scores(&self, query: &str) -> Result<Vec<f32>> {
        let index = self
            .index
            .as_ref()
            .ok_or(RetrievalError::EmbeddingNotBuilt("sparse"))?;
        let tokens = self.tokenizer.tokenize(query)?;
        Ok(index.scores(&tokens, self.corpus.len()))
    }

    pub fn retrieve(&self, query: &str, topk: usize) -> Result<ScoredIndices> {
        Ok(top_k_scores(&self.scores(query)?, topk))
    }

    pub fn retrieve_bulk(&self, queries: &[String], topk: usize) -> Result<Vec<ScoredIndices>> {
        queries
            .par_iter()
            .map(|q| self.retrieve(q, topk))
            .collect()
    }
}

fn read_artifact(path: &Path) -> Result<SparseArtifact> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse sparse index {}", path.display()))
}

fn write_artifact(path: &Path, artifact: &SparseArtifact) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), artifact).context("serialize sparse index")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::HashTokenizer;

    fn corpus() -> Arc<Corpus> {
        Arc::new(Corpus::from_texts([
            "the quick brown fox jumps over the lazy dog",
            "the lazy cat sleeps all day",
            "quick brown rabbits hop in the garden",
            "seoul is the capital of south korea",
        ]))
    }

    fn retriever(dir: &Path) -> SparseRetrieval {
        SparseRetrieval::with_corpus(Arc::new(HashTokenizer::new(128).unwrap()), dir, corpus())
    }

    #[test]
    fn tfidf_ranks_matching_passage_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = retriever(dir.path());
        r.get_sparse_embedding().unwrap();

        let top = r.retrieve("capital of korea", 2).unwrap();
        assert_eq!(top.indices[0], 3);
        assert!(top.scores[0] > top.scores[1]);
        assert!(top.scores[0] <= 1.0 + 1e-5);
    }

    #[test]
    fn bm25_ranks_matching_passage_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = retriever(dir.path());
        r.get_bm25_embedding().unwrap();

        let top = r.retrieve("lazy cat", 4).unwrap();
        assert_eq!(top.indices[0], 1);
        assert_eq!(top.len(), 4);
        assert!(top.scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn bigrams_break_unigram_ties() {
        let docs = vec![
            vec!["brown".to_string(), "quick".to_string()],
            vec!["quick".to_string(), "brown".to_string()],
        ];
        let idx = TfidfIndex::build(&docs, MAX_FEATURES);
        let scores = idx.scores(&["quick".to_string(), "brown".to_string()], 2);
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn max_features_keeps_most_frequent_terms() {
        let docs = vec![
            vec!["a".to_string(), "a".to_string(), "b".to_string()],
            vec!["a".to_string(), "c".to_string()],
        ];
        let idx = TfidfIndex::build(&docs, 1);
        assert_eq!(idx.num_features(), 1);
        assert!(idx.vocab.contains_key("a"));
    }

    #[test]
    fn bm25_negative_idf_uses_epsilon_floor() {
        let doc = |terms: &[&str]| terms.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        let docs = vec![
            doc(&["common", "x"]),
            doc(&["common", "y"]),
            doc(&["common", "z"]),
            doc(&["w"]),
        ];
        let idx = Bm25Index::build(&docs, BM25_K1, BM25_B, BM25_EPSILON);

        let rare = (3.5f32).ln() - (1.5f32).ln();
        let mean = (4.0 * rare - rare) / 5.0;
        let common = idx.idf[idx.vocab["common"] as usize];
        assert!((common - BM25_EPSILON * mean).abs() < 1e-5);
        assert!((idx.idf[idx.vocab["w"] as usize] - rare).abs() < 1e-5);
    }

    #[test]
    fn unknown_terms_score_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = retriever(dir.path());
        r.get_sparse_embedding().unwrap();

        let scores = r.scores("zebra").unwrap();
        assert!(scores.iter().all(|&s| s == 0.0));
        let top = r.retrieve("", 10).unwrap();
        assert_eq!(top.indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn retrieve_before_build_fails() {
        let dir = tempfile::tempdir().unwrap();
        let r = retriever(dir.path());
        let err = r.retrieve("fox", 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RetrievalError>(),
            Some(RetrievalError::EmbeddingNotBuilt(_))
        ));
    }

    #[test]
    fn cached_index_is_reused_and_invalidated_on_corpus_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = retriever(dir.path());
        r.get_bm25_embedding().unwrap();
        assert!(dir.path().join(BM25_FILE).exists());

        let mut again = retriever(dir.path());
        again.get_bm25_embedding().unwrap();
        assert_eq!(
            r.retrieve("quick fox", 2).unwrap(),
            again.retrieve("quick fox", 2).unwrap()
        );

        let smaller = Arc::new(Corpus::from_texts(["only one passage"]));
        let mut other =
            SparseRetrieval::with_corpus(Arc::new(HashTokenizer::new(128).unwrap()), dir.path(), smaller);
        other.get_bm25_embedding().unwrap();
        assert_eq!(other.retrieve("passage", 5).unwrap().len(), 1);
    }

    /// Splits on whitespace without lowercasing.
    struct CaseSensitiveTokenizer;

    impl Tokenize for CaseSensitiveTokenizer {
        fn tokenize(&self, text: &str) -> Result<Vec<String>> {
            Ok(text.split_whitespace().map(str::to_string).collect())
        }

        fn encode(&self, _text: &str, _max_len: usize) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }

        fn fingerprint(&self) -> String {
            "case-sensitive".to_string()
        }
    }

    #[test]
    fn cached_index_is_rebuilt_for_another_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let shouting = Arc::new(Corpus::from_texts(["SEOUL is big", "paris is old", "rome is new"]));
        let mut first =
            SparseRetrieval::with_corpus(Arc::new(CaseSensitiveTokenizer), dir.path(), shouting.clone());
        first.get_bm25_embedding().unwrap();
        assert_eq!(first.scores("seoul").unwrap()[0], 0.0);

        let mut second = SparseRetrieval::with_corpus(
            Arc::new(HashTokenizer::new(128).unwrap()),
            dir.path(),
            shouting,
        );
        second.get_bm25_embedding().unwrap();
        assert!(second.scores("seoul").unwrap()[0] > 0.0);

        let saved = read_artifact(&dir.path().join(BM25_FILE)).unwrap();
        assert_eq!(saved.tokenizer, "hash-words");
    }

    #[test]
    fn bulk_matches_single_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = retriever(dir.path());
        r.get_sparse_embedding().unwrap();

        let queries = vec!["lazy dog".to_string(), "garden rabbits".to_string()];
        let bulk = r.retrieve_bulk(&queries, 2).unwrap();
        assert_eq!(bulk[0], r.retrieve("lazy dog", 2).unwrap());
        assert_eq!(bulk[1].indices[0], 2);
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("BM25".parse::<SparseMethod>().unwrap(), SparseMethod::Bm25);
        assert!("dense".parse::<SparseMethod>().is_err());
    }
}
