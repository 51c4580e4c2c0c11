use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::error::RetrievalError;

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const CLS_ID: u32 = 2;
pub const SEP_ID: u32 = 3;
pub const RESERVED_IDS: u32 = 4;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 1469598103934665603;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

/// Text-to-token interface shared by the sparse and dense retrievers.
pub trait Tokenize: Send + Sync {
    /// Surface tokens used as sparse features.
    fn tokenize(&self, text: &str) -> Result<Vec<String>>;

    /// Token ids including special tokens, at most `max_len` long.
    fn encode(&self, text: &str, max_len: usize) -> Result<Vec<u32>>;

    /// Identifies the `tokenize` output; indexes built under a different
    /// fingerprint are stale.
    fn fingerprint(&self) -> String;
}

/// Wraps a `tokenizer.json` from a HuggingFace checkpoint.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    digest: u64,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let inner = tokenizers::Tokenizer::from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", path.display()))?;
        Ok(Self {
            inner,
            digest: fnv1a(&bytes),
        })
    }
}

impl Tokenize for HfTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn encode(&self, text: &str, max_len: usize) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() > max_len && max_len > 0 {
            // keep the trailing [SEP]
            let last = ids[ids.len() - 1];
            ids.truncate(max_len);
            ids[max_len - 1] = last;
        }
        Ok(ids)
    }

    fn fingerprint(&self) -> String {
        format!("hf:{:016x}", self.digest)
    }
}

/// Lowercased alphanumeric words hashed into a fixed vocabulary.
#[derive(Debug, Clone)]
pub struct HashTokenizer {
    vocab_size: u32,
}

impl HashTokenizer {
    /// `vocab_size` must leave room for word ids after the reserved ones.
    pub fn new(vocab_size: usize) -> Result<Self, RetrievalError> {
        match u32::try_from(vocab_size) {
            Ok(vocab_size) if vocab_size > RESERVED_IDS => Ok(Self { vocab_size }),
            _ => Err(RetrievalError::InvalidArgument(format!(
                "hash tokenizer vocab_size must be in {}..={}, got {vocab_size}",
                RESERVED_IDS + 1,
                u32::MAX
            ))),
        }
    }

    fn words(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    fn word_id(&self, word: &str) -> u32 {
        RESERVED_IDS + (fnv1a(word.as_bytes()) % (self.vocab_size - RESERVED_IDS) as u64) as u32
    }
}

impl Tokenize for HashTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        Ok(Self::words(text).collect())
    }

    fn encode(&self, text: &str, max_len: usize) -> Result<Vec<u32>> {
        let budget = max_len.saturating_sub(2);
        let mut ids = Vec::with_capacity(budget + 2);
        ids.push(CLS_ID);
        ids.extend(Self::words(text).take(budget).map(|w| self.word_id(&w)));
        ids.push(SEP_ID);
        Ok(ids)
    }

    // word splitting does not depend on the vocabulary size
    fn fingerprint(&self) -> String {
        "hash-words".to_string()
    }
}

/// Pick the checkpoint's `tokenizer.json` when present, else hash words into
/// `vocab_size` ids.
pub fn load_tokenizer(model_dir: &Path, vocab_size: usize) -> Result<Arc<dyn Tokenize>> {
    let path = model_dir.join("tokenizer.json");
    if path.exists() {
        tracing::info!("using tokenizer {}", path.display());
        Ok(Arc::new(HfTokenizer::from_file(&path)?))
    } else {
        tracing::warn!(
            "no tokenizer.json in {}; falling back to hash tokenizer",
            model_dir.display()
        );
        Ok(Arc::new(HashTokenizer::new(vocab_size)?))
    }
}
