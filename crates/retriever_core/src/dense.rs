use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::config::{RunMode, TrainingArgs};
use crate::dataset::{load_contexts, Corpus};
use crate::encoder::BertEncoder;
use crate::error::RetrievalError;
use crate::model::{top_k_scores, QaExample, ScoredIndices};
use crate::tokenize::Tokenize;

pub const ENCODER_DIR: &str = "dense";
pub const P_ENCODER_FILE: &str = "p_encoder.safetensors";
pub const Q_ENCODER_FILE: &str = "q_encoder.safetensors";
pub const PASSAGE_EMBEDDING_FILE: &str = "dense_embedding.safetensors";
const PASSAGE_TENSOR: &str = "passage_embedding";

/// Bi-encoder retriever: passages and questions are encoded separately and
/// scored by dot product.
pub struct DenseRetrieval {
    args: TrainingArgs,
    dataset: Vec<QaExample>,
    data_path: PathBuf,
    corpus: Arc<Corpus>,
    num_neg: usize,
    tokenizer: Arc<dyn Tokenize>,
    p_encoder: BertEncoder,
    q_encoder: BertEncoder,
    /// `[hidden, passages]`, contiguous.
    passage_matrix: Option<Tensor>,
}

impl DenseRetrieval {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        args: TrainingArgs,
        dataset: Vec<QaExample>,
        data_path: &Path,
        context_path: &str,
        num_neg: usize,
        tokenizer: Arc<dyn Tokenize>,
        p_encoder: BertEncoder,
        q_encoder: BertEncoder,
    ) -> Result<Self> {
        let corpus = Arc::new(load_contexts(data_path, context_path)?);
        Self::with_corpus(
            args, dataset, data_path, corpus, num_neg, tokenizer, p_encoder, q_encoder,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_corpus(
        mut args: TrainingArgs,
        dataset: Vec<QaExample>,
        data_path: &Path,
        corpus: Arc<Corpus>,
        num_neg: usize,
        tokenizer: Arc<dyn Tokenize>,
        p_encoder: BertEncoder,
        q_encoder: BertEncoder,
    ) -> Result<Self> {
        args.validate()?;
        if p_encoder.hidden_size() != q_encoder.hidden_size() {
            bail!(RetrievalError::InvalidArgument(format!(
                "passage encoder width {} differs from query encoder width {}",
                p_encoder.hidden_size(),
                q_encoder.hidden_size()
            )));
        }
        let positions = p_encoder
            .config()
            .max_position_embeddings
            .min(q_encoder.config().max_position_embeddings);
        if args.max_seq_len > positions {
            info!(
                requested = args.max_seq_len,
                max_seq_len = positions,
                "truncating inputs to the encoder's position table"
            );
            args.max_seq_len = positions;
        }
        Ok(Self {
            args,
            dataset,
            data_path: data_path.to_path_buf(),
            corpus,
            num_neg,
            tokenizer,
            p_encoder,
            q_encoder,
            passage_matrix: None,
        })
    }

    pub fn corpus(&self) -> &Arc<Corpus> {
        &self.corpus
    }

    fn encoder_path(&self, file: &str) -> PathBuf {
        self.data_path.join(ENCODER_DIR).join(file)
    }

    fn encode_texts<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Result<Vec<Vec<u32>>> {
        texts
            .par_iter()
            .map(|t| self.tokenizer.encode(t.as_ref(), self.args.max_seq_len))
            .collect()
    }

    /// Pick `num_neg` distinct passages whose text differs from `positive`.
    fn sample_negatives(&self, rng: &mut StdRng, positive: &str) -> Vec<usize> {
        let mut picked = Vec::with_capacity(self.num_neg);
        while picked.len() < self.num_neg {
            let idx = rng.random_range(0..self.corpus.len());
            if picked.contains(&idx) || self.corpus.get(idx) == Some(positive) {
                continue;
            }
            picked.push(idx);
        }
        picked
    }

    fn check_trainable(&self) -> Result<()> {
        if self.dataset.is_empty() {
            bail!(RetrievalError::InvalidArgument(
                "dense training needs at least one training example".to_string()
            ));
        }
        let available = self.corpus.len() - usize::from(
            self.dataset
                .iter()
                .any(|ex| self.corpus.index_of(&ex.context).is_some()),
        );
        if self.num_neg == 0 || self.num_neg > available {
            bail!(RetrievalError::InvalidArgument(format!(
                "num_neg must be between 1 and {available} for a corpus of {} passages",
                self.corpus.len()
            )));
        }
        Ok(())
    }

    /// Train both encoders with one positive and `num_neg` sampled negatives
    /// per question, then save them under the data path. Returns the mean
    /// loss of every epoch.
    #[instrument(skip(self), fields(examples = self.dataset.len(), num_neg = self.num_neg))]
    pub fn train(&mut self) -> Result<Vec<f32>> {
        self.check_trainable()?;

        let device = self.p_encoder.device().clone();
        if let Err(err) = device.set_seed(self.args.seed) {
            debug!("device rng not seeded: {err}");
        }
        let mut rng = StdRng::seed_from_u64(self.args.seed);

        let mut vars = self.p_encoder.vars();
        vars.extend(self.q_encoder.vars());
        let mut optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: self.args.learning_rate,
                weight_decay: self.args.weight_decay,
                ..Default::default()
            },
        )?;

        let group = 1 + self.num_neg;
        let hidden = self.p_encoder.hidden_size();
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        let mut epoch_losses = Vec::with_capacity(self.args.num_train_epochs);

        for epoch in 0..self.args.num_train_epochs {
            order.shuffle(&mut rng);
            let mut total = 0.0f32;
            let mut steps = 0usize;

            for chunk in order.chunks(self.args.per_device_train_batch_size) {
                let mut questions = Vec::with_capacity(chunk.len());
                let mut passages = Vec::with_capacity(chunk.len() * group);
                for &i in chunk {
                    let example = &self.dataset[i];
                    questions.push(example.question.as_str());
                    passages.push(example.context.as_str());
                    for neg in self.sample_negatives(&mut rng, &example.context) {
                        passages.push(&self.corpus.contexts()[neg]);
                    }
                }

                let q_ids = self.encode_texts(&questions)?;
                let p_ids = self.encode_texts(&passages)?;
                let batch = chunk.len();

                let q = self.q_encoder.encode_batch(&q_ids)?;
                let p = self
                    .p_encoder
                    .encode_batch(&p_ids)?
                    .reshape((batch, group, hidden))?;

                // [batch, group]; the positive passage is always column 0
                let sim = p.matmul(&q.unsqueeze(2)?)?.squeeze(2)?;
                let log_probs = candle_nn::ops::log_softmax(&sim, D::Minus1)?;
                let targets = Tensor::zeros(batch, DType::U32, &device)?;
                let loss = candle_nn::loss::nll(&log_probs, &targets)?;
                optimizer.backward_step(&loss)?;

                let value = loss.to_scalar::<f32>()?;
                total += value;
                steps += 1;
                if steps % 100 == 0 {
                    debug!(epoch, steps, loss = value, "training step");
                }
            }

            let mean = total / steps.max(1) as f32;
            info!(epoch = epoch + 1, loss = mean, "finished dense epoch");
            epoch_losses.push(mean);
        }

        self.p_encoder.save(&self.encoder_path(P_ENCODER_FILE))?;
        self.q_encoder.save(&self.encoder_path(Q_ENCODER_FILE))?;
        info!(
            "saved encoders to {}",
            self.data_path.join(ENCODER_DIR).display()
        );
        Ok(epoch_losses)
    }

    /// Load encoders saved by a previous [`train`](Self::train).
    pub fn load_model(&mut self) -> Result<()> {
        for (file, encoder) in [
            (P_ENCODER_FILE, &self.p_encoder),
            (Q_ENCODER_FILE, &self.q_encoder),
        ] {
            let path = self.data_path.join(ENCODER_DIR).join(file);
            if !path.exists() {
                bail!(
                    "trained encoder {} not found; run with --mode train first",
                    path.display()
                );
            }
            encoder.load_weights(&path)?;
        }
        Ok(())
    }

    /// Encode the corpus, or in eval mode reuse the saved embedding when one
    /// exists.
    #[instrument(skip(self), fields(passages = self.corpus.len()))]
    pub fn get_passage_embedding(&mut self, mode: RunMode) -> Result<()> {
        let path = self.data_path.join(PASSAGE_EMBEDDING_FILE);

        if mode == RunMode::Eval && path.exists() {
            let mut tensors = candle_core::safetensors::load(&path, self.p_encoder.device())
                .with_context(|| format!("load {}", path.display()))?;
            let embedding = tensors
                .remove(PASSAGE_TENSOR)
                .with_context(|| format!("{} has no '{PASSAGE_TENSOR}'", path.display()))?;
            let (rows, cols) = embedding.dims2()?;
            if rows != self.corpus.len() {
                bail!(RetrievalError::CorpusMismatch {
                    artifact: path.display().to_string(),
                    expected: rows,
                    actual: self.corpus.len(),
                });
            }
            if cols != self.q_encoder.hidden_size() {
                bail!(
                    "{} holds {cols}-wide vectors but the query encoder produces {}",
                    path.display(),
                    self.q_encoder.hidden_size()
                );
            }
            info!("loaded passage embedding from {}", path.display());
            self.passage_matrix = Some(embedding.t()?.contiguous()?);
            return Ok(());
        }

        let ids = self.encode_texts(self.corpus.contexts())?;
        let batch_size = self.args.per_device_eval_batch_size;
        let total = ids.len();
        let mut parts = Vec::with_capacity(total.div_ceil(batch_size));
        for (b, batch) in ids.chunks(batch_size).enumerate() {
            let done = (b * batch_size + batch.len()).min(total);
            if done % 1000 < batch.len() || done == total {
                info!("embedding passages {done}/{total} ...");
            }
            parts.push(self.p_encoder.encode_batch(batch)?.detach());
        }
        let embedding = Tensor::cat(&parts, 0)?;

        let tensors = HashMap::from([(PASSAGE_TENSOR.to_string(), embedding.clone())]);
        candle_core::safetensors::save(&tensors, &path)
            .with_context(|| format!("save {}", path.display()))?;
        info!("saved passage embedding to {}", path.display());

        self.passage_matrix = Some(embedding.t()?.contiguous()?);
        Ok(())
    }

    /// Dot-product scores against every passage, one row per query.
    pub fn scores_batch<S: AsRef<str> + Sync>(&self, queries: &[S]) -> Result<Vec<Vec<f32>>> {
        let matrix = self
            .passage_matrix
            .as_ref()
            .ok_or(RetrievalError::EmbeddingNotBuilt("dense passage"))?;
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self.encode_texts(queries)?;
        let mut rows = Vec::with_capacity(queries.len());
        for batch in ids.chunks(self.args.per_device_eval_batch_size) {
            let q = self.q_encoder.encode_batch(batch)?.detach();
            rows.extend(q.matmul(matrix)?.to_vec2::<f32>()?);
        }
        Ok(rows)
    }

    pub fn scores(&self, query: &str) -> Result<Vec<f32>> {
        Ok(self.scores_batch(&[query])?.remove(0))
    }

    pub fn retrieve(&self, query: &str, topk: usize) -> Result<ScoredIndices> {
        Ok(top_k_scores(&self.scores(query)?, topk))
    }

    pub fn retrieve_bulk(&self, queries: &[String], topk: usize) -> Result<Vec<ScoredIndices>> {
        Ok(self
            .scores_batch(queries)?
            .iter()
            .map(|row| top_k_scores(row, topk))
            .collect())
    }
}
