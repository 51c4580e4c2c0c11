use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use rayon::prelude::*;
use tracing::{info, instrument};

use crate::config::RunMode;
use crate::dense::DenseRetrieval;
use crate::error::RetrievalError;
use crate::logistic::LogisticRegression;
use crate::model::{rank_top_k, top_k_scores, QaExample, RetrievalResult, ScoredPassage};
use crate::sparse::SparseRetrieval;

/// Queries scored against the dense index per forward pass.
const QUERY_BATCH: usize = 64;

/// Candidate passage with its `[sparse, dense]` feature pair.
type Candidate = (usize, [f64; 2]);

/// Re-ranks the union of sparse and dense candidates with a logistic
/// regression over their two scores.
pub struct HybridLogisticRetrieval {
    mode: RunMode,
    dataset: Vec<QaExample>,
    data_path: PathBuf,
    sparse: SparseRetrieval,
    dense: DenseRetrieval,
    model: Option<LogisticRegression>,
}

impl HybridLogisticRetrieval {
    pub fn new(
        mode: RunMode,
        dataset: Vec<QaExample>,
        data_path: &Path,
        sparse: SparseRetrieval,
        dense: DenseRetrieval,
    ) -> Result<Self> {
        let (s, d) = (sparse.corpus().len(), dense.corpus().len());
        if s != d {
            bail!(RetrievalError::CorpusMismatch {
                artifact: "dense corpus".to_string(),
                expected: s,
                actual: d,
            });
        }
        Ok(Self {
            mode,
            dataset,
            data_path: data_path.to_path_buf(),
            sparse,
            dense,
            model: None,
        })
    }

    pub fn model(&self) -> Option<&LogisticRegression> {
        self.model.as_ref()
    }

    /// Union of both retrievers' top-k, plus `extra` when given, in first-seen
    /// order.
    fn candidates(
        sparse_scores: &[f32],
        dense_scores: &[f32],
        topk: usize,
        extra: Option<usize>,
    ) -> Vec<Candidate> {
        let mut indices = top_k_scores(sparse_scores, topk).indices;
        for idx in top_k_scores(dense_scores, topk)
            .indices
            .into_iter()
            .chain(extra)
        {
            if !indices.contains(&idx) {
                indices.push(idx);
            }
        }
        indices
            .into_iter()
            .map(|i| (i, [sparse_scores[i] as f64, dense_scores[i] as f64]))
            .collect()
    }

    fn collect_candidates(
        &self,
        questions: &[&str],
        topk: usize,
        gold: Option<&[Option<usize>]>,
    ) -> Result<Vec<Vec<Candidate>>> {
        let sparse = &self.sparse;
        let mut out = Vec::with_capacity(questions.len());

        for (b, chunk) in questions.chunks(QUERY_BATCH).enumerate() {
            let dense_rows = self.dense.scores_batch(chunk)?;
            let sparse_rows = chunk
                .par_iter()
                .map(|q| sparse.scores(q))
                .collect::<Result<Vec<_>>>()?;

            let offset = b * QUERY_BATCH;
            let batch: Vec<Vec<Candidate>> = sparse_rows
                .par_iter()
                .zip(dense_rows.par_iter())
                .enumerate()
                .map(|(i, (s, d))| {
                    let extra = gold.and_then(|g| g[offset + i]);
                    Self::candidates(s, d, topk, extra)
                })
                .collect();
            out.extend(batch);
        }
        Ok(out)
    }

    /// Load the combiner from `data_path/save_name` in eval mode when it
    /// exists, otherwise fit it on the training split and save it there.
    #[instrument(skip(self, labels), fields(examples = self.dataset.len()))]
    pub fn get_logistic_regression(
        &mut self,
        save_name: &str,
        labels: &[i64],
        topk: usize,
    ) -> Result<()> {
        let path = self.data_path.join(save_name);
        if self.mode == RunMode::Eval && path.exists() {
            let model = LogisticRegression::load(&path)?;
            if labels != model.classes.as_slice() {
                bail!(RetrievalError::InvalidLabels(format!(
                    "{} was fitted with labels {:?}, requested {labels:?}",
                    path.display(),
                    model.classes
                )));
            }
            info!("loaded hybrid model from {}", path.display());
            self.model = Some(model);
            return Ok(());
        }

        let [negative, positive] = match labels {
            [n, p] => [*n, *p],
            _ => bail!(RetrievalError::InvalidLabels(format!(
                "expected two labels, got {labels:?}"
            ))),
        };

        let corpus = self.sparse.corpus().clone();
        let questions: Vec<&str> = self.dataset.iter().map(|e| e.question.as_str()).collect();
        let gold: Vec<Option<usize>> = self
            .dataset
            .iter()
            .map(|e| corpus.index_of(&e.context))
            .collect();

        let candidates = self.collect_candidates(&questions, topk, Some(&gold))?;
        let mut x = Vec::new();
        let mut y = Vec::new();
        for (cands, gold) in candidates.iter().zip(&gold) {
            for &(idx, features) in cands {
                x.push(features.to_vec());
                y.push(if Some(idx) == *gold { positive } else { negative });
            }
        }
        info!(
            rows = x.len(),
            positives = y.iter().filter(|&&l| l == positive).count(),
            "fitting hybrid logistic regression"
        );

        let model = LogisticRegression::fit(&x, &y, labels)?;
        model.save(&path)?;
        info!(
            weights = ?model.weights,
            bias = model.bias,
            "saved hybrid model to {}",
            path.display()
        );
        self.model = Some(model);
        Ok(())
    }

    fn rerank(
        &self,
        model: &LogisticRegression,
        cands: Vec<Candidate>,
        topk: usize,
    ) -> Vec<ScoredPassage> {
        let features: Vec<Vec<f64>> = cands.iter().map(|(_, f)| f.to_vec()).collect();
        let mut scored: Vec<ScoredPassage> = cands
            .iter()
            .zip(model.predict_proba(&features))
            .map(|(&(index, _), p)| ScoredPassage {
                index,
                score: p as f32,
            })
            .collect();
        rank_top_k(&mut scored, topk);
        scored
    }

    /// Hybrid top-k for a single question.
    pub fn retrieve_query(&self, query: &str, topk: usize) -> Result<Vec<ScoredPassage>> {
        let model = self.model.as_ref().ok_or(RetrievalError::ModelNotFitted)?;
        let mut cands = self.collect_candidates(&[query], topk, None)?;
        Ok(self.rerank(model, cands.remove(0), topk))
    }

    /// Hybrid top-k for every example, in input order.
    #[instrument(skip(self, queries), fields(queries = queries.len()))]
    pub fn retrieve(&self, queries: &[QaExample], topk: usize) -> Result<Vec<RetrievalResult>> {
        let model = self.model.as_ref().ok_or(RetrievalError::ModelNotFitted)?;
        let corpus = self.sparse.corpus();

        let questions: Vec<&str> = queries.iter().map(|e| e.question.as_str()).collect();
        let candidates = self.collect_candidates(&questions, topk, None)?;

        let results = queries
            .par_iter()
            .zip(candidates.into_par_iter())
            .map(|(example, cands)| {
                let retrieved = self.rerank(model, cands, topk);
                let texts: Vec<&str> = retrieved
                    .iter()
                    .filter_map(|p| corpus.get(p.index))
                    .collect();
                let rank = texts
                    .iter()
                    .position(|t| *t == example.context)
                    .map(|p| p + 1);

                RetrievalResult {
                    id: example.id.clone(),
                    question: example.question.clone(),
                    context: texts.join(" "),
                    original_context: Some(example.context.clone()),
                    answers: Some(example.answers.clone()),
                    retrieved,
                    rank,
                }
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingArgs;
    use crate::dataset::Corpus;
    use crate::encoder::tests::tiny_config;
    use crate::encoder::BertEncoder;
    use crate::model::Answers;
    use crate::tokenize::HashTokenizer;
    use candle_core::Device;
    use std::sync::Arc;

    fn example(id: &str, question: &str, context: &str) -> QaExample {
        QaExample {
            id: id.to_string(),
            title: String::new(),
            context: context.to_string(),
            question: question.to_string(),
            answers: Answers::default(),
            document_id: None,
        }
    }

    fn passages() -> Vec<&'static str> {
        vec![
            "paris is the capital and largest city of france",
            "the nile is the longest river in africa",
            "mount everest is the highest mountain on earth",
            "python is a popular programming language",
            "seoul is the capital of south korea",
            "the amazon rainforest covers much of brazil",
        ]
    }

    fn train_set() -> Vec<QaExample> {
        vec![
            example("t1", "what is the capital of france", passages()[0]),
            example("t2", "which river is longest in africa", passages()[1]),
            example("t3", "highest mountain on earth", passages()[2]),
            example("t4", "popular programming language", passages()[3]),
            example("t5", "capital of south korea", passages()[4]),
        ]
    }

    fn build(dir: &Path, mode: RunMode) -> HybridLogisticRetrieval {
        let corpus = Arc::new(Corpus::from_texts(passages()));
        let tokenizer = Arc::new(HashTokenizer::new(64).unwrap());

        let mut sparse = SparseRetrieval::with_corpus(tokenizer.clone(), dir, corpus.clone());
        sparse.get_bm25_embedding().unwrap();

        let args = TrainingArgs {
            max_seq_len: 16,
            per_device_eval_batch_size: 4,
            ..TrainingArgs::default()
        };
        let mut dense = DenseRetrieval::with_corpus(
            args,
            train_set(),
            dir,
            corpus,
            2,
            tokenizer,
            BertEncoder::new(tiny_config(), &Device::Cpu).unwrap(),
            BertEncoder::new(tiny_config(), &Device::Cpu).unwrap(),
        )
        .unwrap();
        dense.get_passage_embedding(RunMode::Train).unwrap();

        HybridLogisticRetrieval::new(mode, train_set(), dir, sparse, dense).unwrap()
    }

    #[test]
    fn candidates_union_keeps_first_seen_order() {
        let sparse = [0.9, 0.1, 0.5, 0.0];
        let dense = [0.0, 0.8, 0.7, 0.1];
        let cands = HybridLogisticRetrieval::candidates(&sparse, &dense, 2, Some(3));
        let idx: Vec<usize> = cands.iter().map(|c| c.0).collect();
        assert_eq!(idx, vec![0, 2, 1, 3]);
        assert_eq!(cands[1].1, [0.5f32 as f64, 0.7f32 as f64]);
    }

    #[test]
    fn retrieve_before_fit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let hybrid = build(dir.path(), RunMode::Train);
        let err = hybrid.retrieve(&train_set(), 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RetrievalError>(),
            Some(RetrievalError::ModelNotFitted)
        ));
    }

    #[test]
    fn fit_saves_model_and_ranks_gold_passages() {
        let dir = tempfile::tempdir().unwrap();
        let mut hybrid = build(dir.path(), RunMode::Train);
        hybrid
            .get_logistic_regression("hybrid_logistic.bin", &[0, 1], 2)
            .unwrap();
        assert!(dir.path().join("hybrid_logistic.bin").exists());

        let results = hybrid.retrieve(&train_set(), 2).unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].id, "t1");
        for r in &results {
            assert!(r.retrieved.len() <= 2);
            assert!(r.retrieved.windows(2).all(|w| w[0].score >= w[1].score));
        }
        // lexical overlap dominates on this corpus
        assert!(hybrid.model().unwrap().weights[0] > 0.0);
        assert!(results.iter().filter(|r| r.rank.is_some()).count() >= 3);

        let single = hybrid.retrieve_query("capital of south korea", 2).unwrap();
        assert!(single.iter().any(|p| p.index == 4));
    }

    #[test]
    fn eval_mode_reuses_saved_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut trained = build(dir.path(), RunMode::Train);
        trained
            .get_logistic_regression("hybrid_logistic.bin", &[0, 1], 2)
            .unwrap();

        let mut eval = build(dir.path(), RunMode::Eval);
        eval.get_logistic_regression("hybrid_logistic.bin", &[0, 1], 2)
            .unwrap();
        assert_eq!(
            eval.model().unwrap().classes,
            trained.model().unwrap().classes
        );

        let err = eval
            .get_logistic_regression("hybrid_logistic.bin", &[1, 2], 2)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RetrievalError>(),
            Some(RetrievalError::InvalidLabels(_))
        ));
    }
}
