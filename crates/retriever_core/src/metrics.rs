//! Retrieval quality over a batch of [`RetrievalResult`]s.
//!
//! A result counts as a hit when the original context is among its
//! retrieved passages; its reciprocal rank is `1 / rank` of the first such
//! passage and 0 otherwise.

use serde::{Deserialize, Serialize};

use crate::model::RetrievalResult;

/// Number of queries whose original context was retrieved.
pub fn topk_hit(results: &[RetrievalResult]) -> usize {
    results.iter().filter(|r| r.is_correct()).count()
}

/// Mean Reciprocal Rank over all queries; 0 for an empty batch.
pub fn mrr(results: &[RetrievalResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let total: f64 = results
        .iter()
        .filter_map(|r| r.rank)
        .map(|rank| 1.0 / rank as f64)
        .sum();
    total / results.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub total: usize,
    pub topk_hit: usize,
    pub hit_rate: f64,
    pub mrr: f64,
}

impl RetrievalSummary {
    pub fn from_results(results: &[RetrievalResult]) -> Self {
        let total = results.len();
        let hits = topk_hit(results);
        Self {
            total,
            topk_hit: hits,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            mrr: mrr(results),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(rank: Option<usize>) -> RetrievalResult {
        RetrievalResult {
            id: "q".into(),
            question: "q".into(),
            context: String::new(),
            original_context: Some("gold".into()),
            answers: None,
            retrieved: Vec::new(),
            rank,
        }
    }

    #[test]
    fn mrr_averages_reciprocal_ranks_including_misses() {
        let results = vec![result(Some(1)), result(Some(2)), result(None), result(Some(4))];
        assert!((mrr(&results) - (1.0 + 0.5 + 0.0 + 0.25) / 4.0).abs() < 1e-12);
        assert_eq!(topk_hit(&results), 3);
    }

    #[test]
    fn empty_batch_scores_zero() {
        assert_eq!(mrr(&[]), 0.0);
        assert_eq!(topk_hit(&[]), 0);
        let summary = RetrievalSummary::from_results(&[]);
        assert_eq!(summary.hit_rate, 0.0);
    }

    #[test]
    fn summary_reports_hit_rate() {
        let summary = RetrievalSummary::from_results(&[result(Some(1)), result(None)]);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.topk_hit, 1);
        assert!((summary.hit_rate - 0.5).abs() < 1e-12);
        assert!((summary.mrr - 0.5).abs() < 1e-12);
    }
}
