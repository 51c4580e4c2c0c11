use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answers {
    #[serde(default)]
    pub answer_start: Vec<i32>,
    #[serde(default)]
    pub text: Vec<String>,
}

/// One question/context/answer record of a QA split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaExample {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub context: String,
    pub question: String,
    #[serde(default)]
    pub answers: Answers,
    #[serde(default)]
    pub document_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct QaDataset {
    pub train: Vec<QaExample>,
    pub validation: Vec<QaExample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub index: usize,
    pub score: f32,
}

/// Ranked passages for one query, highest score first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoredIndices {
    pub scores: Vec<f32>,
    pub indices: Vec<usize>,
}

impl ScoredIndices {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ScoredPassage> + '_ {
        self.indices
            .iter()
            .zip(self.scores.iter())
            .map(|(&index, &score)| ScoredPassage { index, score })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub id: String,
    pub question: String,
    /// Retrieved passages joined by a single space.
    pub context: String,
    pub original_context: Option<String>,
    pub answers: Option<Answers>,
    pub retrieved: Vec<ScoredPassage>,
    /// 1-based position of the first retrieved passage equal to the original context.
    pub rank: Option<usize>,
}

impl RetrievalResult {
    pub fn is_correct(&self) -> bool {
        self.rank.is_some()
    }
}

/// Sort `(index, score)` pairs by descending score, lower index first on ties,
/// and keep the first `k`.
pub fn rank_top_k(scored: &mut Vec<ScoredPassage>, k: usize) {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
    scored.truncate(k);
}

/// Top-k selection over a dense score vector indexed by passage.
pub fn top_k_scores(scores: &[f32], k: usize) -> ScoredIndices {
    let k = k.min(scores.len());
    if k == 0 {
        return ScoredIndices::default();
    }

    let mut scored: Vec<ScoredPassage> = scores
        .iter()
        .enumerate()
        .map(|(index, &score)| ScoredPassage { index, score })
        .collect();

    let cmp = |a: &ScoredPassage, b: &ScoredPassage| {
        b.score.total_cmp(&a.score).then(a.index.cmp(&b.index))
    };
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, cmp);
        scored.truncate(k);
    }
    scored.sort_by(cmp);

    ScoredIndices {
        scores: scored.iter().map(|s| s.score).collect(),
        indices: scored.iter().map(|s| s.index).collect(),
    }
}
