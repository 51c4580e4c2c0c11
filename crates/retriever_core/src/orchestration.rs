use crate::config::RunMode;
use crate::metrics::RetrievalSummary;
use crate::sparse::SparseMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Loading,
    Indexing,
    Training,
    Fitting,
    Retrieving,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMark {
    pub status: RunStatus,
    pub at: DateTime<Utc>,
}

/// Progress record of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub dataset: String,
    pub mode: RunMode,
    pub sparse_method: SparseMethod,
    pub topk: usize,
    pub status: RunStatus,
    pub requested_at: DateTime<Utc>,
    pub stages: Vec<StageMark>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Option<RetrievalSummary>,
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn start(
        run_id: String,
        dataset: String,
        mode: RunMode,
        sparse_method: SparseMethod,
        topk: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            dataset,
            mode,
            sparse_method,
            topk,
            status: RunStatus::Loading,
            requested_at: now,
            stages: vec![StageMark {
                status: RunStatus::Loading,
                at: now,
            }],
            completed_at: None,
            summary: None,
            error: None,
        }
    }

    /// Move to a later working stage. Backward moves, terminal targets and
    /// moves out of a terminal state are ignored.
    pub fn advance(&mut self, next: RunStatus) {
        if self.status.is_terminal() || next.is_terminal() || next <= self.status {
            return;
        }
        self.status = next;
        self.stages.push(StageMark {
            status: next,
            at: Utc::now(),
        });
    }

    pub fn on_failed(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = RunStatus::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn on_completed(&mut self, summary: RetrievalSummary) {
        if self.status != RunStatus::Retrieving {
            return;
        }
        self.status = RunStatus::Completed;
        self.summary = Some(summary);
        self.completed_at = Some(Utc::now());
    }

    pub fn stage_started(&self, status: RunStatus) -> Option<DateTime<Utc>> {
        self.stages.iter().find(|m| m.status == status).map(|m| m.at)
    }
}
