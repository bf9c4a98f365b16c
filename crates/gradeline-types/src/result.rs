use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::check::CheckFamily;
use super::task::TaskId;

/// Which family produced a result. `Skipped` marks unrecognized checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Static,
    ContentQuality,
    Dynamic,
    Skipped,
}

impl From<CheckFamily> for CheckKind {
    fn from(family: CheckFamily) -> Self {
        match family {
            CheckFamily::Static => CheckKind::Static,
            CheckFamily::ContentQuality => CheckKind::ContentQuality,
            CheckFamily::Dynamic => CheckKind::Dynamic,
        }
    }
}

/// Output of one check run against one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub task_id: TaskId,
    /// Position of the check in the task's check list.
    pub check_index: usize,
    pub label: String,
    pub kind: CheckKind,
    /// Score in `[0.0, 1.0]`.
    pub score: f64,
    pub reason: String,
    pub evidence: Option<serde_json::Value>,
    pub evaluated_at: DateTime<Utc>,
}

/// Score and explanation produced by a single check before it is bound to a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub score: f64,
    pub reason: String,
    pub evidence: Option<serde_json::Value>,
}

impl Verdict {
    pub fn new(score: f64, reason: impl Into<String>) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Self {
            score,
            reason: reason.into(),
            evidence: None,
        }
    }

    /// true → 1.0, false → 0.0.
    pub fn from_bool(passed: bool, reason: impl Into<String>) -> Self {
        Self::new(if passed { 1.0 } else { 0.0 }, reason)
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::new(0.0, reason)
    }

    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = Some(evidence);
        self
    }
}

impl CheckResult {
    pub fn from_verdict(
        submission_id: Uuid,
        task_id: TaskId,
        check_index: usize,
        label: impl Into<String>,
        kind: CheckKind,
        verdict: Verdict,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submission_id,
            task_id,
            check_index,
            label: label.into(),
            kind,
            score: verdict.score,
            reason: verdict.reason,
            evidence: verdict.evidence,
            evaluated_at: Utc::now(),
        }
    }

    pub fn is_scored(&self) -> bool {
        self.kind != CheckKind::Skipped
    }
}
