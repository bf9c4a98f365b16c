use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use gradeline_store::Store;
use gradeline_types::{
    ArtifactReference, GradelineError, IntakeRejection, Submission, SubmissionRequest, TaskId,
};

/// Result of one intake request as seen by the submitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcceptOutcome {
    Accepted {
        submission: Submission,
        /// `false` when the evaluation queue was full; the submission is
        /// still recorded and is picked up by the next sweep.
        queued: bool,
    },
    Rejected { reason: IntakeRejection },
}

impl AcceptOutcome {
    /// Wire code: `accepted`, `unknown_task`, `nonce_mismatch` or `duplicate`.
    pub fn code(&self) -> &'static str {
        match self {
            AcceptOutcome::Accepted { .. } => "accepted",
            AcceptOutcome::Rejected { reason } => reason.code(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptOutcome::Accepted { .. })
    }
}

/// Records completion notices and hands them to the evaluator.
///
/// Validation and insert happen in one store call so two concurrent
/// submissions for the same task cannot both be accepted. Evaluation is
/// never performed inline.
#[derive(Clone)]
pub struct SubmissionIntake {
    store: Arc<dyn Store>,
    queue: mpsc::Sender<Submission>,
}

impl SubmissionIntake {
    pub fn new(store: Arc<dyn Store>, queue: mpsc::Sender<Submission>) -> Self {
        Self { store, queue }
    }

    pub async fn accept(
        &self,
        task_id: TaskId,
        nonce: impl Into<String>,
        artifact: ArtifactReference,
    ) -> Result<AcceptOutcome, GradelineError> {
        self.accept_request(SubmissionRequest {
            task_id,
            nonce: nonce.into(),
            artifact,
        })
        .await
    }

    pub async fn accept_request(
        &self,
        request: SubmissionRequest,
    ) -> Result<AcceptOutcome, GradelineError> {
        let task_id = request.task_id.clone();
        let submission = match self.store.record_submission(request).await? {
            Ok(submission) => submission,
            Err(reason) => {
                tracing::warn!(task_id = %task_id, code = reason.code(), "Submission rejected: {reason}");
                return Ok(AcceptOutcome::Rejected { reason });
            }
        };

        let queued = match self.queue.try_send(submission.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    task_id = %task_id,
                    submission_id = %submission.id,
                    "Evaluation queue full; submission left for the next sweep"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!(
                    task_id = %task_id,
                    submission_id = %submission.id,
                    "Evaluation queue closed"
                );
                false
            }
        };

        tracing::info!(task_id = %task_id, submission_id = %submission.id, "Submission accepted");
        Ok(AcceptOutcome::Accepted { submission, queued })
    }
}
