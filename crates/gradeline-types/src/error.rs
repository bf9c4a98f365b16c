use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{DeliveryEvent, DeliveryStatus, TaskId};

#[derive(Debug, Error)]
pub enum GradelineError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error(
        "Missing resolution for placeholder '{placeholder}' in template {template_id} round {round}"
    )]
    MissingResolution {
        template_id: String,
        round: u8,
        placeholder: String,
    },

    #[error("Round limit exceeded for template {template_id}: requested round {requested}, maximum {max}")]
    RoundLimitExceeded {
        template_id: String,
        requested: u8,
        max: u8,
    },

    #[error("Template deprecated: {0}")]
    TemplateDeprecated(String),

    #[error("Delivery transition error: cannot transition from {from:?} via {event:?}")]
    InvalidDeliveryTransition {
        from: DeliveryStatus,
        event: DeliveryEvent,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GradelineError {
    /// Configuration and policy errors abort the caller's request; everything
    /// else is a fault of the pipeline itself.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            GradelineError::UnknownTemplate(_)
                | GradelineError::MissingResolution { .. }
                | GradelineError::RoundLimitExceeded { .. }
                | GradelineError::TemplateDeprecated(_)
                | GradelineError::TaskNotFound(_)
        )
    }
}

impl From<serde_json::Error> for GradelineError {
    fn from(e: serde_json::Error) -> Self {
        GradelineError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GradelineError>;

/// Reasons the intake refuses a completion notice. Each maps to a distinct
/// wire code so recipients can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeRejection {
    #[error("no task with this identifier was issued")]
    UnknownTask,

    #[error("task was issued but never delivered to your endpoint")]
    TaskNotDelivered,

    #[error("nonce does not match the nonce issued with this task")]
    NonceMismatch,

    #[error("a submission for this task was already accepted")]
    DuplicateSubmission,
}

impl IntakeRejection {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            IntakeRejection::UnknownTask | IntakeRejection::TaskNotDelivered => "unknown_task",
            IntakeRejection::NonceMismatch => "nonce_mismatch",
            IntakeRejection::DuplicateSubmission => "duplicate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_codes_are_distinct_for_replay_and_forgery() {
        assert_eq!(IntakeRejection::DuplicateSubmission.code(), "duplicate");
        assert_eq!(IntakeRejection::NonceMismatch.code(), "nonce_mismatch");
        assert_eq!(IntakeRejection::UnknownTask.code(), "unknown_task");
        assert_eq!(IntakeRejection::TaskNotDelivered.code(), "unknown_task");
    }

    #[test]
    fn test_caller_errors() {
        assert!(GradelineError::UnknownTemplate("x".into()).is_caller_error());
        assert!(
            GradelineError::RoundLimitExceeded {
                template_id: "x".into(),
                requested: 4,
                max: 3
            }
            .is_caller_error()
        );
        assert!(!GradelineError::Store("disk full".into()).is_caller_error());
    }
}
