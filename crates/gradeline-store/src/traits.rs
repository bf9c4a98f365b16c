use async_trait::async_trait;
use uuid::Uuid;

use gradeline_types::{
    CheckResult, DeliveryEvent, Exclusion, GradelineError, IntakeRejection, Submission,
    SubmissionRequest, Task, TaskId,
};

use crate::audit::AuditEntry;

/// Outcome of the conditional submission insert.
pub type SubmissionOutcome = std::result::Result<Submission, IntakeRejection>;

/// Persistence Store: the single source of truth for tasks, submissions and results.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a freshly generated task. Fails if the id is taken.
    async fn insert_task(&self, task: Task) -> Result<(), GradelineError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, GradelineError>;

    /// Apply a delivery transition and return the updated task.
    async fn apply_delivery_event(
        &self,
        id: &TaskId,
        event: DeliveryEvent,
    ) -> Result<Task, GradelineError>;

    /// Tasks of one template issued to one recipient, oldest first.
    async fn tasks_for_recipient(
        &self,
        template_id: &str,
        email: &str,
    ) -> Result<Vec<Task>, GradelineError>;

    async fn tasks_for_template(&self, template_id: &str) -> Result<Vec<Task>, GradelineError>;

    /// Validate and record a submission as one atomic step per task id:
    /// the task exists and was delivered, the nonce matches, and no
    /// submission exists yet. The nonce is consumed on success.
    async fn record_submission(
        &self,
        request: SubmissionRequest,
    ) -> Result<SubmissionOutcome, GradelineError>;

    async fn get_submission(&self, task_id: &TaskId) -> Result<Option<Submission>, GradelineError>;

    /// Submissions with no recorded results.
    async fn unevaluated_submissions(&self) -> Result<Vec<Submission>, GradelineError>;

    /// Record the results of one evaluation. A submission is evaluated once.
    async fn append_results(
        &self,
        submission_id: Uuid,
        results: Vec<CheckResult>,
    ) -> Result<(), GradelineError>;

    async fn results_for_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<CheckResult>, GradelineError>;

    async fn record_exclusion(&self, exclusion: Exclusion) -> Result<(), GradelineError>;

    async fn exclusion(
        &self,
        template_id: &str,
        email: &str,
    ) -> Result<Option<Exclusion>, GradelineError>;

    /// Returns `true` if the template was not already deprecated.
    async fn deprecate_template(&self, template_id: &str) -> Result<bool, GradelineError>;

    async fn is_deprecated(&self, template_id: &str) -> Result<bool, GradelineError>;

    /// Full audit chain.
    async fn audit_log(&self) -> Result<Vec<AuditEntry>, GradelineError>;

    async fn verify_audit_integrity(&self) -> Result<bool, GradelineError>;
}
