use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use gradeline_types::{
    CheckResult, DeliveryEvent, DeliveryStatus, Exclusion, GradelineError, IntakeRejection,
    Submission, SubmissionRequest, Task, TaskId,
};

use crate::audit::{AuditEntry, AuditKind, AuditLog};
use crate::snapshot::PersistedState;
use crate::traits::{Store, SubmissionOutcome};

/// In-memory store (default). Durable through [`crate::FileSnapshot`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tasks: DashMap<TaskId, Task>,
    submissions: DashMap<TaskId, Submission>,
    results: DashMap<Uuid, Vec<CheckResult>>,
    exclusions: DashMap<(String, String), Exclusion>,
    deprecated: DashMap<String, DateTime<Utc>>,
    audit: AuditLog,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a persisted snapshot.
    pub fn from_state(state: PersistedState) -> Self {
        let store = Self {
            audit: AuditLog::from_entries(state.audit),
            ..Self::default()
        };
        for task in state.tasks {
            store.tasks.insert(task.id.clone(), task);
        }
        for submission in state.submissions {
            store
                .submissions
                .insert(submission.task_id.clone(), submission);
        }
        for result in state.results {
            store
                .results
                .entry(result.submission_id)
                .or_default()
                .push(result);
        }
        for exclusion in state.exclusions {
            store.exclusions.insert(
                (exclusion.template_id.clone(), exclusion.email.clone()),
                exclusion,
            );
        }
        for (template_id, at) in state.deprecated {
            store.deprecated.insert(template_id, at);
        }
        store
    }

    /// Capture the current contents for persistence.
    pub async fn snapshot(&self) -> PersistedState {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|r| r.value().clone()).collect();
        tasks.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        let mut results: Vec<CheckResult> = self
            .results
            .iter()
            .flat_map(|r| r.value().clone())
            .collect();
        results.sort_by(|a, b| {
            (a.submission_id, a.check_index).cmp(&(b.submission_id, b.check_index))
        });
        PersistedState {
            tasks,
            submissions: self.submissions.iter().map(|r| r.value().clone()).collect(),
            results,
            exclusions: self.exclusions.iter().map(|r| r.value().clone()).collect(),
            deprecated: self
                .deprecated
                .iter()
                .map(|r| (r.key().clone(), *r.value()))
                .collect(),
            audit: self.audit.entries().await,
        }
    }

    /// The three-part validation and the insert, under the task entry's lock.
    fn try_record(&self, request: &SubmissionRequest) -> SubmissionOutcome {
        let Some(mut task) = self.tasks.get_mut(&request.task_id) else {
            return Err(IntakeRejection::UnknownTask);
        };
        if task.status != DeliveryStatus::Delivered {
            return Err(IntakeRejection::TaskNotDelivered);
        }
        if !task.nonce_matches(&request.nonce) {
            return Err(IntakeRejection::NonceMismatch);
        }
        if task.nonce_consumed {
            return Err(IntakeRejection::DuplicateSubmission);
        }
        match self.submissions.entry(request.task_id.clone()) {
            Entry::Occupied(_) => Err(IntakeRejection::DuplicateSubmission),
            Entry::Vacant(slot) => {
                let submission = Submission::new(
                    request.task_id.clone(),
                    request.nonce.clone(),
                    request.artifact.clone(),
                );
                slot.insert(submission.clone());
                task.nonce_consumed = true;
                Ok(submission)
            }
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_task(&self, task: Task) -> Result<(), GradelineError> {
        let payload = serde_json::json!({
            "template_id": task.template_id,
            "email": task.recipient.email,
            "round": task.round,
            "time_bucket": task.time_bucket,
            "previous_task_id": task.previous_task_id,
        });
        let id = task.id.clone();
        match self.tasks.entry(id.clone()) {
            Entry::Occupied(_) => return Err(GradelineError::DuplicateTask(id)),
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
        }
        self.audit
            .append(AuditKind::TaskIssued, id.as_str(), payload)
            .await;
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, GradelineError> {
        Ok(self.tasks.get(id).map(|t| t.clone()))
    }

    async fn apply_delivery_event(
        &self,
        id: &TaskId,
        event: DeliveryEvent,
    ) -> Result<Task, GradelineError> {
        let updated = {
            let mut task = self
                .tasks
                .get_mut(id)
                .ok_or_else(|| GradelineError::TaskNotFound(id.clone()))?;
            task.apply_delivery_event(event, Utc::now())?;
            task.clone()
        };
        self.audit
            .append(
                AuditKind::DeliveryRecorded,
                id.as_str(),
                serde_json::json!({
                    "event": event,
                    "status": updated.status,
                    "attempts": updated.attempts,
                }),
            )
            .await;
        Ok(updated)
    }

    async fn tasks_for_recipient(
        &self,
        template_id: &str,
        email: &str,
    ) -> Result<Vec<Task>, GradelineError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.template_id == template_id && t.recipient.email == email)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| (a.round, a.issued_at).cmp(&(b.round, b.issued_at)));
        Ok(tasks)
    }

    async fn tasks_for_template(&self, template_id: &str) -> Result<Vec<Task>, GradelineError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.template_id == template_id)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(tasks)
    }

    async fn record_submission(
        &self,
        request: SubmissionRequest,
    ) -> Result<SubmissionOutcome, GradelineError> {
        let outcome = self.try_record(&request);
        // Rejections are logged by intake, not audited.
        if let Ok(submission) = &outcome {
            self.audit
                .append(
                    AuditKind::SubmissionAccepted,
                    request.task_id.as_str(),
                    serde_json::json!({
                        "submission_id": submission.id,
                        "repo_url": submission.artifact.repo_url,
                    }),
                )
                .await;
        }
        Ok(outcome)
    }

    async fn get_submission(&self, task_id: &TaskId) -> Result<Option<Submission>, GradelineError> {
        Ok(self.submissions.get(task_id).map(|s| s.clone()))
    }

    async fn unevaluated_submissions(&self) -> Result<Vec<Submission>, GradelineError> {
        let mut pending: Vec<Submission> = self
            .submissions
            .iter()
            .filter(|s| !self.results.contains_key(&s.id))
            .map(|s| s.value().clone())
            .collect();
        pending.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(pending)
    }

    async fn append_results(
        &self,
        submission_id: Uuid,
        results: Vec<CheckResult>,
    ) -> Result<(), GradelineError> {
        let count = results.len();
        match self.results.entry(submission_id) {
            Entry::Occupied(_) => {
                return Err(GradelineError::Store(format!(
                    "results for submission {submission_id} already recorded"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(results);
            }
        }
        self.audit
            .append(
                AuditKind::ResultsRecorded,
                submission_id.to_string(),
                serde_json::json!({ "results": count }),
            )
            .await;
        Ok(())
    }

    async fn results_for_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<CheckResult>, GradelineError> {
        Ok(self
            .results
            .get(&submission_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn record_exclusion(&self, exclusion: Exclusion) -> Result<(), GradelineError> {
        let key = (exclusion.template_id.clone(), exclusion.email.clone());
        let payload = serde_json::json!({
            "template_id": exclusion.template_id,
            "round": exclusion.round,
            "reason": exclusion.reason,
            "aggregate": exclusion.aggregate,
        });
        let subject = exclusion.email.clone();
        // The first exclusion for a recipient is the one that counts.
        if let Entry::Vacant(slot) = self.exclusions.entry(key) {
            slot.insert(exclusion);
            self.audit
                .append(AuditKind::RecipientExcluded, subject, payload)
                .await;
        }
        Ok(())
    }

    async fn exclusion(
        &self,
        template_id: &str,
        email: &str,
    ) -> Result<Option<Exclusion>, GradelineError> {
        Ok(self
            .exclusions
            .get(&(template_id.to_string(), email.to_string()))
            .map(|e| e.clone()))
    }

    async fn deprecate_template(&self, template_id: &str) -> Result<bool, GradelineError> {
        let newly = match self.deprecated.entry(template_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        };
        if newly {
            self.audit
                .append(
                    AuditKind::TemplateDeprecated,
                    template_id,
                    serde_json::Value::Null,
                )
                .await;
        }
        Ok(newly)
    }

    async fn is_deprecated(&self, template_id: &str) -> Result<bool, GradelineError> {
        Ok(self.deprecated.contains_key(template_id))
    }

    async fn audit_log(&self) -> Result<Vec<AuditEntry>, GradelineError> {
        Ok(self.audit.entries().await)
    }

    async fn verify_audit_integrity(&self) -> Result<bool, GradelineError> {
        Ok(self.audit.verify_integrity().await)
    }
}
