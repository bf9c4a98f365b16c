use std::collections::HashSet;
use std::sync::Arc;

use gradeline_dispatch::Dispatcher;
use gradeline_generator::{IssuanceContext, TaskGenerator};
use gradeline_store::Store;
use gradeline_types::{
    Cohort, DeliveryStatus, Exclusion, ExclusionReason, GradelineError, Recipient, Task, TaskId,
};

use crate::policy::AggregatePolicy;

/// Result of starting a cohort on round 1.
#[derive(Debug, Clone)]
pub struct StartReport {
    pub template_id: String,
    pub issued: Vec<Task>,
    /// Recipients that already hold a task for the template or were excluded.
    pub skipped: Vec<String>,
}

/// Result of advancing a cohort from one round to the next.
#[derive(Debug, Clone)]
pub struct AdvanceReport {
    pub template_id: String,
    pub from_round: u8,
    pub issued: Vec<Task>,
    pub excluded: Vec<Exclusion>,
    /// Recipients whose delivery or evaluation has not finished yet.
    pub pending: Vec<String>,
    /// Recipients that already hold a task for the next round.
    pub already_issued: Vec<String>,
}

impl AdvanceReport {
    pub fn next_round(&self) -> u8 {
        self.from_round + 1
    }
}

#[derive(Debug, Clone)]
pub struct DeprecationReport {
    pub template_id: String,
    /// `false` when the template was already deprecated.
    pub newly_deprecated: bool,
    pub cancelled: Vec<TaskId>,
}

/// Where a recipient stands after its `from_round` task.
enum Standing {
    Eligible,
    Pending,
    Excluded(Exclusion),
}

/// Moves cohorts through the rounds of a template.
pub struct RoundController {
    generator: Arc<TaskGenerator>,
    dispatcher: Dispatcher,
    store: Arc<dyn Store>,
    policy: AggregatePolicy,
}

impl RoundController {
    pub fn new(
        generator: Arc<TaskGenerator>,
        dispatcher: Dispatcher,
        store: Arc<dyn Store>,
        policy: AggregatePolicy,
    ) -> Self {
        Self {
            generator,
            dispatcher,
            store,
            policy,
        }
    }

    pub fn policy(&self) -> &AggregatePolicy {
        &self.policy
    }

    /// Issue round 1 to every recipient of the cohort and queue its delivery.
    pub async fn start(&self, cohort: &Cohort) -> Result<StartReport, GradelineError> {
        let template_id = cohort.template_id.as_str();
        self.ensure_active(template_id).await?;
        self.generator.registry().get(template_id)?;

        let context = IssuanceContext::now();
        let mut report = StartReport {
            template_id: template_id.to_string(),
            issued: Vec::new(),
            skipped: Vec::new(),
        };

        for recipient in unique(&cohort.recipients) {
            let email = recipient.email.as_str();
            if self.store.exclusion(template_id, email).await?.is_some()
                || !self
                    .store
                    .tasks_for_recipient(template_id, email)
                    .await?
                    .is_empty()
            {
                report.skipped.push(email.to_string());
                continue;
            }
            let task = self
                .generator
                .generate(template_id, recipient, 1, &context)
                .await?;
            self.dispatcher.enqueue(&task);
            report.issued.push(task);
        }

        tracing::info!(
            template_id = %template_id,
            issued = report.issued.len(),
            skipped = report.skipped.len(),
            "Cohort started"
        );
        Ok(report)
    }

    /// Issue round `from_round + 1` to every recipient whose `from_round`
    /// aggregate meets the threshold. Everyone else is excluded or reported
    /// pending. Fails with `RoundLimitExceeded` before creating anything.
    pub async fn advance(
        &self,
        cohort: &Cohort,
        from_round: u8,
    ) -> Result<AdvanceReport, GradelineError> {
        let template_id = cohort.template_id.as_str();
        self.ensure_active(template_id).await?;
        let template = self.generator.registry().get(template_id)?;
        let max = self.generator.max_rounds(template);
        let next = from_round.saturating_add(1);
        if from_round == 0 || next > max || template.round(next).is_none() {
            tracing::warn!(
                template_id = %template_id,
                requested = next,
                max,
                "Refusing to advance past the round limit"
            );
            return Err(GradelineError::RoundLimitExceeded {
                template_id: template_id.to_string(),
                requested: next,
                max,
            });
        }

        let context = IssuanceContext::now();
        let mut report = AdvanceReport {
            template_id: template_id.to_string(),
            from_round,
            issued: Vec::new(),
            excluded: Vec::new(),
            pending: Vec::new(),
            already_issued: Vec::new(),
        };

        for recipient in unique(&cohort.recipients) {
            let email = recipient.email.as_str();
            if let Some(existing) = self.store.exclusion(template_id, email).await? {
                report.excluded.push(existing);
                continue;
            }

            let tasks = self.store.tasks_for_recipient(template_id, email).await?;
            if tasks.iter().any(|t| t.round == next) {
                report.already_issued.push(email.to_string());
                continue;
            }

            match self.standing(template_id, email, from_round, &tasks).await? {
                Standing::Pending => report.pending.push(email.to_string()),
                Standing::Excluded(exclusion) => {
                    tracing::info!(
                        template_id = %template_id,
                        email = %email,
                        reason = ?exclusion.reason,
                        "Recipient excluded"
                    );
                    self.store.record_exclusion(exclusion.clone()).await?;
                    report.excluded.push(exclusion);
                }
                Standing::Eligible => {
                    let task = self
                        .generator
                        .generate(template_id, recipient, next, &context)
                        .await?;
                    self.dispatcher.enqueue(&task);
                    report.issued.push(task);
                }
            }
        }

        tracing::info!(
            template_id = %template_id,
            round = next,
            issued = report.issued.len(),
            excluded = report.excluded.len(),
            pending = report.pending.len(),
            "Cohort advanced"
        );
        Ok(report)
    }

    /// Deprecate a template: no further starts or advances, retry timelines
    /// cancelled, and recipients with a cancelled delivery excluded.
    pub async fn deprecate(&self, template_id: &str) -> Result<DeprecationReport, GradelineError> {
        self.generator.registry().get(template_id)?;
        let newly_deprecated = self.store.deprecate_template(template_id).await?;
        let cancelled = self.dispatcher.cancel_template(template_id).await?;

        // Also covers timelines that noticed the cancellation on their own.
        for task in self.store.tasks_for_template(template_id).await? {
            if task.status != DeliveryStatus::Cancelled {
                continue;
            }
            if self
                .store
                .exclusion(template_id, &task.recipient.email)
                .await?
                .is_none()
            {
                self.store
                    .record_exclusion(Exclusion::new(
                        template_id,
                        &task.recipient.email,
                        task.round,
                        ExclusionReason::TemplateDeprecated,
                    ))
                    .await?;
            }
        }

        tracing::info!(
            template_id = %template_id,
            newly_deprecated,
            cancelled = cancelled.len(),
            "Template deprecated"
        );
        Ok(DeprecationReport {
            template_id: template_id.to_string(),
            newly_deprecated,
            cancelled,
        })
    }

    async fn ensure_active(&self, template_id: &str) -> Result<(), GradelineError> {
        if self.store.is_deprecated(template_id).await? {
            return Err(GradelineError::TemplateDeprecated(template_id.to_string()));
        }
        Ok(())
    }

    async fn standing(
        &self,
        template_id: &str,
        email: &str,
        round: u8,
        tasks: &[Task],
    ) -> Result<Standing, GradelineError> {
        let exclude = |reason: ExclusionReason| -> Result<Standing, GradelineError> {
            Ok(Standing::Excluded(Exclusion::new(template_id, email, round, reason)))
        };

        let Some(task) = tasks.iter().rev().find(|t| t.round == round) else {
            return exclude(ExclusionReason::NeverIssued);
        };
        match task.status {
            DeliveryStatus::Pending => return Ok(Standing::Pending),
            DeliveryStatus::FailedExhausted | DeliveryStatus::Cancelled => {
                return exclude(ExclusionReason::DeliveryFailed);
            }
            DeliveryStatus::Delivered => {}
        }

        let Some(submission) = self.store.get_submission(&task.id).await? else {
            return exclude(ExclusionReason::NoSubmission);
        };
        let results = self.store.results_for_submission(submission.id).await?;
        if results.is_empty() {
            return Ok(Standing::Pending);
        }

        let aggregate = self.policy.aggregate(task, &results);
        if self.policy.is_eligible(aggregate) {
            tracing::debug!(task_id = %task.id, aggregate, "Recipient eligible");
            Ok(Standing::Eligible)
        } else {
            Ok(Standing::Excluded(
                Exclusion::new(template_id, email, round, ExclusionReason::BelowThreshold)
                    .with_aggregate(aggregate),
            ))
        }
    }
}

/// Cohort recipients with repeated emails dropped, first entry wins.
fn unique(recipients: &[Recipient]) -> Vec<&Recipient> {
    let mut seen = HashSet::new();
    recipients
        .iter()
        .filter(|r| seen.insert(r.email.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gradeline_dispatch::{DeliveryOutcome, RetryPolicy, Transport, TransportError};
    use gradeline_generator::{SignedPayload, TemplateRegistry};
    use gradeline_store::InMemoryStore;
    use gradeline_types::{
        ArtifactReference, CheckKind, CheckResult, SubmissionRequest, Verdict,
    };
    use tokio::sync::watch;

    /// Succeeds unless the endpoint contains "down".
    struct EndpointTransport;

    #[async_trait]
    impl Transport for EndpointTransport {
        async fn send(&self, endpoint: &str, _payload: &SignedPayload) -> Result<(), TransportError> {
            if endpoint.contains("down") {
                Err(TransportError::Status(503))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        controller: RoundController,
        dispatcher: Dispatcher,
        store: Arc<InMemoryStore>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(TemplateRegistry::builtin().unwrap());
        let generator = Arc::new(TaskGenerator::new(registry, store.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::spawn(
            store.clone(),
            Arc::new(EndpointTransport),
            RetryPolicy::default(),
            "http://localhost:8080/api/v1/submissions",
            shutdown_rx,
        );
        let controller = RoundController::new(
            generator,
            dispatcher.clone(),
            store.clone(),
            AggregatePolicy::new(0.5),
        );
        Harness {
            controller,
            dispatcher,
            store,
            _shutdown: shutdown_tx,
        }
    }

    fn recipient(email: &str, endpoint: &str) -> Recipient {
        Recipient::new(email, endpoint, "s3cret")
    }

    fn cohort(recipients: Vec<Recipient>) -> Cohort {
        Cohort::new("sum-of-sales", recipients)
    }

    async fn settle(outcomes: &mut tokio::sync::broadcast::Receiver<DeliveryOutcome>, count: usize) {
        for _ in 0..count {
            outcomes.recv().await.unwrap();
        }
    }

    /// Submit for `task` and record one result per check with `score`.
    async fn submit_scored(store: &InMemoryStore, task: &Task, score: Option<f64>) {
        let submission = store
            .record_submission(SubmissionRequest {
                task_id: task.id.clone(),
                nonce: task.nonce.clone(),
                artifact: ArtifactReference::new("https://github.com/a/site"),
            })
            .await
            .unwrap()
            .unwrap();
        if let Some(score) = score {
            let results = task
                .checks
                .iter()
                .enumerate()
                .map(|(i, entry)| {
                    CheckResult::from_verdict(
                        submission.id,
                        task.id.clone(),
                        i,
                        &entry.label,
                        CheckKind::Static,
                        Verdict::new(score, "scored"),
                    )
                })
                .collect();
            store.append_results(submission.id, results).await.unwrap();
        }
    }

    fn issued_to<'a>(tasks: &'a [Task], email: &str) -> &'a Task {
        tasks.iter().find(|t| t.recipient.email == email).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_delivery_excluded_from_round_two() {
        let h = harness();
        let mut outcomes = h.dispatcher.subscribe();
        let cohort = cohort(vec![recipient("a@x.edu", "http://down.invalid/hook")]);

        let started = h.controller.start(&cohort).await.unwrap();
        assert_eq!(started.issued.len(), 1);
        settle(&mut outcomes, 1).await;
        let task = h.store.get_task(&started.issued[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, DeliveryStatus::FailedExhausted);

        let report = h.controller.advance(&cohort, 1).await.unwrap();
        assert!(report.issued.is_empty());
        assert_eq!(report.excluded.len(), 1);
        assert_eq!(report.excluded[0].reason, ExclusionReason::DeliveryFailed);
        let recorded = h.store.exclusion("sum-of-sales", "a@x.edu").await.unwrap().unwrap();
        assert_eq!(recorded.round, 1);
        assert_eq!(h.store.tasks_for_template("sum-of-sales").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_beyond_maximum_creates_nothing() {
        let h = harness();
        let cohort = cohort(vec![recipient("a@x.edu", "http://up.invalid/hook")]);

        let err = h.controller.advance(&cohort, 3).await.unwrap_err();
        match err {
            GradelineError::RoundLimitExceeded { requested, max, .. } => {
                assert_eq!(requested, 4);
                assert_eq!(max, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.store.tasks_for_template("sum-of-sales").await.unwrap().is_empty());
        assert!(h.store.exclusion("sum-of-sales", "a@x.edu").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_recipients_meeting_threshold_advance() {
        let h = harness();
        let mut outcomes = h.dispatcher.subscribe();
        let cohort = cohort(vec![
            recipient("a@x.edu", "http://up.invalid/a"),
            recipient("b@x.edu", "http://up.invalid/b"),
            recipient("c@x.edu", "http://up.invalid/c"),
            recipient("d@x.edu", "http://up.invalid/d"),
        ]);

        let started = h.controller.start(&cohort).await.unwrap();
        settle(&mut outcomes, 4).await;
        let round_one = |email| h.store.get_task(&issued_to(&started.issued, email).id);
        submit_scored(&h.store, &round_one("a@x.edu").await.unwrap().unwrap(), Some(0.9)).await;
        submit_scored(&h.store, &round_one("b@x.edu").await.unwrap().unwrap(), Some(0.2)).await;
        // c submitted but is not evaluated yet; d never submitted.
        submit_scored(&h.store, &round_one("c@x.edu").await.unwrap().unwrap(), None).await;

        let report = h.controller.advance(&cohort, 1).await.unwrap();
        assert_eq!(report.next_round(), 2);
        assert_eq!(report.issued.len(), 1);
        let advanced = &report.issued[0];
        assert_eq!(advanced.recipient.email, "a@x.edu");
        assert_eq!(advanced.round, 2);
        assert_eq!(
            advanced.previous_task_id.as_ref(),
            Some(&issued_to(&started.issued, "a@x.edu").id)
        );
        assert_eq!(report.pending, vec!["c@x.edu".to_string()]);

        let reasons: Vec<_> = report.excluded.iter().map(|e| (e.email.as_str(), e.reason)).collect();
        assert!(reasons.contains(&("b@x.edu", ExclusionReason::BelowThreshold)));
        assert!(reasons.contains(&("d@x.edu", ExclusionReason::NoSubmission)));
        let below = report.excluded.iter().find(|e| e.email == "b@x.edu").unwrap();
        assert!((below.aggregate.unwrap() - 0.2).abs() < 1e-9);

        // Advancing again issues nothing new; the exclusion sticks.
        let again = h.controller.advance(&cohort, 1).await.unwrap();
        assert!(again.issued.is_empty());
        assert_eq!(again.already_issued, vec!["a@x.edu".to_string()]);
        assert_eq!(again.excluded.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_recipient_is_not_blocked_elsewhere() {
        let h = harness();
        h.store
            .record_exclusion(Exclusion::new(
                "sum-of-sales",
                "a@x.edu",
                1,
                ExclusionReason::BelowThreshold,
            ))
            .await
            .unwrap();

        let same = h
            .controller
            .start(&cohort(vec![recipient("a@x.edu", "http://up.invalid/a")]))
            .await
            .unwrap();
        assert!(same.issued.is_empty());
        assert_eq!(same.skipped, vec!["a@x.edu".to_string()]);

        let other = h
            .controller
            .start(&Cohort::new(
                "markdown-to-html",
                vec![recipient("a@x.edu", "http://up.invalid/a")],
            ))
            .await
            .unwrap();
        assert_eq!(other.issued.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deprecated_template_cannot_start_or_advance() {
        let h = harness();
        let cohort = cohort(vec![recipient("a@x.edu", "http://down.invalid/a")]);
        let started = h.controller.start(&cohort).await.unwrap();
        let task_id = started.issued[0].id.clone();
        // First attempt fails; the retry is parked for a minute.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(h.store.get_task(&task_id).await.unwrap().unwrap().attempts, 1);

        let report = h.controller.deprecate("sum-of-sales").await.unwrap();
        assert!(report.newly_deprecated);
        assert_eq!(report.cancelled, vec![task_id.clone()]);
        let task = h.store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, DeliveryStatus::Cancelled);
        let exclusion = h.store.exclusion("sum-of-sales", "a@x.edu").await.unwrap().unwrap();
        assert_eq!(exclusion.reason, ExclusionReason::TemplateDeprecated);

        assert!(matches!(
            h.controller.start(&cohort).await,
            Err(GradelineError::TemplateDeprecated(_))
        ));
        assert!(matches!(
            h.controller.advance(&cohort, 1).await,
            Err(GradelineError::TemplateDeprecated(_))
        ));
        assert!(!h.controller.deprecate("sum-of-sales").await.unwrap().newly_deprecated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_template_is_rejected() {
        let h = harness();
        let cohort = Cohort::new("no-such-template", vec![recipient("a@x.edu", "http://up.invalid/a")]);
        assert!(matches!(
            h.controller.start(&cohort).await,
            Err(GradelineError::UnknownTemplate(_))
        ));
    }
}
