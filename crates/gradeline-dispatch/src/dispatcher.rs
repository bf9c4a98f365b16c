use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use gradeline_generator::{SignedPayload, TaskPayload};
use gradeline_store::Store;
use gradeline_types::{DeliveryEvent, DeliveryStatus, GradelineError, Task, TaskId};

use crate::policy::RetryPolicy;
use crate::scheduler::{RetryEntry, RetryScheduler, SchedulerCommand};
use crate::transport::Transport;

/// What happened to one delivery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered { task_id: TaskId, attempts: u32 },
    RetryScheduled {
        task_id: TaskId,
        next_attempt: u32,
        delay_secs: u64,
    },
    FailedExhausted { task_id: TaskId, attempts: u32 },
    /// Delivery was requested for a task that already reached `delivered`.
    AlreadyDelivered { task_id: TaskId },
    Cancelled { task_id: TaskId },
    /// A forced redelivery did not go through; the task stays `delivered`.
    RedeliveryFailed { task_id: TaskId, reason: String },
}

impl DeliveryOutcome {
    pub fn task_id(&self) -> &TaskId {
        match self {
            DeliveryOutcome::Delivered { task_id, .. }
            | DeliveryOutcome::RetryScheduled { task_id, .. }
            | DeliveryOutcome::FailedExhausted { task_id, .. }
            | DeliveryOutcome::AlreadyDelivered { task_id }
            | DeliveryOutcome::Cancelled { task_id }
            | DeliveryOutcome::RedeliveryFailed { task_id, .. } => task_id,
        }
    }

    /// Final outcomes end a task's retry timeline.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Delivered { .. }
                | DeliveryOutcome::FailedExhausted { .. }
                | DeliveryOutcome::Cancelled { .. }
        )
    }

    fn settled(task: &Task) -> Option<Self> {
        let task_id = task.id.clone();
        match task.status {
            DeliveryStatus::Pending => None,
            DeliveryStatus::Delivered => Some(DeliveryOutcome::AlreadyDelivered { task_id }),
            DeliveryStatus::FailedExhausted => Some(DeliveryOutcome::FailedExhausted {
                task_id,
                attempts: task.attempts,
            }),
            DeliveryStatus::Cancelled => Some(DeliveryOutcome::Cancelled { task_id }),
        }
    }
}

/// Delivers tasks to recipient endpoints and drives their retry timelines.
///
/// Cloning is cheap; every clone shares the same scheduler.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    submission_url: String,
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    cancellations: DashMap<String, CancellationToken>,
}

impl Dispatcher {
    /// Start the retry scheduler and return a handle to it.
    pub fn spawn(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        submission_url: impl Into<String>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel::<RetryEntry>();
        let (outcomes, _) = broadcast::channel(256);

        let inner = Arc::new(DispatcherInner {
            store,
            transport,
            policy,
            submission_url: submission_url.into(),
            commands: cmd_tx,
            outcomes,
            cancellations: DashMap::new(),
        });

        tokio::spawn(RetryScheduler::new(cmd_rx, fired_tx, shutdown_rx).run());

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(entry) = fired_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    if let Err(e) = inner.attempt(&entry.task_id).await {
                        tracing::error!(
                            task_id = %entry.task_id,
                            attempt = entry.attempt,
                            "Delivery attempt could not be recorded: {e}"
                        );
                    }
                });
            }
        });

        Self { inner }
    }

    /// Receive final outcomes (`delivered`, `failed_exhausted`, `cancelled`).
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.inner.outcomes.subscribe()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Attempt delivery now. Failures are retried in the background; a task
    /// that is no longer pending is left untouched.
    pub async fn deliver(&self, task: &Task) -> Result<DeliveryOutcome, GradelineError> {
        self.inner.attempt(&task.id).await
    }

    /// Queue the next attempt of a pending task without waiting for it.
    pub fn enqueue(&self, task: &Task) {
        self.inner.schedule(task, task.attempts + 1, Duration::ZERO);
    }

    /// Manual re-trigger of an already delivered task.
    pub async fn redeliver(&self, task_id: &TaskId) -> Result<DeliveryOutcome, GradelineError> {
        let task = self.inner.load(task_id).await?;
        if task.status != DeliveryStatus::Delivered {
            return Err(GradelineError::InvalidDeliveryTransition {
                from: task.status,
                event: DeliveryEvent::Redelivered,
            });
        }

        let signed = self.inner.sign(&task)?;
        match self
            .inner
            .transport
            .send(&task.recipient.endpoint, &signed)
            .await
        {
            Ok(()) => {
                let updated = self
                    .inner
                    .store
                    .apply_delivery_event(task_id, DeliveryEvent::Redelivered)
                    .await?;
                tracing::info!(task_id = %task_id, "Task redelivered");
                Ok(DeliveryOutcome::Delivered {
                    task_id: task_id.clone(),
                    attempts: updated.attempts,
                })
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, "Forced redelivery failed: {e}");
                Ok(DeliveryOutcome::RedeliveryFailed {
                    task_id: task_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop every retry timeline of a template and mark its pending tasks
    /// `cancelled`. Returns the tasks that were cancelled.
    pub async fn cancel_template(&self, template_id: &str) -> Result<Vec<TaskId>, GradelineError> {
        self.inner.token(template_id).cancel();

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = SchedulerCommand::CancelTemplate {
            template_id: template_id.to_string(),
            reply: reply_tx,
        };
        if self.inner.commands.send(command).is_ok() {
            let _ = reply_rx.await;
        } else {
            tracing::warn!("Retry scheduler stopped; cancelling stored tasks only");
        }

        let mut cancelled = Vec::new();
        for task in self.inner.store.tasks_for_template(template_id).await? {
            if task.status != DeliveryStatus::Pending {
                continue;
            }
            if let Some(DeliveryOutcome::Cancelled { task_id }) = self.inner.cancel(&task).await? {
                cancelled.push(task_id);
            }
        }
        tracing::info!(
            count = cancelled.len(),
            "Cancelled pending deliveries for template '{template_id}'"
        );
        Ok(cancelled)
    }
}

impl DispatcherInner {
    async fn load(&self, task_id: &TaskId) -> Result<Task, GradelineError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| GradelineError::TaskNotFound(task_id.clone()))
    }

    fn token(&self, template_id: &str) -> CancellationToken {
        self.cancellations
            .entry(template_id.to_string())
            .or_default()
            .clone()
    }

    fn sign(&self, task: &Task) -> Result<SignedPayload, GradelineError> {
        let payload = TaskPayload::from_task(task, &self.submission_url);
        Ok(SignedPayload::sign(&payload, &task.recipient.secret)?)
    }

    fn schedule(&self, task: &Task, attempt: u32, delay: Duration) {
        let command = SchedulerCommand::Schedule {
            entry: RetryEntry {
                task_id: task.id.clone(),
                template_id: task.template_id.clone(),
                attempt,
            },
            delay,
        };
        if self.commands.send(command).is_err() {
            tracing::warn!(task_id = %task.id, "Retry scheduler stopped; attempt {attempt} not queued");
        }
    }

    fn emit(&self, outcome: DeliveryOutcome) -> DeliveryOutcome {
        let _ = self.outcomes.send(outcome.clone());
        outcome
    }

    /// Apply a delivery event. A transition that lost a race with another
    /// writer yields `None` and leaves the task as that writer left it.
    async fn record(
        &self,
        task_id: &TaskId,
        event: DeliveryEvent,
    ) -> Result<Option<Task>, GradelineError> {
        match self.store.apply_delivery_event(task_id, event).await {
            Ok(task) => Ok(Some(task)),
            Err(GradelineError::InvalidDeliveryTransition { from, .. }) => {
                tracing::debug!(task_id = %task_id, ?from, ?event, "Delivery event superseded");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel(&self, task: &Task) -> Result<Option<DeliveryOutcome>, GradelineError> {
        match self.record(&task.id, DeliveryEvent::Cancelled).await? {
            Some(_) => Ok(Some(self.emit(DeliveryOutcome::Cancelled {
                task_id: task.id.clone(),
            }))),
            None => Ok(DeliveryOutcome::settled(&self.load(&task.id).await?)),
        }
    }

    async fn attempt(&self, task_id: &TaskId) -> Result<DeliveryOutcome, GradelineError> {
        let task = self.load(task_id).await?;
        if let Some(outcome) = DeliveryOutcome::settled(&task) {
            return Ok(outcome);
        }

        let token = self.token(&task.template_id);
        if token.is_cancelled() {
            return self.cancel_or_settled(&task).await;
        }

        let attempt = task.attempts + 1;
        let signed = self.sign(&task)?;
        let sent = tokio::select! {
            result = self.transport.send(&task.recipient.endpoint, &signed) => result,
            _ = token.cancelled() => return self.cancel_or_settled(&task).await,
        };

        match sent {
            Ok(()) => match self.record(task_id, DeliveryEvent::Delivered).await? {
                Some(updated) => {
                    tracing::info!(task_id = %task_id, attempt, "Task delivered");
                    Ok(self.emit(DeliveryOutcome::Delivered {
                        task_id: task_id.clone(),
                        attempts: updated.attempts,
                    }))
                }
                None => self.settled_now(task_id).await,
            },
            Err(e) if self.policy.is_exhausted(attempt) => {
                match self.record(task_id, DeliveryEvent::Exhausted).await? {
                    Some(updated) => {
                        tracing::warn!(
                            task_id = %task_id,
                            attempts = updated.attempts,
                            "Delivery failed permanently: {e}"
                        );
                        Ok(self.emit(DeliveryOutcome::FailedExhausted {
                            task_id: task_id.clone(),
                            attempts: updated.attempts,
                        }))
                    }
                    None => self.settled_now(task_id).await,
                }
            }
            Err(e) => match self.record(task_id, DeliveryEvent::AttemptFailed).await? {
                Some(updated) => {
                    let next_attempt = updated.attempts + 1;
                    let delay = self.policy.jittered(self.policy.delay_before(next_attempt));
                    self.schedule(&updated, next_attempt, delay);
                    tracing::warn!(
                        task_id = %task_id,
                        attempt,
                        retry_in_secs = delay.as_secs(),
                        "Delivery attempt failed: {e}"
                    );
                    Ok(DeliveryOutcome::RetryScheduled {
                        task_id: task_id.clone(),
                        next_attempt,
                        delay_secs: delay.as_secs(),
                    })
                }
                None => self.settled_now(task_id).await,
            },
        }
    }

    async fn cancel_or_settled(&self, task: &Task) -> Result<DeliveryOutcome, GradelineError> {
        match self.cancel(task).await? {
            Some(outcome) => Ok(outcome),
            None => Ok(DeliveryOutcome::Cancelled {
                task_id: task.id.clone(),
            }),
        }
    }

    async fn settled_now(&self, task_id: &TaskId) -> Result<DeliveryOutcome, GradelineError> {
        let task = self.load(task_id).await?;
        DeliveryOutcome::settled(&task).ok_or_else(|| {
            GradelineError::Internal(format!("task {task_id} still pending after a lost transition"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use gradeline_generator::{IssuanceContext, TaskGenerator, TemplateRegistry};
    use gradeline_store::InMemoryStore;
    use gradeline_types::Recipient;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::Instant;

    /// Answers from a script, then with `fallback`.
    struct ScriptedTransport {
        script: Mutex<VecDeque<bool>>,
        fallback: bool,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(script: &[bool], fallback: bool) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _endpoint: &str, _payload: &SignedPayload) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(Instant::now());
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
            if ok { Ok(()) } else { Err(TransportError::Status(500)) }
        }
    }

    /// Holds every send open until `release` is notified.
    #[derive(Default)]
    struct HangingTransport {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Transport for HangingTransport {
        async fn send(&self, _endpoint: &str, _payload: &SignedPayload) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<InMemoryStore>,
        task: Task,
        _shutdown: watch::Sender<bool>,
    }

    async fn harness(transport: Arc<dyn Transport>) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let generator = TaskGenerator::new(Arc::new(TemplateRegistry::builtin().unwrap()), store.clone());
        let task = generator
            .generate(
                "sum-of-sales",
                &Recipient::new("a@x.edu", "http://student.invalid/hook", "s3cret"),
                1,
                &IssuanceContext::now(),
            )
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::spawn(
            store.clone(),
            transport,
            RetryPolicy::default(),
            "http://localhost:8080/api/v1/submissions",
            shutdown_rx,
        );
        Harness {
            dispatcher,
            store,
            task,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_three_attempts_then_stops() {
        let transport = ScriptedTransport::new(&[], false);
        let h = harness(transport.clone()).await;
        let mut outcomes = h.dispatcher.subscribe();

        let first = h.dispatcher.deliver(&h.task).await.unwrap();
        assert_eq!(
            first,
            DeliveryOutcome::RetryScheduled {
                task_id: h.task.id.clone(),
                next_attempt: 2,
                delay_secs: 60,
            }
        );

        let last = outcomes.recv().await.unwrap();
        assert_eq!(
            last,
            DeliveryOutcome::FailedExhausted {
                task_id: h.task.id.clone(),
                attempts: 3,
            }
        );

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1] - calls[0] >= Duration::from_secs(60));
        assert!(calls[2] - calls[1] >= Duration::from_secs(180));

        let stored = h.store.get_task(&h.task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::FailedExhausted);
        assert_eq!(stored.attempts, 3);

        // A terminal task is never attempted again.
        let again = h.dispatcher.deliver(&stored).await.unwrap();
        assert!(matches!(again, DeliveryOutcome::FailedExhausted { attempts: 3, .. }));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let transport = ScriptedTransport::new(&[false], true);
        let h = harness(transport.clone()).await;
        let mut outcomes = h.dispatcher.subscribe();

        h.dispatcher.deliver(&h.task).await.unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Delivered {
                task_id: h.task.id.clone(),
                attempts: 2,
            }
        );
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_delivered_task_is_not_sent_again() {
        let transport = ScriptedTransport::new(&[], true);
        let h = harness(transport.clone()).await;

        let outcome = h.dispatcher.deliver(&h.task).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Delivered { attempts: 1, .. }));
        let again = h.dispatcher.deliver(&h.task).await.unwrap();
        assert!(matches!(again, DeliveryOutcome::AlreadyDelivered { .. }));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_forced_redelivery_keeps_status() {
        let transport = ScriptedTransport::new(&[true, false], true);
        let h = harness(transport.clone()).await;

        let err = h.dispatcher.redeliver(&h.task.id).await.unwrap_err();
        assert!(matches!(err, GradelineError::InvalidDeliveryTransition { .. }));

        h.dispatcher.deliver(&h.task).await.unwrap();
        let failed = h.dispatcher.redeliver(&h.task.id).await.unwrap();
        assert!(matches!(failed, DeliveryOutcome::RedeliveryFailed { .. }));
        let ok = h.dispatcher.redeliver(&h.task.id).await.unwrap();
        assert!(matches!(ok, DeliveryOutcome::Delivered { attempts: 2, .. }));

        let stored = h.store.get_task(&h.task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_template_stops_retry_timeline() {
        let transport = ScriptedTransport::new(&[], false);
        let h = harness(transport.clone()).await;

        h.dispatcher.deliver(&h.task).await.unwrap();
        let cancelled = h.dispatcher.cancel_template("sum-of-sales").await.unwrap();
        assert_eq!(cancelled, vec![h.task.id.clone()]);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(transport.calls().len(), 1);
        let stored = h.store.get_task(&h.task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_template_abandons_in_flight_attempt() {
        let transport = Arc::new(HangingTransport::default());
        let h = harness(transport.clone()).await;
        let mut outcomes = h.dispatcher.subscribe();

        h.dispatcher.enqueue(&h.task);
        transport.started.notified().await;
        h.dispatcher.cancel_template("sum-of-sales").await.unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Cancelled {
                task_id: h.task.id.clone(),
            }
        );

        transport.release.notify_waiters();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(outcomes.try_recv().is_err());
        let stored = h.store.get_task(&h.task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Cancelled);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_delivers_in_background() {
        let transport = ScriptedTransport::new(&[], true);
        let h = harness(transport.clone()).await;
        let mut outcomes = h.dispatcher.subscribe();

        h.dispatcher.enqueue(&h.task);
        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Delivered { attempts: 1, .. }));
        assert!(outcome.is_final());
    }
}
