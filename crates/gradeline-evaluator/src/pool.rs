use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use gradeline_store::Store;
use gradeline_types::{GradelineError, Submission};

use crate::evaluator::Evaluator;

/// Consumes the evaluation queue and evaluates submissions concurrently.
///
/// Besides the queue, the store is swept for unevaluated submissions on start
/// and every `sweep_interval`, which picks up anything the queue dropped or a
/// previous process left behind.
pub struct EvaluationPool {
    evaluator: Arc<Evaluator>,
    store: Arc<dyn Store>,
    queue: mpsc::Receiver<Submission>,
    shutdown_rx: watch::Receiver<bool>,
    sweep_interval: Duration,
    completed: Option<mpsc::UnboundedSender<Uuid>>,
}

/// `None`: results already existed and nothing was run.
type Evaluated = (Uuid, Result<Option<usize>, GradelineError>);

impl EvaluationPool {
    pub fn new(
        evaluator: Arc<Evaluator>,
        store: Arc<dyn Store>,
        queue: mpsc::Receiver<Submission>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            evaluator,
            store,
            queue,
            shutdown_rx,
            sweep_interval: Duration::from_secs(30),
            completed: None,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Receive the id of every submission whose results were recorded.
    pub fn with_notifier(mut self, completed: mpsc::UnboundedSender<Uuid>) -> Self {
        self.completed = Some(completed);
        self
    }

    /// Run until shutdown. In-flight batteries finish before returning.
    pub async fn run(mut self) {
        let mut in_flight: HashSet<Uuid> = HashSet::new();
        let mut running: JoinSet<Evaluated> = JoinSet::new();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.queue.recv() => match received {
                    Some(submission) => self.spawn(&mut running, &mut in_flight, submission),
                    None => {
                        tracing::info!("Evaluation queue closed");
                        break;
                    }
                },
                _ = sweep.tick() => match self.store.unevaluated_submissions().await {
                    Ok(pending) => {
                        for submission in pending {
                            self.spawn(&mut running, &mut in_flight, submission);
                        }
                    }
                    Err(e) => tracing::error!("Failed to sweep unevaluated submissions: {e}"),
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    self.finish(&mut in_flight, joined);
                }
                Ok(()) = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        tracing::info!(in_flight = running.len(), "Evaluation pool shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            self.finish(&mut in_flight, joined);
        }
    }

    fn spawn(
        &self,
        running: &mut JoinSet<Evaluated>,
        in_flight: &mut HashSet<Uuid>,
        submission: Submission,
    ) {
        if !in_flight.insert(submission.id) {
            return;
        }
        let evaluator = self.evaluator.clone();
        let store = self.store.clone();
        running.spawn(async move {
            let result = match store.results_for_submission(submission.id).await {
                Ok(existing) if !existing.is_empty() => Ok(None),
                _ => evaluator
                    .evaluate_and_record(&submission)
                    .await
                    .map(|results| Some(results.len())),
            };
            (submission.id, result)
        });
    }

    fn finish(
        &self,
        in_flight: &mut HashSet<Uuid>,
        joined: Result<Evaluated, tokio::task::JoinError>,
    ) {
        match joined {
            Ok((id, Ok(None))) => {
                in_flight.remove(&id);
                tracing::debug!(submission_id = %id, "Already evaluated");
            }
            Ok((id, Ok(Some(count)))) => {
                in_flight.remove(&id);
                tracing::debug!(submission_id = %id, results = count, "Results recorded");
                if let Some(completed) = &self.completed {
                    let _ = completed.send(id);
                }
            }
            Ok((id, Err(e))) => {
                in_flight.remove(&id);
                tracing::error!(submission_id = %id, "Evaluation failed: {e}");
            }
            // A panicked battery stays in `in_flight` so the sweep does not retry it.
            Err(e) => tracing::error!("Evaluation task panicked: {e}"),
        }
    }
}
