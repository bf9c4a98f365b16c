use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use gradeline_types::TaskId;

/// One pending delivery attempt on a task's retry timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub task_id: TaskId,
    pub template_id: String,
    /// 1-based attempt number this entry will perform.
    pub attempt: u32,
}

#[derive(Debug)]
pub enum SchedulerCommand {
    /// Fire `entry` after `delay`. Replaces any entry already queued for the task.
    Schedule { entry: RetryEntry, delay: Duration },
    /// Drop every queued entry of a template and report the affected tasks.
    CancelTemplate {
        template_id: String,
        reply: oneshot::Sender<Vec<TaskId>>,
    },
}

/// Owns every retry timeline in one delay queue keyed by task.
///
/// Entries are emitted on `fired` when their delay elapses; the scheduler
/// itself never performs I/O, so one slow endpoint cannot hold up another.
pub struct RetryScheduler {
    queue: DelayQueue<RetryEntry>,
    keys: HashMap<TaskId, (Key, String)>,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    fired: mpsc::UnboundedSender<RetryEntry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RetryScheduler {
    pub fn new(
        commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        fired: mpsc::UnboundedSender<RetryEntry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue: DelayQueue::new(),
            keys: HashMap::new(),
            commands,
            fired,
            shutdown_rx,
        }
    }

    /// Run until shutdown is signalled or every command sender is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(expired) = poll_fn(|cx| self.queue.poll_expired(cx)), if !self.queue.is_empty() => {
                    let key = expired.key();
                    let entry = expired.into_inner();
                    if self.keys.get(&entry.task_id).is_some_and(|(k, _)| *k == key) {
                        self.keys.remove(&entry.task_id);
                    }
                    if self.fired.send(entry).is_err() {
                        tracing::debug!("Retry consumer gone; stopping scheduler");
                        break;
                    }
                }
                Ok(()) = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        tracing::info!(pending = self.keys.len(), "Retry scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Schedule { entry, delay } => {
                if let Some((old, _)) = self.keys.remove(&entry.task_id) {
                    self.queue.remove(&old);
                }
                let task_id = entry.task_id.clone();
                let template_id = entry.template_id.clone();
                let key = self.queue.insert(entry, delay);
                self.keys.insert(task_id, (key, template_id));
            }
            SchedulerCommand::CancelTemplate { template_id, reply } => {
                let cancelled: Vec<TaskId> = self
                    .keys
                    .iter()
                    .filter(|(_, (_, template))| *template == template_id)
                    .map(|(task_id, _)| task_id.clone())
                    .collect();
                for task_id in &cancelled {
                    if let Some((key, _)) = self.keys.remove(task_id) {
                        self.queue.remove(&key);
                    }
                }
                tracing::info!(
                    count = cancelled.len(),
                    "Dropped queued retries for template '{template_id}'"
                );
                let _ = reply.send(cancelled);
            }
        }
    }
}
