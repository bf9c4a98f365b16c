use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::check::CheckEntry;
use super::error::GradelineError;

/// Task identifier: `"{template_id}-{short hash}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Who a task is issued to.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    /// Where the task payload is delivered.
    pub endpoint: String,
    /// Shared secret used to sign deliveries.
    pub secret: String,
}

impl Recipient {
    pub fn new(
        email: impl Into<String>,
        endpoint: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            endpoint: endpoint.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient")
            .field("email", &self.email)
            .field("endpoint", &self.endpoint)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Delivery state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    FailedExhausted,
    Cancelled,
}

/// Events that drive delivery transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// A failed attempt with retries remaining.
    AttemptFailed,
    Delivered,
    Exhausted,
    Cancelled,
    /// Manual re-trigger of an already delivered task.
    Redelivered,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::FailedExhausted | DeliveryStatus::Cancelled
        )
    }

    /// Attempt a delivery transition given an event.
    pub fn transition(self, event: DeliveryEvent) -> super::error::Result<DeliveryStatus> {
        match (self, event) {
            (DeliveryStatus::Pending, DeliveryEvent::AttemptFailed) => Ok(DeliveryStatus::Pending),
            (DeliveryStatus::Pending, DeliveryEvent::Delivered) => Ok(DeliveryStatus::Delivered),
            (DeliveryStatus::Pending, DeliveryEvent::Exhausted) => {
                Ok(DeliveryStatus::FailedExhausted)
            }
            (DeliveryStatus::Pending, DeliveryEvent::Cancelled) => Ok(DeliveryStatus::Cancelled),

            // Forced redelivery keeps the task delivered whatever the transport says.
            (DeliveryStatus::Delivered, DeliveryEvent::Redelivered) => {
                Ok(DeliveryStatus::Delivered)
            }

            (status, event) => Err(GradelineError::InvalidDeliveryTransition {
                from: status,
                event,
            }),
        }
    }
}

/// A resolved attachment, carried as a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub url: String,
}

/// One recipient's resolved instance of a template round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub template_id: String,
    pub recipient: Recipient,
    pub round: u8,
    pub brief: String,
    pub attachments: Vec<Attachment>,
    pub checks: Vec<CheckEntry>,
    /// Resolved placeholder values, kept for audit.
    pub placeholders: BTreeMap<String, String>,
    pub nonce: String,
    pub nonce_consumed: bool,
    pub time_bucket: String,
    pub issued_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Task of the previous round this one supersedes.
    pub previous_task_id: Option<TaskId>,
}

impl Task {
    /// Apply a delivery event, counting the attempt it represents.
    pub fn apply_delivery_event(
        &mut self,
        event: DeliveryEvent,
        at: DateTime<Utc>,
    ) -> super::error::Result<()> {
        self.status = self.status.transition(event)?;
        if event != DeliveryEvent::Cancelled {
            self.attempts += 1;
            self.last_attempt_at = Some(at);
        }
        Ok(())
    }

    pub fn nonce_matches(&self, presented: &str) -> bool {
        // Length check first so unequal lengths short-circuit without byte comparison.
        self.nonce.len() == presented.len()
            && self
                .nonce
                .bytes()
                .zip(presented.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}
