use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use gradeline_types::{Attachment, Task, TaskId};

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Gradeline-Signature";

/// What a recipient endpoint receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub email: String,
    pub round: u8,
    pub brief: String,
    pub attachments: Vec<Attachment>,
    /// Labels of the checks the submission will be graded against.
    pub checks_summary: Vec<String>,
    pub nonce: String,
    /// Where the completion notice must be posted.
    pub submission_url: String,
    pub issued_at: DateTime<Utc>,
}

impl TaskPayload {
    pub fn from_task(task: &Task, submission_url: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            email: task.recipient.email.clone(),
            round: task.round,
            brief: task.brief.clone(),
            attachments: task.attachments.clone(),
            checks_summary: task.checks.iter().map(|c| c.label.clone()).collect(),
            nonce: task.nonce.clone(),
            submission_url: submission_url.into(),
            issued_at: task.issued_at,
        }
    }
}

/// A serialized payload with its signature.
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub body: Vec<u8>,
    /// `sha256=<hex hmac>`.
    pub signature: String,
}

impl SignedPayload {
    pub fn sign(payload: &TaskPayload, secret: &str) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(payload)?;
        let signature = format!("sha256={}", hex::encode(hmac_sha256(secret, &body)));
        Ok(Self { body, signature })
    }

    /// Check a signature the way a recipient would.
    pub fn verify(body: &[u8], signature: &str, secret: &str) -> bool {
        let Some(hex_mac) = signature.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(expected) = hex::decode(hex_mac) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}

fn hmac_sha256(secret: &str, body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, including empty ones.
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}
