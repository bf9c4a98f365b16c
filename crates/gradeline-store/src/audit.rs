use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Types of audit entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    TaskIssued,
    DeliveryRecorded,
    SubmissionAccepted,
    ResultsRecorded,
    RecipientExcluded,
    TemplateDeprecated,
}

/// An immutable, hash-chained audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    /// Task id, template id or email the entry is about.
    pub subject: String,
    pub payload: serde_json::Value,
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        subject: impl Into<String>,
        payload: serde_json::Value,
        previous_hash: Option<String>,
    ) -> Self {
        let mut entry = Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            subject: subject.into(),
            payload,
            previous_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    pub fn compute_hash(&self) -> String {
        let input = format!(
            "{}:{}:{:?}:{}:{}:{}",
            self.id,
            self.timestamp.timestamp_nanos_opt().unwrap_or(0),
            self.kind,
            self.subject,
            self.payload,
            self.previous_hash.as_deref().unwrap_or("genesis"),
        );
        hex::encode(Sha256::digest(input.as_bytes()))
    }
}

/// Append-only audit chain.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<AuditEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Append an entry chained onto the current head.
    pub async fn append(
        &self,
        kind: AuditKind,
        subject: impl Into<String>,
        payload: serde_json::Value,
    ) -> AuditEntry {
        let mut entries = self.entries.write().await;
        let previous_hash = entries.last().map(|e| e.hash.clone());
        let entry = AuditEntry::new(kind, subject, payload, previous_hash);
        entries.push(entry.clone());
        entry
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn query_by_subject(&self, subject: &str) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect()
    }

    pub async fn verify_integrity(&self) -> bool {
        let entries = self.entries.read().await;
        for (i, entry) in entries.iter().enumerate() {
            if entry.hash != entry.compute_hash() {
                return false;
            }
            let expected_previous = if i == 0 {
                None
            } else {
                Some(&entries[i - 1].hash)
            };
            if entry.previous_hash.as_ref() != expected_previous {
                return false;
            }
        }
        true
    }
}
