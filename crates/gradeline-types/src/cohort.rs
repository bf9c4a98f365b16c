use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Recipient;

/// Recipients advanced together through one template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cohort {
    pub template_id: String,
    pub recipients: Vec<Recipient>,
}

impl Cohort {
    pub fn new(template_id: impl Into<String>, recipients: Vec<Recipient>) -> Self {
        Self {
            template_id: template_id.into(),
            recipients,
        }
    }
}

/// Why a recipient stopped progressing through a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    NeverIssued,
    DeliveryFailed,
    NoSubmission,
    BelowThreshold,
    TemplateDeprecated,
}

/// A recipient recorded as terminal-failed for one template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exclusion {
    pub template_id: String,
    pub email: String,
    /// Round whose outcome caused the exclusion.
    pub round: u8,
    pub reason: ExclusionReason,
    pub aggregate: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl Exclusion {
    pub fn new(
        template_id: impl Into<String>,
        email: impl Into<String>,
        round: u8,
        reason: ExclusionReason,
    ) -> Self {
        Self {
            template_id: template_id.into(),
            email: email.into(),
            round,
            reason,
            aggregate: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_aggregate(mut self, aggregate: f64) -> Self {
        self.aggregate = Some(aggregate);
        self
    }
}
