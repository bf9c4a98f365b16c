use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskId;

/// Where the recipient's completed work lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub repo_url: String,
    #[serde(default)]
    pub commit_sha: Option<String>,
    /// Published page rendered by dynamic checks.
    #[serde(default)]
    pub pages_url: Option<String>,
}

impl ArtifactReference {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            commit_sha: None,
            pages_url: None,
        }
    }

    pub fn with_pages_url(mut self, url: impl Into<String>) -> Self {
        self.pages_url = Some(url.into());
        self
    }

    pub fn with_commit(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = Some(sha.into());
        self
    }

    /// Last path segment of the repository URL, without a `.git` suffix.
    pub fn repository_name(&self) -> Option<&str> {
        let trimmed = self.repo_url.trim_end_matches('/');
        let name = trimmed.rsplit('/').next()?;
        let name = name.strip_suffix(".git").unwrap_or(name);
        (!name.is_empty()).then_some(name)
    }
}

/// Inbound completion notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub task_id: TaskId,
    pub nonce: String,
    pub artifact: ArtifactReference,
}

/// A recorded claim that work for a task is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub task_id: TaskId,
    pub nonce_used: String,
    pub artifact: ArtifactReference,
    pub received_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(task_id: TaskId, nonce: impl Into<String>, artifact: ArtifactReference) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            nonce_used: nonce.into(),
            artifact,
            received_at: Utc::now(),
        }
    }
}
