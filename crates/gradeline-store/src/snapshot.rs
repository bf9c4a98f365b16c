use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gradeline_types::{CheckResult, Exclusion, Submission, Task};

use crate::audit::AuditEntry;

/// The top-level persisted state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedState {
    pub tasks: Vec<Task>,
    pub submissions: Vec<Submission>,
    pub results: Vec<CheckResult>,
    pub exclusions: Vec<Exclusion>,
    pub deprecated: Vec<(String, DateTime<Utc>)>,
    pub audit: Vec<AuditEntry>,
}

impl PersistedState {
    /// Every store mutation appends to the audit chain, so its length and
    /// head hash identify a state.
    fn head(&self) -> (usize, Option<String>) {
        (self.audit.len(), self.audit.last().map(|e| e.hash.clone()))
    }
}

/// `state.json` in the state directory, replaced atomically on save.
///
/// Saves are skipped while the audit head is unchanged since the last
/// write or load, so a periodic flush of an idle store touches nothing.
pub struct FileSnapshot {
    path: PathBuf,
    written: Mutex<Option<(usize, Option<String>)>>,
}

impl FileSnapshot {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("state.json"),
            written: Mutex::new(None),
        }
    }

    /// `~/.gradeline`, or `./.gradeline` without a home directory.
    pub fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gradeline")
    }

    /// Empty state when no snapshot exists yet.
    pub fn load(&self) -> Result<PersistedState> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to open {}", self.path.display()));
            }
        };
        let state: PersistedState = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        *self.written.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.head());
        Ok(state)
    }

    /// Stream `state` to a temp file, sync it and rename it over the
    /// snapshot. Returns `false` when nothing changed since the last save.
    pub fn save(&self, state: &PersistedState) -> Result<bool> {
        let head = state.head();
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if written.as_ref() == Some(&head) && self.path.exists() {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let file = File::create(&tmp_path).context("Failed to create temp state file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, state).context("Failed to serialize state")?;
        writer.flush().context("Failed to write temp state file")?;
        writer
            .get_ref()
            .sync_all()
            .context("Failed to sync temp state file")?;
        std::fs::rename(&tmp_path, &self.path).context("Failed to rename temp state file")?;

        *written = Some(head);
        tracing::debug!(
            tasks = state.tasks.len(),
            audit_entries = state.audit.len(),
            "State snapshot written to {}",
            self.path.display()
        );
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
