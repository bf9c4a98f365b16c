use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gradeline_dispatch::RetryPolicy;
use gradeline_generator::TemplateRegistry;

/// Top-level configuration for gradeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradelineConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Externally reachable base URL, advertised to recipients as the
    /// submission endpoint.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Directory of JSON templates merged over the built-ins.
    #[serde(default)]
    pub templates_dir: Option<String>,

    /// Seconds between state snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub rounds: RoundsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Total delivery attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delays before the second, third, ... attempt.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,

    /// Each delay is extended by up to this fraction of itself.
    #[serde(default)]
    pub jitter: f64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Browsing contexts open at once.
    #[serde(default = "default_browser_concurrency")]
    pub browser_concurrency: usize,

    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_judge_command")]
    pub judge_command: String,

    /// Claude model used by the content-quality judge.
    #[serde(default = "default_judge_model")]
    pub judge_model: String,

    /// WebDriver endpoint. Dynamic checks fail with `browser_unavailable`
    /// when unset.
    #[serde(default)]
    pub webdriver_url: Option<String>,

    /// Directory holding local checkouts of submitted repositories.
    /// Defaults to `<state_dir>/checkouts`.
    #[serde(default)]
    pub checkout_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundsConfig {
    /// Hard cap on rounds per template.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u8,

    /// Minimum aggregate score to advance.
    #[serde(default = "default_eligibility_threshold")]
    pub eligibility_threshold: f64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_snapshot_interval() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> Vec<u64> {
    vec![60, 180, 600]
}

fn default_request_timeout() -> u64 {
    30
}

fn default_browser_concurrency() -> usize {
    2
}

fn default_check_timeout() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    256
}

fn default_judge_command() -> String {
    "claude".to_string()
}

fn default_judge_model() -> String {
    "haiku".to_string()
}

fn default_max_rounds() -> u8 {
    3
}

fn default_eligibility_threshold() -> f64 {
    0.5
}

impl Default for GradelineConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            public_base_url: default_public_base_url(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            templates_dir: None,
            snapshot_interval_secs: default_snapshot_interval(),
            dispatch: DispatchConfig::default(),
            evaluation: EvaluationConfig::default(),
            rounds: RoundsConfig::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            jitter: 0.0,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            browser_concurrency: default_browser_concurrency(),
            check_timeout_secs: default_check_timeout(),
            queue_capacity: default_queue_capacity(),
            judge_command: default_judge_command(),
            judge_model: default_judge_model(),
            webdriver_url: None,
            checkout_root: None,
        }
    }
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            eligibility_threshold: default_eligibility_threshold(),
        }
    }
}

impl GradelineConfig {
    /// Config file path within the state directory.
    pub fn config_path(state_dir: &Path) -> PathBuf {
        state_dir.join("config.toml")
    }

    /// Load config from disk. Returns default if not found.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::config_path(state_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to disk.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = Self::config_path(state_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Endpoint recipients post completion notices to.
    pub fn submission_url(&self) -> String {
        format!(
            "{}/api/v1/submissions",
            self.public_base_url.trim_end_matches('/')
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_secs(
            self.dispatch.max_attempts,
            &self.dispatch.backoff_secs,
            self.dispatch.jitter,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.request_timeout_secs.max(1))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation.check_timeout_secs.max(1))
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }

    pub fn checkout_root(&self, state_dir: &Path) -> PathBuf {
        match &self.evaluation.checkout_root {
            Some(root) => PathBuf::from(root),
            None => state_dir.join("checkouts"),
        }
    }

    /// Built-in templates, overlaid with `templates_dir` when set.
    pub fn template_registry(&self) -> Result<TemplateRegistry> {
        TemplateRegistry::from_config_dir(self.templates_dir.as_deref().map(Path::new))
    }
}
