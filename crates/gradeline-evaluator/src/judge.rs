use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge unavailable: {0}")]
    Unavailable(String),

    #[error("malformed judgement: {0}")]
    Malformed(String),
}

/// Score and rationale returned by a content-quality judge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Judgement {
    pub score: f64,
    pub rationale: String,
}

/// External text/code-quality judge.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, content: &str, rubric: &str) -> Result<Judgement, JudgeError>;
}

/// Judge that shells out to the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeJudge {
    /// Executable to run.
    pub command: String,
    /// Model to use: "sonnet", "opus", "haiku"
    pub model: String,
}

impl Default for ClaudeJudge {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: "haiku".to_string(),
        }
    }
}

impl ClaudeJudge {
    pub fn new(command: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            model: model.into(),
        }
    }

    fn build_prompt(content: &str, rubric: &str) -> String {
        format!(
            "You are grading a student submission.\n\n\
             # Rubric\n{rubric}\n\n\
             # Submission\n{content}\n\n\
             Respond with only a JSON object of the form \
             {{\"score\": <number between 0 and 1>, \"rationale\": \"<one paragraph>\"}}."
        )
    }

    fn build_args(&self, prompt: &str) -> Vec<String> {
        vec![
            "--model".to_string(),
            self.model.clone(),
            "--output-format".to_string(),
            "json".to_string(),
            "--max-turns".to_string(),
            "1".to_string(),
            "-p".to_string(),
            prompt.to_string(),
        ]
    }
}

#[async_trait]
impl Judge for ClaudeJudge {
    async fn judge(&self, content: &str, rubric: &str) -> Result<Judgement, JudgeError> {
        let prompt = Self::build_prompt(content, rubric);
        let output = tokio::process::Command::new(&self.command)
            .args(self.build_args(&prompt))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| JudgeError::Unavailable(format!("failed to spawn {}: {e}", self.command)))?;

        if !output.status.success() {
            return Err(JudgeError::Unavailable(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }

        parse_judgement(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse CLI output: a JSON envelope whose `result` holds the judgement,
/// possibly wrapped in code fences.
pub fn parse_judgement(stdout: &str) -> Result<Judgement, JudgeError> {
    let envelope: serde_json::Value = serde_json::from_str(stdout.trim())
        .unwrap_or_else(|_| serde_json::Value::String(stdout.to_string()));
    let text = envelope
        .get("result")
        .and_then(|v| v.as_str())
        .or_else(|| envelope.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| envelope.to_string());

    let cleaned = strip_code_fences(&text);
    let judgement: Judgement = serde_json::from_str(&cleaned)
        .map_err(|e| JudgeError::Malformed(format!("{e}: {cleaned}")))?;
    if !judgement.score.is_finite() {
        return Err(JudgeError::Malformed(format!("score {}", judgement.score)));
    }
    Ok(judgement)
}

/// Strip markdown code fences from a string.
/// Handles ```json\n...\n```, ```\n...\n```, and bare JSON.
fn strip_code_fences(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest,
        };
        let rest = rest.strip_suffix("```").unwrap_or(rest);
        rest.trim().to_string()
    } else {
        trimmed.to_string()
    }
}
