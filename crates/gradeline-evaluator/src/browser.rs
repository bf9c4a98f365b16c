use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("no browser configured")]
    Unavailable,

    #[error("webdriver session error: {0}")]
    Session(String),

    #[error("script error: {0}")]
    Script(String),
}

/// Starts scriptable browsing contexts.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn render(&self, url: &str) -> Result<Box<dyn Document>, BrowserError>;
}

/// A rendered, live page.
///
/// Everything is expressed through `evaluate`; the provided methods are the
/// queries checks need.
#[async_trait]
pub trait Document: Send + Sync {
    /// Run a script body (`return ...;`) with `arguments[i]` bound to `args`.
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;

    async fn title(&self) -> Result<String, BrowserError> {
        let value = self.evaluate("return document.title;", Vec::new()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn element_exists(&self, selector: &str) -> Result<bool, BrowserError> {
        let value = self
            .evaluate(
                "return document.querySelector(arguments[0]) !== null;",
                vec![json!(selector)],
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Text content of the first match, `None` when nothing matches.
    async fn text(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        let value = self
            .evaluate(
                "const el = document.querySelector(arguments[0]); \
                 return el === null ? null : el.textContent;",
                vec![json!(selector)],
            )
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    /// Attribute of the first match. Outer `None`: no element; inner `None`: no attribute.
    async fn attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<Option<String>>, BrowserError> {
        let value = self
            .evaluate(
                "const el = document.querySelector(arguments[0]); \
                 if (el === null) { return { found: false }; } \
                 return { found: true, value: el.getAttribute(arguments[1]) };",
                vec![json!(selector), json!(attribute)],
            )
            .await?;
        if value.get("found").and_then(Value::as_bool) != Some(true) {
            return Ok(None);
        }
        Ok(Some(
            value.get("value").and_then(Value::as_str).map(str::to_string),
        ))
    }

    /// Click the first match. Returns `false` when nothing matches.
    async fn click(&self, selector: &str) -> Result<bool, BrowserError> {
        let value = self
            .evaluate(
                "const el = document.querySelector(arguments[0]); \
                 if (el === null) { return false; } \
                 el.click(); return true;",
                vec![json!(selector)],
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Truthiness of a free-form expression against the live document.
    async fn expression(&self, expression: &str) -> Result<bool, BrowserError> {
        let script = format!("return !!({expression});");
        let value = self.evaluate(&script, Vec::new()).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

/// Used when no WebDriver endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBrowser;

#[async_trait]
impl Browser for NoBrowser {
    async fn render(&self, _url: &str) -> Result<Box<dyn Document>, BrowserError> {
        Err(BrowserError::Unavailable)
    }
}

/// W3C WebDriver client (chromedriver, geckodriver, selenium).
#[derive(Debug, Clone)]
pub struct WebDriverBrowser {
    client: reqwest::Client,
    base_url: String,
}

impl WebDriverBrowser {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BrowserError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrowserError::Session(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn capabilities() -> Value {
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": ["--headless=new", "--no-sandbox"] },
                    "moz:firefoxOptions": { "args": ["-headless"] }
                }
            }
        })
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn render(&self, url: &str) -> Result<Box<dyn Document>, BrowserError> {
        let created = command(
            self.client
                .post(format!("{}/session", self.base_url))
                .json(&Self::capabilities()),
            BrowserError::Session,
        )
        .await?;
        let session_id = created
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Session(format!("no sessionId in {created}")))?
            .to_string();

        let document = WebDriverDocument {
            client: self.client.clone(),
            session_url: format!("{}/session/{session_id}", self.base_url),
        };
        let navigated = command(
            self.client
                .post(format!("{}/url", document.session_url))
                .json(&json!({ "url": url })),
            BrowserError::Session,
        )
        .await;
        if let Err(e) = navigated {
            let _ = document.close().await;
            return Err(e);
        }
        tracing::debug!(session_id = %session_id, url = %url, "Rendered submission page");
        Ok(Box::new(document))
    }
}

struct WebDriverDocument {
    client: reqwest::Client,
    session_url: String,
}

#[async_trait]
impl Document for WebDriverDocument {
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError> {
        command(
            self.client
                .post(format!("{}/execute/sync", self.session_url))
                .json(&json!({ "script": script, "args": args })),
            BrowserError::Script,
        )
        .await
    }

    async fn close(&self) -> Result<(), BrowserError> {
        command(self.client.delete(&self.session_url), BrowserError::Session).await?;
        Ok(())
    }
}

/// Send a WebDriver command and unwrap its `value`. WebDriver reports
/// failures as `{"value": {"error": .., "message": ..}}`.
async fn command(
    request: reqwest::RequestBuilder,
    into_error: fn(String) -> BrowserError,
) -> Result<Value, BrowserError> {
    let response = request.send().await.map_err(|e| into_error(e.to_string()))?;
    let status = response.status();
    let body: Value = response.json().await.map_err(|e| into_error(e.to_string()))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if !status.is_success() {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| value.get("error").and_then(Value::as_str))
            .unwrap_or("unknown webdriver error");
        return Err(into_error(format!("{status}: {message}")));
    }
    Ok(value)
}
