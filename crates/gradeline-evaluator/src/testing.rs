//! In-process stand-ins for the artifact, judge and browser capabilities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};

use gradeline_types::{
    ArtifactReference, CheckEntry, DeliveryStatus, Recipient, Task, TaskId,
};

use crate::browser::{Browser, BrowserError, Document};
use crate::inspect::{ArtifactInspector, InspectError};
use crate::judge::{Judge, JudgeError, Judgement};

pub fn sample_task(checks: Vec<CheckEntry>) -> Task {
    Task {
        id: TaskId::new("sum-of-sales-1a2b3c4d"),
        template_id: "sum-of-sales".into(),
        recipient: Recipient::new("a@x.edu", "http://student.invalid/hook", "s3cret"),
        round: 1,
        brief: "Build it".into(),
        attachments: Vec::new(),
        checks,
        placeholders: BTreeMap::new(),
        nonce: "n".repeat(64),
        nonce_consumed: true,
        time_bucket: "2025-10-17-12".into(),
        issued_at: Utc::now() - TimeDelta::hours(2),
        status: DeliveryStatus::Delivered,
        attempts: 1,
        last_attempt_at: None,
        previous_task_id: None,
    }
}

pub struct FakeInspector {
    license: Option<String>,
    created_at: Option<DateTime<Utc>>,
    files: HashMap<String, String>,
}

impl FakeInspector {
    /// MIT license, created an hour after issuance, README and index page.
    pub fn complete(issued_at: DateTime<Utc>) -> Self {
        let mut files = HashMap::new();
        files.insert("README.md".to_string(), "# Sales summary\nSetup and usage.".to_string());
        files.insert("index.html".to_string(), "<html></html>".to_string());
        Self {
            license: Some("MIT".into()),
            created_at: Some(issued_at + TimeDelta::hours(1)),
            files,
        }
    }
}

#[async_trait]
impl ArtifactInspector for FakeInspector {
    async fn license(&self, _artifact: &ArtifactReference) -> Result<Option<String>, InspectError> {
        Ok(self.license.clone())
    }

    async fn created_at(
        &self,
        _artifact: &ArtifactReference,
    ) -> Result<Option<DateTime<Utc>>, InspectError> {
        Ok(self.created_at)
    }

    async fn file_exists(
        &self,
        _artifact: &ArtifactReference,
        path: &str,
    ) -> Result<bool, InspectError> {
        Ok(self.files.contains_key(path))
    }

    async fn read_file(
        &self,
        _artifact: &ArtifactReference,
        path: &str,
    ) -> Result<String, InspectError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| InspectError::NotFound(path.to_string()))
    }
}

pub enum FakeJudge {
    Score(f64),
    Failing,
}

impl FakeJudge {
    pub fn score(score: f64) -> Self {
        FakeJudge::Score(score)
    }
}

#[async_trait]
impl Judge for FakeJudge {
    async fn judge(&self, _content: &str, _rubric: &str) -> Result<Judgement, JudgeError> {
        match self {
            FakeJudge::Score(score) => Ok(Judgement {
                score: *score,
                rationale: "well structured".into(),
            }),
            FakeJudge::Failing => Err(JudgeError::Unavailable("judge crashed".into())),
        }
    }
}

/// A static page answering the scripts `Document` sends.
pub struct FakePage {
    title: String,
    selectors: HashSet<String>,
    texts: HashMap<String, String>,
    attributes: HashMap<(String, String), String>,
    expressions: HashMap<String, bool>,
    clicked: Mutex<Option<String>>,
    pub closed: AtomicUsize,
}

impl FakePage {
    pub fn sales_page() -> Self {
        let selectors = ["#total-sales", "#total-currency", "#currency-picker option", "#region-filter-North"]
            .into_iter()
            .map(String::from)
            .collect();
        let mut texts = HashMap::new();
        texts.insert("#total-currency".to_string(), "EUR".to_string());
        texts.insert("#total-sales".to_string(), "1234.50".to_string());
        let mut attributes = HashMap::new();
        attributes.insert(
            ("#currency-picker option".to_string(), "value".to_string()),
            "EUR".to_string(),
        );
        let mut expressions = HashMap::new();
        expressions.insert("bootstrap".to_string(), true);
        Self {
            title: "Sales Summary 1a2b3c4d".into(),
            selectors,
            texts,
            attributes,
            expressions,
            clicked: Mutex::new(None),
            closed: AtomicUsize::new(0),
        }
    }

    fn arg(args: &[Value], i: usize) -> String {
        args.get(i).and_then(Value::as_str).unwrap_or_default().to_string()
    }
}

#[async_trait]
impl Document for FakePage {
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError> {
        if script == "return document.title;" {
            return Ok(json!(self.title));
        }
        if let Some(expression) = script
            .strip_prefix("return !!(")
            .and_then(|s| s.strip_suffix(");"))
        {
            if expression == "region === 'North'" {
                let clicked = self.clicked.lock().unwrap().clone();
                return Ok(json!(clicked.as_deref() == Some("#region-filter-North")));
            }
            return self
                .expressions
                .get(expression)
                .map(|b| json!(b))
                .ok_or_else(|| BrowserError::Script(format!("{expression} is not defined")));
        }
        let selector = Self::arg(&args, 0);
        if script.contains("el.click()") {
            if !self.selectors.contains(&selector) {
                return Ok(json!(false));
            }
            *self.clicked.lock().unwrap() = Some(selector);
            return Ok(json!(true));
        }
        if script.contains("getAttribute") {
            if !self.selectors.contains(&selector) {
                return Ok(json!({ "found": false }));
            }
            let value = self.attributes.get(&(selector, Self::arg(&args, 1)));
            return Ok(json!({ "found": true, "value": value }));
        }
        if script.contains("textContent") {
            return Ok(json!(self.texts.get(&selector)));
        }
        if script.contains("!== null") {
            return Ok(json!(self.selectors.contains(&selector)));
        }
        Err(BrowserError::Script(format!("unsupported script: {script}")))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Renders `FakePage::sales_page` and counts renders.
#[derive(Default)]
pub struct FakeBrowser {
    pub renders: AtomicUsize,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn render(&self, _url: &str) -> Result<Box<dyn Document>, BrowserError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage::sales_page()))
    }
}
