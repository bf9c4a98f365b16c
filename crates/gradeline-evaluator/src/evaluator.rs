use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use gradeline_store::Store;
use gradeline_types::{CheckResult, GradelineError, Submission};

use crate::browser::{Browser, Document};
use crate::checks::{CheckContext, run_check};
use crate::inspect::ArtifactInspector;
use crate::judge::Judge;

/// Runs a task's check battery against one submission.
pub struct Evaluator {
    store: Arc<dyn Store>,
    inspector: Arc<dyn ArtifactInspector>,
    judge: Arc<dyn Judge>,
    browser: Arc<dyn Browser>,
    /// Bounds concurrently open browsing contexts.
    browser_slots: Arc<Semaphore>,
    check_timeout: Duration,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn Store>,
        inspector: Arc<dyn ArtifactInspector>,
        judge: Arc<dyn Judge>,
        browser: Arc<dyn Browser>,
    ) -> Self {
        Self {
            store,
            inspector,
            judge,
            browser,
            browser_slots: Arc::new(Semaphore::new(2)),
            check_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_browser_concurrency(mut self, slots: usize) -> Self {
        self.browser_slots = Arc::new(Semaphore::new(slots.max(1)));
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Exactly one result per declared check, in declaration order. A check
    /// that fails to run yields a zero score; the battery always completes.
    pub async fn evaluate(&self, submission: &Submission) -> Result<Vec<CheckResult>, GradelineError> {
        let task = self
            .store
            .get_task(&submission.task_id)
            .await?
            .ok_or_else(|| GradelineError::TaskNotFound(submission.task_id.clone()))?;

        let needs_browser = task.checks.iter().any(|c| c.check.needs_browser());
        let _permit = if needs_browser {
            let permit = self
                .browser_slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GradelineError::Internal("browser pool closed".into()))?;
            Some(permit)
        } else {
            None
        };

        let mut document: Option<Box<dyn Document>> = None;
        let mut page_error = String::from("page not rendered");
        if needs_browser {
            match submission.artifact.pages_url.as_deref() {
                None => page_error = "submission has no pages_url".into(),
                Some(url) => match tokio::time::timeout(self.check_timeout, self.browser.render(url)).await {
                    Ok(Ok(doc)) => document = Some(doc),
                    Ok(Err(e)) => {
                        tracing::warn!(task_id = %task.id, "Could not render {url}: {e}");
                        page_error = e.to_string();
                    }
                    Err(_) => page_error = format!("rendering {url} timed out"),
                },
            }
        }

        let ctx = CheckContext {
            task: &task,
            submission,
            inspector: self.inspector.as_ref(),
            judge: self.judge.as_ref(),
            page: match &document {
                Some(doc) => Ok(doc.as_ref()),
                None => Err(page_error.as_str()),
            },
            timeout: self.check_timeout,
        };

        let mut results = Vec::with_capacity(task.checks.len());
        for (index, entry) in task.checks.iter().enumerate() {
            let (kind, verdict) = run_check(entry, &ctx).await;
            results.push(CheckResult::from_verdict(
                submission.id,
                task.id.clone(),
                index,
                &entry.label,
                kind,
                verdict,
            ));
        }

        if let Some(doc) = document {
            if let Err(e) = doc.close().await {
                tracing::warn!(task_id = %task.id, "Failed to close browsing context: {e}");
            }
        }

        tracing::info!(
            task_id = %task.id,
            submission_id = %submission.id,
            checks = results.len(),
            passed = results.iter().filter(|r| r.score >= 1.0).count(),
            "Submission evaluated"
        );
        Ok(results)
    }

    /// Evaluate and append the results to the store.
    pub async fn evaluate_and_record(
        &self,
        submission: &Submission,
    ) -> Result<Vec<CheckResult>, GradelineError> {
        let results = self.evaluate(submission).await?;
        self.store
            .append_results(submission.id, results.clone())
            .await?;
        Ok(results)
    }
}
