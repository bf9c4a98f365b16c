use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use gradeline_dispatch::{Dispatcher, HttpTransport, Transport};
use gradeline_evaluator::{
    ArtifactInspector, Browser, ClaudeJudge, EvaluationPool, Evaluator, Judge,
    LocalCheckoutInspector, NoBrowser, WebDriverBrowser,
};
use gradeline_generator::{TaskGenerator, TemplateRegistry};
use gradeline_intake::SubmissionIntake;
use gradeline_rounds::{AggregatePolicy, RoundController};
use gradeline_store::Store;
use gradeline_types::{DeliveryStatus, GradelineError};

use crate::config::GradelineConfig;
use crate::state::AppState;

/// External capabilities the pipeline talks to.
pub struct Capabilities {
    pub transport: Arc<dyn Transport>,
    pub inspector: Arc<dyn ArtifactInspector>,
    pub judge: Arc<dyn Judge>,
    pub browser: Arc<dyn Browser>,
}

impl Capabilities {
    /// HTTP transport, local checkout inspector, `claude` judge, and a
    /// WebDriver browser when `webdriver_url` is set.
    pub fn from_config(config: &GradelineConfig, state_dir: &Path) -> Result<Self> {
        let transport =
            HttpTransport::new(config.request_timeout()).context("Failed to build HTTP transport")?;
        let browser: Arc<dyn Browser> = match &config.evaluation.webdriver_url {
            Some(url) => Arc::new(
                WebDriverBrowser::new(url.as_str(), config.check_timeout())
                    .context("Failed to build WebDriver client")?,
            ),
            None => {
                tracing::warn!("No webdriver_url configured; dynamic checks will fail");
                Arc::new(NoBrowser)
            }
        };
        Ok(Self {
            transport: Arc::new(transport),
            inspector: Arc::new(LocalCheckoutInspector::new(config.checkout_root(state_dir))),
            judge: Arc::new(ClaudeJudge::new(
                config.evaluation.judge_command.as_str(),
                config.evaluation.judge_model.as_str(),
            )),
            browser,
        })
    }
}

/// Every component wired together, with the evaluation pool running.
pub struct Pipeline {
    pub state: AppState,
    evaluation: JoinHandle<()>,
}

impl Pipeline {
    /// Spawn the dispatcher and evaluation pool and re-queue pending
    /// deliveries left by a previous run.
    pub async fn start(
        config: &GradelineConfig,
        store: Arc<dyn Store>,
        registry: Arc<TemplateRegistry>,
        capabilities: Capabilities,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, GradelineError> {
        let generator = Arc::new(
            TaskGenerator::new(registry.clone(), store.clone())
                .with_round_cap(config.rounds.max_rounds),
        );
        let dispatcher = Dispatcher::spawn(
            store.clone(),
            capabilities.transport,
            config.retry_policy(),
            config.submission_url(),
            shutdown_rx.clone(),
        );

        let (queue_tx, queue_rx) = mpsc::channel(config.evaluation.queue_capacity.max(1));
        let intake = SubmissionIntake::new(store.clone(), queue_tx);
        let evaluator = Evaluator::new(
            store.clone(),
            capabilities.inspector,
            capabilities.judge,
            capabilities.browser,
        )
        .with_browser_concurrency(config.evaluation.browser_concurrency)
        .with_check_timeout(config.check_timeout());
        let evaluation = tokio::spawn(
            EvaluationPool::new(Arc::new(evaluator), store.clone(), queue_rx, shutdown_rx).run(),
        );

        let controller = Arc::new(RoundController::new(
            generator.clone(),
            dispatcher.clone(),
            store.clone(),
            AggregatePolicy::new(config.rounds.eligibility_threshold),
        ));

        let resumed = resume_pending(store.as_ref(), &registry, &dispatcher).await?;
        if resumed > 0 {
            tracing::info!(resumed, "Resumed pending deliveries");
        }

        Ok(Self {
            state: AppState {
                store,
                registry,
                generator,
                dispatcher,
                intake,
                controller,
            },
            evaluation,
        })
    }

    /// Wait for in-flight evaluations after shutdown was signalled.
    pub async fn join(self) {
        if let Err(e) = self.evaluation.await {
            tracing::error!("Evaluation pool panicked: {e}");
        }
    }
}

async fn resume_pending(
    store: &dyn Store,
    registry: &TemplateRegistry,
    dispatcher: &Dispatcher,
) -> Result<usize, GradelineError> {
    let mut resumed = 0;
    for template in registry.templates() {
        if store.is_deprecated(&template.id).await? {
            continue;
        }
        for task in store.tasks_for_template(&template.id).await? {
            if task.status == DeliveryStatus::Pending {
                dispatcher.enqueue(&task);
                resumed += 1;
            }
        }
    }
    Ok(resumed)
}
