use std::sync::Arc;

use gradeline_dispatch::Dispatcher;
use gradeline_generator::{TaskGenerator, TemplateRegistry};
use gradeline_intake::SubmissionIntake;
use gradeline_rounds::RoundController;
use gradeline_store::Store;

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<TemplateRegistry>,
    pub generator: Arc<TaskGenerator>,
    pub dispatcher: Dispatcher,
    pub intake: SubmissionIntake,
    pub controller: Arc<RoundController>,
}
