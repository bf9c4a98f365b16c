use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use gradeline_dispatch::DeliveryOutcome;
use gradeline_intake::AcceptOutcome;
use gradeline_types::{
    CheckResult, Cohort, DeliveryStatus, Exclusion, GradelineError, IntakeRejection, Recipient,
    Submission, SubmissionRequest, Task, TaskId,
};

use crate::state::AppState;

type ApiResult<T> = Result<T, (StatusCode, String)>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/submissions", post(submit))
        .route("/api/v1/cohorts/{template_id}/start", post(start_cohort))
        .route("/api/v1/cohorts/{template_id}/advance", post(advance_cohort))
        .route("/api/v1/templates", get(list_templates))
        .route(
            "/api/v1/templates/{template_id}/deprecate",
            post(deprecate_template),
        )
        .route("/api/v1/tasks/{task_id}", get(get_task))
        .route("/api/v1/tasks/{task_id}/results", get(get_task_results))
        .route("/api/v1/tasks/{task_id}/redeliver", post(redeliver_task))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Configuration and policy errors are the caller's fault; anything else is ours.
fn error_response(e: GradelineError) -> (StatusCode, String) {
    let status = match &e {
        GradelineError::UnknownTemplate(_) | GradelineError::TaskNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        GradelineError::RoundLimitExceeded { .. } | GradelineError::MissingResolution { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        GradelineError::TemplateDeprecated(_)
        | GradelineError::InvalidDeliveryTransition { .. }
        | GradelineError::DuplicateTask(_) => StatusCode::CONFLICT,
        GradelineError::Store(_)
        | GradelineError::Serialization(_)
        | GradelineError::Internal(_) => {
            tracing::error!("Request failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

/// A task without its nonce or the recipient's secret.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub template_id: String,
    pub email: String,
    pub round: u8,
    pub brief: String,
    pub checks: Vec<String>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub issued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub previous_task_id: Option<TaskId>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            template_id: task.template_id.clone(),
            email: task.recipient.email.clone(),
            round: task.round,
            brief: task.brief.clone(),
            checks: task.checks.iter().map(|c| c.label.clone()).collect(),
            status: task.status,
            attempts: task.attempts,
            issued_at: task.issued_at,
            last_attempt_at: task.last_attempt_at,
            previous_task_id: task.previous_task_id.clone(),
        }
    }
}

// --- Intake ---

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<Uuid>,
}

async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmissionRequest>,
) -> ApiResult<(StatusCode, Json<SubmissionResponse>)> {
    let outcome = state
        .intake
        .accept_request(req)
        .await
        .map_err(error_response)?;
    let code = outcome.code().to_string();
    let (status, message, submission_id) = match outcome {
        AcceptOutcome::Accepted { submission, .. } => (
            StatusCode::ACCEPTED,
            "submission recorded; evaluation is queued".to_string(),
            Some(submission.id),
        ),
        AcceptOutcome::Rejected { reason } => {
            let status = match reason {
                IntakeRejection::UnknownTask | IntakeRejection::TaskNotDelivered => {
                    StatusCode::NOT_FOUND
                }
                IntakeRejection::NonceMismatch => StatusCode::FORBIDDEN,
                IntakeRejection::DuplicateSubmission => StatusCode::CONFLICT,
            };
            (status, reason.to_string(), None)
        }
    };
    Ok((
        status,
        Json(SubmissionResponse {
            status: code,
            message,
            submission_id,
        }),
    ))
}

// --- Cohorts ---

#[derive(Debug, Serialize, Deserialize)]
pub struct StartCohortRequest {
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartCohortResponse {
    pub template_id: String,
    pub issued: Vec<TaskView>,
    pub skipped: Vec<String>,
}

async fn start_cohort(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    Json(req): Json<StartCohortRequest>,
) -> ApiResult<(StatusCode, Json<StartCohortResponse>)> {
    let cohort = Cohort::new(template_id, req.recipients);
    let report = state
        .controller
        .start(&cohort)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(StartCohortResponse {
            template_id: report.template_id,
            issued: report.issued.iter().map(TaskView::from).collect(),
            skipped: report.skipped,
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdvanceCohortRequest {
    pub from_round: u8,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdvanceCohortResponse {
    pub template_id: String,
    pub round: u8,
    pub issued: Vec<TaskView>,
    pub excluded: Vec<Exclusion>,
    pub pending: Vec<String>,
    pub already_issued: Vec<String>,
}

async fn advance_cohort(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    Json(req): Json<AdvanceCohortRequest>,
) -> ApiResult<Json<AdvanceCohortResponse>> {
    let cohort = Cohort::new(template_id, req.recipients);
    let report = state
        .controller
        .advance(&cohort, req.from_round)
        .await
        .map_err(error_response)?;
    Ok(Json(AdvanceCohortResponse {
        template_id: report.template_id.clone(),
        round: report.next_round(),
        issued: report.issued.iter().map(TaskView::from).collect(),
        excluded: report.excluded,
        pending: report.pending,
        already_issued: report.already_issued,
    }))
}

// --- Templates ---

#[derive(Debug, Serialize, Deserialize)]
pub struct TemplateView {
    pub id: String,
    pub name: String,
    /// Effective maximum, after the configured cap.
    pub max_rounds: u8,
    pub rounds: Vec<u8>,
    pub deprecated: bool,
}

async fn list_templates(State(state): State<AppState>) -> ApiResult<Json<Vec<TemplateView>>> {
    let mut views = Vec::new();
    for template in state.registry.templates() {
        let deprecated = state
            .store
            .is_deprecated(&template.id)
            .await
            .map_err(error_response)?;
        views.push(TemplateView {
            id: template.id.clone(),
            name: template.name.clone(),
            max_rounds: state.generator.max_rounds(template),
            rounds: template.rounds.iter().map(|r| r.round).collect(),
            deprecated,
        });
    }
    Ok(Json(views))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeprecateResponse {
    pub template_id: String,
    pub newly_deprecated: bool,
    pub cancelled: Vec<TaskId>,
}

async fn deprecate_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
) -> ApiResult<Json<DeprecateResponse>> {
    let report = state
        .controller
        .deprecate(&template_id)
        .await
        .map_err(error_response)?;
    Ok(Json(DeprecateResponse {
        template_id: report.template_id,
        newly_deprecated: report.newly_deprecated,
        cancelled: report.cancelled,
    }))
}

// --- Tasks ---

async fn load_task(state: &AppState, task_id: &TaskId) -> ApiResult<Task> {
    state
        .store
        .get_task(task_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(GradelineError::TaskNotFound(task_id.clone())))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    let task = load_task(&state, &TaskId::new(task_id)).await?;
    Ok(Json(TaskView::from(&task)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResultsResponse {
    pub task_id: TaskId,
    pub submission: Option<Submission>,
    /// Absent until the submission has been evaluated.
    pub aggregate: Option<f64>,
    pub results: Vec<CheckResult>,
}

async fn get_task_results(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResultsResponse>> {
    let task = load_task(&state, &TaskId::new(task_id)).await?;
    let submission = state
        .store
        .get_submission(&task.id)
        .await
        .map_err(error_response)?;
    let results = match &submission {
        Some(submission) => state
            .store
            .results_for_submission(submission.id)
            .await
            .map_err(error_response)?,
        None => Vec::new(),
    };
    let aggregate =
        (!results.is_empty()).then(|| state.controller.policy().aggregate(&task, &results));
    Ok(Json(TaskResultsResponse {
        task_id: task.id,
        submission,
        aggregate,
        results,
    }))
}

async fn redeliver_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<DeliveryOutcome>> {
    let outcome = state
        .dispatcher
        .redeliver(&TaskId::new(task_id))
        .await
        .map_err(error_response)?;
    Ok(Json(outcome))
}
