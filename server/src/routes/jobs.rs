//! Single-job submission, lookup, and cancellation (C12).
//!
//! `POST /api/job` hands the freshly-built [`Job`] to [`SingleJobManager`]
//! in a background task and answers as soon as the job id is known, rather
//! than blocking the request on the full run — the run can take minutes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use orchestrator_core::job_repo::JobRepository;
use orchestrator_core::models::{CanvasLayout, CanvasNode, FallbackStrategy, Job, NodeType};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::error;
use utoipa::OpenApi;

use crate::db::sqlite::SqliteStore;
use crate::error::ServerError;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(submit_job, get_job, cancel_job))]
pub struct JobsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/job", post(submit_job))
        .route("/api/jobs/{id}", get(get_job).delete(cancel_job))
}

// `canvas` is a core `CanvasLayout`, which deliberately carries no
// `utoipa` dependency (the engine crate owns no web-framework concerns), so
// these DTOs stay `Deserialize`/`Serialize`-only and the OpenAPI annotation
// below documents the body as a generic JSON object rather than a named
// schema — the same choice the teacher makes for its `diagnostics` response.
#[derive(Debug, Deserialize)]
pub struct JobSubmitRequest {
    /// Runs a single-node canvas wrapping this workflow. Mutually exclusive
    /// with `canvas`; exactly one must be set.
    pub workflow_id: Option<String>,
    /// A full canvas to run. Takes precedence over `workflow_id` if both are set.
    pub canvas: Option<CanvasLayout>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct JobSubmitResponse {
    pub job_id: String,
    pub status: String,
    pub message: String,
    pub submitted_at: DateTime<Utc>,
}

/// Submit a job for background execution.
#[utoipa::path(
    post,
    path = "/api/job",
    tag = "jobs",
    request_body(content = serde_json::Value, description = "`{workflow_id | canvas, parameters, metadata}`"),
    responses(
        (status = 201, description = "Job accepted", body = serde_json::Value),
        (status = 400, description = "Neither `canvas` nor `workflow_id` was set"),
        (status = 503, description = "No backends are configured"),
    ),
)]
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JobSubmitRequest>,
) -> Result<(StatusCode, Json<JobSubmitResponse>), ServerError> {
    if state.registry.list().is_empty() {
        return Err(ServerError::Unavailable("no backends are configured".to_string()));
    }

    let canvas = match (req.canvas, req.workflow_id) {
        (Some(canvas), _) => canvas,
        (None, Some(workflow_id)) => single_workflow_canvas(workflow_id),
        (None, None) => return Err(ServerError::BadRequest("request must set either `canvas` or `workflow_id`".to_string())),
    };

    let workflows = state.workflows_snapshot().await?;
    let job = SingleJobManager::<SqliteStore>::new_job(&canvas, req.parameters);
    let job_id = job.id.clone();
    let submitted_at = job.created_at;
    let status = job.status.to_string();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    state.job_handles.register(job_id.clone(), cancel_tx);

    let job_manager = state.job_manager.clone();
    let job_handles = state.job_handles.clone();
    let background_job_id = job_id.clone();
    tokio::spawn(async move {
        if let Err(e) = job_manager.run_job(job, &canvas, &workflows, cancel_rx).await {
            error!(job_id = %background_job_id, error = %e, "job run failed");
        }
        job_handles.remove(&background_job_id);
    });

    Ok((
        StatusCode::CREATED,
        Json(JobSubmitResponse { job_id, status, message: "job accepted".to_string(), submitted_at }),
    ))
}

fn single_workflow_canvas(workflow_id: String) -> CanvasLayout {
    CanvasLayout {
        nodes: vec![CanvasNode {
            id: "1".to_string(),
            node_type: NodeType::Workflow,
            workflow_id: Some(workflow_id),
            backend_affinity: None,
            fallback_strategy: FallbackStrategy::Auto,
            parameter_values: serde_json::Value::Null,
        }],
        connections: vec![],
    }
}

/// Current state of a job, including per-node executions and progress.
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "The job", body = serde_json::Value),
        (status = 404, description = "No job with this id"),
    ),
)]
pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Job>, ServerError> {
    let job = state.store.get(&id).await?.ok_or_else(|| ServerError::NotFound(format!("job {id} not found")))?;
    Ok(Json(job))
}

/// Request cancellation of a running job.
#[utoipa::path(
    delete,
    path = "/api/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 202, description = "Cancellation accepted"),
        (status = 404, description = "No job with this id"),
        (status = 409, description = "The job is already in a terminal state"),
    ),
)]
pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode, ServerError> {
    let job = state.store.get(&id).await?.ok_or_else(|| ServerError::NotFound(format!("job {id} not found")))?;
    if job.status.is_terminal() {
        return Err(ServerError::Conflict(format!("job {id} is already {}", job.status)));
    }
    // `cancel` returning false just means the background task already
    // finished between the status check above and here; the DB state
    // checked above is authoritative for the response either way.
    let _ = state.job_handles.cancel(&id);
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    #[tokio::test]
    async fn submit_job_rejects_missing_canvas_and_workflow_id() {
        let state = test_state().await;
        let req = JobSubmitRequest { workflow_id: None, canvas: None, parameters: serde_json::json!({}), metadata: serde_json::json!({}) };
        let result = submit_job(State(state), Json(req)).await;
        assert!(matches!(result, Err(ServerError::BadRequest(_))));
    }

    #[tokio::test]
    async fn get_job_404s_for_unknown_id() {
        let state = test_state().await;
        let result = get_job(State(state), Path("ghost".to_string())).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_job_404s_for_unknown_id() {
        let state = test_state().await;
        let result = cancel_job(State(state), Path("ghost".to_string())).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }
}
