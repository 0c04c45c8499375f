//! Parallel job group submission, status, and cancellation (C12), backed by
//! [`ParallelJobGroupManager`] (C11).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use orchestrator_core::RuntimeError;
use orchestrator_core::models::{JobGroup, JobGroupRequest};
use serde::Serialize;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(submit_job_group, get_job_group, cancel_job_group))]
pub struct JobGroupsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/job-group", post(submit_job_group))
        .route("/api/job-groups/{id}", get(get_job_group).delete(cancel_job_group))
}

/// [`JobGroup`] plus the aggregate counts a dashboard polls for, so callers
/// don't have to recompute them from `child_jobs` themselves.
#[derive(Debug, Serialize)]
pub struct JobGroupView {
    #[serde(flatten)]
    pub group: JobGroup,
    pub total_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub running_count: usize,
}

impl From<JobGroup> for JobGroupView {
    fn from(group: JobGroup) -> Self {
        let total_count = group.total_count();
        let completed_count = group.completed_count();
        let failed_count = group.failed_count();
        let running_count = group.running_count();
        Self { group, total_count, completed_count, failed_count, running_count }
    }
}

/// Submit a parallel job group: one workflow fanned out across `backend_ids`
/// with independently-seeded variations.
#[utoipa::path(
    post,
    path = "/api/job-group",
    tag = "job-groups",
    request_body(content = serde_json::Value, description = "workflow_json, parameters, backend_ids, seed_strategy, base_seed, timeout_seconds, required_capabilities, metadata"),
    responses(
        (status = 201, description = "Group accepted", body = serde_json::Value),
        (status = 400, description = "Validation failure (empty backend_ids, timeout_seconds out of [30, 3600], bad seed request, or a named backend that is unknown/disabled/offline/missing a required capability)"),
    ),
)]
pub async fn submit_job_group(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JobGroupRequest>,
) -> Result<(StatusCode, Json<JobGroupView>), ServerError> {
    if let Err(reason) = request.validate() {
        return Err(ServerError::BadRequest(reason));
    }
    let group = state.group_manager.submit_group(request).await?;
    Ok((StatusCode::CREATED, Json(JobGroupView::from(group))))
}

/// Full status of a job group, including per-child details and counts.
#[utoipa::path(
    get,
    path = "/api/job-groups/{id}",
    tag = "job-groups",
    params(("id" = String, Path, description = "Job group id")),
    responses(
        (status = 200, description = "The job group", body = serde_json::Value),
        (status = 404, description = "No job group with this id"),
    ),
)]
pub async fn get_job_group(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<JobGroupView>, ServerError> {
    let group = state.group_manager.get_group(&id).ok_or_else(|| ServerError::NotFound(format!("job group {id} not found")))?;
    Ok(Json(JobGroupView::from(group)))
}

/// Request cancellation of every still-running child in a job group.
#[utoipa::path(
    delete,
    path = "/api/job-groups/{id}",
    tag = "job-groups",
    params(("id" = String, Path, description = "Job group id")),
    responses(
        (status = 200, description = "Cancellation accepted; counts reflect the state at the moment of the request", body = serde_json::Value),
        (status = 404, description = "No job group with this id"),
    ),
)]
pub async fn cancel_job_group(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<JobGroupView>, ServerError> {
    state.group_manager.cancel_group(&id).map_err(|e| match e {
        RuntimeError::GroupNotFound { group_id } => ServerError::NotFound(format!("job group {group_id} not found")),
        other => ServerError::Runtime(other),
    })?;
    let group = state.group_manager.get_group(&id).ok_or_else(|| ServerError::NotFound(format!("job group {id} not found")))?;
    Ok(Json(JobGroupView::from(group)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use orchestrator_core::models::SeedStrategy;

    fn sample_request() -> JobGroupRequest {
        JobGroupRequest {
            workflow_json: Default::default(),
            parameters: serde_json::json!({}),
            backend_ids: vec!["b1".to_string()],
            seed_strategy: SeedStrategy::Sequential,
            base_seed: Some(1),
            metadata: serde_json::json!({}),
            timeout_seconds: 60,
            required_capabilities: vec![],
        }
    }

    #[tokio::test]
    async fn submit_job_group_rejects_empty_backend_ids() {
        let state = test_state().await;
        let mut req = sample_request();
        req.backend_ids = vec![];
        let result = submit_job_group(State(state), Json(req)).await;
        assert!(matches!(result, Err(ServerError::BadRequest(_))));
    }

    fn mark_online(state: &crate::state::AppState, backend_id: &str) {
        let mut status = state.registry.get_status(backend_id).unwrap();
        status.online = true;
        state.registry.update_status(backend_id, status).unwrap();
    }

    #[tokio::test]
    async fn submit_then_get_job_group_round_trips() {
        let state = test_state().await;
        mark_online(&state, "b1");
        let (status, Json(submitted)) = submit_job_group(State(state.clone()), Json(sample_request())).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(submitted.total_count, 1);

        let Json(fetched) = get_job_group(State(state), Path(submitted.group.id.clone())).await.unwrap();
        assert_eq!(fetched.group.id, submitted.group.id);
    }

    #[tokio::test]
    async fn submit_job_group_rejects_unknown_backend_with_bad_request() {
        let state = test_state().await;
        let mut req = sample_request();
        req.backend_ids = vec!["ghost".to_string()];
        let result = submit_job_group(State(state), Json(req)).await;
        assert!(matches!(result, Err(ServerError::Runtime(_))));
        if let Err(ServerError::Runtime(e)) = result {
            assert_eq!(e.kind(), orchestrator_core::ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn submit_job_group_rejects_offline_backend_with_bad_request() {
        let state = test_state().await;
        // `b1` is registered but left offline by `test_state()`; submission
        // must be rejected upfront rather than admitted and failed later.
        let result = submit_job_group(State(state), Json(sample_request())).await;
        assert!(matches!(result, Err(ServerError::Runtime(_))));
    }

    #[tokio::test]
    async fn get_job_group_404s_for_unknown_id() {
        let state = test_state().await;
        let result = get_job_group(State(state), Path("ghost".to_string())).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_job_group_404s_for_unknown_id() {
        let state = test_state().await;
        let result = cancel_job_group(State(state), Path("ghost".to_string())).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }
}
