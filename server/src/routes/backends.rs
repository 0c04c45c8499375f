//! Read-only backend fleet views (C12), reading straight from the
//! Backend Registry (C1) — nothing here mutates registry state.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_backends, backend_status))]
pub struct BackendsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/backends", get(list_backends))
        .route("/api/backends/{id}/status", get(backend_status))
}

#[derive(Debug, Serialize)]
pub struct BackendSummary {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub online: bool,
    pub queue_pending: u32,
    pub queue_running: u32,
    pub current_job_id: Option<String>,
    pub gpu_name: String,
    pub gpu_memory_used: u64,
    pub gpu_memory_total: u64,
    pub gpu_utilization: Option<f32>,
    pub cpu_utilization: Option<f32>,
    pub ram_used: u64,
    pub ram_total: u64,
}

fn summarize(config: orchestrator_core::models::BackendConfig, status: Option<orchestrator_core::models::BackendStatus>) -> BackendSummary {
    let status = status.unwrap_or_else(|| orchestrator_core::models::BackendStatus::offline(&config.id, chrono::Utc::now()));
    BackendSummary {
        id: config.id,
        name: config.name,
        host: config.host,
        port: config.port,
        enabled: config.enabled,
        capabilities: config.capabilities,
        tags: config.tags,
        online: status.online,
        queue_pending: status.queue_pending,
        queue_running: status.queue_running,
        current_job_id: status.current_job_id,
        gpu_name: status.gpu_name,
        gpu_memory_used: status.gpu_memory_used,
        gpu_memory_total: status.gpu_memory_total,
        gpu_utilization: status.gpu_utilization,
        cpu_utilization: status.cpu_utilization,
        ram_used: status.ram_used,
        ram_total: status.ram_total,
    }
}

/// List every configured backend with its latest observed status.
#[utoipa::path(
    get,
    path = "/api/backends",
    tag = "backends",
    responses((status = 200, description = "The configured fleet", body = serde_json::Value)),
)]
pub async fn list_backends(State(state): State<Arc<AppState>>) -> Json<Vec<BackendSummary>> {
    let summaries = state.registry.snapshot().into_iter().map(|(config, status)| summarize(config, status)).collect();
    Json(summaries)
}

/// The latest observed status for one backend.
#[utoipa::path(
    get,
    path = "/api/backends/{id}/status",
    tag = "backends",
    params(("id" = String, Path, description = "Backend id")),
    responses(
        (status = 200, description = "The backend's status", body = serde_json::Value),
        (status = 404, description = "No backend with this id"),
    ),
)]
pub async fn backend_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<BackendSummary>, ServerError> {
    let config = state.registry.get(&id).ok_or_else(|| ServerError::NotFound(format!("backend {id} not found")))?;
    let status = state.registry.get_status(&id);
    Ok(Json(summarize(config, status)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    #[tokio::test]
    async fn list_backends_includes_the_configured_backend() {
        let state = test_state().await;
        let Json(backends) = list_backends(State(state)).await;
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].id, "b1");
        assert!(!backends[0].online);
    }

    #[tokio::test]
    async fn backend_status_404s_for_unknown_id() {
        let state = test_state().await;
        let result = backend_status(State(state), Path("ghost".to_string())).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }
}
