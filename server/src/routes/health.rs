//! `GET /healthz`: process liveness. Always 200 once the HTTP server has
//! bound its socket — this endpoint checks nothing downstream (no database
//! ping, no backend poll), it only answers "is the process up".

use std::sync::Arc;

use axum::Json;
use axum::routing::get;
use axum::{Router, extract::State};
use serde::Serialize;
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(healthz))]
pub struct HealthApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/healthz", get(healthz))
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    status: &'static str,
}

#[utoipa::path(
    get,
    path = "/healthz",
    tag = "health",
    responses((status = 200, description = "The process is up", body = HealthResponse)),
)]
pub async fn healthz(State(_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    #[tokio::test]
    async fn healthz_reports_ok() {
        let state = test_state().await;
        let Json(body) = healthz(State(state)).await;
        assert_eq!(body.status, "ok");
    }
}
