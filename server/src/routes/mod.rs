//! Axum router construction.
//!
//! [`build`] assembles the complete application router: CORS, per-request
//! trace-ID middleware, the single-job / backend / job-group / WebSocket
//! routes, the health check, and (when enabled) the Swagger UI.

pub mod backends;
pub mod doc;
pub mod health;
pub mod job_groups;
pub mod jobs;
pub mod ws_job_groups;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::TraceLayer;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    // Default allows all origins; restrict via `ORCH_CORS_ORIGINS` in production.
    let cors = if let Some(origins_str) = &state.config.cors_allowed_origins {
        let origins: Vec<axum::http::HeaderValue> = origins_str.split(',').filter_map(|s| s.trim().parse().ok()).collect();
        if origins.is_empty() {
            CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
        } else {
            CorsLayer::new().allow_origin(origins).allow_headers(Any).allow_methods(Any)
        }
    } else {
        CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
    };

    let api_router = Router::new()
        .merge(health::router())
        .merge(jobs::router())
        .merge(backends::router())
        .merge(job_groups::router())
        .merge(ws_job_groups::router());

    let mut app = Router::new().merge(api_router);

    if state.config.enable_swagger {
        let api_doc = doc::get_docs();
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api_doc));
    }

    app.layer(TraceLayer).layer(cors).with_state(state)
}
