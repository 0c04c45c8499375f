//! Root OpenAPI document: merges every route module's `OpenApi` doc into
//! one. Never hand-maintained — each handler's own `#[utoipa::path(...)]`
//! annotation is the single source of truth for its entry.

use utoipa::OpenApi;

use crate::routes::{backends, health, job_groups, jobs};

#[derive(OpenApi)]
#[openapi(info(
    title = "orchestrator-server",
    description = "Dispatches image/video generation workflows across a fleet of remote rendering backends.",
    version = "0.1.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(jobs::JobsApi::openapi());
    root.merge(backends::BackendsApi::openapi());
    root.merge(job_groups::JobGroupsApi::openapi());
    root
}
