//! Shared `AppState` builder for route handler unit tests. Only compiled
//! under `#[cfg(test)]` — mirrors `orchestrator_core::workflow_storage`'s
//! minimal temp-dir helper rather than pulling in the `tempfile` crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use orchestrator_core::backend_client::{BackendClient, BackendClientFactory};
use orchestrator_core::group_manager::ParallelJobGroupManager;
use orchestrator_core::job_manager::SingleJobManager;
use orchestrator_core::models::BackendConfig;
use orchestrator_core::registry::BackendRegistry;
use orchestrator_core::workflow_storage::WorkflowStorage;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::state::{AppState, JobHandles};

pub async fn test_state() -> Arc<AppState> {
    let config = Arc::new(Config { backends: "b1@localhost:8188".to_string(), ..Config::from_env() });
    let store = Arc::new(SqliteStore::connect("sqlite://:memory:").await.unwrap());
    let registry = BackendRegistry::new();
    registry.register(BackendConfig {
        id: "b1".to_string(),
        name: "b1".to_string(),
        host: "localhost".to_string(),
        port: 8188,
        enabled: true,
        capabilities: vec![],
        max_concurrent_jobs: 1,
        tags: vec![],
    });

    let client_factory: BackendClientFactory =
        Arc::new(|id, base| Arc::new(orchestrator_core::backend_client::HttpBackendClient::new(id, base)) as Arc<dyn BackendClient>);

    let job_manager = Arc::new(SingleJobManager::new(registry.clone(), store.clone(), client_factory.clone()));
    let group_manager = Arc::new(ParallelJobGroupManager::new(registry.clone(), client_factory));

    Arc::new(AppState {
        config,
        store,
        registry,
        workflows: WorkflowStorage::new(tempdir()),
        workflow_cache: Arc::new(RwLock::new(HashMap::new())),
        job_manager,
        group_manager,
        job_handles: Arc::new(JobHandles::new()),
    })
}

/// Minimal temp-dir helper; avoids pulling in the `tempfile` crate for a
/// handful of tests. Left on disk after the test process exits, same as
/// `/tmp` generally accumulates scratch files from any test run.
fn tempdir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("orch-server-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
