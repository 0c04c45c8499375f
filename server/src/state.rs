//! Shared application state injected into every Axum handler.

use std::collections::HashMap;
use std::sync::Arc;

use orchestrator_core::group_manager::ParallelJobGroupManager;
use orchestrator_core::job_manager::SingleJobManager;
use orchestrator_core::models::WorkflowDefinition;
use orchestrator_core::registry::BackendRegistry;
use orchestrator_core::workflow_storage::WorkflowStorage;
use tokio::sync::RwLock;
use tokio::sync::watch;

use crate::config::Config;
use crate::db::sqlite::SqliteStore;

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub registry: BackendRegistry,
    pub workflows: WorkflowStorage,
    /// In-memory cache of loaded workflow definitions, keyed by id, refreshed
    /// from `workflows` on every submission so a definition edited on disk
    /// takes effect on the next job without a restart.
    pub workflow_cache: Arc<RwLock<HashMap<String, WorkflowDefinition>>>,
    pub job_manager: Arc<SingleJobManager<SqliteStore>>,
    pub group_manager: Arc<ParallelJobGroupManager>,
    pub job_handles: Arc<JobHandles>,
}

/// Tracks the cancel signal for every job currently running in the
/// background, keyed by job id. Mirrors the teacher's task-abort-handle
/// registry, but holds a `watch` sender instead of an `AbortHandle` since
/// job cancellation is cooperative (checked between node executions), not a
/// hard task abort.
#[derive(Default)]
pub struct JobHandles {
    cancel_senders: std::sync::Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl JobHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: String, sender: watch::Sender<bool>) {
        self.cancel_senders.lock().expect("job handles lock poisoned").insert(job_id, sender);
    }

    /// Signals cancellation for `job_id`. Returns `false` if no running job
    /// is registered under that id (already finished, or never started).
    pub fn cancel(&self, job_id: &str) -> bool {
        let senders = self.cancel_senders.lock().expect("job handles lock poisoned");
        match senders.get(job_id) {
            Some(sender) => {
                let _ = sender.send(true);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: &str) {
        self.cancel_senders.lock().expect("job handles lock poisoned").remove(job_id);
    }
}

impl AppState {
    /// Loads (or refreshes) the workflow cache from disk and returns a
    /// snapshot map for one job submission.
    pub async fn workflows_snapshot(&self) -> orchestrator_core::Result<HashMap<String, WorkflowDefinition>> {
        let definitions = self.workflows.list_workflows().await?;
        let mut cache = self.workflow_cache.write().await;
        cache.clear();
        for def in definitions {
            cache.insert(def.id.clone(), def);
        }
        Ok(cache.clone())
    }
}
