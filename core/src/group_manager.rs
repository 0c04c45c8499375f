//! Parallel Job Group Manager (C11): fans one workflow out across K
//! explicitly-named backends with K independently-seeded variations,
//! tracks every child to a terminal state, and narrates the whole thing
//! over a per-group broadcast channel.
//!
//! Event shapes and the ping/close/echo WebSocket protocol are grounded on
//! `orchestrator/api/ws_job_groups.py`; the persist-then-broadcast shape of
//! one child event is grounded on the `handle_comfyui_event` →
//! `broadcast_json` pattern in the x121 progress-bridge reference file,
//! adapted from one global sink to one `tokio::sync::broadcast` channel per
//! group so a slow or absent subscriber on group A never backs up group B.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::backend_client::{BackendClient, BackendClientFactory};
use crate::error::{Result, RuntimeError};
use crate::models::{ApiForm, ChildJob, ChildJobError, ChildJobStatus, JobGroup, JobGroupRequest, JobGroupStatus};
use crate::patch::{default_seed_field_for_class, inject_seed, patch_parameters};
use crate::registry::BackendRegistry;
use crate::seed::generate_seeds;

const BROADCAST_CAPACITY: usize = 256;

/// One notification about a job group. One variant per case (§9) — the
/// WebSocket wire form tags on `type` so a client never has to guess which
/// optional fields apply.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupEvent {
    InitialState { group: JobGroup },
    ChildProgress { job_id: String, progress: f64, current_step: Option<String> },
    ChildCompleted { job_id: String, outputs: serde_json::Value },
    ChildFailed { job_id: String, error: ChildJobError },
    ChildTimeout { job_id: String },
    ChildCancelled { job_id: String },
    GroupComplete { group_id: String, status: JobGroupStatus },
}

struct GroupHandle {
    group: JobGroup,
    cancel_tx: watch::Sender<bool>,
}

type GroupMap = Arc<RwLock<HashMap<String, GroupHandle>>>;
type ChannelMap = Arc<RwLock<HashMap<String, broadcast::Sender<GroupEvent>>>>;

/// Shared plumbing threaded into the detached per-group task: the backend
/// registry, a client factory, and the two maps that back every group's
/// externally-visible state. Cloning is cheap (every field is an `Arc`).
#[derive(Clone)]
struct Shared {
    registry: BackendRegistry,
    client_factory: BackendClientFactory,
    groups: GroupMap,
    channels: ChannelMap,
}

impl Shared {
    fn emit(&self, group_id: &str, event: GroupEvent) {
        if let Some(tx) = self.channels.read().expect("channels lock poisoned").get(group_id) {
            let _ = tx.send(event);
        }
    }

    fn update_child(&self, group_id: &str, job_id: &str, f: impl FnOnce(&mut ChildJob)) {
        let mut groups = self.groups.write().expect("groups lock poisoned");
        if let Some(handle) = groups.get_mut(group_id) {
            if let Some(child) = handle.group.child_jobs.iter_mut().find(|c| c.job_id == job_id) {
                f(child);
            }
        }
    }
}

pub struct ParallelJobGroupManager {
    shared: Shared,
}

impl ParallelJobGroupManager {
    pub fn new(registry: BackendRegistry, client_factory: BackendClientFactory) -> Self {
        Self {
            shared: Shared {
                registry,
                client_factory,
                groups: Arc::new(RwLock::new(HashMap::new())),
                channels: Arc::new(RwLock::new(HashMap::new())),
            },
        }
    }

    pub fn get_group(&self, id: &str) -> Option<JobGroup> {
        self.shared.groups.read().expect("groups lock poisoned").get(id).map(|h| h.group.clone())
    }

    /// Subscribes to a group's event stream. The receiver is created before
    /// the snapshot is read, so any event racing the subscription at worst
    /// arrives twice (once folded into the snapshot, once live) and is never
    /// silently dropped. The caller (the WebSocket route) sends
    /// `GroupEvent::InitialState` built from the returned snapshot before
    /// forwarding anything from the receiver.
    pub fn register_websocket_handler(&self, group_id: &str) -> Result<(JobGroup, broadcast::Receiver<GroupEvent>)> {
        let rx = {
            let mut channels = self.shared.channels.write().expect("channels lock poisoned");
            channels
                .entry(group_id.to_string())
                .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
                .subscribe()
        };
        let group = self
            .get_group(group_id)
            .ok_or_else(|| RuntimeError::GroupNotFound { group_id: group_id.to_string() })?;
        Ok((group, rx))
    }

    /// Dropping the returned receiver is sufficient to unregister; kept as
    /// an explicit no-op entry point so call sites read intentionally.
    pub fn unregister_websocket_handler(&self, _group_id: &str, _rx: broadcast::Receiver<GroupEvent>) {}

    pub fn cancel_group(&self, group_id: &str) -> Result<()> {
        let groups = self.shared.groups.read().expect("groups lock poisoned");
        let handle = groups
            .get(group_id)
            .ok_or_else(|| RuntimeError::GroupNotFound { group_id: group_id.to_string() })?;
        let _ = handle.cancel_tx.send(true);
        Ok(())
    }

    /// Validates the request, generates K seeds, registers the group in a
    /// `running` snapshot, then spawns the background fan-out and returns
    /// immediately with that snapshot.
    pub async fn submit_group(&self, request: JobGroupRequest) -> Result<JobGroup> {
        request.validate().map_err(RuntimeError::Validation)?;
        validate_backends(&self.shared.registry, &request.backend_ids, &request.required_capabilities)?;

        let count = request.backend_ids.len() as i64;
        let seeds = generate_seeds(count, request.seed_strategy, request.base_seed)
            .map_err(|e| RuntimeError::Validation(e.to_string()))?;
        if !crate::seed::validate_seeds(&seeds) {
            return Err(RuntimeError::Validation("generated seeds failed distinctness/range check".to_string()));
        }

        let child_jobs: Vec<ChildJob> = request
            .backend_ids
            .iter()
            .zip(seeds.iter())
            .map(|(backend_id, seed)| ChildJob::new(backend_id, *seed))
            .collect();

        let group = JobGroup {
            id: uuid::Uuid::new_v4().to_string(),
            panel_id: None,
            workflow_json: request.workflow_json.clone(),
            parameters: request.parameters.clone(),
            seed_strategy: request.seed_strategy,
            base_seed: request.base_seed,
            child_jobs,
            status: JobGroupStatus::Running,
            timeout_seconds: request.timeout_seconds,
            metadata: request.metadata.clone(),
            created_at: Utc::now(),
            completed_at: None,
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let group_id = group.id.clone();
        self.shared
            .groups
            .write()
            .expect("groups lock poisoned")
            .insert(group_id.clone(), GroupHandle { group: group.clone(), cancel_tx });
        self.shared
            .channels
            .write()
            .expect("channels lock poisoned")
            .entry(group_id.clone())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0);

        let shared = self.shared.clone();
        let timeout = Duration::from_secs(request.timeout_seconds as u64);
        tokio::spawn(run_group(group_id, request, timeout, shared, cancel_rx));

        Ok(group)
    }
}

/// §4.11 step 1: every named backend must be known, enabled, online, and
/// declare the required capabilities before the group is admitted at all.
/// Collects one reason per failing id so the caller can reject the whole
/// request with a precise 400 rather than admitting it and letting each bad
/// id surface later as a failed child.
fn validate_backends(registry: &BackendRegistry, backend_ids: &[String], required_capabilities: &[String]) -> Result<()> {
    let mut reasons = Vec::new();
    for backend_id in backend_ids {
        let Some(config) = registry.get(backend_id) else {
            reasons.push(format!("{backend_id}: unknown backend"));
            continue;
        };
        if !config.enabled {
            reasons.push(format!("{backend_id}: disabled"));
            continue;
        }
        let online = registry.get_status(backend_id).map(|s| s.online).unwrap_or(false);
        if !online {
            reasons.push(format!("{backend_id}: offline"));
            continue;
        }
        let missing: Vec<&String> = required_capabilities.iter().filter(|cap| !config.capabilities.iter().any(|c| c == *cap)).collect();
        if !missing.is_empty() {
            reasons.push(format!("{backend_id}: missing capabilities {missing:?}"));
        }
    }
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(RuntimeError::Validation(reasons.join("; ")))
    }
}

async fn run_group(group_id: String, request: JobGroupRequest, timeout: Duration, shared: Shared, cancel_rx: watch::Receiver<bool>) {
    let child_specs: Vec<(String, String, u64)> = {
        let groups = shared.groups.read().expect("groups lock poisoned");
        match groups.get(&group_id) {
            Some(handle) => handle.group.child_jobs.iter().map(|c| (c.job_id.clone(), c.backend_id.clone(), c.seed)).collect(),
            None => return,
        }
    };

    let child_futures = child_specs.into_iter().map(|(job_id, backend_id, seed)| {
        let shared = shared.clone();
        let group_id = group_id.clone();
        let request = &request;
        let mut cancel_rx = cancel_rx.clone();
        async move {
            run_child(&group_id, &job_id, &backend_id, seed, request, timeout, &shared, &mut cancel_rx).await;
        }
    });
    futures::future::join_all(child_futures).await;

    let final_status = {
        let mut groups = shared.groups.write().expect("groups lock poisoned");
        let Some(handle) = groups.get_mut(&group_id) else { return };
        let completed = handle.group.completed_count();
        let total = handle.group.total_count();
        let cancelled_any = handle.group.child_jobs.iter().any(|c| c.status == ChildJobStatus::Cancelled);
        handle.group.status = if cancelled_any && completed == 0 {
            JobGroupStatus::Cancelled
        } else if completed == total {
            JobGroupStatus::Completed
        } else if completed == 0 {
            JobGroupStatus::Failed
        } else {
            JobGroupStatus::PartialComplete
        };
        handle.group.completed_at = Some(Utc::now());
        handle.group.status
    };

    info!(group_id, status = %final_status, "job group finished");
    shared.emit(&group_id, GroupEvent::GroupComplete { group_id: group_id.clone(), status: final_status });
}

async fn run_child(
    group_id: &str,
    job_id: &str,
    backend_id: &str,
    seed: u64,
    request: &JobGroupRequest,
    timeout: Duration,
    shared: &Shared,
    cancel_rx: &mut watch::Receiver<bool>,
) {
    let Some(config) = shared.registry.get(backend_id) else {
        let error = ChildJobError { message: format!("backend {backend_id} unknown"), error_type: "unknown_backend".to_string() };
        shared.update_child(group_id, job_id, |c| {
            c.status = ChildJobStatus::Failed;
            c.error = Some(error.clone());
            c.completed_at = Some(Utc::now());
        });
        shared.emit(group_id, GroupEvent::ChildFailed { job_id: job_id.to_string(), error });
        return;
    };
    let online = shared.registry.get_status(backend_id).map(|s| s.online).unwrap_or(false);
    let has_capabilities = request.required_capabilities.iter().all(|cap| config.capabilities.iter().any(|c| c == cap));
    if !config.enabled || !online || !has_capabilities {
        let error = ChildJobError { message: format!("backend {backend_id} not usable"), error_type: "backend_unavailable".to_string() };
        shared.update_child(group_id, job_id, |c| {
            c.status = ChildJobStatus::Failed;
            c.error = Some(error.clone());
            c.completed_at = Some(Utc::now());
        });
        shared.emit(group_id, GroupEvent::ChildFailed { job_id: job_id.to_string(), error });
        return;
    }

    let mut api_json = request.workflow_json.clone();
    patch_parameters(&mut api_json, &[], &request.parameters);
    if !inject_seed(&mut api_json, seed, default_seed_field_for_class) {
        let error = ChildJobError { message: "workflow has no recognized seed field".to_string(), error_type: "no_seed_field".to_string() };
        shared.update_child(group_id, job_id, |c| {
            c.status = ChildJobStatus::Failed;
            c.error = Some(error.clone());
            c.completed_at = Some(Utc::now());
        });
        shared.emit(group_id, GroupEvent::ChildFailed { job_id: job_id.to_string(), error });
        return;
    }

    if let Err(e) = shared.registry.set_current_job(backend_id, Some(job_id.to_string())) {
        warn!(backend_id, error = %e, "failed to reserve backend slot for child job");
    }
    shared.update_child(group_id, job_id, |c| {
        c.status = ChildJobStatus::Running;
        c.started_at = Some(Utc::now());
    });

    let client = (shared.client_factory)(backend_id, &config.base_url());
    let outcome = tokio::time::timeout(timeout, dispatch_child(client.as_ref(), &api_json, group_id, job_id, shared, cancel_rx)).await;

    if let Err(e) = shared.registry.set_current_job(backend_id, None) {
        warn!(backend_id, error = %e, "failed to release backend slot for child job");
    }
    client.close().await;

    match outcome {
        Ok(Ok(outputs)) => {
            shared.update_child(group_id, job_id, |c| {
                c.status = ChildJobStatus::Completed;
                c.outputs = outputs.clone();
                c.progress = 1.0;
                c.completed_at = Some(Utc::now());
            });
            shared.emit(group_id, GroupEvent::ChildCompleted { job_id: job_id.to_string(), outputs });
        }
        Ok(Err(RuntimeError::Cancelled)) => {
            let _ = client.interrupt().await;
            shared.update_child(group_id, job_id, |c| {
                c.status = ChildJobStatus::Cancelled;
                c.completed_at = Some(Utc::now());
            });
            shared.emit(group_id, GroupEvent::ChildCancelled { job_id: job_id.to_string() });
        }
        Ok(Err(e)) => {
            let error = ChildJobError { message: e.to_string(), error_type: e.kind().to_string() };
            shared.update_child(group_id, job_id, |c| {
                c.status = ChildJobStatus::Failed;
                c.error = Some(error.clone());
                c.completed_at = Some(Utc::now());
            });
            shared.emit(group_id, GroupEvent::ChildFailed { job_id: job_id.to_string(), error });
        }
        Err(_elapsed) => {
            let _ = client.interrupt().await;
            shared.update_child(group_id, job_id, |c| {
                c.status = ChildJobStatus::Timeout;
                c.completed_at = Some(Utc::now());
            });
            shared.emit(group_id, GroupEvent::ChildTimeout { job_id: job_id.to_string() });
        }
    }
}

async fn dispatch_child(
    client: &dyn BackendClient,
    api_json: &ApiForm,
    group_id: &str,
    job_id: &str,
    shared: &Shared,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<serde_json::Value> {
    let prompt_id = client.submit_prompt(api_json, cancel_rx.clone()).await?;
    let mut stream = client.open_progress_stream(&prompt_id, cancel_rx.clone()).await?;

    loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return Err(RuntimeError::Cancelled);
                }
            }
            event = stream.recv() => {
                match event {
                    Some(crate::backend_client::ProgressEvent::Progress { value, max, node_id }) => {
                        let progress = if max > 0 { (value as f64 / max as f64).clamp(0.0, 1.0) } else { 0.0 };
                        shared.update_child(group_id, job_id, |c| {
                            c.progress = progress;
                            if node_id.is_some() {
                                c.current_step = node_id.clone();
                            }
                        });
                        shared.emit(group_id, GroupEvent::ChildProgress { job_id: job_id.to_string(), progress, current_step: node_id });
                    }
                    Some(crate::backend_client::ProgressEvent::Executed { node_id }) => {
                        shared.update_child(group_id, job_id, |c| c.current_step = Some(node_id.clone()));
                        shared.emit(group_id, GroupEvent::ChildProgress { job_id: job_id.to_string(), progress: -1.0, current_step: Some(node_id) });
                    }
                    Some(crate::backend_client::ProgressEvent::Done) | None => break,
                }
            }
        }
    }

    let history = client.fetch_history(&prompt_id, cancel_rx.clone()).await?;
    Ok(serde_json::to_value(&history).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::{DownloadedOutput, HistoryOutputs, MetricsAgentReport, ProgressEvent, QueueStatus, SystemStats};
    use crate::models::{ApiNode, BackendConfig, SeedStrategy};
    use async_trait::async_trait;

    struct HappyPathClient {
        id: String,
    }

    #[async_trait]
    impl BackendClient for HappyPathClient {
        fn backend_id(&self) -> &str {
            &self.id
        }
        async fn health_check(&self, _cancel: watch::Receiver<bool>) -> bool {
            true
        }
        async fn get_system_stats(&self, _cancel: watch::Receiver<bool>) -> Result<SystemStats> {
            Ok(SystemStats { ram_total: 0, devices: vec![] })
        }
        async fn get_queue_status(&self, _cancel: watch::Receiver<bool>) -> Result<QueueStatus> {
            Ok(QueueStatus::default())
        }
        async fn get_metrics_agent(&self, _cancel: watch::Receiver<bool>) -> Result<Option<MetricsAgentReport>> {
            Ok(None)
        }
        async fn submit_prompt(&self, _api_json: &ApiForm, _cancel: watch::Receiver<bool>) -> Result<String> {
            Ok(format!("prompt-{}", self.id))
        }
        async fn open_progress_stream(
            &self,
            _prompt_id: &str,
            _cancel: watch::Receiver<bool>,
        ) -> Result<tokio::sync::mpsc::Receiver<ProgressEvent>> {
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx.send(ProgressEvent::Progress { value: 1, max: 1, node_id: None }).await;
                let _ = tx.send(ProgressEvent::Done).await;
            });
            Ok(rx)
        }
        async fn fetch_history(&self, _prompt_id: &str, _cancel: watch::Receiver<bool>) -> Result<HistoryOutputs> {
            Ok(HistoryOutputs::default())
        }
        async fn download_output(
            &self,
            _filename: &str,
            _subfolder: &str,
            _kind: &str,
            _cancel: watch::Receiver<bool>,
        ) -> Result<DownloadedOutput> {
            unimplemented!()
        }
        async fn interrupt(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn registry_with_online_backends(ids: &[&str]) -> BackendRegistry {
        let registry = BackendRegistry::new();
        for id in ids {
            registry.register(BackendConfig {
                id: id.to_string(),
                name: id.to_string(),
                host: "localhost".to_string(),
                port: 8188,
                enabled: true,
                capabilities: vec![],
                max_concurrent_jobs: 1,
                tags: vec![],
            });
            let mut status = registry.get_status(id).unwrap();
            status.online = true;
            registry.update_status(id, status).unwrap();
        }
        registry
    }

    fn sample_workflow_json() -> ApiForm {
        let mut wf = ApiForm::new();
        wf.insert(
            "3".to_string(),
            ApiNode { class: "KSampler".to_string(), inputs: serde_json::Map::from_iter([("seed".to_string(), serde_json::json!(0))]) },
        );
        wf
    }

    #[tokio::test]
    async fn happy_path_group_completes_all_children() {
        let registry = registry_with_online_backends(&["b1", "b2"]);
        let factory: BackendClientFactory =
            Arc::new(|id, _base| Arc::new(HappyPathClient { id: id.to_string() }) as Arc<dyn BackendClient>);
        let manager = ParallelJobGroupManager::new(registry, factory);

        let request = JobGroupRequest {
            workflow_json: sample_workflow_json(),
            parameters: serde_json::json!({}),
            backend_ids: vec!["b1".to_string(), "b2".to_string()],
            seed_strategy: SeedStrategy::Sequential,
            base_seed: Some(1),
            metadata: serde_json::Value::Null,
            timeout_seconds: 60,
            required_capabilities: vec![],
        };

        let group = manager.submit_group(request).await.unwrap();
        let (_snapshot, mut rx) = manager.register_websocket_handler(&group.id).unwrap();
        assert_eq!(group.child_jobs.len(), 2);

        let mut saw_group_complete = false;
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Ok(GroupEvent::GroupComplete { status, .. })) => {
                    assert_eq!(status, JobGroupStatus::Completed);
                    saw_group_complete = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_group_complete, "expected a GroupComplete event");

        let final_group = manager.get_group(&group.id).unwrap();
        assert_eq!(final_group.status, JobGroupStatus::Completed);
        assert_eq!(final_group.completed_count(), 2);
    }

    #[tokio::test]
    async fn rejects_empty_backend_list() {
        let registry = BackendRegistry::new();
        let factory: BackendClientFactory =
            Arc::new(|id, _base| Arc::new(HappyPathClient { id: id.to_string() }) as Arc<dyn BackendClient>);
        let manager = ParallelJobGroupManager::new(registry, factory);

        let request = JobGroupRequest {
            workflow_json: sample_workflow_json(),
            parameters: serde_json::json!({}),
            backend_ids: vec![],
            seed_strategy: SeedStrategy::Sequential,
            base_seed: Some(1),
            metadata: serde_json::Value::Null,
            timeout_seconds: 60,
            required_capabilities: vec![],
        };
        assert!(manager.submit_group(request).await.is_err());
    }

    #[tokio::test]
    async fn unknown_backend_rejects_the_whole_group_upfront() {
        let registry = registry_with_online_backends(&["b1"]);
        let factory: BackendClientFactory =
            Arc::new(|id, _base| Arc::new(HappyPathClient { id: id.to_string() }) as Arc<dyn BackendClient>);
        let manager = ParallelJobGroupManager::new(registry, factory);

        let request = JobGroupRequest {
            workflow_json: sample_workflow_json(),
            parameters: serde_json::json!({}),
            backend_ids: vec!["b1".to_string(), "ghost".to_string()],
            seed_strategy: SeedStrategy::Sequential,
            base_seed: Some(1),
            metadata: serde_json::Value::Null,
            timeout_seconds: 60,
            required_capabilities: vec![],
        };
        let err = manager.submit_group(request).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(err.to_string().contains("ghost"), "error should name the offending id: {err}");

        // Rejected requests never create a group or spawn children.
        assert!(manager.get_group("ghost").is_none());
    }

    #[tokio::test]
    async fn disabled_backend_rejects_the_whole_group_upfront() {
        let registry = BackendRegistry::new();
        registry.register(BackendConfig {
            id: "b1".to_string(),
            name: "b1".to_string(),
            host: "localhost".to_string(),
            port: 8188,
            enabled: false,
            capabilities: vec![],
            max_concurrent_jobs: 1,
            tags: vec![],
        });
        let mut status = registry.get_status("b1").unwrap();
        status.online = true;
        registry.update_status("b1", status).unwrap();
        let factory: BackendClientFactory =
            Arc::new(|id, _base| Arc::new(HappyPathClient { id: id.to_string() }) as Arc<dyn BackendClient>);
        let manager = ParallelJobGroupManager::new(registry, factory);

        let request = JobGroupRequest {
            workflow_json: sample_workflow_json(),
            parameters: serde_json::json!({}),
            backend_ids: vec!["b1".to_string()],
            seed_strategy: SeedStrategy::Sequential,
            base_seed: Some(1),
            metadata: serde_json::Value::Null,
            timeout_seconds: 60,
            required_capabilities: vec![],
        };
        let err = manager.submit_group(request).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(err.to_string().contains("disabled"), "error should say why b1 is rejected: {err}");
    }
}
