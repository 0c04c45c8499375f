//! Single-Job Manager (C10): owns the lifecycle of one Job end to end —
//! translate each ready canvas node into a dispatch, patch its parameters,
//! pick a backend, submit, bridge progress, persist, finalize.
//!
//! Grounded on the teacher's `orchestrator.rs` actor shape (an owned handle
//! over shared state driving a multi-step pipeline with a cancellation
//! watch channel checked between steps) generalized from one linear stage
//! pipeline to the node-graph walk this spec requires.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend_client::{BackendClient, BackendClientFactory, ProgressEvent};
use crate::error::{Result, RuntimeError};
use crate::graph::GraphExecutor;
use crate::job_repo::JobRepository;
use crate::models::{
    ApiForm, CanvasLayout, CanvasNode, Job, JobStatus, NodeExecution, NodeExecutionStatus, NodeType, WorkflowDefinition,
};
use crate::patch::{apply_node_bypass, patch_parameters};
use crate::registry::BackendRegistry;
use crate::scheduler::{select_with_affinity, Candidate, NoBackendReason};

/// Every `N` progress events the current node-execution's progress is
/// persisted unconditionally, independent of the "step label changed" rule
/// (§4.10e).
const PERSIST_EVERY_N_EVENTS: u32 = 5;

pub struct SingleJobManager<R: JobRepository> {
    registry: BackendRegistry,
    repo: Arc<R>,
    client_factory: BackendClientFactory,
}

impl<R: JobRepository> SingleJobManager<R> {
    pub fn new(registry: BackendRegistry, repo: Arc<R>, client_factory: BackendClientFactory) -> Self {
        Self { registry, repo, client_factory }
    }

    /// Builds a new `Pending` job for `canvas`, without running it. Callers
    /// that need the job id before dispatch starts (the HTTP submission
    /// route, to answer with `{job_id, ...}` immediately) create the job
    /// here, persist it, respond, then hand it to [`Self::run_job`] in a
    /// background task.
    pub fn new_job(canvas: &CanvasLayout, parameter_values: serde_json::Value) -> Job {
        Job::new(serde_json::to_value(canvas).unwrap_or_default(), parameter_values)
    }

    /// Runs a job to completion (or failure/cancellation), persisting every
    /// state transition along the way.
    pub async fn run_job(
        &self,
        mut job: Job,
        canvas: &CanvasLayout,
        workflows: &HashMap<String, WorkflowDefinition>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Job> {
        let parameter_values = job.parameter_values.clone();
        self.persist(&job).await?;

        let mut graph = GraphExecutor::new(canvas);
        let nodes_by_id: HashMap<&str, &CanvasNode> = canvas.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.persist(&job).await?;

        loop {
            if *cancel.borrow() {
                self.cancel_job(&mut job).await?;
                return Ok(job);
            }

            let Some(node_id) = graph.get_ready_node() else { break };
            let canvas_node = match nodes_by_id.get(node_id.as_str()) {
                Some(n) => *n,
                None => {
                    graph.on_node_complete(&node_id);
                    continue;
                }
            };

            let mut node_exec = NodeExecution::new(&job.id, &node_id);
            job.node_executions.push(node_exec.clone());
            self.persist(&job).await?;

            if matches!(canvas_node.node_type, NodeType::Input | NodeType::Output | NodeType::Condition | NodeType::Merge | NodeType::Fanout) {
                // Structural/plumbing node: no backend dispatch required.
                node_exec.status = NodeExecutionStatus::Completed;
                node_exec.completed_at = Some(Utc::now());
                self.replace_node_execution(&mut job, node_exec);
                self.persist(&job).await?;
                graph.on_node_complete(&node_id);
                continue;
            }

            let Some(workflow_id) = &canvas_node.workflow_id else {
                node_exec.status = NodeExecutionStatus::Failed;
                node_exec.error_message = Some("workflow node has no workflow_id".to_string());
                self.replace_node_execution(&mut job, node_exec);
                self.fail_job(&mut job, "node missing workflow_id").await?;
                return Ok(job);
            };
            let Some(definition) = workflows.get(workflow_id) else {
                node_exec.status = NodeExecutionStatus::Failed;
                node_exec.error_message = Some(format!("workflow {workflow_id} not found"));
                self.replace_node_execution(&mut job, node_exec);
                self.fail_job(&mut job, "workflow not found").await?;
                return Ok(job);
            };

            let mut api_json: ApiForm = definition.api_json.clone();
            patch_parameters(&mut api_json, &definition.exposed_parameters, &parameter_values);
            apply_node_bypass(&mut api_json, &definition.bypassed_nodes);
            node_exec.input_data = serde_json::to_value(&api_json).unwrap_or_default();

            let snapshot = self.registry.snapshot();
            let candidates: Vec<Candidate> = snapshot
                .iter()
                .map(|(config, status)| Candidate { config, status: status.as_ref() })
                .collect();

            let backend = match select_with_affinity(
                &candidates,
                &definition.required_capabilities,
                canvas_node.backend_affinity.as_deref(),
                canvas_node.fallback_strategy,
            ) {
                Ok(Some(backend)) => backend,
                Ok(None) | Err(NoBackendReason::AskUser) => {
                    node_exec.status = NodeExecutionStatus::Failed;
                    node_exec.error_message = Some("no backend available (ask-user)".to_string());
                    self.replace_node_execution(&mut job, node_exec);
                    self.fail_job(&mut job, "no backend available").await?;
                    return Ok(job);
                }
                Err(NoBackendReason::AffinityUnusableNoFallback) | Err(NoBackendReason::NoCandidates) => {
                    node_exec.status = NodeExecutionStatus::Failed;
                    node_exec.error_message = Some("no backend available".to_string());
                    self.replace_node_execution(&mut job, node_exec);
                    self.fail_job(&mut job, "no backend available").await?;
                    return Ok(job);
                }
            };
            let backend_id = backend.id.clone();

            node_exec.backend_id = Some(backend_id.clone());
            node_exec.status = NodeExecutionStatus::Queued;
            self.replace_node_execution(&mut job, node_exec.clone());
            self.persist(&job).await?;

            self.registry.set_current_job(&backend_id, Some(job.id.clone()))?;

            node_exec.status = NodeExecutionStatus::Running;
            node_exec.started_at = Some(Utc::now());
            self.replace_node_execution(&mut job, node_exec.clone());
            self.persist(&job).await?;

            let client = (self.client_factory)(&backend_id, &backend.base_url());
            let dispatch_result = self
                .dispatch_one(client.as_ref(), &api_json, &mut job, &mut node_exec, &mut cancel)
                .await;

            // Slot is released on every exit path, success or failure.
            if let Err(e) = self.registry.set_current_job(&backend_id, None) {
                warn!(backend_id, error = %e, "failed to release backend slot");
            }
            client.close().await;

            match dispatch_result {
                Ok(()) => {
                    node_exec.status = NodeExecutionStatus::Completed;
                    node_exec.completed_at = Some(Utc::now());
                    self.replace_node_execution(&mut job, node_exec);
                    self.persist(&job).await?;
                    graph.on_node_complete(&node_id);
                }
                Err(RuntimeError::Cancelled) => {
                    node_exec.status = NodeExecutionStatus::Cancelled;
                    node_exec.completed_at = Some(Utc::now());
                    self.replace_node_execution(&mut job, node_exec);
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    self.persist(&job).await?;
                    return Ok(job);
                }
                Err(e) => {
                    node_exec.status = NodeExecutionStatus::Failed;
                    node_exec.error_message = Some(e.to_string());
                    node_exec.completed_at = Some(Utc::now());
                    self.replace_node_execution(&mut job, node_exec);
                    self.fail_job(&mut job, &e.to_string()).await?;
                    return Ok(job);
                }
            }
        }

        let all_completed = job.node_executions.iter().all(|n| n.status == NodeExecutionStatus::Completed);
        if all_completed {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            self.persist(&job).await?;
        }
        info!(job_id = %job.id, status = %job.status, "job finished");
        Ok(job)
    }

    async fn dispatch_one(
        &self,
        client: &dyn BackendClient,
        api_json: &ApiForm,
        job: &mut Job,
        node_exec: &mut NodeExecution,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let prompt_id = client.submit_prompt(api_json, cancel.clone()).await?;
        node_exec.remote_prompt_id = Some(prompt_id.clone());

        let mut stream = client.open_progress_stream(&prompt_id, cancel.clone()).await?;
        let mut events_since_persist = 0u32;
        let mut last_step: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        let _ = client.interrupt().await;
                        return Err(RuntimeError::Cancelled);
                    }
                }
                event = stream.recv() => {
                    match event {
                        Some(ProgressEvent::Progress { value, max, node_id }) => {
                            if max > 0 {
                                node_exec.progress = (value as f64 / max as f64).clamp(0.0, 1.0);
                            }
                            if let Some(id) = node_id {
                                node_exec.current_step = Some(id);
                            }
                            events_since_persist += 1;
                            let step_changed = node_exec.current_step != last_step;
                            if step_changed {
                                last_step = node_exec.current_step.clone();
                            }
                            if events_since_persist >= PERSIST_EVERY_N_EVENTS || step_changed {
                                events_since_persist = 0;
                                self.replace_node_execution(job, node_exec.clone());
                                if let Err(e) = self.persist(job).await {
                                    warn!(job_id = %job.id, error = %e, "failed to persist in-flight node progress");
                                }
                            }
                        }
                        Some(ProgressEvent::Executed { node_id }) => {
                            node_exec.current_step = Some(node_id);
                        }
                        Some(ProgressEvent::Done) | None => break,
                    }
                }
            }
        }

        let history = client.fetch_history(&prompt_id, cancel.clone()).await?;
        node_exec.output_data = serde_json::to_value(&history).unwrap_or_default();
        node_exec.progress = 1.0;
        Ok(())
    }

    fn replace_node_execution(&self, job: &mut Job, updated: NodeExecution) {
        if let Some(existing) = job.node_executions.iter_mut().find(|n| n.id == updated.id) {
            *existing = updated;
        }
    }

    async fn fail_job(&self, job: &mut Job, message: &str) -> Result<()> {
        job.status = JobStatus::Failed;
        job.error_message = Some(message.to_string());
        job.completed_at = Some(Utc::now());
        self.persist(job).await
    }

    async fn cancel_job(&self, job: &mut Job) -> Result<()> {
        if let Some(running) = job
            .node_executions
            .iter_mut()
            .find(|n| n.status == NodeExecutionStatus::Running)
        {
            running.status = NodeExecutionStatus::Cancelled;
            running.completed_at = Some(Utc::now());
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.persist(job).await
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        self.repo.save(job).await
    }
}
