//! Data model shared by every component (§3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A configured remote rendering backend. Immutable after registration
/// except via a full reload of the configured backend list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_port() -> u16 {
    8188
}
fn default_true() -> bool {
    true
}
fn default_max_concurrent() -> u32 {
    1
}

impl BackendConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// The latest observed status of one backend. Always keyed by backend id.
///
/// Invariant: if `online` is false, `current_job_id` must be `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendStatus {
    pub backend_id: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub current_job_id: Option<String>,
    pub queue_pending: u32,
    pub queue_running: u32,
    #[serde(default = "default_gpu_name")]
    pub gpu_name: String,
    pub gpu_memory_total: u64,
    pub gpu_memory_used: u64,
    pub gpu_utilization: Option<f32>,
    pub gpu_temperature: Option<f32>,
    pub cpu_utilization: Option<f32>,
    pub ram_total: u64,
    pub ram_used: u64,
}

fn default_gpu_name() -> String {
    "Unknown".to_string()
}

impl BackendStatus {
    pub fn queue_depth(&self) -> u32 {
        self.queue_pending + self.queue_running
    }

    pub fn gpu_memory_free(&self) -> u64 {
        self.gpu_memory_total.saturating_sub(self.gpu_memory_used)
    }

    pub fn offline(backend_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            backend_id: backend_id.into(),
            online: false,
            last_seen: at,
            current_job_id: None,
            queue_pending: 0,
            queue_running: 0,
            gpu_name: default_gpu_name(),
            gpu_memory_total: 0,
            gpu_memory_used: 0,
            gpu_utilization: None,
            gpu_temperature: None,
            cpu_utilization: None,
            ram_total: 0,
            ram_used: 0,
        }
    }
}

/// A point-in-time metrics observation for one backend. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub backend_id: String,
    pub timestamp: DateTime<Utc>,
    pub gpu_memory_used: u64,
    pub gpu_memory_total: u64,
    pub gpu_utilization: Option<f32>,
    pub gpu_temperature: Option<f32>,
    pub cpu_utilization: Option<f32>,
    pub ram_used: u64,
    pub ram_total: u64,
    pub queue_depth: u32,
    pub active_job_id: Option<String>,
}

// ─── Workflow definitions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ParamType {
    Int,
    Float,
    String,
    Bool,
    Choice,
    Multiline,
    ImagePath,
    VideoPath,
    Seed,
    Prompt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamConstraints {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub file_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposedParameter {
    pub id: String,
    pub node_id: String,
    pub field_name: String,
    pub display_name: String,
    pub param_type: ParamType,
    pub default_value: serde_json::Value,
    #[serde(default)]
    pub constraints: Option<ParamConstraints>,
    #[serde(default)]
    pub order: i32,
}

/// A single node of the renderer-native API form: `{class, inputs}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiNode {
    pub class: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
}

/// The flat, directly-submittable workflow form: node-id → {class, inputs}.
pub type ApiForm = HashMap<String, ApiNode>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub workflow_json: serde_json::Value,
    pub api_json: ApiForm,
    #[serde(default)]
    pub exposed_parameters: Vec<ExposedParameter>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub bypassed_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Exposed parameters are unique by id; (node_id, field_name) pairs must
    /// also be unique within one definition.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_fields = std::collections::HashSet::new();
        for p in &self.exposed_parameters {
            if !seen_ids.insert(&p.id) {
                return Err(format!("duplicate exposed parameter id {}", p.id));
            }
            let key = (p.node_id.clone(), p.field_name.clone());
            if !seen_fields.insert(key) {
                return Err(format!(
                    "duplicate (node_id, field_name) pair ({}, {})",
                    p.node_id, p.field_name
                ));
            }
        }
        Ok(())
    }
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub job_id: String,
    pub canvas_node_id: String,
    pub backend_id: Option<String>,
    pub status: NodeExecutionStatus,
    pub remote_prompt_id: Option<String>,
    pub progress: f64,
    pub current_step: Option<String>,
    pub input_data: serde_json::Value,
    pub output_data: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
}

impl NodeExecution {
    pub fn new(job_id: &str, canvas_node_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            canvas_node_id: canvas_node_id.to_string(),
            backend_id: None,
            status: NodeExecutionStatus::Pending,
            remote_prompt_id: None,
            progress: 0.0,
            current_step: None,
            input_data: serde_json::Value::Null,
            output_data: serde_json::Value::Null,
            started_at: None,
            completed_at: None,
            error_message: None,
            error_trace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project_id: Option<String>,
    pub status: JobStatus,
    pub canvas_snapshot: serde_json::Value,
    pub parameter_values: serde_json::Value,
    pub node_executions: Vec<NodeExecution>,
    pub outputs: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(canvas_snapshot: serde_json::Value, parameter_values: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: None,
            status: JobStatus::Pending,
            canvas_snapshot,
            parameter_values,
            node_executions: Vec::new(),
            outputs: serde_json::Value::Null,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Fraction of completed node-executions plus partial credit for the one
    /// currently running, matching the source's `progress_percent` shape.
    pub fn progress(&self) -> f64 {
        if self.node_executions.is_empty() {
            return 0.0;
        }
        let total = self.node_executions.len() as f64;
        let completed = self
            .node_executions
            .iter()
            .filter(|n| n.status == NodeExecutionStatus::Completed)
            .count() as f64;
        let running_partial: f64 = self
            .node_executions
            .iter()
            .filter(|n| n.status == NodeExecutionStatus::Running)
            .map(|n| n.progress)
            .sum();
        (completed + running_partial) / total
    }
}

// ─── Job Groups ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SeedStrategy {
    Random,
    Sequential,
    Fibonacci,
    GoldenRatio,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobGroupStatus {
    Pending,
    Running,
    PartialComplete,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChildJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ChildJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChildJobStatus::Completed
                | ChildJobStatus::Failed
                | ChildJobStatus::Timeout
                | ChildJobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildJobError {
    pub message: String,
    pub error_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildJob {
    pub job_id: String,
    pub backend_id: String,
    pub seed: u64,
    pub status: ChildJobStatus,
    pub progress: f64,
    pub current_step: Option<String>,
    pub outputs: serde_json::Value,
    pub error: Option<ChildJobError>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChildJob {
    pub fn new(backend_id: &str, seed: u64) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            backend_id: backend_id.to_string(),
            seed,
            status: ChildJobStatus::Queued,
            progress: 0.0,
            current_step: None,
            outputs: serde_json::Value::Null,
            error: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGroup {
    pub id: String,
    pub panel_id: Option<String>,
    pub workflow_json: ApiForm,
    pub parameters: serde_json::Value,
    pub seed_strategy: SeedStrategy,
    pub base_seed: Option<u64>,
    pub child_jobs: Vec<ChildJob>,
    pub status: JobGroupStatus,
    pub timeout_seconds: u32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobGroup {
    pub fn completed_count(&self) -> usize {
        self.child_jobs
            .iter()
            .filter(|c| c.status == ChildJobStatus::Completed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.child_jobs
            .iter()
            .filter(|c| matches!(c.status, ChildJobStatus::Failed | ChildJobStatus::Timeout))
            .count()
    }

    pub fn running_count(&self) -> usize {
        self.child_jobs
            .iter()
            .filter(|c| matches!(c.status, ChildJobStatus::Running | ChildJobStatus::Queued))
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.child_jobs.len()
    }
}

/// Request body for `POST /api/job-group`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobGroupRequest {
    pub workflow_json: ApiForm,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub backend_ids: Vec<String>,
    #[serde(default = "default_seed_strategy")]
    pub seed_strategy: SeedStrategy,
    #[serde(default)]
    pub base_seed: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

fn default_seed_strategy() -> SeedStrategy {
    SeedStrategy::Random
}
fn default_timeout_seconds() -> u32 {
    300
}

impl JobGroupRequest {
    /// Schema-layer validation (§9: typed validation before the core sees the
    /// request). Returns a human-readable reason on the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.backend_ids.is_empty() {
            return Err("backend_ids must be non-empty".to_string());
        }
        if !(30..=3600).contains(&self.timeout_seconds) {
            return Err("timeout_seconds must be in [30, 3600]".to_string());
        }
        Ok(())
    }
}

// ─── Canvas / graph ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
    Workflow,
    Condition,
    Fanout,
    Merge,
    Input,
    Output,
    Execute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FallbackStrategy {
    None,
    AskUser,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasNode {
    pub id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub backend_affinity: Option<String>,
    #[serde(default = "default_fallback")]
    pub fallback_strategy: FallbackStrategy,
    #[serde(default)]
    pub parameter_values: serde_json::Value,
}

fn default_fallback() -> FallbackStrategy {
    FallbackStrategy::AskUser
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConnection {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanvasLayout {
    pub nodes: Vec<CanvasNode>,
    pub connections: Vec<CanvasConnection>,
}
