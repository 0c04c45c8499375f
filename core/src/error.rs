//! The error taxonomy shared by every component.
//!
//! Mirrors the source's exception hierarchy as an explicit result union: every
//! suspending operation in this crate returns `Result<T, RuntimeError>` rather
//! than raising. Only the process entry point in `orchestrator-server` is
//! allowed to collapse this into `anyhow::Error`.

use thiserror::Error;

/// Abstract error kinds a caller can match on without parsing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NoBackend,
    Transport,
    RemoteError,
    Timeout,
    Cancelled,
    Corrupt,
}

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no backend available for required capabilities {required:?}")]
    NoBackend { required: Vec<String> },

    #[error("backend {backend_id} is unknown")]
    UnknownBackend { backend_id: String },

    #[error("transport error talking to backend {backend_id}: {message}")]
    Transport { backend_id: String, message: String },

    #[error("backend {backend_id} rejected the prompt: {message}")]
    RemoteError { backend_id: String, message: String },

    #[error("operation timed out after {timeout_seconds}s")]
    Timeout { timeout_seconds: u64 },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("job group {group_id} not found")]
    GroupNotFound { group_id: String },

    #[error("job {job_id} is already in a terminal state")]
    AlreadyTerminal { job_id: String },

    #[error("workflow {id} not found")]
    WorkflowNotFound { id: String },

    #[error("persisted artifact at {location} failed to deserialize: {message}")]
    Corrupt { location: String, message: String },

    #[error("the submission queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("engine not initialized")]
    NotInitialized,
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Validation(_) => ErrorKind::Validation,
            RuntimeError::NoBackend { .. } => ErrorKind::NoBackend,
            RuntimeError::UnknownBackend { .. } => ErrorKind::Validation,
            RuntimeError::Transport { .. } => ErrorKind::Transport,
            RuntimeError::RemoteError { .. } => ErrorKind::RemoteError,
            RuntimeError::Timeout { .. } => ErrorKind::Timeout,
            RuntimeError::Cancelled => ErrorKind::Cancelled,
            RuntimeError::JobNotFound { .. } => ErrorKind::Validation,
            RuntimeError::GroupNotFound { .. } => ErrorKind::Validation,
            RuntimeError::AlreadyTerminal { .. } => ErrorKind::Validation,
            RuntimeError::WorkflowNotFound { .. } => ErrorKind::Validation,
            RuntimeError::Corrupt { .. } => ErrorKind::Corrupt,
            RuntimeError::QueueFull { .. } => ErrorKind::Validation,
            RuntimeError::Persistence(_) => ErrorKind::Corrupt,
            RuntimeError::NotInitialized => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
