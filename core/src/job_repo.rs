//! Job Repository (C7) contract. The durable implementation lives in
//! `orchestrator-server`'s `db` module (sqlx over SQLite); this trait keeps
//! the Single-Job Manager and Parallel Group Manager persistence-agnostic,
//! mirroring the teacher's `TaskStore` trait shape in `slab-server/src/
//! entities/task.rs` (an `impl Future<Output = ...> + Send` return type
//! rather than `#[async_trait]`, so the trait stays object-safe-free and
//! allocation-free on the hot path).

use std::future::Future;

use crate::error::Result;
use crate::models::Job;

pub trait JobRepository: Send + Sync {
    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Job>>> + Send;

    /// Newest-first.
    fn list(&self) -> impl Future<Output = Result<Vec<Job>>> + Send;

    /// Upsert; writes are atomic per job.
    fn save(&self, job: &Job) -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<()>> + Send;
}
