//! SQLite implementation of the Job Repository (C7) and Metrics Snapshot
//! Store (C13).
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path **at compile time**
//! relative to `CARGO_MANIFEST_DIR`, so the directory is embedded into the
//! binary. The database file location is determined at runtime by the
//! configured database URL.
//!
//! # Queries
//!
//! The `sqlx::query`/`query_as` (runtime-verified) form is used deliberately
//! so no `DATABASE_URL` environment variable is needed at compile time.

use chrono::{DateTime, Utc};
use orchestrator_core::error::{Result, RuntimeError};
use orchestrator_core::job_repo::JobRepository;
use orchestrator_core::models::{Job, MetricsSnapshot};
use sqlx::SqlitePool;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (or creates) the SQLite database at `url` and runs pending
    /// migrations.
    pub async fn connect(url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Appends one Metrics Snapshot. Never mutated after insert (§4.13).
    pub async fn insert_metrics_snapshot(&self, backend_id: &str, status: &orchestrator_core::models::BackendStatus) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO metrics_snapshots \
             (backend_id, timestamp, gpu_memory_used, gpu_memory_total, gpu_utilization, \
              gpu_temperature, cpu_utilization, ram_used, ram_total, queue_depth, active_job_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(backend_id)
        .bind(&timestamp)
        .bind(status.gpu_memory_used as i64)
        .bind(status.gpu_memory_total as i64)
        .bind(status.gpu_utilization)
        .bind(status.gpu_temperature)
        .bind(status.cpu_utilization)
        .bind(status.ram_used as i64)
        .bind(status.ram_total as i64)
        .bind(status.queue_depth() as i64)
        .bind(&status.current_job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Most recent `limit` snapshots for one backend, newest-first.
    pub async fn recent_metrics_snapshots(&self, backend_id: &str, limit: i64) -> Result<Vec<MetricsSnapshot>> {
        let rows: Vec<(i64, String, String, i64, i64, Option<f32>, Option<f32>, Option<f32>, i64, i64, i64, Option<String>)> =
            sqlx::query_as(
                "SELECT id, backend_id, timestamp, gpu_memory_used, gpu_memory_total, gpu_utilization, \
                 gpu_temperature, cpu_utilization, ram_used, ram_total, queue_depth, active_job_id \
                 FROM metrics_snapshots WHERE backend_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )
            .bind(backend_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RuntimeError::Persistence(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    backend_id,
                    timestamp,
                    gpu_memory_used,
                    gpu_memory_total,
                    gpu_utilization,
                    gpu_temperature,
                    cpu_utilization,
                    ram_used,
                    ram_total,
                    queue_depth,
                    active_job_id,
                )| MetricsSnapshot {
                    id,
                    backend_id,
                    timestamp: timestamp.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
                    gpu_memory_used: gpu_memory_used as u64,
                    gpu_memory_total: gpu_memory_total as u64,
                    gpu_utilization,
                    gpu_temperature,
                    cpu_utilization,
                    ram_used: ram_used as u64,
                    ram_total: ram_total as u64,
                    queue_depth: queue_depth as u32,
                    active_job_id,
                },
            )
            .collect())
    }
}

impl JobRepository for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        match row {
            None => Ok(None),
            Some((data,)) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| RuntimeError::Corrupt { location: format!("jobs/{id}"), message: e.to_string() }),
        }
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM jobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        rows.into_iter()
            .map(|(data,)| {
                serde_json::from_str(&data)
                    .map_err(|e| RuntimeError::Corrupt { location: "jobs".to_string(), message: e.to_string() })
            })
            .collect()
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_string(job).map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        let created_at = job.created_at.to_rfc3339();
        let updated_at = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO jobs (id, status, data, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(id) DO UPDATE SET status = ?2, data = ?3, updated_at = ?5",
        )
        .bind(&job.id)
        .bind(job.status.to_string())
        .bind(&data)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::models::JobStatus;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite://:memory:").await.unwrap()
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = memory_store().await;
        let job = Job::new(serde_json::json!({}), serde_json::json!({}));
        store.save(&job).await.unwrap();
        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = memory_store().await;
        assert!(store.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_upserts_existing_row() {
        let store = memory_store().await;
        let mut job = Job::new(serde_json::json!({}), serde_json::json!({}));
        store.save(&job).await.unwrap();
        job.status = JobStatus::Completed;
        store.save(&job).await.unwrap();
        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metrics_snapshots_are_newest_first() {
        let store = memory_store().await;
        let mut status = orchestrator_core::models::BackendStatus::offline("b1", Utc::now());
        status.online = true;
        status.queue_running = 1;
        store.insert_metrics_snapshot("b1", &status).await.unwrap();
        status.queue_running = 2;
        store.insert_metrics_snapshot("b1", &status).await.unwrap();

        let recent = store.recent_metrics_snapshots("b1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].queue_depth, 2);
    }
}
