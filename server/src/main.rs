//! orchestrator-server: HTTP/WebSocket front door for the orchestrator-core
//! engine. Owns configuration, persistence, the background Health Monitor
//! sweep, and process lifecycle; all scheduling/dispatch logic lives in
//! `orchestrator-core`.

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod state;

#[cfg(test)]
mod test_support;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::backend_client::{BackendClient, BackendClientFactory, HttpBackendClient};
use orchestrator_core::group_manager::ParallelJobGroupManager;
use orchestrator_core::health_monitor::HealthMonitor;
use orchestrator_core::job_manager::SingleJobManager;
use orchestrator_core::models::BackendConfig;
use orchestrator_core::registry::BackendRegistry;
use orchestrator_core::workflow_storage::WorkflowStorage;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::state::{AppState, JobHandles};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    init_tracing(&cfg);

    info!(version = env!("CARGO_PKG_VERSION"), "orchestrator-server starting");

    let backend_specs = cfg.parse_backends().map_err(|e| anyhow::anyhow!(e))?;

    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    let registry = BackendRegistry::new();
    for (id, host, port) in backend_specs {
        registry.register(BackendConfig {
            id,
            name: String::new(),
            host,
            port,
            enabled: true,
            capabilities: vec![],
            max_concurrent_jobs: cfg.backend_capacity,
            tags: vec![],
        });
    }

    let client_factory: BackendClientFactory =
        Arc::new(|id, base| Arc::new(HttpBackendClient::new(id, base)) as Arc<dyn BackendClient>);

    let health_monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        client_factory.clone(),
        Duration::from_secs(cfg.health_poll_interval_secs),
        cfg.health_collect_metrics,
    ));
    let health_monitor_task = {
        let monitor = health_monitor.clone();
        tokio::spawn(async move { monitor.run_loop().await })
    };

    let snapshot_task = spawn_metrics_snapshot_loop(registry.clone(), store.clone(), Duration::from_secs(cfg.health_poll_interval_secs));

    let workflows = WorkflowStorage::new(cfg.workflows_dir.clone());
    let job_manager = Arc::new(SingleJobManager::new(registry.clone(), store.clone(), client_factory.clone()));
    let group_manager = Arc::new(ParallelJobGroupManager::new(registry.clone(), client_factory));

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        store,
        registry,
        workflows,
        workflow_cache: Arc::new(RwLock::new(HashMap::new())),
        job_manager,
        group_manager,
        job_handles: Arc::new(JobHandles::new()),
    });

    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    health_monitor.stop();
    snapshot_task.abort();
    let _ = tokio::time::timeout(Duration::from_secs(5), health_monitor_task).await;

    info!("orchestrator-server stopped");
    Ok(())
}

fn init_tracing(cfg: &Config) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!("WARN: ORCH_LOG='{}' is not a valid tracing filter ({e}); falling back to 'info'", cfg.log_level);
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).with_thread_ids(true);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Every sweep interval, appends one Metrics Snapshot (C13) per backend from
/// the registry's latest observed status. Kept separate from the Health
/// Monitor (C3) itself, which stays storage-agnostic.
fn spawn_metrics_snapshot_loop(registry: BackendRegistry, store: Arc<SqliteStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it, the sweep hasn't run yet
        loop {
            ticker.tick().await;
            for (config, status) in registry.snapshot() {
                let Some(status) = status else { continue };
                if let Err(e) = store.insert_metrics_snapshot(&config.id, &status).await {
                    warn!(backend_id = %config.id, error = %e, "failed to persist metrics snapshot");
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
