//! Health Monitor (C3): periodic concurrent poll of every registered
//! backend, merged into the registry. Never panics or propagates a failure
//! outside itself — per-backend failures are localized (§4.3, §7).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backend_client::{BackendClient, BackendClientFactory as ClientFactory};
use crate::models::BackendStatus;
use crate::registry::BackendRegistry;

pub struct HealthMonitor {
    registry: BackendRegistry,
    client_factory: ClientFactory,
    interval: Duration,
    collect_metrics: bool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(registry: BackendRegistry, client_factory: ClientFactory, interval: Duration, collect_metrics: bool) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self { registry, client_factory, interval, collect_metrics, stop_tx, stop_rx }
    }

    /// Runs sweeps on `interval` until `stop()` is called. Uses an
    /// interruptible sleep (`watch::Receiver::changed` raced against a
    /// timer) so a stop request is honored mid-wait, not just between
    /// sweeps.
    pub async fn run_loop(&self) {
        loop {
            self.poll_once().await;
            let mut stop_rx = self.stop_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return;
                    }
                }
            }
            if *self.stop_rx.borrow() {
                return;
            }
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Runs exactly one sweep over every registered backend, concurrently.
    pub async fn poll_once(&self) {
        let backends = self.registry.list();
        let futures = backends.into_iter().map(|config| {
            let registry = self.registry.clone();
            let client = (self.client_factory)(&config.id, &config.base_url());
            let collect_metrics = self.collect_metrics;
            let existing = registry.get_status(&config.id);
            async move {
                let status = poll_backend(client.as_ref(), collect_metrics, existing).await;
                if let Err(e) = registry.update_status(&config.id, status) {
                    warn!(backend_id = %config.id, error = %e, "failed to record health-poll status");
                }
            }
        });
        futures::future::join_all(futures).await;
    }
}

async fn poll_backend(client: &dyn BackendClient, collect_metrics: bool, existing: Option<BackendStatus>) -> BackendStatus {
    let (_, cancel_rx) = watch::channel(false);
    let online = client.health_check(cancel_rx.clone()).await;
    if !online {
        return BackendStatus::offline(client.backend_id(), Utc::now());
    }

    if !collect_metrics {
        let mut status = BackendStatus::offline(client.backend_id(), Utc::now());
        status.online = true;
        return status;
    }

    let (stats, queue, agent) = tokio::join!(
        client.get_system_stats(cancel_rx.clone()),
        client.get_queue_status(cancel_rx.clone()),
        client.get_metrics_agent(cancel_rx.clone()),
    );

    build_status(client.backend_id(), stats.ok(), queue.ok(), agent.ok().flatten(), existing)
}

/// Merge rule (§4.3), highest to lowest precedence: (1) metrics-agent
/// response, (2) a WebSocket push (C4) already sitting in the registry as
/// `existing`, (3) `system_stats`/`queue_status` from this sweep, (4) prior
/// status for fields none of the above refreshed. `existing` is read once,
/// before this sweep's network calls, so it reflects whatever the registry
/// held at the start of the poll.
fn build_status(
    backend_id: &str,
    stats: Option<crate::backend_client::SystemStats>,
    queue: Option<crate::backend_client::QueueStatus>,
    agent: Option<crate::backend_client::MetricsAgentReport>,
    existing: Option<BackendStatus>,
) -> BackendStatus {
    let mut status = BackendStatus::offline(backend_id, Utc::now());
    status.online = true;

    if let Some(queue) = queue {
        status.queue_pending = queue.pending;
        status.queue_running = queue.running;
    }

    if let Some(stats) = &stats {
        status.ram_total = stats.ram_total;
        if let Some(device) = stats.devices.first() {
            status.gpu_name = device.name.clone();
            status.gpu_memory_total = device.vram_total;
            status.gpu_memory_used = device.vram_total.saturating_sub(device.vram_free);
        }
    }

    let has_metrics_agent = agent.as_ref().is_some_and(|a| a.cpu_utilization.is_some() || a.gpu_utilization.is_some());

    // Level 2/4: preserve the prior sweep's (or a WebSocket push's) CPU/GPU
    // readings whenever the metrics agent didn't refresh them this sweep —
    // `get_metrics_agent` commonly returns `Ok(None)`, and without this the
    // fields would reset to empty on every such sweep instead of holding.
    if let Some(existing) = &existing {
        if !has_metrics_agent {
            status.cpu_utilization = existing.cpu_utilization;
            status.gpu_utilization = existing.gpu_utilization;
            status.gpu_temperature = existing.gpu_temperature;
            if existing.ram_total > 0 {
                status.ram_total = existing.ram_total;
                status.ram_used = existing.ram_used;
            }
        }
    }

    // Level 1: metrics-agent precedence is highest.
    if let Some(agent) = agent {
        if let Some(v) = agent.cpu_utilization {
            status.cpu_utilization = Some(v);
        }
        if let Some(v) = agent.gpu_utilization {
            status.gpu_utilization = Some(v);
        }
        if let Some(v) = agent.gpu_temperature {
            status.gpu_temperature = Some(v);
        }
        if let Some(v) = agent.ram_used {
            status.ram_used = v;
        }
        if let Some(v) = agent.ram_total {
            status.ram_total = v;
        }
        if let Some(v) = agent.gpu_memory_used {
            status.gpu_memory_used = v;
        }
        if let Some(v) = agent.gpu_memory_total {
            status.gpu_memory_total = v;
        }
    }

    status
}

/// Merges a partial status pushed over the metrics WebSocket (C4) into the
/// registry, preserving queue depth and any other REST-sourced field not
/// present in the push frame.
pub fn merge_pushed_metrics(existing: &BackendStatus, push: &crate::metrics_ws::MetricsFrame) -> BackendStatus {
    let mut merged = existing.clone();
    merged.last_seen = Utc::now();
    if let Some(v) = push.gpu_name.clone() {
        merged.gpu_name = v;
    }
    if let Some(v) = push.gpu_memory_total {
        merged.gpu_memory_total = v;
    }
    if let Some(v) = push.gpu_memory_used {
        merged.gpu_memory_used = v;
    }
    if let Some(v) = push.gpu_utilization {
        merged.gpu_utilization = Some(v);
    }
    if let Some(v) = push.gpu_temperature {
        merged.gpu_temperature = Some(v);
    }
    if let Some(v) = push.cpu_utilization {
        merged.cpu_utilization = Some(v);
    }
    merged
}
