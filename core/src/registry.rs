//! Backend Registry (C1): the single source of truth for configured
//! backends and their latest observed status.
//!
//! All mutations go through one `RwLock`-guarded map, following the same
//! shared-handle shape as the teacher's `ResultStorage` — a `Clone`, `Debug`
//! struct wrapping an `Arc<RwLock<...>>` so every component holds an
//! equally-privileged handle to the same state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::error::{Result, RuntimeError};
use crate::models::{BackendConfig, BackendStatus};

#[derive(Debug)]
struct Inner {
    configs: HashMap<String, BackendConfig>,
    statuses: HashMap<String, BackendStatus>,
    /// Registration order, for the scheduler's stable tie-break.
    order: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct BackendRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                configs: HashMap::new(),
                statuses: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    /// On first registration of an id, a synthetic offline status is
    /// materialized immediately (§4.1) so the scheduler never needs to treat
    /// "no status yet" as a separate case from "explicitly offline".
    pub fn register(&self, config: BackendConfig) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if !inner.configs.contains_key(&config.id) {
            inner.order.push(config.id.clone());
        }
        let id = config.id.clone();
        inner.configs.insert(id.clone(), config);
        inner
            .statuses
            .entry(id.clone())
            .or_insert_with(|| BackendStatus::offline(id, Utc::now()));
    }

    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.configs.remove(id);
        inner.statuses.remove(id);
        inner.order.retain(|x| x != id);
    }

    pub fn list(&self) -> Vec<BackendConfig> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.order.iter().filter_map(|id| inner.configs.get(id).cloned()).collect()
    }

    pub fn get(&self, id: &str) -> Option<BackendConfig> {
        self.inner.read().expect("registry lock poisoned").configs.get(id).cloned()
    }

    pub fn get_status(&self, id: &str) -> Option<BackendStatus> {
        self.inner.read().expect("registry lock poisoned").statuses.get(id).cloned()
    }

    pub fn update_status(&self, id: &str, status: BackendStatus) -> Result<()> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if !inner.configs.contains_key(id) {
            return Err(RuntimeError::UnknownBackend { backend_id: id.to_string() });
        }
        inner.statuses.insert(id.to_string(), status);
        Ok(())
    }

    pub fn get_online(&self) -> Vec<BackendConfig> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|id| {
                let config = inner.configs.get(id)?;
                let status = inner.statuses.get(id)?;
                (config.enabled && status.online).then(|| config.clone())
            })
            .collect()
    }

    pub fn get_by_capability(&self, capability: &str) -> Vec<BackendConfig> {
        self.list()
            .into_iter()
            .filter(|c| c.capabilities.iter().any(|cap| cap == capability))
            .collect()
    }

    /// Set (or clear, with `None`) the job currently occupying a backend's
    /// slot. Preserves every other status field, matching the source's
    /// field-by-field reconstruction in `set_current_job`.
    pub fn set_current_job(&self, id: &str, job_id: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let status = inner
            .statuses
            .get_mut(id)
            .ok_or_else(|| RuntimeError::UnknownBackend { backend_id: id.to_string() })?;
        status.current_job_id = job_id;
        Ok(())
    }

    /// Snapshot of `(config, status)` pairs in registration order, the shape
    /// the Scheduler (C5) consumes directly.
    pub fn snapshot(&self) -> Vec<(BackendConfig, Option<BackendStatus>)> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|id| inner.configs.get(id).cloned().map(|c| (c, inner.statuses.get(id).cloned())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            name: id.to_string(),
            host: "localhost".to_string(),
            port: 8188,
            enabled: true,
            capabilities: vec![],
            max_concurrent_jobs: 1,
            tags: vec![],
        }
    }

    #[test]
    fn first_registration_materializes_offline_status() {
        let registry = BackendRegistry::new();
        registry.register(config("a"));
        let status = registry.get_status("a").unwrap();
        assert!(!status.online);
        assert!(status.current_job_id.is_none());
    }

    #[test]
    fn update_status_on_unknown_backend_errors() {
        let registry = BackendRegistry::new();
        assert!(registry
            .update_status("ghost", BackendStatus::offline("ghost", Utc::now()))
            .is_err());
    }

    #[test]
    fn get_online_requires_enabled_and_online() {
        let registry = BackendRegistry::new();
        registry.register(config("a"));
        registry.register(config("b"));
        let mut status_a = registry.get_status("a").unwrap();
        status_a.online = true;
        registry.update_status("a", status_a).unwrap();
        let online = registry.get_online();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, "a");
    }

    #[test]
    fn registration_order_is_preserved_for_scheduler_tie_break() {
        let registry = BackendRegistry::new();
        registry.register(config("z"));
        registry.register(config("a"));
        let ids: Vec<_> = registry.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[test]
    fn clone_shares_the_same_underlying_state() {
        let registry = BackendRegistry::new();
        let handle = registry.clone();
        registry.register(config("a"));
        assert!(handle.get("a").is_some());
    }
}
