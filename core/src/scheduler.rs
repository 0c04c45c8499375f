//! Pure backend-selection policy (§4.5). Nothing here suspends or mutates
//! shared state — callers pass in a snapshot and get a decision back.

use crate::models::{BackendConfig, BackendStatus, FallbackStrategy};

/// Why `select` declined to return a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoBackendReason {
    /// The affinity-named backend exists but is not usable, and its fallback
    /// strategy is `none`.
    AffinityUnusableNoFallback,
    /// The affinity-named backend is not usable and the caller asked to be
    /// consulted (`ask_user`) rather than have the scheduler decide.
    AskUser,
    /// No candidate (with or without affinity) satisfies the requirements.
    NoCandidates,
}

fn is_candidate(config: &BackendConfig, status: Option<&BackendStatus>, required: &[String]) -> bool {
    if !config.enabled {
        return false;
    }
    let Some(status) = status else {
        return false;
    };
    if !status.online {
        return false;
    }
    required.iter().all(|cap| config.capabilities.iter().any(|c| c == cap))
}

/// One registered backend as seen by the scheduler: its static config paired
/// with its latest status, in registration order (the tie-breaker).
pub struct Candidate<'a> {
    pub config: &'a BackendConfig,
    pub status: Option<&'a BackendStatus>,
}

/// Select the best candidate ascending by `(queue_depth, -gpu_memory_free)`,
/// stable by registration order on ties.
pub fn select_best<'a>(
    candidates: &[Candidate<'a>],
    required_capabilities: &[String],
) -> Option<&'a BackendConfig> {
    let mut usable: Vec<&Candidate<'a>> = candidates
        .iter()
        .filter(|c| is_candidate(c.config, c.status, required_capabilities))
        .collect();

    // `sort_by_key` is a stable sort: ties preserve the input (registration)
    // order, matching Python's `sorted()`.
    usable.sort_by_key(|c| {
        let status = c.status.expect("filtered to Some above");
        (status.queue_depth(), std::cmp::Reverse(status.gpu_memory_free()))
    });

    usable.first().map(|c| c.config)
}

/// Affinity-aware selection used by the graph executor (§4.5's "affinity
/// extension"). `affinity` names a canvas node's preferred backend id.
pub fn select_with_affinity<'a>(
    candidates: &[Candidate<'a>],
    required_capabilities: &[String],
    affinity: Option<&str>,
    fallback: FallbackStrategy,
) -> Result<Option<&'a BackendConfig>, NoBackendReason> {
    let Some(affinity_id) = affinity else {
        return Ok(select_best(candidates, required_capabilities));
    };

    let affinity_candidate = candidates.iter().find(|c| c.config.id == affinity_id);
    let affinity_usable = affinity_candidate
        .map(|c| is_candidate(c.config, c.status, required_capabilities))
        .unwrap_or(false);

    if affinity_usable {
        return Ok(affinity_candidate.map(|c| c.config));
    }

    match fallback {
        FallbackStrategy::None => Err(NoBackendReason::AffinityUnusableNoFallback),
        FallbackStrategy::AskUser => Err(NoBackendReason::AskUser),
        FallbackStrategy::Auto => Ok(select_best(candidates, required_capabilities)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cfg(id: &str, enabled: bool, caps: &[&str]) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            name: id.to_string(),
            host: "localhost".to_string(),
            port: 8188,
            enabled,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            max_concurrent_jobs: 1,
            tags: vec![],
        }
    }

    fn online_status(id: &str, queue: u32, vram_free: u64) -> BackendStatus {
        BackendStatus {
            backend_id: id.to_string(),
            online: true,
            last_seen: Utc::now(),
            current_job_id: None,
            queue_pending: 0,
            queue_running: queue,
            gpu_name: "Test".to_string(),
            gpu_memory_total: vram_free + 1000,
            gpu_memory_used: 1000,
            gpu_utilization: None,
            gpu_temperature: None,
            cpu_utilization: None,
            ram_total: 0,
            ram_used: 0,
        }
    }

    #[test]
    fn selects_lowest_queue_depth() {
        let c1 = cfg("a", true, &["sdxl"]);
        let c2 = cfg("b", true, &["sdxl"]);
        let s1 = online_status("a", 3, 1000);
        let s2 = online_status("b", 1, 1000);
        let candidates = vec![
            Candidate { config: &c1, status: Some(&s1) },
            Candidate { config: &c2, status: Some(&s2) },
        ];
        let picked = select_best(&candidates, &["sdxl".to_string()]);
        assert_eq!(picked.unwrap().id, "b");
    }

    #[test]
    fn breaks_queue_ties_by_more_free_vram() {
        let c1 = cfg("a", true, &[]);
        let c2 = cfg("b", true, &[]);
        let s1 = online_status("a", 1, 500);
        let s2 = online_status("b", 1, 2000);
        let candidates = vec![
            Candidate { config: &c1, status: Some(&s1) },
            Candidate { config: &c2, status: Some(&s2) },
        ];
        let picked = select_best(&candidates, &[]);
        assert_eq!(picked.unwrap().id, "b");
    }

    #[test]
    fn disabled_backend_is_never_a_candidate() {
        let c1 = cfg("a", false, &[]);
        let s1 = online_status("a", 0, 1000);
        let candidates = vec![Candidate { config: &c1, status: Some(&s1) }];
        assert!(select_best(&candidates, &[]).is_none());
    }

    #[test]
    fn missing_capability_excludes_candidate() {
        let c1 = cfg("a", true, &["sd15"]);
        let s1 = online_status("a", 0, 1000);
        let candidates = vec![Candidate { config: &c1, status: Some(&s1) }];
        assert!(select_best(&candidates, &["sdxl".to_string()]).is_none());
    }

    #[test]
    fn selection_is_idempotent_for_same_snapshot() {
        let c1 = cfg("a", true, &[]);
        let c2 = cfg("b", true, &[]);
        let s1 = online_status("a", 2, 1000);
        let s2 = online_status("b", 2, 1000);
        let candidates = vec![
            Candidate { config: &c1, status: Some(&s1) },
            Candidate { config: &c2, status: Some(&s2) },
        ];
        let first = select_best(&candidates, &[]).map(|c| c.id.clone());
        let second = select_best(&candidates, &[]).map(|c| c.id.clone());
        assert_eq!(first, second);
        assert_eq!(first.unwrap(), "a"); // tie broken by registration order
    }

    #[test]
    fn affinity_with_auto_fallback_falls_through() {
        let preferred = cfg("preferred", true, &["sdxl"]);
        let fallback = cfg("fallback", true, &[]);
        let preferred_status = online_status("preferred", 0, 1000); // missing capability
        let fallback_status = online_status("fallback", 0, 1000);
        let candidates = vec![
            Candidate { config: &preferred, status: Some(&preferred_status) },
            Candidate { config: &fallback, status: Some(&fallback_status) },
        ];
        let picked = select_with_affinity(
            &candidates,
            &["sdxl".to_string()],
            Some("preferred"),
            FallbackStrategy::Auto,
        );
        assert!(picked.is_err() || picked.unwrap().is_none());
    }

    #[test]
    fn affinity_none_fallback_errors_when_unusable() {
        let preferred = cfg("preferred", false, &[]);
        let candidates = vec![Candidate { config: &preferred, status: None }];
        let result = select_with_affinity(&candidates, &[], Some("preferred"), FallbackStrategy::None);
        assert_eq!(result.unwrap_err(), NoBackendReason::AffinityUnusableNoFallback);
    }
}
