//! Server configuration, loaded from environment variables at startup.

/// Runtime configuration for orchestrator-server.
///
/// Every field has a sensible default so the server works out-of-the-box in
/// development; production deployments override via environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8080"`).
    pub bind_address: String,

    /// SQLite (or other sqlx-compatible) database URL.
    pub database_url: String,

    /// Directory where Workflow Definitions (C8) are stored, one file per id.
    pub workflows_dir: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Health Monitor (C3) sweep interval, in seconds.
    pub health_poll_interval_secs: u64,

    /// Whether the Health Monitor also collects per-backend metrics on each
    /// sweep (system stats, queue status, metrics-agent report).
    pub health_collect_metrics: bool,

    /// Default per-backend concurrency when a configured backend doesn't
    /// specify its own `max_concurrent_jobs`.
    pub backend_capacity: u32,

    /// Comma-separated list of allowed CORS origins. `None` allows all
    /// origins (`*`), suitable for development only.
    pub cors_allowed_origins: Option<String>,

    /// Serve the Swagger UI at `/swagger-ui` and the OpenAPI document at
    /// `/api-docs/openapi.json` alongside the API.
    pub enable_swagger: bool,

    /// Statically configured backend fleet, as `id@host:port` entries
    /// separated by commas, e.g. `"gpu1@10.0.0.1:8188,gpu2@10.0.0.2:8188"`.
    /// At least one is required — validated at load time.
    pub backends: String,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("ORCH_BIND", "0.0.0.0:8080"),
            database_url: env_or("ORCH_DATABASE_URL", "sqlite://orchestrator.db?mode=rwc"),
            workflows_dir: env_or("ORCH_WORKFLOWS_DIR", "./workflows"),
            log_level: env_or("ORCH_LOG", "info"),
            log_json: std::env::var("ORCH_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            health_poll_interval_secs: parse_env("ORCH_HEALTH_POLL_INTERVAL_SECS", 10),
            health_collect_metrics: std::env::var("ORCH_HEALTH_COLLECT_METRICS")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            backend_capacity: parse_env("ORCH_BACKEND_CAPACITY", 1),
            cors_allowed_origins: std::env::var("ORCH_CORS_ORIGINS").ok(),
            enable_swagger: std::env::var("ORCH_ENABLE_SWAGGER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            backends: env_or("ORCH_BACKENDS", ""),
        }
    }

    /// Parses [`Config::backends`] into `(id, host, port)` triples. Returns an
    /// error if the list is empty or malformed — validated once at startup,
    /// never deferred to first use.
    pub fn parse_backends(&self) -> Result<Vec<(String, String, u16)>, String> {
        if self.backends.trim().is_empty() {
            return Err("ORCH_BACKENDS must name at least one backend".to_string());
        }
        self.backends
            .split(',')
            .map(|entry| {
                let entry = entry.trim();
                let (id, host_port) = entry
                    .split_once('@')
                    .ok_or_else(|| format!("backend entry '{entry}' is not of the form id@host:port"))?;
                let (host, port) = host_port
                    .rsplit_once(':')
                    .ok_or_else(|| format!("backend entry '{entry}' is missing a port"))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| format!("backend entry '{entry}' has an invalid port"))?;
                Ok((id.to_string(), host.to_string(), port))
            })
            .collect()
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backends_splits_id_host_port() {
        let cfg = Config { backends: "a@10.0.0.1:8188,b@10.0.0.2:8189".to_string(), ..Config::from_env() };
        let parsed = cfg.parse_backends().unwrap();
        assert_eq!(parsed, vec![
            ("a".to_string(), "10.0.0.1".to_string(), 8188),
            ("b".to_string(), "10.0.0.2".to_string(), 8189),
        ]);
    }

    #[test]
    fn parse_backends_rejects_empty_list() {
        let cfg = Config { backends: "".to_string(), ..Config::from_env() };
        assert!(cfg.parse_backends().is_err());
    }
}
