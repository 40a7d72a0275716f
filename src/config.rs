//! Static configuration for the supervisor orchestration subsystem (spec
//! §6.4).
//!
//! Grounded in `weavegraph::runtimes::runtime_config::RuntimeConfig`: a
//! plain struct with `dotenvy`-backed env overrides and a `Default`
//! matching the spec's documented defaults, rather than a layered
//! config-file loader.

use std::time::Duration;

/// `store.backend` (spec §6.4): which [`crate::kv::KvStore`] implementation
/// [`Config::build_kv_store`]-style wiring should select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// `embedded_kv` — [`crate::kv::InMemoryKvStore`].
    EmbeddedKv,
    /// `local_file` — [`crate::kv::sqlite::SqliteKvStore`].
    LocalFile,
    /// `external` — reserved for a future out-of-process backend; not
    /// implemented by this crate (SPEC_FULL Non-goal).
    External,
}

impl StoreBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "embedded_kv" => Some(StoreBackend::EmbeddedKv),
            "local_file" => Some(StoreBackend::LocalFile),
            "external" => Some(StoreBackend::External),
            _ => None,
        }
    }
}

/// The subsystem's static configuration (spec §6.4). Construct with
/// [`Config::from_env`] to honor environment overrides, or
/// [`Config::default`] for the documented defaults verbatim.
#[derive(Clone, Debug)]
pub struct Config {
    pub lock_default_ttl: Duration,
    pub lock_sweep_interval: Duration,
    pub checkpoint_default_ttl: Duration,
    pub checkpoint_key_prefix: String,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub scheduler_periodic_snapshot_interval: Duration,
    pub scheduler_cleanup_interval: Duration,
    pub scheduler_stop_drain: Duration,
    pub store_backend: StoreBackend,
    pub sqlite_database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_default_ttl: Duration::from_secs(30),
            lock_sweep_interval: Duration::from_secs(10),
            checkpoint_default_ttl: Duration::from_secs(604_800),
            checkpoint_key_prefix: "ckpt".to_string(),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            scheduler_periodic_snapshot_interval: Duration::from_secs(60),
            scheduler_cleanup_interval: Duration::from_secs(300),
            scheduler_stop_drain: Duration::from_secs(5),
            store_backend: StoreBackend::EmbeddedKv,
            sqlite_database_url: "sqlite://wf-supervisor.db".to_string(),
        }
    }
}

impl Config {
    /// Load `.env` (if present) and apply recognized environment overrides
    /// on top of [`Config::default`]. Mirrors
    /// `RuntimeConfig::resolve_sqlite_db_name`'s `dotenvy::dotenv().ok()`
    /// then `std::env::var` fallback pattern.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Some(v) = env_u64("WF_LOCK_DEFAULT_TTL_SECONDS") {
            config.lock_default_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("WF_LOCK_SWEEP_INTERVAL_SECONDS") {
            config.lock_sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("WF_CHECKPOINT_DEFAULT_TTL_SECONDS") {
            config.checkpoint_default_ttl = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("WF_CHECKPOINT_KEY_PREFIX") {
            config.checkpoint_key_prefix = v;
        }
        if let Some(v) = env_u64("WF_RETRY_MAX_ATTEMPTS") {
            config.retry_max_attempts = v as u32;
        }
        if let Some(v) = env_u64("WF_RETRY_BASE_DELAY_SECONDS") {
            config.retry_base_delay = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("WF_SCHEDULER_PERIODIC_SNAPSHOT_INTERVAL_SECONDS") {
            config.scheduler_periodic_snapshot_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("WF_SCHEDULER_CLEANUP_INTERVAL_SECONDS") {
            config.scheduler_cleanup_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("WF_SCHEDULER_STOP_DRAIN_SECONDS") {
            config.scheduler_stop_drain = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("WF_STORE_BACKEND") {
            if let Some(backend) = StoreBackend::parse(&v) {
                config.store_backend = backend;
            }
        }
        if let Ok(v) = std::env::var("WF_SQLITE_DATABASE_URL") {
            config.sqlite_database_url = v;
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::default();
        assert_eq!(config.lock_default_ttl, Duration::from_secs(30));
        assert_eq!(config.lock_sweep_interval, Duration::from_secs(10));
        assert_eq!(config.checkpoint_default_ttl, Duration::from_secs(604_800));
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.scheduler_periodic_snapshot_interval, Duration::from_secs(60));
        assert_eq!(config.scheduler_cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.scheduler_stop_drain, Duration::from_secs(5));
        assert_eq!(config.store_backend, StoreBackend::EmbeddedKv);
    }

    #[test]
    fn store_backend_parses_recognized_values() {
        assert_eq!(StoreBackend::parse("embedded_kv"), Some(StoreBackend::EmbeddedKv));
        assert_eq!(StoreBackend::parse("local_file"), Some(StoreBackend::LocalFile));
        assert_eq!(StoreBackend::parse("external"), Some(StoreBackend::External));
        assert_eq!(StoreBackend::parse("bogus"), None);
    }
}
