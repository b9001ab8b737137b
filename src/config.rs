//! Daemon configuration.
//!
//! Loads settings from `peerd.toml` with environment variable overrides.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this priority order (highest wins):
//! 1. Environment variables (e.g., `PEERD_CACHE_ROOT`, `PEERD_P2P_PORT`)
//! 2. TOML file (`peerd.toml` by default)
//! 3. Built-in defaults
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `cache` | Cache root directory, chunk size |
//! | `network` | Peer HTTP port, DHT port, bootstrap peers, advertisement |
//! | `routing` | Resolution cache capacity and TTLs |
//! | `tuning` | Worker pool size, origin retry budget, timeouts |
//!
//! # Example
//!
//! ```toml
//! [cache]
//! root = "/var/lib/peerd/cache"
//! chunk_size = 1048576
//!
//! [network]
//! peer_registry_port = 5000
//! p2p_port = 5001
//! bootstrap_peers = ["/ip4/10.0.0.2/tcp/5001/p2p/12D3Koo..."]
//!
//! [routing]
//! t_negative_secs = 30
//! ```

use crate::fetch::FetcherConfig;
use crate::routing::RouterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Read an env var, parse it, and apply it to `target`. Logs a warning on
/// parse failure.
fn env_parse<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env = var,
                value = %val,
                expected_type = std::any::type_name::<T>(),
                "Invalid env var value, using default"
            ),
        }
    }
}

/// Read an env var as a comma-separated list (skips empty items).
fn env_list(var: &str, target: &mut Vec<String>) {
    if let Ok(val) = std::env::var(var) {
        *target = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PeerdConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
}

/// Cache layout configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory for cached blob files and their bitmaps
    #[serde(default = "default_cache_root")]
    pub root: String,

    /// Chunk size in bytes. Must be a power of two.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_cache_root() -> String {
    "data/peerd/cache".to_string()
}
fn default_chunk_size() -> u64 {
    1024 * 1024
}

/// Network configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// TCP port of the peer HTTP surface (cluster-wide)
    #[serde(default = "default_peer_registry_port")]
    pub peer_registry_port: u16,

    /// TCP port of the DHT swarm
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,

    /// DHT bootstrap peers as multiaddrs with a /p2p/ component
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// URL scheme peers are addressed with
    #[serde(default = "default_peer_scheme")]
    pub peer_scheme: String,

    /// Seconds between re-advertisements of owned keys
    #[serde(default = "default_advertise_interval")]
    pub advertise_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_registry_port: default_peer_registry_port(),
            p2p_port: default_p2p_port(),
            bootstrap_peers: Vec::new(),
            peer_scheme: default_peer_scheme(),
            advertise_interval_secs: default_advertise_interval(),
        }
    }
}

fn default_peer_registry_port() -> u16 {
    5000
}
fn default_p2p_port() -> u16 {
    5001
}
fn default_peer_scheme() -> String {
    "https".to_string()
}
fn default_advertise_interval() -> u64 {
    30
}

/// Resolution cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Capacity of the resolution cache
    #[serde(default = "default_map_capacity")]
    pub map_capacity: usize,

    /// Bulk eviction percentage when the cache overflows
    #[serde(default = "default_map_evict_pct")]
    pub map_evict_pct: usize,

    /// Lifetime of positive resolutions in seconds
    #[serde(default = "default_t_positive")]
    pub t_positive_secs: u64,

    /// Lifetime of negative resolutions in seconds
    #[serde(default = "default_t_negative")]
    pub t_negative_secs: u64,

    /// Upper bound on peers returned per resolve
    #[serde(default = "default_max_peers")]
    pub max_peers_per_resolve: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            map_capacity: default_map_capacity(),
            map_evict_pct: default_map_evict_pct(),
            t_positive_secs: default_t_positive(),
            t_negative_secs: default_t_negative(),
            max_peers_per_resolve: default_max_peers(),
        }
    }
}

fn default_map_capacity() -> usize {
    4096
}
fn default_map_evict_pct() -> usize {
    5
}
fn default_t_positive() -> u64 {
    300
}
fn default_t_negative() -> u64 {
    30
}
fn default_max_peers() -> usize {
    10
}

/// Concurrency and retry tuning knobs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TuningConfig {
    /// Size of the chunk-fetch worker pool
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,

    /// Extra origin attempts after the first failure
    #[serde(default = "default_origin_retries")]
    pub origin_retries: u32,

    /// Base backoff between origin attempts in milliseconds
    #[serde(default = "default_origin_backoff_ms")]
    pub origin_backoff_ms: u64,

    /// Per-request timeout of the shared HTTP client in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            fetch_workers: default_fetch_workers(),
            origin_retries: default_origin_retries(),
            origin_backoff_ms: default_origin_backoff_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_fetch_workers() -> usize {
    32
}
fn default_origin_retries() -> u32 {
    2
}
fn default_origin_backoff_ms() -> u64 {
    250
}
fn default_request_timeout() -> u64 {
    30
}

impl PeerdConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let config_path = path.unwrap_or("peerd.toml");

        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            warn!(config_path = %config_path, "No config file found, using defaults/env vars");
            PeerdConfig::default()
        };

        // Cache overrides
        if let Ok(val) = std::env::var("PEERD_CACHE_ROOT") {
            config.cache.root = val;
        }
        env_parse("PEERD_CHUNK_SIZE", &mut config.cache.chunk_size);

        // Network overrides
        env_parse(
            "PEERD_REGISTRY_PORT",
            &mut config.network.peer_registry_port,
        );
        env_parse("PEERD_P2P_PORT", &mut config.network.p2p_port);
        env_list("PEERD_BOOTSTRAP_PEERS", &mut config.network.bootstrap_peers);
        if let Ok(val) = std::env::var("PEERD_PEER_SCHEME") {
            config.network.peer_scheme = val;
        }
        env_parse(
            "PEERD_ADVERTISE_INTERVAL_SECS",
            &mut config.network.advertise_interval_secs,
        );

        // Routing overrides
        env_parse("PEERD_MAP_CAPACITY", &mut config.routing.map_capacity);
        env_parse("PEERD_MAP_EVICT_PCT", &mut config.routing.map_evict_pct);
        env_parse("PEERD_T_POSITIVE_SECS", &mut config.routing.t_positive_secs);
        env_parse("PEERD_T_NEGATIVE_SECS", &mut config.routing.t_negative_secs);
        env_parse(
            "PEERD_MAX_PEERS_PER_RESOLVE",
            &mut config.routing.max_peers_per_resolve,
        );

        // Tuning overrides
        env_parse("PEERD_FETCH_WORKERS", &mut config.tuning.fetch_workers);
        env_parse("PEERD_ORIGIN_RETRIES", &mut config.tuning.origin_retries);
        env_parse(
            "PEERD_ORIGIN_BACKOFF_MS",
            &mut config.tuning.origin_backoff_ms,
        );
        env_parse(
            "PEERD_REQUEST_TIMEOUT_SECS",
            &mut config.tuning.request_timeout_secs,
        );

        config.validate();
        Ok(config)
    }

    /// Clamp out-of-range values back to their defaults, warning as the
    /// values are replaced.
    fn validate(&mut self) {
        if self.cache.chunk_size == 0 || !self.cache.chunk_size.is_power_of_two() {
            warn!(
                chunk_size = self.cache.chunk_size,
                "chunk_size must be a nonzero power of two, using default"
            );
            self.cache.chunk_size = default_chunk_size();
        }
        if self.routing.map_capacity == 0 {
            warn!("map_capacity must be at least 1, using default");
            self.routing.map_capacity = default_map_capacity();
        }
        if self.tuning.fetch_workers == 0 {
            warn!("fetch_workers must be at least 1, using default");
            self.tuning.fetch_workers = default_fetch_workers();
        }
    }

    /// The router view of this configuration.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            peer_registry_port: self.network.peer_registry_port,
            peer_scheme: self.network.peer_scheme.clone(),
            t_positive: Duration::from_secs(self.routing.t_positive_secs),
            t_negative: Duration::from_secs(self.routing.t_negative_secs),
            map_capacity: self.routing.map_capacity,
            map_evict_pct: self.routing.map_evict_pct,
            max_peers_per_resolve: self.routing.max_peers_per_resolve,
        }
    }

    /// The fetch-engine view of this configuration.
    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            fetch_workers: self.tuning.fetch_workers,
            max_peers_per_resolve: self.routing.max_peers_per_resolve,
            origin_retries: self.tuning.origin_retries,
            origin_backoff: Duration::from_millis(self.tuning.origin_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // SAFETY: `set_var`/`remove_var` are unsafe in Rust 2024 edition because
    // concurrent env modification is UB. Each test uses a unique prefixed
    // name (`_PTEST_*`) so no two tests touch the same variable, making
    // concurrent execution safe regardless of thread count.

    #[test]
    fn env_parse_valid_u16() {
        let mut val: u16 = 0;
        unsafe { std::env::set_var("_PTEST_PARSE_U16", "5005") };
        env_parse("_PTEST_PARSE_U16", &mut val);
        assert_eq!(val, 5005);
        unsafe { std::env::remove_var("_PTEST_PARSE_U16") };
    }

    #[test]
    fn env_parse_invalid_leaves_default() {
        let mut val: u16 = 42;
        unsafe { std::env::set_var("_PTEST_PARSE_INV", "not_a_number") };
        env_parse("_PTEST_PARSE_INV", &mut val);
        assert_eq!(val, 42);
        unsafe { std::env::remove_var("_PTEST_PARSE_INV") };
    }

    #[test]
    fn env_list_splits_and_trims() {
        let mut val: Vec<String> = Vec::new();
        unsafe { std::env::set_var("_PTEST_LIST", "/ip4/a, /ip4/b ,,") };
        env_list("_PTEST_LIST", &mut val);
        assert_eq!(val, vec!["/ip4/a".to_string(), "/ip4/b".to_string()]);
        unsafe { std::env::remove_var("_PTEST_LIST") };
    }

    #[test]
    fn default_config_has_sane_values() {
        let config = PeerdConfig::default();
        assert_eq!(config.cache.chunk_size, 1024 * 1024);
        assert_eq!(config.network.peer_registry_port, 5000);
        assert_eq!(config.routing.map_evict_pct, 5);
        assert_eq!(config.routing.t_negative_secs, 30);
        assert!(config.routing.t_negative_secs < config.routing.t_positive_secs);
        assert_eq!(config.tuning.fetch_workers, 32);
    }

    #[test]
    fn validate_rejects_bad_chunk_size() {
        let mut config = PeerdConfig::default();
        config.cache.chunk_size = 1000; // not a power of two
        config.validate();
        assert_eq!(config.cache.chunk_size, 1024 * 1024);

        config.cache.chunk_size = 0;
        config.validate();
        assert_eq!(config.cache.chunk_size, 1024 * 1024);
    }

    #[test]
    fn toml_roundtrip_with_partial_sections() {
        let toml_str = r#"
            [cache]
            chunk_size = 65536

            [routing]
            t_negative_secs = 10
        "#;
        let config: PeerdConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.cache.chunk_size, 65536);
        assert_eq!(config.cache.root, default_cache_root());
        assert_eq!(config.routing.t_negative_secs, 10);
        assert_eq!(config.network.peer_registry_port, 5000);
    }

    #[test]
    fn config_views_carry_durations() {
        let config = PeerdConfig::default();
        let rc = config.router_config();
        assert_eq!(rc.t_negative, Duration::from_secs(30));
        let fc = config.fetcher_config();
        assert_eq!(fc.origin_backoff, Duration::from_millis(250));
    }
}
