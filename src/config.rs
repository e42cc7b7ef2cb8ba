//! Configuration module for pingshard.
//!
//! Loads configuration from environment variables with sensible defaults.
//! The result is immutable once loaded and is handed to the monitor by `Arc`.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::probe::SuccessRange;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the trigger endpoints (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pingshard.db")
    pub db_path: String,
    /// Node identity this process schedules for (default: "node-1")
    pub node_id: String,
    /// Scheduling shard keys this node owns (default: [0])
    pub shard_keys: Vec<u8>,
    /// Time between scheduled ticks of one shard (default: 60s)
    pub tick_interval: Duration,
    /// Tunables consumed by every tick.
    pub monitor: MonitorConfig,
}

/// Tunables for selection, probing, aggregation and state updates.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub urls_collection: String,
    pub results_collection: String,
    /// Maximum URLs selected per tick.
    pub batch_size: usize,
    pub probe_timeout: Duration,
    /// Global ceiling on in-flight probes.
    pub max_concurrency: usize,
    /// Idle lifetime of pooled connections.
    pub pool_idle_timeout: Duration,
    /// Upper bound of the random delay before each probe; zero disables it.
    pub probe_jitter: Duration,
    /// Concurrent URL document updates per wave.
    pub update_wave_size: usize,
    pub max_log_entries: usize,
    /// Interval in minutes for URLs that carry none.
    pub default_ping_interval: u32,
    /// Read-merge-write attempts per shard before giving up.
    pub shard_write_attempts: u32,
    /// Newest entries kept per URL series in a result shard.
    pub max_series_history: usize,
    pub scheduled_success: SuccessRange,
    pub on_demand_success: SuccessRange,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "pingshard.db".to_string(),
            node_id: "node-1".to_string(),
            shard_keys: vec![0],
            tick_interval: Duration::from_secs(60),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            urls_collection: "urls".to_string(),
            results_collection: "results".to_string(),
            batch_size: 1000,
            probe_timeout: Duration::from_secs(10),
            max_concurrency: 1000,
            pool_idle_timeout: Duration::from_secs(300),
            probe_jitter: Duration::from_millis(100),
            update_wave_size: 25,
            max_log_entries: 100,
            default_ping_interval: 15,
            shard_write_attempts: 5,
            max_series_history: 288,
            scheduled_success: SuccessRange::Below400,
            on_demand_success: SuccessRange::Standard,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is prefixed with `PINGSHARD_`. Values that fail to parse
    /// leave the default in place.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("PINGSHARD_{}", name));
        let mut cfg = Self::default();

        set_parsed(&mut cfg.http_port, get("HTTP_PORT"));
        if let Some(db_path) = get("DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(node_id) = get("NODE_ID").filter(|s| !s.trim().is_empty()) {
            cfg.node_id = node_id.trim().to_string();
        }
        if let Some(keys) = get("SHARD_KEYS").and_then(|s| parse_shard_keys(&s)) {
            cfg.shard_keys = keys;
        }
        if let Some(secs) = get("TICK_INTERVAL_SECS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.tick_interval = Duration::from_secs(secs.max(1));
        }

        let m = &mut cfg.monitor;
        if let Some(name) = get("URLS_COLLECTION") {
            m.urls_collection = name;
        }
        if let Some(name) = get("RESULTS_COLLECTION") {
            m.results_collection = name;
        }
        set_parsed(&mut m.batch_size, get("BATCH_SIZE"));
        if let Some(secs) = get("PROBE_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
            m.probe_timeout = Duration::from_secs(secs.max(1));
        }
        set_parsed(&mut m.max_concurrency, get("MAX_CONCURRENCY"));
        if let Some(secs) = get("POOL_IDLE_SECS").and_then(|s| s.parse::<u64>().ok()) {
            m.pool_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = get("PROBE_JITTER_MS").and_then(|s| s.parse::<u64>().ok()) {
            m.probe_jitter = Duration::from_millis(ms);
        }
        set_parsed(&mut m.update_wave_size, get("UPDATE_WAVE_SIZE"));
        set_parsed(&mut m.max_log_entries, get("MAX_LOG_ENTRIES"));
        set_parsed(&mut m.default_ping_interval, get("DEFAULT_PING_INTERVAL"));
        set_parsed(&mut m.shard_write_attempts, get("SHARD_WRITE_ATTEMPTS"));
        set_parsed(&mut m.max_series_history, get("MAX_SERIES_HISTORY"));
        set_parsed(&mut m.scheduled_success, get("SCHEDULED_SUCCESS"));
        set_parsed(&mut m.on_demand_success, get("ON_DEMAND_SUCCESS"));

        // Zero would stall the semaphore or the wave loop.
        m.max_concurrency = m.max_concurrency.max(1);
        m.update_wave_size = m.update_wave_size.max(1);
        m.shard_write_attempts = m.shard_write_attempts.max(1);
        m.max_series_history = m.max_series_history.max(1);
        if m.default_ping_interval == 0 {
            m.default_ping_interval = 15;
        }

        cfg
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(value) = raw.and_then(|s| s.trim().parse().ok()) {
        *slot = value;
    }
}

/// Parse a comma separated list of shard keys, e.g. `"0,3,7"`.
///
/// Returns `None` if any entry is not a valid key (0 to 9) or the list is empty.
fn parse_shard_keys(raw: &str) -> Option<Vec<u8>> {
    let mut keys = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let key: u8 = part.parse().ok()?;
        if key > crate::db::MAX_SHARD_KEY {
            return None;
        }
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    if keys.is_empty() {
        None
    } else {
        Some(keys)
    }
}
