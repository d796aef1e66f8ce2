use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::mux::MuxConfig;
use crate::pool::{IdlePolicy, PoolConfig};

/// Exclusive pool settings; durations are in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Idle connections kept warm per endpoint
    #[serde(default)]
    pub min_idle: usize,

    /// Idle list capacity (0 = unlimited)
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Concurrently checked-out connections (0 = unlimited)
    #[serde(default)]
    pub max_active: usize,

    /// Wait for a free slot instead of failing when `max_active` is reached
    #[serde(default)]
    pub wait: bool,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// 0 disables the lifetime limit
    #[serde(default)]
    pub max_conn_lifetime_ms: u64,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// stack (LIFO) or queue (FIFO)
    #[serde(default = "default_idle_policy")]
    pub idle_policy: String,

    /// Destroy a pool unused for this long (0 = never)
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub pool_idle_timeout_ms: u64,

    /// Health check sweep interval
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_max_idle() -> usize {
    65536
}

fn default_idle_timeout_ms() -> u64 {
    50_000
}

fn default_dial_timeout_ms() -> u64 {
    200
}

fn default_idle_policy() -> String {
    "stack".to_string()
}

fn default_pool_idle_timeout_ms() -> u64 {
    100_000
}

fn default_check_interval_ms() -> u64 {
    3_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_idle: default_max_idle(),
            max_active: 0,
            wait: false,
            idle_timeout_ms: default_idle_timeout_ms(),
            max_conn_lifetime_ms: 0,
            dial_timeout_ms: default_dial_timeout_ms(),
            idle_policy: default_idle_policy(),
            pool_idle_timeout_ms: default_pool_idle_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> Result<PoolConfig> {
        let idle_policy = IdlePolicy::from_str(&self.idle_policy).map_err(anyhow::Error::msg)?;
        let config = PoolConfig {
            min_idle: self.min_idle,
            max_idle: self.max_idle,
            max_active: self.max_active,
            wait: self.wait,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_conn_lifetime: Duration::from_millis(self.max_conn_lifetime_ms),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            idle_policy,
            pool_idle_timeout: Duration::from_millis(self.pool_idle_timeout_ms),
            check_interval: Duration::from_millis(self.check_interval_ms),
        };
        config.validate().context("Invalid pool settings")?;
        Ok(config)
    }
}

/// Multiplexed pool settings; durations are in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxSettings {
    #[serde(default = "default_connections_per_host")]
    pub connections_per_host: usize,

    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,

    /// Fail writes on a full send queue instead of waiting
    #[serde(default)]
    pub drop_full: bool,

    #[serde(default = "default_mux_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// 0 = unlimited
    #[serde(default)]
    pub max_streams_per_conn: usize,

    /// 0 = unlimited
    #[serde(default)]
    pub max_idle_conns_per_host: usize,

    #[serde(default = "default_max_reconnect_count")]
    pub max_reconnect_count: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// 0 derives the window from the reconnect count and max backoff
    #[serde(default)]
    pub reconnect_reset_interval_ms: u64,

    #[serde(default)]
    pub backoff_jitter: bool,
}

fn default_connections_per_host() -> usize {
    2
}

fn default_send_queue_size() -> usize {
    1024
}

fn default_mux_dial_timeout_ms() -> u64 {
    1_000
}

fn default_max_reconnect_count() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    5
}

fn default_max_backoff_ms() -> u64 {
    50
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            connections_per_host: default_connections_per_host(),
            send_queue_size: default_send_queue_size(),
            drop_full: false,
            dial_timeout_ms: default_mux_dial_timeout_ms(),
            max_streams_per_conn: 0,
            max_idle_conns_per_host: 0,
            max_reconnect_count: default_max_reconnect_count(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            reconnect_reset_interval_ms: 0,
            backoff_jitter: false,
        }
    }
}

impl MuxSettings {
    pub fn to_mux_config(&self) -> Result<MuxConfig> {
        let max_backoff = Duration::from_millis(self.max_backoff_ms);
        let reconnect_reset_interval = if self.reconnect_reset_interval_ms == 0 {
            max_backoff * self.max_reconnect_count * 2
        } else {
            Duration::from_millis(self.reconnect_reset_interval_ms)
        };

        let config = MuxConfig {
            connections_per_host: self.connections_per_host,
            send_queue_size: self.send_queue_size,
            drop_full: self.drop_full,
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            max_streams_per_conn: self.max_streams_per_conn,
            max_idle_conns_per_host: self.max_idle_conns_per_host,
            max_reconnect_count: self.max_reconnect_count,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff,
            reconnect_reset_interval,
            backoff_jitter: self.backoff_jitter,
            ..MuxConfig::default()
        };
        config.validate().context("Invalid multiplexing settings")?;
        Ok(config)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Exclusive pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Multiplexed pool settings
    #[serde(default)]
    pub mux: MuxSettings,
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Read `name` and parse it, `None` when unset
fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {name}: {e}")),
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// Every setting is optional. Exclusive pool:
/// - CONNPOOL_MIN_IDLE, CONNPOOL_MAX_IDLE, CONNPOOL_MAX_ACTIVE, CONNPOOL_WAIT
/// - CONNPOOL_IDLE_TIMEOUT_MS, CONNPOOL_MAX_CONN_LIFETIME_MS, CONNPOOL_DIAL_TIMEOUT_MS
/// - CONNPOOL_IDLE_POLICY (stack or queue)
/// - CONNPOOL_POOL_IDLE_TIMEOUT_MS, CONNPOOL_CHECK_INTERVAL_MS
///
/// Multiplexed pool:
/// - CONNPOOL_MUX_CONNECTIONS_PER_HOST, CONNPOOL_MUX_SEND_QUEUE_SIZE, CONNPOOL_MUX_DROP_FULL
/// - CONNPOOL_MUX_DIAL_TIMEOUT_MS, CONNPOOL_MUX_MAX_STREAMS_PER_CONN
/// - CONNPOOL_MUX_MAX_IDLE_CONNS_PER_HOST, CONNPOOL_MUX_MAX_RECONNECT_COUNT
/// - CONNPOOL_MUX_INITIAL_BACKOFF_MS, CONNPOOL_MUX_MAX_BACKOFF_MS
pub fn load_from_env() -> Result<Config> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let mut config = Config::default();
    let pool = &mut config.pool;

    if let Some(v) = env_var("CONNPOOL_MIN_IDLE")? {
        pool.min_idle = v;
    }
    if let Some(v) = env_var("CONNPOOL_MAX_IDLE")? {
        pool.max_idle = v;
    }
    if let Some(v) = env_var("CONNPOOL_MAX_ACTIVE")? {
        pool.max_active = v;
    }
    if let Some(v) = env_var("CONNPOOL_WAIT")? {
        pool.wait = v;
    }
    if let Some(v) = env_var("CONNPOOL_IDLE_TIMEOUT_MS")? {
        pool.idle_timeout_ms = v;
    }
    if let Some(v) = env_var("CONNPOOL_MAX_CONN_LIFETIME_MS")? {
        pool.max_conn_lifetime_ms = v;
    }
    if let Some(v) = env_var("CONNPOOL_DIAL_TIMEOUT_MS")? {
        pool.dial_timeout_ms = v;
    }
    if let Some(v) = env_var::<String>("CONNPOOL_IDLE_POLICY")? {
        IdlePolicy::from_str(&v).map_err(anyhow::Error::msg)?;
        pool.idle_policy = v;
    }
    if let Some(v) = env_var("CONNPOOL_POOL_IDLE_TIMEOUT_MS")? {
        pool.pool_idle_timeout_ms = v;
    }
    if let Some(v) = env_var("CONNPOOL_CHECK_INTERVAL_MS")? {
        pool.check_interval_ms = v;
    }

    let mux = &mut config.mux;

    if let Some(v) = env_var("CONNPOOL_MUX_CONNECTIONS_PER_HOST")? {
        mux.connections_per_host = v;
    }
    if let Some(v) = env_var("CONNPOOL_MUX_SEND_QUEUE_SIZE")? {
        mux.send_queue_size = v;
    }
    if let Some(v) = env_var("CONNPOOL_MUX_DROP_FULL")? {
        mux.drop_full = v;
    }
    if let Some(v) = env_var("CONNPOOL_MUX_DIAL_TIMEOUT_MS")? {
        mux.dial_timeout_ms = v;
    }
    if let Some(v) = env_var("CONNPOOL_MUX_MAX_STREAMS_PER_CONN")? {
        mux.max_streams_per_conn = v;
    }
    if let Some(v) = env_var("CONNPOOL_MUX_MAX_IDLE_CONNS_PER_HOST")? {
        mux.max_idle_conns_per_host = v;
    }
    if let Some(v) = env_var("CONNPOOL_MUX_MAX_RECONNECT_COUNT")? {
        mux.max_reconnect_count = v;
    }
    if let Some(v) = env_var("CONNPOOL_MUX_INITIAL_BACKOFF_MS")? {
        mux.initial_backoff_ms = v;
    }
    if let Some(v) = env_var("CONNPOOL_MUX_MAX_BACKOFF_MS")? {
        mux.max_backoff_ms = v;
    }

    Ok(config)
}

/// Load configuration from a YAML file when a path is given, otherwise from
/// the environment
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
