use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::pool::{CircuitBreakerConfig, ClassifierConfig, PoolConfig};
use crate::session::SessionConfig;
use crate::txn::TxConfig;

/// One database backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend identifier used by clients
    pub id: String,

    /// Connection URL handed to the database client
    pub url: String,

    /// Cluster-wide capacity for this backend; defaults to `pool.max_connections`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

/// Pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Default cluster-wide capacity per backend
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Acquisition deadline for fast operations in milliseconds
    #[serde(default = "default_fast_timeout_ms")]
    pub fast_timeout_ms: u64,

    /// Acquisition deadline for slow operations in milliseconds
    #[serde(default = "default_slow_timeout_ms")]
    pub slow_timeout_ms: u64,

    /// Share of each pool reserved for slow operations (0-100)
    #[serde(default = "default_slow_slot_percentage")]
    pub slow_slot_percentage: u8,

    /// Split pools into fast and slow sub-pools
    #[serde(default = "default_true")]
    pub segregation_enabled: bool,

    /// Idle time after which a sub-pool may lend a connection to the other
    #[serde(default = "default_idle_borrow_threshold_ms")]
    pub idle_borrow_threshold_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,

    /// Lease duration after which a connection is reported as a suspected leak
    #[serde(default = "default_leak_timeout_ms")]
    pub leak_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub validate_on_release: bool,

    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
}

fn default_max_connections() -> usize {
    20
}

fn default_fast_timeout_ms() -> u64 {
    60_000
}

fn default_slow_timeout_ms() -> u64 {
    120_000
}

fn default_slow_slot_percentage() -> u8 {
    20
}

fn default_true() -> bool {
    true
}

fn default_idle_borrow_threshold_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_max_lifetime_ms() -> u64 {
    1_800_000
}

fn default_leak_timeout_ms() -> u64 {
    300_000
}

fn default_housekeeping_interval_ms() -> u64 {
    30_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            fast_timeout_ms: default_fast_timeout_ms(),
            slow_timeout_ms: default_slow_timeout_ms(),
            slow_slot_percentage: default_slow_slot_percentage(),
            segregation_enabled: true,
            idle_borrow_threshold_ms: default_idle_borrow_threshold_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            leak_timeout_ms: default_leak_timeout_ms(),
            validate_on_release: true,
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    60_000
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Operation classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    #[serde(default = "default_max_tracked_operations")]
    pub max_tracked_operations: usize,

    /// Seconds between recomputations of the overall average
    #[serde(default = "default_update_global_avg_interval_secs")]
    pub update_global_avg_interval_secs: u64,
}

fn default_max_tracked_operations() -> usize {
    10_000
}

fn default_update_global_avg_interval_secs() -> u64 {
    300
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            max_tracked_operations: default_max_tracked_operations(),
            update_global_avg_interval_secs: default_update_global_avg_interval_secs(),
        }
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Idle time after which a session is closed
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Idle time after which an ended, unprepared branch left by a closed
    /// session is rolled back
    #[serde(default = "default_abandoned_branch_timeout_ms")]
    pub abandoned_branch_timeout_ms: u64,
}

fn default_inactivity_timeout_ms() -> u64 {
    1_800_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_abandoned_branch_timeout_ms() -> u64 {
    600_000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            abandoned_branch_timeout_ms: default_abandoned_branch_timeout_ms(),
        }
    }
}

/// Cluster sizing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Address this node appears under in cluster-health reports
    #[serde(default = "default_local_node")]
    pub local_node: String,

    /// Cluster-wide capacity per backend; defaults to each backend's maximum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_capacity: Option<usize>,
}

fn default_local_node() -> String {
    "localhost:1059".to_string()
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            local_node: default_local_node(),
            total_capacity: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub circuit: CircuitSettings,

    #[serde(default)]
    pub classifier: ClassifierSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub cluster: ClusterSettings,
}

impl Config {
    /// Create a configuration with defaults and no backends
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("No backends configured");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                anyhow::bail!("Backend with url '{}' has an empty id", backend.url);
            }
            if !seen.insert(backend.id.as_str()) {
                anyhow::bail!("Duplicate backend id '{}'", backend.id);
            }
            if backend.max_connections == Some(0) {
                anyhow::bail!("Backend '{}' has max_connections of 0", backend.id);
            }
        }

        if self.pool.max_connections == 0 {
            anyhow::bail!("pool.max_connections must be at least 1");
        }
        if self.pool.slow_slot_percentage > 100 {
            anyhow::bail!(
                "pool.slow_slot_percentage must be between 0 and 100, got {}",
                self.pool.slow_slot_percentage
            );
        }
        if self.pool.fast_timeout_ms == 0 || self.pool.slow_timeout_ms == 0 {
            anyhow::bail!("Acquisition timeouts must be greater than 0");
        }
        if self.pool.housekeeping_interval_ms == 0 || self.session.sweep_interval_ms == 0 {
            anyhow::bail!("Housekeeping and sweep intervals must be greater than 0");
        }
        if self.circuit.failure_threshold == 0 {
            anyhow::bail!("circuit.failure_threshold must be at least 1");
        }
        if self.classifier.max_tracked_operations == 0 {
            anyhow::bail!("classifier.max_tracked_operations must be at least 1");
        }
        if self.cluster.local_node.trim().is_empty() {
            anyhow::bail!("cluster.local_node must not be empty");
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.pool;
        PoolConfig {
            max_connections: pool.max_connections,
            fast_timeout: Duration::from_millis(pool.fast_timeout_ms),
            slow_timeout: Duration::from_millis(pool.slow_timeout_ms),
            slow_slot_percentage: pool.slow_slot_percentage,
            segregation_enabled: pool.segregation_enabled,
            idle_borrow_threshold: Duration::from_millis(pool.idle_borrow_threshold_ms),
            idle_timeout: Duration::from_millis(pool.idle_timeout_ms),
            max_lifetime: Duration::from_millis(pool.max_lifetime_ms),
            leak_timeout: Duration::from_millis(pool.leak_timeout_ms),
            validate_on_release: pool.validate_on_release,
            housekeeping_interval: Duration::from_millis(pool.housekeeping_interval_ms),
            circuit: CircuitBreakerConfig {
                failure_threshold: self.circuit.failure_threshold,
                cooldown: Duration::from_millis(self.circuit.cooldown_ms),
            },
            classifier: ClassifierConfig {
                max_tracked: self.classifier.max_tracked_operations,
                update_interval: Duration::from_secs(self.classifier.update_global_avg_interval_secs),
            },
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            inactivity_timeout: Duration::from_millis(self.session.inactivity_timeout_ms),
            sweep_interval: Duration::from_millis(self.session.sweep_interval_ms),
        }
    }

    pub fn tx_config(&self) -> TxConfig {
        TxConfig {
            abandoned_branch_timeout: Duration::from_millis(self.session.abandoned_branch_timeout_ms),
        }
    }

    /// Capacity a backend registers with
    pub fn backend_capacity(&self, backend: &BackendConfig) -> usize {
        backend.max_connections.unwrap_or(self.pool.max_connections)
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, name, e)),
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// - SQLPOOL_BACKENDS (comma-separated `id=url` pairs)
/// - SQLPOOL_MAX_CONNECTIONS
/// - SQLPOOL_FAST_TIMEOUT_MS / SQLPOOL_SLOW_TIMEOUT_MS
/// - SQLPOOL_SLOW_SLOT_PERCENTAGE
/// - SQLPOOL_CIRCUIT_THRESHOLD / SQLPOOL_CIRCUIT_COOLDOWN_MS
/// - SQLPOOL_SESSION_TIMEOUT_MS
/// - SQLPOOL_LOCAL_NODE
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    let backends_str = std::env::var("SQLPOOL_BACKENDS")
        .context("SQLPOOL_BACKENDS environment variable not set")?;

    for entry in backends_str.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, url) = entry
            .split_once('=')
            .with_context(|| format!("Backend entry '{}' is not of the form id=url", entry))?;
        config.backends.push(BackendConfig {
            id: id.trim().to_string(),
            url: url.trim().to_string(),
            max_connections: None,
        });
    }

    if config.backends.is_empty() {
        anyhow::bail!("SQLPOOL_BACKENDS contains no valid backends");
    }

    if let Some(val) = parse_env("SQLPOOL_MAX_CONNECTIONS")? {
        config.pool.max_connections = val;
    }
    if let Some(val) = parse_env("SQLPOOL_FAST_TIMEOUT_MS")? {
        config.pool.fast_timeout_ms = val;
    }
    if let Some(val) = parse_env("SQLPOOL_SLOW_TIMEOUT_MS")? {
        config.pool.slow_timeout_ms = val;
    }
    if let Some(val) = parse_env("SQLPOOL_SLOW_SLOT_PERCENTAGE")? {
        config.pool.slow_slot_percentage = val;
    }
    if let Some(val) = parse_env("SQLPOOL_CIRCUIT_THRESHOLD")? {
        config.circuit.failure_threshold = val;
    }
    if let Some(val) = parse_env("SQLPOOL_CIRCUIT_COOLDOWN_MS")? {
        config.circuit.cooldown_ms = val;
    }
    if let Some(val) = parse_env("SQLPOOL_SESSION_TIMEOUT_MS")? {
        config.session.inactivity_timeout_ms = val;
    }
    if let Ok(node) = std::env::var("SQLPOOL_LOCAL_NODE") {
        config.cluster.local_node = node;
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables. The result is validated either way.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml_str() {
        let yaml = r#"
backends:
  - id: orders
    url: postgres://db-1/orders
    max_connections: 40
  - id: billing
    url: postgres://db-2/billing

pool:
  max_connections: 30
  fast_timeout_ms: 5000
  slow_slot_percentage: 25

circuit:
  failure_threshold: 5

cluster:
  local_node: "10.0.0.1:1059"
  total_capacity: 90
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backend_capacity(&config.backends[0]), 40);
        assert_eq!(config.backend_capacity(&config.backends[1]), 30);
        assert_eq!(config.pool.fast_timeout_ms, 5000);
        assert_eq!(config.pool.slow_timeout_ms, 120_000);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.cooldown_ms, 60_000);
        assert_eq!(config.cluster.total_capacity, Some(90));
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert!(config.backends.is_empty());
        assert_eq!(config.pool.max_connections, 20);
        assert_eq!(config.pool.slow_slot_percentage, 20);
        assert!(config.pool.segregation_enabled);
        assert_eq!(config.session.inactivity_timeout_ms, 1_800_000);
        assert_eq!(config.cluster.local_node, "localhost:1059");
    }

    #[test]
    fn test_conversion_to_runtime_configs() {
        let config: Config = serde_yaml::from_str(
            "pool:\n  fast_timeout_ms: 1500\n  idle_borrow_threshold_ms: 250\ncircuit:\n  cooldown_ms: 2000\n",
        )
        .unwrap();
        let pool = config.pool_config();
        assert_eq!(pool.fast_timeout, Duration::from_millis(1500));
        assert_eq!(pool.idle_borrow_threshold, Duration::from_millis(250));
        assert_eq!(pool.circuit.cooldown, Duration::from_secs(2));
        assert_eq!(pool.classifier.update_interval, Duration::from_secs(300));
        assert_eq!(config.tx_config().abandoned_branch_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::new();
        assert!(config.validate().is_err());

        config.backends.push(BackendConfig {
            id: "db1".to_string(),
            url: "mem://db1".to_string(),
            max_connections: None,
        });
        config.validate().unwrap();

        config.pool.slow_slot_percentage = 101;
        assert!(config.validate().is_err());
        config.pool.slow_slot_percentage = 20;

        config.backends.push(config.backends[0].clone());
        assert!(config.validate().is_err());
    }
}
