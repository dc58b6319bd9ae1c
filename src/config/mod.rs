//! Unified configuration for the coordinator.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (kbshard.toml)
//! ```toml
//! mode = "cluster"
//!
//! [cluster]
//! replica_factor = 2
//! max_replicas_per_node = 800
//!
//! [rollover]
//! batch_size = 100
//! low_water_backlog = 500
//! ```
//!
//! Environment variables use the `KBSHARD_` prefix and `__` as the section
//! separator, e.g. `KBSHARD_CLUSTER__REPLICA_FACTOR=2`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Deployment mode. Selects the fan-out, retry and auto-split strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    /// Single process, replica writes issued one after another
    #[default]
    Standalone,
    /// Replica writes issued in parallel under an overall timeout
    Cluster,
}

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub mode: DeploymentMode,
    pub cluster: ClusterConfig,
    pub shards: ShardLimits,
    pub processor: ProcessorConfig,
    pub rpc: RpcConfig,
    pub rollover: RolloverConfig,
    pub retry: RetryConfig,
    pub auto_split: AutoSplitConfig,
    pub storage: StorageConfig,
}

impl CoordinatorConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CoordinatorConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("KBSHARD_").split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        let config: CoordinatorConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only.
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.replica_factor == 0 {
            return Err(ConfigError::invalid("cluster.replica_factor must be at least 1"));
        }
        if self.cluster.max_replicas_per_node == 0 {
            return Err(ConfigError::invalid(
                "cluster.max_replicas_per_node must be at least 1",
            ));
        }
        if self.rollover.batch_size < MIN_ROLLOVER_BATCH_SIZE {
            return Err(ConfigError::invalid(format!(
                "rollover.batch_size must be greater than 10, got {}",
                self.rollover.batch_size
            )));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::invalid("retry.attempts must be at least 1"));
        }
        if self.auto_split.sample_every == 0 {
            return Err(ConfigError::invalid("auto_split.sample_every must be at least 1"));
        }
        Ok(())
    }
}

/// Replica placement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub replica_factor: usize,
    pub max_replicas_per_node: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replica_factor: DEFAULT_REPLICA_FACTOR,
            max_replicas_per_node: DEFAULT_MAX_REPLICAS_PER_NODE,
        }
    }
}

/// Auto-split thresholds for the active shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardLimits {
    pub max_paragraphs: u64,
    pub max_fields: u64,
}

impl Default for ShardLimits {
    fn default() -> Self {
        Self {
            max_paragraphs: DEFAULT_MAX_SHARD_PARAGRAPHS,
            max_fields: DEFAULT_MAX_SHARD_FIELDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Indexability cap per resource
    pub max_paragraphs_per_resource: usize,
    /// Reject deliveries whose seqid is not above the partition ledger
    pub enforce_ordering: bool,
    /// Check shard size after each committed write (standalone only)
    pub auto_split_on_write: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_paragraphs_per_resource: DEFAULT_MAX_PARAGRAPHS_PER_RESOURCE,
            enforce_ordering: true,
            auto_split_on_write: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms: u64,
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloverConfig {
    pub batch_size: usize,
    pub low_water_backlog: u64,
    pub poll_interval_ms: u64,
}

impl RolloverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_ROLLOVER_BATCH_SIZE,
            low_water_backlog: DEFAULT_ROLLOVER_LOW_WATER_BACKLOG,
            poll_interval_ms: DEFAULT_ROLLOVER_POLL_INTERVAL_MS,
        }
    }
}

/// Backoff for replica writes on unsynchronized nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retry in standalone mode
    pub standalone: bool,
    /// Retry in cluster mode
    pub cluster: bool,
}

impl RetryConfig {
    pub fn enabled_for(&self, mode: DeploymentMode) -> bool {
        match mode {
            DeploymentMode::Standalone => self.standalone,
            DeploymentMode::Cluster => self.cluster,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            standalone: true,
            cluster: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSplitConfig {
    pub sample_every: u64,
}

impl Default for AutoSplitConfig {
    fn default() -> Self {
        Self {
            sample_every: DEFAULT_AUTO_SPLIT_SAMPLE_EVERY,
        }
    }
}

/// Persistent storage. In-memory when `data_dir` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

/// Overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeploymentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_factor: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
