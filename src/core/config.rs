//! Configuration management for the aggregation engine.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Per metric type overrides on top of engine-wide defaults
//! - Validation and defaults

use crate::cluster::WorkerSelector;
use crate::core::retry::RetryConfig;
use crate::core::{Result, StrataError};
use crate::metrics::DownSampling;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Flush and buffering defaults
    pub persistence: PersistenceConfig,
    /// Cluster membership for remote dispatch
    pub cluster: ClusterConfig,
    /// Storage DAO policy
    pub storage: StorageConfig,
    /// Per metric type settings, keyed by metric type name
    pub metrics: BTreeMap<String, MetricConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Engine-wide persistence defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Pending-key count that triggers an inline flush
    pub default_high_water_mark: usize,
    /// Periodic flush tick
    #[serde(with = "humantime_serde")]
    pub default_flush_interval: Duration,
    /// Upper bound of a single wait while draining a buffer half
    #[serde(with = "humantime_serde")]
    pub drain_wait: Duration,
    /// Capacity of every worker inbound queue
    pub queue_capacity: usize,
    /// Records pulled from an inbound queue per wakeup
    pub consumer_batch: usize,
}

/// Cluster configuration. An empty member list means standalone mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address this process serves remote dispatch on
    pub self_address: Option<SocketAddr>,
    /// Every member of the cluster, this process included
    pub members: Vec<SocketAddr>,
    /// Connect timeout towards peers
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long a peer that failed to connect is skipped
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    /// Frames queued per peer before records are dropped
    pub send_queue_capacity: usize,
    /// Tick forwarding the locally pre-merged records to their owners
    #[serde(with = "humantime_serde")]
    pub forward_interval: Duration,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Retry policy of the batch DAO
    pub retry: RetryConfig,
}

/// Settings of one metric type. Unset fields fall back to [`PersistenceConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    /// Pending-key count that triggers an inline flush
    pub high_water_mark: Option<usize>,
    /// Periodic flush tick
    #[serde(with = "humantime_serde")]
    pub flush_interval: Option<Duration>,
    /// Read the stored value and merge onto it before writing
    pub reconcile: bool,
    /// How records are routed across instances
    pub selector: WorkerSelector,
    /// Worker instances per cluster member
    pub instances: usize,
    /// Maintained time granularities
    pub levels: Vec<DownSampling>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Include target, thread ids and line numbers
    pub structured: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            default_high_water_mark: 5_000,
            default_flush_interval: Duration::from_secs(3),
            drain_wait: Duration::from_millis(10),
            queue_capacity: 10_000,
            consumer_batch: 128,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            self_address: None,
            members: Vec::new(),
            connect_timeout: Duration::from_secs(3),
            reconnect_backoff: Duration::from_secs(1),
            send_queue_capacity: 4_096,
            forward_interval: Duration::from_secs(1),
        }
    }
}

impl Default for MetricConfig {
    fn default() -> Self {
        MetricConfig {
            high_water_mark: None,
            flush_interval: None,
            reconcile: true,
            selector: WorkerSelector::HashCode,
            instances: 1,
            levels: DownSampling::ALL.to_vec(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl ClusterConfig {
    /// True when no peers are configured
    pub fn is_standalone(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in the order every process agrees on
    pub fn sorted_members(&self) -> Vec<SocketAddr> {
        let mut members = self.members.clone();
        members.sort();
        members
    }
}

impl Config {
    /// Load and validate a YAML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        ConfigBuilder::new().from_yaml(&content)?.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let p = &self.persistence;
        if p.default_high_water_mark == 0 {
            return Err(StrataError::config("default_high_water_mark must be greater than 0"));
        }
        if p.queue_capacity == 0 {
            return Err(StrataError::config("queue_capacity must be greater than 0"));
        }
        if p.consumer_batch == 0 {
            return Err(StrataError::config("consumer_batch must be greater than 0"));
        }
        if p.default_flush_interval.is_zero() {
            return Err(StrataError::config("default_flush_interval must be non-zero"));
        }

        for (name, metric) in &self.metrics {
            if metric.high_water_mark == Some(0) {
                return Err(StrataError::config(format!(
                    "high_water_mark of '{}' must be greater than 0",
                    name
                )));
            }
            if metric.flush_interval.is_some_and(|d| d.is_zero()) {
                return Err(StrataError::config(format!(
                    "flush_interval of '{}' must be non-zero",
                    name
                )));
            }
            if metric.instances == 0 {
                return Err(StrataError::config(format!(
                    "instances of '{}' must be greater than 0",
                    name
                )));
            }
            if !metric.levels.contains(&DownSampling::Minute) {
                return Err(StrataError::config(format!(
                    "levels of '{}' must include minute",
                    name
                )));
            }
        }

        let cluster = &self.cluster;
        if !cluster.is_standalone() {
            if cluster.send_queue_capacity == 0 {
                return Err(StrataError::config("cluster.send_queue_capacity must be greater than 0"));
            }
            if cluster.forward_interval.is_zero() {
                return Err(StrataError::config("cluster.forward_interval must be non-zero"));
            }
            let mut seen = HashSet::new();
            for member in &cluster.members {
                if !seen.insert(member) {
                    return Err(StrataError::config(format!("duplicate cluster member {}", member)));
                }
            }
            match cluster.self_address {
                None => {
                    return Err(StrataError::config(
                        "cluster.self_address is required when members are configured",
                    ))
                },
                Some(addr) if !cluster.members.contains(&addr) => {
                    return Err(StrataError::config(format!(
                        "cluster.self_address {} is not one of the members",
                        addr
                    )))
                },
                Some(_) => {},
            }
        }

        Ok(())
    }

    /// Effective settings of one metric type
    pub fn metric(&self, name: &str) -> MetricConfig {
        self.metrics.get(name).cloned().unwrap_or_default()
    }

    /// Effective high-water mark of one metric type
    pub fn high_water_mark(&self, name: &str) -> usize {
        self.metrics
            .get(name)
            .and_then(|m| m.high_water_mark)
            .unwrap_or(self.persistence.default_high_water_mark)
    }

    /// Effective flush interval of one metric type
    pub fn flush_interval(&self, name: &str) -> Duration {
        self.metrics
            .get(name)
            .and_then(|m| m.flush_interval)
            .unwrap_or(self.persistence.default_flush_interval)
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| StrataError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set the settings of one metric type
    pub fn metric<S: Into<String>>(mut self, name: S, metric: MetricConfig) -> Self {
        self.config.metrics.insert(name.into(), metric);
        self
    }

    /// Join a cluster
    pub fn cluster(mut self, self_address: SocketAddr, members: Vec<SocketAddr>) -> Self {
        self.config.cluster.self_address = Some(self_address);
        self.config.cluster.members = members;
        self
    }

    /// Set the default flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.persistence.default_flush_interval = interval;
        self
    }

    /// Set the default high-water mark
    pub fn high_water_mark(mut self, mark: usize) -> Self {
        self.config.persistence.default_high_water_mark = mark;
        self
    }

    /// Set the log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.logging.level = level;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
