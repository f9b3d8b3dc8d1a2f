//! Configuration management for the distributed cache
//!
//! This module provides structured configuration using TOML/YAML files with
//! serde for serialization and deserialization.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure for one cache instance
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache name, used in log output and task names
    pub name: String,
    /// Distribution and rehash configuration
    pub distribution: DistributionConfig,
    /// L1 near-cache configuration
    pub l1: L1Config,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Distribution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Number of owners per key
    pub num_owners: usize,
    /// Number of segments the key space is split into
    pub num_segments: usize,
    /// Enable rehashing on membership changes
    pub rehash_enabled: bool,
    /// Timeout for rehash control and state RPCs in milliseconds
    pub rehash_rpc_timeout_ms: u64,
    /// Maximum total time a joiner waits for the coordinator in milliseconds
    pub rehash_wait_time_ms: u64,
    /// First backoff step when retrying the join request in milliseconds
    pub join_retry_base_ms: u64,
    /// Backoff ceiling when retrying the join request in milliseconds
    pub join_retry_max_ms: u64,
    /// Number of retry passes when applying received state
    pub state_apply_retries: u32,
    /// Backlog size above which the transaction log is drained without the lock
    pub drain_lock_threshold: usize,
    /// Out-of-order backup writes held per segment before the missing ones
    /// are given up on
    pub max_buffered_backup_writes: usize,
    /// Consistent hash implementation
    pub consistent_hash: ConsistentHashKind,
    /// Leave protocol variant
    pub leave_protocol: LeaveProtocol,
}

/// Consistent hash implementation selector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsistentHashKind {
    /// Evenly spaced ring over one million slots
    DefaultRing,
}

/// Leave protocol variant. Both run the same push algorithm and differ only in
/// the rehash kind they report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LeaveProtocol {
    Push,
    Inverted,
}

/// L1 near-cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Enable L1 caching of remotely read entries
    pub enabled: bool,
    /// Requestor count above which invalidations are multicast.
    /// 0 always multicasts, -1 never does.
    pub invalidation_threshold: i32,
    /// Maximum lifespan of an L1 entry in milliseconds
    pub lifespan_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Enable console logging
    pub console: bool,
    /// Enable structured logging
    pub structured: bool,
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,
    /// Metric name prefix
    pub prefix: String,
}

impl CacheConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let dist = &self.distribution;
        if dist.num_owners == 0 {
            errors.push("Number of owners cannot be 0".to_string());
        }
        if dist.num_segments == 0 {
            errors.push("Number of segments cannot be 0".to_string());
        }
        if dist.num_segments > crate::ch::RING_SIZE as usize {
            errors.push(format!(
                "Number of segments cannot exceed the ring size {}",
                crate::ch::RING_SIZE
            ));
        }
        if dist.rehash_rpc_timeout_ms == 0 {
            errors.push("Rehash RPC timeout cannot be 0".to_string());
        }
        if dist.max_buffered_backup_writes == 0 {
            errors.push("Backup write buffer cannot be 0".to_string());
        }
        if dist.join_retry_base_ms > dist.join_retry_max_ms {
            errors.push("Join retry base cannot exceed the retry ceiling".to_string());
        }

        if self.l1.invalidation_threshold < -1 {
            errors.push("L1 invalidation threshold must be -1 or greater".to_string());
        }
        if self.l1.enabled && self.l1.lifespan_ms == 0 {
            errors.push("L1 lifespan cannot be 0 when L1 is enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl DistributionConfig {
    pub fn rehash_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rehash_rpc_timeout_ms)
    }

    pub fn rehash_wait_time(&self) -> Duration {
        Duration::from_millis(self.rehash_wait_time_ms)
    }

    pub fn join_retry_base(&self) -> Duration {
        Duration::from_millis(self.join_retry_base_ms)
    }

    pub fn join_retry_max(&self) -> Duration {
        Duration::from_millis(self.join_retry_max_ms)
    }
}

impl L1Config {
    pub fn lifespan(&self) -> Duration {
        Duration::from_millis(self.lifespan_ms)
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            num_owners: 2,
            num_segments: 256,
            rehash_enabled: true,
            rehash_rpc_timeout_ms: 600_000, // 10 minutes
            rehash_wait_time_ms: 60_000,
            join_retry_base_ms: 100,
            join_retry_max_ms: 5_000,
            state_apply_retries: 3,
            drain_lock_threshold: 10,
            max_buffered_backup_writes: 1024,
            consistent_hash: ConsistentHashKind::DefaultRing,
            leave_protocol: LeaveProtocol::Inverted,
        }
    }
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            invalidation_threshold: 2,
            lifespan_ms: 600_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            console: true,
            structured: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "kv_cache_dist".to_string(),
        }
    }
}
