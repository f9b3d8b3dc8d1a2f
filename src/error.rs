//! Error types for the distribution subsystem
//!
//! Every fallible operation in the crate returns [`DistributionError`]. The
//! variants follow the failure classes a rehash has to tell apart: some are
//! retryable by the caller, some fail the task, and some are only logged.

use thiserror::Error;

use crate::member::Member;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, DistributionError>;

/// Errors raised by the distribution and rehash subsystem
#[derive(Debug, Clone, Error)]
pub enum DistributionError {
    /// The coordinator could not hand out the current consistent hash
    #[error("could not retrieve old topology from {coordinator} after {attempts} attempts: {reason}")]
    TopologyRetrieval {
        coordinator: String,
        attempts: u32,
        reason: String,
    },

    /// The owner's view of the key is uncertain while a rehash runs
    #[error("rehash in progress on {node}, retry the operation")]
    RehashInProgress { node: String },

    /// A command was tagged with a topology id that is not the installed one
    #[error("outdated topology: command topology {command_topology}, current topology {current_topology}")]
    OutdatedTopology {
        command_topology: u64,
        current_topology: u64,
    },

    /// A remote invocation failed
    #[error("rpc to {target} failed: {reason}")]
    Rpc { target: String, reason: String },

    /// A remote invocation or a local wait ran out of time
    #[error("timed out after {millis}ms waiting for {operation}")]
    Timeout { operation: String, millis: u64 },

    /// State could not be transferred or applied
    #[error("state transfer failed: {0}")]
    StateTransfer(String),

    /// The persistent store failed
    #[error("cache store error: {0}")]
    Store(String),

    /// A configuration value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A member definition is invalid
    #[error("invalid member {address}: {reason}")]
    InvalidMember { address: String, reason: String },

    /// The node has not finished joining the cluster
    #[error("node {0} has not joined the cluster")]
    NotJoined(String),

    /// The component has been stopped
    #[error("distribution manager stopped")]
    Stopped,

    /// Reading or parsing a configuration file failed
    #[error("configuration file error: {0}")]
    Config(String),
}

impl DistributionError {
    pub fn rpc(target: &Member, reason: impl Into<String>) -> Self {
        DistributionError::Rpc {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, millis: u64) -> Self {
        DistributionError::Timeout {
            operation: operation.into(),
            millis,
        }
    }

    /// Whether the caller is expected to retry rather than fail
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DistributionError::RehashInProgress { .. }
                | DistributionError::OutdatedTopology { .. }
                | DistributionError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for DistributionError {
    fn from(e: std::io::Error) -> Self {
        DistributionError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for DistributionError {
    fn from(e: toml::de::Error) -> Self {
        DistributionError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for DistributionError {
    fn from(e: toml::ser::Error) -> Self {
        DistributionError::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for DistributionError {
    fn from(e: serde_yaml::Error) -> Self {
        DistributionError::Config(e.to_string())
    }
}
