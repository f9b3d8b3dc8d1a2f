//! Write commands and prepared transactions
//!
//! These are the units the transaction logger buffers while a rehash runs and
//! that are replayed on the new owners afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::member::Member;
use crate::store::{DataContainer, InternalCacheValue, Key};

/// A cache mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteCommand {
    Put {
        key: Key,
        value: InternalCacheValue,
    },
    PutMap {
        entries: Vec<(Key, InternalCacheValue)>,
    },
    Remove {
        key: Key,
    },
    Clear,
}

impl WriteCommand {
    pub fn put(key: impl Into<Key>, value: impl Into<String>) -> Self {
        WriteCommand::Put {
            key: key.into(),
            value: InternalCacheValue::new(value),
        }
    }

    pub fn remove(key: impl Into<Key>) -> Self {
        WriteCommand::Remove { key: key.into() }
    }

    /// Keys touched by this command. `Clear` touches every key and returns none.
    pub fn affected_keys(&self) -> Vec<&Key> {
        match self {
            WriteCommand::Put { key, .. } | WriteCommand::Remove { key } => vec![key],
            WriteCommand::PutMap { entries } => entries.iter().map(|(key, _)| key).collect(),
            WriteCommand::Clear => Vec::new(),
        }
    }

    /// Split into single-key commands. `Clear` is returned as is.
    pub fn split_per_key(self) -> Vec<WriteCommand> {
        match self {
            WriteCommand::PutMap { entries } => entries
                .into_iter()
                .map(|(key, value)| WriteCommand::Put { key, value })
                .collect(),
            other => vec![other],
        }
    }

    /// Apply the command to a local container
    pub async fn apply_to(&self, container: &dyn DataContainer) -> Result<()> {
        match self {
            WriteCommand::Put { key, value } => container.put(key.clone(), value.clone()).await?,
            WriteCommand::PutMap { entries } => {
                for (key, value) in entries {
                    container.put(key.clone(), value.clone()).await?;
                }
            }
            WriteCommand::Remove { key } => {
                container.remove(key).await;
            }
            WriteCommand::Clear => container.clear().await,
        }
        Ok(())
    }
}

/// Cluster-wide transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTransaction {
    pub origin: String,
    pub id: u64,
}

impl GlobalTransaction {
    pub fn new(origin: &Member, id: u64) -> Self {
        Self {
            origin: origin.address().to_string(),
            id,
        }
    }
}

impl fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTx:{}:{}", self.origin, self.id)
    }
}

/// First phase of a transaction: its modifications, not yet committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareCommand {
    pub gtx: GlobalTransaction,
    pub modifications: Vec<WriteCommand>,
}

impl PrepareCommand {
    pub fn new(gtx: GlobalTransaction, modifications: Vec<WriteCommand>) -> Self {
        Self { gtx, modifications }
    }

    pub fn affected_keys(&self) -> Vec<&Key> {
        self.modifications
            .iter()
            .flat_map(|m| m.affected_keys())
            .collect()
    }
}
