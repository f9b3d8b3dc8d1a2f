//! Local storage contracts used by the rehash protocols
//!
//! The distribution core only needs to read, write, remove and iterate local
//! entries. [`DataContainer`] is the in-memory store every node has;
//! [`CacheStore`] is an optional persistent store whose keys also take part in
//! rehashing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

pub type Key = String;

/// A stored value together with its expiration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalCacheValue {
    pub value: String,
    pub lifespan: Option<Duration>,
    pub max_idle: Option<Duration>,
}

impl InternalCacheValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            lifespan: None,
            max_idle: None,
        }
    }

    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = Some(lifespan);
        self
    }
}

/// Entries moved between nodes during a rehash
pub type StateMap = HashMap<Key, InternalCacheValue>;

/// The node-local in-memory store
#[async_trait]
pub trait DataContainer: Send + Sync {
    async fn get(&self, key: &str) -> Option<InternalCacheValue>;

    async fn put(&self, key: Key, value: InternalCacheValue) -> Result<()>;

    async fn remove(&self, key: &str) -> Option<InternalCacheValue>;

    async fn clear(&self);

    /// Snapshot of every entry
    async fn entries(&self) -> Vec<(Key, InternalCacheValue)>;

    async fn keys(&self) -> HashSet<Key> {
        self.entries().await.into_iter().map(|(key, _)| key).collect()
    }

    async fn len(&self) -> usize {
        self.entries().await.len()
    }

    async fn contains_key(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }
}

/// A persistent store whose entries take part in rehashing
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Load every key except the excluded ones
    async fn load_all_keys(&self, exclude: &HashSet<Key>) -> Result<HashSet<Key>>;

    async fn load(&self, key: &str) -> Result<Option<InternalCacheValue>>;

    async fn remove(&self, key: &str) -> Result<bool>;
}

/// HashMap-backed data container
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataContainer {
    data: Arc<RwLock<HashMap<Key, InternalCacheValue>>>,
}

impl InMemoryDataContainer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataContainer for InMemoryDataContainer {
    async fn get(&self, key: &str) -> Option<InternalCacheValue> {
        let data = self.data.read().await;
        data.get(key).cloned()
    }

    async fn put(&self, key: Key, value: InternalCacheValue) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Option<InternalCacheValue> {
        let mut data = self.data.write().await;
        data.remove(key)
    }

    async fn clear(&self) {
        let mut data = self.data.write().await;
        data.clear();
    }

    async fn entries(&self) -> Vec<(Key, InternalCacheValue)> {
        let data = self.data.read().await;
        data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    async fn keys(&self) -> HashSet<Key> {
        let data = self.data.read().await;
        data.keys().cloned().collect()
    }

    async fn len(&self) -> usize {
        let data = self.data.read().await;
        data.len()
    }
}
