//! Collaborators shared by every component of one cache instance

use std::sync::Arc;

use crate::config::CacheConfig;
use crate::metrics::DistributionMetrics;
use crate::notifier::MembershipNotifier;
use crate::rpc::RpcManager;
use crate::store::{CacheStore, DataContainer};

/// Everything a cache's distribution components need, injected at construction
#[derive(Clone)]
pub struct CacheContext {
    pub config: CacheConfig,
    pub rpc: Arc<dyn RpcManager>,
    pub notifier: Arc<dyn MembershipNotifier>,
    pub container: Arc<dyn DataContainer>,
    pub store: Option<Arc<dyn CacheStore>>,
    pub metrics: Arc<DistributionMetrics>,
}

impl CacheContext {
    pub fn new(
        config: CacheConfig,
        rpc: Arc<dyn RpcManager>,
        notifier: Arc<dyn MembershipNotifier>,
        container: Arc<dyn DataContainer>,
    ) -> Self {
        let metrics = Arc::new(DistributionMetrics::new(&config.metrics));
        Self {
            config,
            rpc,
            notifier,
            container,
            store: None,
            metrics,
        }
    }

    /// Let the entries of a persistent store take part in rehashing
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }
}
