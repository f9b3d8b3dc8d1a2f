//! L1 requestor tracking and invalidation
//!
//! Owners remember which remote nodes cached a key after a remote read, so a
//! write only invalidates those nodes instead of the whole cluster.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::L1Config;
use crate::error::Result;
use crate::member::Member;
use crate::metrics::DistributionMetrics;
use crate::rpc::{RehashCommand, ResponseMode, RpcManager};
use crate::store::{InternalCacheValue, Key};

/// How an invalidation is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationDispatch {
    /// No requestor to notify
    None,
    /// One addressed message per requestor
    Unicast(Vec<Member>),
    /// A single cluster-wide message
    Multicast,
}

pub struct L1Manager {
    requestors: DashMap<Key, HashSet<Member>>,
    threshold: i32,
    lifespan: Duration,
    rpc: Arc<dyn RpcManager>,
    metrics: Arc<DistributionMetrics>,
    rpc_timeout: Duration,
}

impl L1Manager {
    pub fn new(
        config: &L1Config,
        rpc: Arc<dyn RpcManager>,
        metrics: Arc<DistributionMetrics>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            requestors: DashMap::new(),
            threshold: config.invalidation_threshold,
            lifespan: config.lifespan(),
            rpc,
            metrics,
            rpc_timeout,
        }
    }

    /// Record that `requestor` cached `key`
    pub fn add_requestor(&self, key: &str, requestor: Member) {
        self.requestors
            .entry(key.to_string())
            .or_default()
            .insert(requestor);
    }

    pub fn requestors(&self, key: &str) -> HashSet<Member> {
        self.requestors
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Choose how to reach `requestors`
    pub fn choose_dispatch(&self, requestors: Vec<Member>) -> InvalidationDispatch {
        if requestors.is_empty() {
            return InvalidationDispatch::None;
        }
        let multicast_capable = self.rpc.is_multicast_capable();
        let multicast = match self.threshold {
            -1 => false,
            0 => {
                if !multicast_capable {
                    tracing::debug!("L1 threshold forces multicast but transport cannot multicast, using unicast");
                }
                multicast_capable
            }
            threshold => multicast_capable && requestors.len() > threshold as usize,
        };

        if multicast {
            InvalidationDispatch::Multicast
        } else {
            InvalidationDispatch::Unicast(requestors)
        }
    }

    /// Invalidate L1 copies of `keys` held by any requestor other than `origin`.
    ///
    /// The requestor entries of the keys are cleared whatever happens to the
    /// invalidation; a node re-registers on its next remote read.
    pub async fn flush_cache(&self, keys: &[Key], origin: &Member) -> Result<InvalidationDispatch> {
        let mut targets: HashSet<Member> = HashSet::new();
        for key in keys {
            if let Some((_, requestors)) = self.requestors.remove(key) {
                targets.extend(requestors);
            }
        }
        targets.remove(origin);
        targets.remove(&self.rpc.local_address());

        let mut targets: Vec<Member> = targets.into_iter().collect();
        targets.sort();
        let dispatch = self.choose_dispatch(targets);

        let command = RehashCommand::InvalidateL1 {
            origin: origin.clone(),
            keys: keys.to_vec(),
        };
        match &dispatch {
            InvalidationDispatch::None => return Ok(dispatch),
            InvalidationDispatch::Multicast => {
                tracing::trace!("Multicasting L1 invalidation of {} key(s)", keys.len());
                self.metrics.record_l1_invalidation(true);
                self.rpc.broadcast_rpc_command(command, false, false).await?;
            }
            InvalidationDispatch::Unicast(targets) => {
                tracing::trace!(
                    "Unicasting L1 invalidation of {} key(s) to {} requestor(s)",
                    keys.len(),
                    targets.len()
                );
                self.metrics.record_l1_invalidation(false);
                self.rpc
                    .invoke_remotely(targets, command, ResponseMode::Asynchronous, self.rpc_timeout, false)
                    .await?;
            }
        }
        Ok(dispatch)
    }

    /// Cap the lifespan of a remotely read value before caching it in L1
    pub fn transform_for_l1(&self, mut value: InternalCacheValue) -> InternalCacheValue {
        let capped = match value.lifespan {
            Some(lifespan) if lifespan <= self.lifespan => lifespan,
            _ => self.lifespan,
        };
        value.lifespan = Some(capped);
        value
    }

    pub fn tracked_keys(&self) -> usize {
        self.requestors.len()
    }
}
