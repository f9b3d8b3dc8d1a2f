//! Metrics collection for the distribution subsystem
//!
//! Counters are kept locally as atomics so they can be read back in tests and
//! status output, and are mirrored to the `metrics` facade for whatever
//! exporter the embedding process installs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::MetricsConfig;
use crate::rehash::RehashKind;

/// Metrics collector for one cache instance
#[derive(Debug)]
pub struct DistributionMetrics {
    enabled: bool,
    rehashes_started: AtomicU64,
    rehashes_completed: AtomicU64,
    rehashes_failed: AtomicU64,
    keys_pushed: AtomicU64,
    keys_pulled: AtomicU64,
    keys_invalidated: AtomicU64,
    commands_logged: AtomicU64,
    l1_unicast_invalidations: AtomicU64,
    l1_multicast_invalidations: AtomicU64,
    last_rehash_duration_ms: AtomicU64,
}

/// Point-in-time copy of the collected metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rehashes_started: u64,
    pub rehashes_completed: u64,
    pub rehashes_failed: u64,
    pub keys_pushed: u64,
    pub keys_pulled: u64,
    pub keys_invalidated: u64,
    pub commands_logged: u64,
    pub l1_unicast_invalidations: u64,
    pub l1_multicast_invalidations: u64,
    pub last_rehash_duration_ms: u64,
}

impl DistributionMetrics {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            enabled: config.enabled,
            rehashes_started: AtomicU64::new(0),
            rehashes_completed: AtomicU64::new(0),
            rehashes_failed: AtomicU64::new(0),
            keys_pushed: AtomicU64::new(0),
            keys_pulled: AtomicU64::new(0),
            keys_invalidated: AtomicU64::new(0),
            commands_logged: AtomicU64::new(0),
            l1_unicast_invalidations: AtomicU64::new(0),
            l1_multicast_invalidations: AtomicU64::new(0),
            last_rehash_duration_ms: AtomicU64::new(0),
        }
    }

    pub fn record_rehash_started(&self, kind: RehashKind) {
        self.rehashes_started.fetch_add(1, Ordering::Relaxed);
        if self.enabled {
            metrics::counter!("dist_rehash_started_total", 1, "kind" => kind.as_str());
        }
    }

    pub fn record_rehash_finished(&self, kind: RehashKind, success: bool, duration: Duration) {
        let millis = duration.as_millis() as u64;
        self.last_rehash_duration_ms.store(millis, Ordering::Relaxed);
        if success {
            self.rehashes_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rehashes_failed.fetch_add(1, Ordering::Relaxed);
        }
        if self.enabled {
            let outcome = if success { "success" } else { "failure" };
            metrics::counter!("dist_rehash_finished_total", 1, "kind" => kind.as_str(), "outcome" => outcome);
            metrics::gauge!("dist_rehash_last_duration_ms", millis as f64);
        }
    }

    pub fn record_keys_pushed(&self, count: usize) {
        self.keys_pushed.fetch_add(count as u64, Ordering::Relaxed);
        if self.enabled {
            metrics::counter!("dist_state_keys_pushed_total", count as u64);
        }
    }

    pub fn record_keys_pulled(&self, count: usize) {
        self.keys_pulled.fetch_add(count as u64, Ordering::Relaxed);
        if self.enabled {
            metrics::counter!("dist_state_keys_pulled_total", count as u64);
        }
    }

    pub fn record_keys_invalidated(&self, count: usize) {
        self.keys_invalidated.fetch_add(count as u64, Ordering::Relaxed);
        if self.enabled {
            metrics::counter!("dist_keys_invalidated_total", count as u64);
        }
    }

    pub fn record_command_logged(&self) {
        self.commands_logged.fetch_add(1, Ordering::Relaxed);
        if self.enabled {
            metrics::counter!("dist_txlog_commands_total", 1);
        }
    }

    pub fn record_l1_invalidation(&self, multicast: bool) {
        if multicast {
            self.l1_multicast_invalidations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.l1_unicast_invalidations.fetch_add(1, Ordering::Relaxed);
        }
        if self.enabled {
            let mode = if multicast { "multicast" } else { "unicast" };
            metrics::counter!("dist_l1_invalidations_total", 1, "mode" => mode);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rehashes_started: self.rehashes_started.load(Ordering::Relaxed),
            rehashes_completed: self.rehashes_completed.load(Ordering::Relaxed),
            rehashes_failed: self.rehashes_failed.load(Ordering::Relaxed),
            keys_pushed: self.keys_pushed.load(Ordering::Relaxed),
            keys_pulled: self.keys_pulled.load(Ordering::Relaxed),
            keys_invalidated: self.keys_invalidated.load(Ordering::Relaxed),
            commands_logged: self.commands_logged.load(Ordering::Relaxed),
            l1_unicast_invalidations: self.l1_unicast_invalidations.load(Ordering::Relaxed),
            l1_multicast_invalidations: self.l1_multicast_invalidations.load(Ordering::Relaxed),
            last_rehash_duration_ms: self.last_rehash_duration_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for DistributionMetrics {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}
