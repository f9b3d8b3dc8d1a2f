//! Cluster member identity

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DistributionError, Result};

/// A cluster node.
///
/// The network address is what RPCs are routed to. The persistent id survives
/// address changes across restarts. The capacity factor is the relative share
/// of segments the node should own; it only influences how wide the node's arc
/// on the ring is.
///
/// Equality, hashing and ordering use the address and the persistent id, never
/// the capacity factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    address: String,
    persistent_id: Uuid,
    capacity_factor: f32,
}

impl Member {
    /// Create a member with a fresh persistent id and a capacity factor of 1
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            persistent_id: Uuid::new_v4(),
            capacity_factor: 1.0,
        }
    }

    /// Create a member with an explicit persistent id
    pub fn with_persistent_id(address: impl Into<String>, persistent_id: Uuid) -> Self {
        Self {
            address: address.into(),
            persistent_id,
            capacity_factor: 1.0,
        }
    }

    /// Return a copy of this member with a different capacity factor
    pub fn with_capacity_factor(self, capacity_factor: f32) -> Result<Self> {
        if !capacity_factor.is_finite() || capacity_factor <= 0.0 {
            return Err(DistributionError::InvalidMember {
                address: self.address,
                reason: format!("capacity factor must be positive, got {}", capacity_factor),
            });
        }
        Ok(Self {
            capacity_factor,
            ..self
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn persistent_id(&self) -> Uuid {
        self.persistent_id
    }

    pub fn capacity_factor(&self) -> f32 {
        self.capacity_factor
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.persistent_id == other.persistent_id
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.persistent_id.hash(state);
    }
}

impl PartialOrd for Member {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Member {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address
            .cmp(&other.address)
            .then_with(|| self.persistent_id.cmp(&other.persistent_id))
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}
