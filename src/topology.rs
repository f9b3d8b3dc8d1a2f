//! Installed topology and per-segment ownership roles
//!
//! A [`CacheTopology`] pairs the hash reads are served from with an optional
//! pending hash that a rehash is moving towards. Writes go to the union of
//! both. [`LocalizedCacheTopology`] resolves, for the local member, the role it
//! plays for every segment.

use std::fmt;
use std::sync::Arc;

use crate::ch::{ConsistentHashRef, UnionConsistentHash};
use crate::member::Member;

const VIEW_SHIFT: u32 = 16;

/// Pending and final topology ids for a rehash towards `view_id`.
///
/// The view id sits in the high bits, so every node moving to the same view
/// picks the same ids. A rehash within a view that already has a topology
/// (a manual rebalance) continues from the installed id.
pub fn topology_ids_for_view(view_id: u64, installed_id: u64) -> (u64, u64) {
    let base = view_id << VIEW_SHIFT;
    if installed_id < base {
        (base, base + 1)
    } else {
        (installed_id + 1, installed_id + 2)
    }
}

/// View a topology id was created for
pub fn view_of_topology(topology_id: u64) -> u64 {
    topology_id >> VIEW_SHIFT
}

/// Immutable pair of consistent hashes tagged with a topology id
#[derive(Clone)]
pub struct CacheTopology {
    topology_id: u64,
    current_ch: ConsistentHashRef,
    pending_ch: Option<ConsistentHashRef>,
    write_ch: ConsistentHashRef,
}

impl CacheTopology {
    /// Stable topology with no rehash in progress
    pub fn stable(topology_id: u64, current_ch: ConsistentHashRef) -> Self {
        Self {
            topology_id,
            write_ch: current_ch.clone(),
            current_ch,
            pending_ch: None,
        }
    }

    /// Transitional topology: reads from `current_ch`, writes to the union
    pub fn rehashing(
        topology_id: u64,
        current_ch: ConsistentHashRef,
        pending_ch: ConsistentHashRef,
    ) -> Self {
        let write_ch = Arc::new(UnionConsistentHash::new(current_ch.clone(), pending_ch.clone()));
        Self {
            topology_id,
            current_ch,
            pending_ch: Some(pending_ch),
            write_ch,
        }
    }

    pub fn topology_id(&self) -> u64 {
        self.topology_id
    }

    pub fn current_ch(&self) -> &ConsistentHashRef {
        &self.current_ch
    }

    pub fn pending_ch(&self) -> Option<&ConsistentHashRef> {
        self.pending_ch.as_ref()
    }

    pub fn read_ch(&self) -> &ConsistentHashRef {
        &self.current_ch
    }

    /// The union hash while rehashing, otherwise the current hash
    pub fn write_ch(&self) -> &ConsistentHashRef {
        &self.write_ch
    }

    pub fn is_rehashing(&self) -> bool {
        self.pending_ch.is_some()
    }

    pub fn members(&self) -> &[Member] {
        self.write_ch.members()
    }
}

impl fmt::Debug for CacheTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTopology")
            .field("topology_id", &self.topology_id)
            .field("current_members", &self.current_ch.members())
            .field(
                "pending_members",
                &self.pending_ch.as_ref().map(|ch| ch.members().to_vec()),
            )
            .finish()
    }
}

/// How certain the local node is about owning a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLocality {
    Local,
    NotLocal,
    LocalUncertain,
    NotLocalUncertain,
}

impl DataLocality {
    pub fn is_local(&self) -> bool {
        matches!(self, DataLocality::Local | DataLocality::LocalUncertain)
    }

    pub fn is_uncertain(&self) -> bool {
        matches!(
            self,
            DataLocality::LocalUncertain | DataLocality::NotLocalUncertain
        )
    }
}

/// A write backup and whether it also serves reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBackup {
    pub member: Member,
    pub is_read_owner: bool,
}

/// Ownership of one segment, seen from the local member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionInfo {
    segment: usize,
    primary: Option<Member>,
    read_owners: Vec<Member>,
    write_owners: Vec<Member>,
    write_backups: Vec<WriteBackup>,
    local: Member,
}

impl DistributionInfo {
    pub fn new(segment: usize, read_ch: &ConsistentHashRef, write_ch: &ConsistentHashRef, local: &Member, num_owners: usize) -> Self {
        let read_owners = read_ch.locate_segment(segment, num_owners);
        let primary = read_owners.first().cloned();

        let mut write_owners: Vec<Member> = Vec::new();
        if let Some(primary) = &primary {
            write_owners.push(primary.clone());
        }
        for member in write_ch.locate_segment(segment, num_owners) {
            if !write_owners.contains(&member) {
                write_owners.push(member);
            }
        }

        let write_backups = write_owners
            .iter()
            .skip(usize::from(primary.is_some()))
            .map(|member| WriteBackup {
                member: member.clone(),
                is_read_owner: read_owners.contains(member),
            })
            .collect();

        Self {
            segment,
            primary,
            read_owners,
            write_owners,
            write_backups,
            local: local.clone(),
        }
    }

    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn primary(&self) -> Option<&Member> {
        self.primary.as_ref()
    }

    pub fn read_owners(&self) -> &[Member] {
        &self.read_owners
    }

    pub fn write_owners(&self) -> &[Member] {
        &self.write_owners
    }

    pub fn write_backups(&self) -> &[WriteBackup] {
        &self.write_backups
    }

    pub fn write_backup_members(&self) -> Vec<Member> {
        self.write_backups.iter().map(|b| b.member.clone()).collect()
    }

    pub fn is_primary(&self) -> bool {
        self.primary.as_ref() == Some(&self.local)
    }

    pub fn is_read_owner(&self) -> bool {
        self.read_owners.contains(&self.local)
    }

    pub fn is_write_owner(&self) -> bool {
        self.write_owners.contains(&self.local)
    }
}

/// A topology resolved for the local member
#[derive(Debug, Clone)]
pub struct LocalizedCacheTopology {
    topology: CacheTopology,
    local: Member,
    num_owners: usize,
    segments: Vec<DistributionInfo>,
}

impl LocalizedCacheTopology {
    pub fn new(topology: CacheTopology, local: Member, num_owners: usize) -> Self {
        let segments = (0..topology.write_ch().num_segments())
            .map(|segment| {
                DistributionInfo::new(segment, topology.read_ch(), topology.write_ch(), &local, num_owners)
            })
            .collect();

        Self {
            topology,
            local,
            num_owners,
            segments,
        }
    }

    pub fn topology(&self) -> &CacheTopology {
        &self.topology
    }

    pub fn topology_id(&self) -> u64 {
        self.topology.topology_id()
    }

    pub fn local_member(&self) -> &Member {
        &self.local
    }

    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_of(&self, key: &str) -> usize {
        self.topology.write_ch().segment_of(key)
    }

    pub fn segment_distribution(&self, segment: usize) -> &DistributionInfo {
        &self.segments[segment % self.segments.len()]
    }

    pub fn distribution(&self, key: &str) -> &DistributionInfo {
        self.segment_distribution(self.segment_of(key))
    }

    /// Locality against the write hash, uncertain while rehashing
    pub fn locality(&self, key: &str) -> DataLocality {
        let local = self.distribution(key).is_write_owner();
        match (local, self.topology.is_rehashing()) {
            (true, false) => DataLocality::Local,
            (false, false) => DataLocality::NotLocal,
            (true, true) => DataLocality::LocalUncertain,
            (false, true) => DataLocality::NotLocalUncertain,
        }
    }
}
