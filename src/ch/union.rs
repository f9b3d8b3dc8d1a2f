//! Transitional consistent hash used while a rehash is running
//!
//! A union answers every lookup with the owners of the old hash followed by
//! the owners of the new hash, so a key is local if either hash says so.

use std::sync::Arc;

use super::{ConsistentHash, ConsistentHashRef};
use crate::member::Member;

#[derive(Debug, Clone)]
pub struct UnionConsistentHash {
    old: ConsistentHashRef,
    new: ConsistentHashRef,
    members: Vec<Member>,
}

impl UnionConsistentHash {
    /// Combine an old and a new hash.
    ///
    /// # Panics
    ///
    /// Panics if either side is itself a union or if the two hashes split the
    /// key space into a different number of segments.
    pub fn new(old: ConsistentHashRef, new: ConsistentHashRef) -> Self {
        assert!(
            !old.is_union() && !new.is_union(),
            "a union consistent hash cannot be built from another union"
        );
        assert_eq!(
            old.num_segments(),
            new.num_segments(),
            "union consistent hash requires equal segment counts"
        );

        let mut members = old.members().to_vec();
        for member in new.members() {
            if !members.contains(member) {
                members.push(member.clone());
            }
        }

        Self { old, new, members }
    }

    pub fn into_ref(self) -> ConsistentHashRef {
        Arc::new(self)
    }

    pub fn old_consistent_hash(&self) -> &ConsistentHashRef {
        &self.old
    }

    pub fn new_consistent_hash(&self) -> &ConsistentHashRef {
        &self.new
    }
}

impl ConsistentHash for UnionConsistentHash {
    fn members(&self) -> &[Member] {
        &self.members
    }

    fn num_segments(&self) -> usize {
        self.new.num_segments()
    }

    fn locate_segment(&self, segment: usize, replication_count: usize) -> Vec<Member> {
        let mut owners = self.old.locate_segment(segment, replication_count);
        for member in self.new.locate_segment(segment, replication_count) {
            if !owners.contains(&member) {
                owners.push(member);
            }
        }
        owners
    }

    fn distance(&self, a: &Member, b: &Member) -> Option<usize> {
        self.new.distance(a, b).or_else(|| self.old.distance(a, b))
    }

    fn as_union(&self) -> Option<&UnionConsistentHash> {
        Some(self)
    }
}
