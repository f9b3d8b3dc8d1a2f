//! Consistent hashing for key distribution
//!
//! A consistent hash maps every segment of the key space to an ordered list of
//! owning members. Keys map to segments through a stable 64-bit hash, so every
//! node computes the same owners for the same member list.

pub mod default;
pub mod union;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ConsistentHashKind;
use crate::error::Result;
use crate::member::Member;
use crate::store::Key;

pub use default::DefaultConsistentHash;
pub use union::UnionConsistentHash;

/// Number of slots on the hash ring
pub const RING_SIZE: u64 = 1_000_000;

/// Shared handle to an immutable consistent hash
pub type ConsistentHashRef = Arc<dyn ConsistentHash>;

/// Mapping from keys and segments to ordered owner lists.
///
/// Implementations are immutable snapshots. The first member returned by
/// [`ConsistentHash::locate`] is the primary owner, the rest are backups.
pub trait ConsistentHash: fmt::Debug + Send + Sync {
    /// All members known to this hash, in insertion order
    fn members(&self) -> &[Member];

    /// Number of segments the key space is split into
    fn num_segments(&self) -> usize;

    /// Ordered owners of a segment
    fn locate_segment(&self, segment: usize, replication_count: usize) -> Vec<Member>;

    /// Clockwise distance from `a` to `b` in ring steps, `None` if either is unknown
    fn distance(&self, a: &Member, b: &Member) -> Option<usize>;

    /// Downcast to a union hash
    fn as_union(&self) -> Option<&UnionConsistentHash> {
        None
    }

    fn is_union(&self) -> bool {
        self.as_union().is_some()
    }

    fn segment_of(&self, key: &str) -> usize {
        segment_for_key(key, self.num_segments())
    }

    /// Ordered owners of a key
    fn locate(&self, key: &str, replication_count: usize) -> Vec<Member> {
        self.locate_segment(self.segment_of(key), replication_count)
    }

    fn locate_all(&self, keys: &[Key], replication_count: usize) -> HashMap<Key, Vec<Member>> {
        keys.iter()
            .map(|key| (key.clone(), self.locate(key, replication_count)))
            .collect()
    }

    fn is_key_local_to_address(&self, member: &Member, key: &str, replication_count: usize) -> bool {
        self.locate(key, replication_count).contains(member)
    }

    /// Whether `a` and `b` are direct neighbours on the ring
    fn is_adjacent(&self, a: &Member, b: &Member) -> bool {
        self.distance(a, b) == Some(1) || self.distance(b, a) == Some(1)
    }

    /// Segments a member owns
    fn segments_owned_by(&self, member: &Member, replication_count: usize) -> Vec<usize> {
        (0..self.num_segments())
            .filter(|segment| self.locate_segment(*segment, replication_count).contains(member))
            .collect()
    }

    fn contains_member(&self, member: &Member) -> bool {
        self.members().contains(member)
    }
}

/// Ring position of a key
pub fn position_of(key: &str) -> u64 {
    xxhash_rust::xxh64::xxh64(key.as_bytes(), 0) % RING_SIZE
}

/// Segment a key falls into
pub fn segment_for_key(key: &str, num_segments: usize) -> usize {
    let num_segments = num_segments.max(1) as u64;
    (position_of(key) * num_segments / RING_SIZE) as usize
}

/// First ring position covered by a segment
pub fn segment_start(segment: usize, num_segments: usize) -> u64 {
    let num_segments = num_segments.max(1) as u64;
    (segment as u64 * RING_SIZE + num_segments - 1) / num_segments
}

/// Build a consistent hash of the configured kind
pub fn create_consistent_hash(
    kind: ConsistentHashKind,
    members: &[Member],
    num_segments: usize,
) -> Result<ConsistentHashRef> {
    match kind {
        ConsistentHashKind::DefaultRing => {
            Ok(Arc::new(DefaultConsistentHash::new(members.to_vec(), num_segments)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_covers_its_keys() {
        let num_segments = 64;
        for i in 0..500 {
            let key = format!("key-{}", i);
            let segment = segment_for_key(&key, num_segments);
            let position = position_of(&key);

            assert!(segment < num_segments);
            assert!(segment_start(segment, num_segments) <= position);
            if segment + 1 < num_segments {
                assert!(position < segment_start(segment + 1, num_segments));
            }
        }
    }

    #[test]
    fn test_position_is_stable() {
        assert_eq!(position_of("user:123"), position_of("user:123"));
        assert!(position_of("user:123") < RING_SIZE);
    }

    #[test]
    fn test_factory_builds_default_ring() {
        let members = vec![Member::new("a"), Member::new("b")];
        let ch = create_consistent_hash(ConsistentHashKind::DefaultRing, &members, 16).unwrap();
        assert_eq!(ch.members(), members.as_slice());
        assert!(!ch.is_union());
    }
}
