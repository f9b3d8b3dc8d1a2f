//! Ring-based consistent hash
//!
//! Members sit at evenly spaced points of a ring of [`RING_SIZE`] slots, the
//! spacing weighted by capacity factor. A segment resolves to the first
//! distinct members at or after the segment's first slot, wrapping around.

use super::{segment_start, ConsistentHash, RING_SIZE};
use crate::error::{DistributionError, Result};
use crate::member::Member;

/// Point on the ring held by one member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingPoint {
    position: u64,
    member_index: usize,
}

/// Consistent hash ring for key distribution
#[derive(Debug, Clone)]
pub struct DefaultConsistentHash {
    members: Vec<Member>,
    ring: Vec<RingPoint>,
    num_segments: usize,
}

impl DefaultConsistentHash {
    pub fn new(members: Vec<Member>, num_segments: usize) -> Result<Self> {
        if members.is_empty() {
            return Err(DistributionError::InvalidConfiguration(
                "can't construct a consistent hash without any members".to_string(),
            ));
        }
        if num_segments == 0 || num_segments as u64 > RING_SIZE {
            return Err(DistributionError::InvalidConfiguration(format!(
                "number of segments must be in 1..={}, got {}",
                RING_SIZE, num_segments
            )));
        }

        let mut distinct: Vec<Member> = Vec::with_capacity(members.len());
        for member in members {
            if !distinct.contains(&member) {
                distinct.push(member);
            }
        }

        let total: f64 = distinct.iter().map(|m| m.capacity_factor() as f64).sum();
        let mut ring = Vec::with_capacity(distinct.len());
        let mut cumulative = 0.0f64;
        for (member_index, member) in distinct.iter().enumerate() {
            let position = ((cumulative / total) * RING_SIZE as f64) as u64;
            ring.push(RingPoint {
                position: position.min(RING_SIZE - 1),
                member_index,
            });
            cumulative += member.capacity_factor() as f64;
        }
        // Stable by insertion index on duplicate positions
        ring.sort_by_key(|point| (point.position, point.member_index));

        Ok(Self {
            members: distinct,
            ring,
            num_segments,
        })
    }

    /// Ordered owners of an arbitrary ring position
    pub fn locate_position(&self, position: u64, replication_count: usize) -> Vec<Member> {
        let wanted = replication_count.min(self.members.len());
        let start = self.ring.partition_point(|point| point.position < position);

        let mut owners: Vec<Member> = Vec::with_capacity(wanted);
        for offset in 0..self.ring.len() {
            if owners.len() == wanted {
                break;
            }
            let point = self.ring[(start + offset) % self.ring.len()];
            let member = &self.members[point.member_index];
            if !owners.contains(member) {
                owners.push(member.clone());
            }
        }
        owners
    }

    /// Ring position of a member
    pub fn position_of_member(&self, member: &Member) -> Option<u64> {
        self.ring_index(member).map(|index| self.ring[index].position)
    }

    fn ring_index(&self, member: &Member) -> Option<usize> {
        let member_index = self.members.iter().position(|m| m == member)?;
        self.ring
            .iter()
            .position(|point| point.member_index == member_index)
    }
}

impl ConsistentHash for DefaultConsistentHash {
    fn members(&self) -> &[Member] {
        &self.members
    }

    fn num_segments(&self) -> usize {
        self.num_segments
    }

    fn locate_segment(&self, segment: usize, replication_count: usize) -> Vec<Member> {
        let position = segment_start(segment % self.num_segments, self.num_segments);
        self.locate_position(position, replication_count)
    }

    fn distance(&self, a: &Member, b: &Member) -> Option<usize> {
        let from = self.ring_index(a)?;
        let to = self.ring_index(b)?;
        Some((to + self.ring.len() - from) % self.ring.len())
    }
}
