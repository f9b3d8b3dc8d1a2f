//! Per-segment write ordering between a primary owner and its backups
//!
//! The primary stamps each write with the next sequence number of its
//! segment. Backups deliver writes only in that order. Both counters are
//! scoped to a topology id and restart at 1 when a newer topology shows up.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{DistributionError, Result};

#[derive(Debug, Default)]
struct SegmentSequencer {
    sender_topology_id: u64,
    sender_sequence: u64,
    receiver_topology_id: u64,
    receiver_sequence: u64,
}

impl SegmentSequencer {
    fn new() -> Self {
        Self {
            sender_topology_id: 0,
            sender_sequence: 1,
            receiver_topology_id: 0,
            receiver_sequence: 1,
        }
    }

    fn next(&mut self, topology_id: u64) -> u64 {
        if topology_id > self.sender_topology_id {
            self.sender_topology_id = topology_id;
            self.sender_sequence = 1;
        }
        let sequence = self.sender_sequence;
        self.sender_sequence += 1;
        sequence
    }

    fn is_next(&mut self, sequence: u64, topology_id: u64) -> bool {
        if topology_id < self.receiver_topology_id {
            return true;
        }
        if topology_id > self.receiver_topology_id {
            self.receiver_topology_id = topology_id;
            self.receiver_sequence = 1;
        }
        sequence == self.receiver_sequence
    }

    fn mark_delivered(&mut self, sequence: u64, topology_id: u64) {
        if topology_id == self.receiver_topology_id && sequence == self.receiver_sequence {
            self.receiver_sequence += 1;
        }
    }

    fn is_delivered(&self, sequence: u64, topology_id: u64) -> bool {
        topology_id == self.receiver_topology_id && sequence < self.receiver_sequence
    }

    fn skip_to(&mut self, sequence: u64, topology_id: u64) -> u64 {
        if topology_id > self.receiver_topology_id {
            self.receiver_topology_id = topology_id;
            self.receiver_sequence = 1;
        }
        if topology_id < self.receiver_topology_id || sequence <= self.receiver_sequence {
            return 0;
        }
        let skipped = sequence - self.receiver_sequence;
        self.receiver_sequence = sequence;
        skipped
    }
}

#[derive(Debug)]
pub struct TriangleOrderManager {
    segments: Vec<Mutex<SegmentSequencer>>,
    current_topology_id: AtomicU64,
}

impl TriangleOrderManager {
    pub fn new(num_segments: usize) -> Self {
        Self {
            segments: (0..num_segments.max(1))
                .map(|_| Mutex::new(SegmentSequencer::new()))
                .collect(),
            current_topology_id: AtomicU64::new(0),
        }
    }

    /// Called whenever a topology is installed
    pub fn update_topology(&self, topology_id: u64) {
        self.current_topology_id.fetch_max(topology_id, Ordering::SeqCst);
    }

    pub fn current_topology_id(&self) -> u64 {
        self.current_topology_id.load(Ordering::SeqCst)
    }

    fn segment(&self, segment: usize) -> &Mutex<SegmentSequencer> {
        &self.segments[segment % self.segments.len()]
    }

    /// Next sequence number for a write on the primary
    pub fn next(&self, segment: usize, topology_id: u64) -> Result<u64> {
        let current = self.current_topology_id();
        if topology_id != current {
            return Err(DistributionError::OutdatedTopology {
                command_topology: topology_id,
                current_topology: current,
            });
        }
        Ok(self.segment(segment).lock().next(topology_id))
    }

    /// Whether a backup may deliver `sequence` now
    pub fn is_next(&self, segment: usize, sequence: u64, topology_id: u64) -> bool {
        self.segment(segment).lock().is_next(sequence, topology_id)
    }

    pub fn mark_delivered(&self, segment: usize, sequence: u64, topology_id: u64) {
        self.segment(segment).lock().mark_delivered(sequence, topology_id);
    }

    /// Whether a backup already delivered `sequence`, making it a resent duplicate
    pub fn is_delivered(&self, segment: usize, sequence: u64, topology_id: u64) -> bool {
        self.segment(segment).lock().is_delivered(sequence, topology_id)
    }

    /// Give up on every write before `sequence`. Returns how many were skipped.
    pub fn skip_to(&self, segment: usize, sequence: u64, topology_id: u64) -> u64 {
        self.segment(segment).lock().skip_to(sequence, topology_id)
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic_per_segment() {
        let manager = TriangleOrderManager::new(4);
        manager.update_topology(3);

        assert_eq!(manager.next(0, 3).unwrap(), 1);
        assert_eq!(manager.next(0, 3).unwrap(), 2);
        assert_eq!(manager.next(0, 3).unwrap(), 3);
        assert_eq!(manager.next(1, 3).unwrap(), 1);
    }

    #[test]
    fn test_stale_topology_is_rejected() {
        let manager = TriangleOrderManager::new(4);
        manager.update_topology(5);
        assert_eq!(manager.next(0, 5).unwrap(), 1);

        let err = manager.next(0, 4).unwrap_err();
        assert!(matches!(
            err,
            DistributionError::OutdatedTopology { command_topology: 4, current_topology: 5 }
        ));
        assert!(err.is_retryable());
        assert!(manager.next(0, 6).is_err());
    }

    #[test]
    fn test_newer_topology_resets_sender() {
        let manager = TriangleOrderManager::new(1);
        manager.update_topology(1);
        manager.next(0, 1).unwrap();
        manager.next(0, 1).unwrap();

        manager.update_topology(2);
        assert_eq!(manager.next(0, 2).unwrap(), 1);
        // older topology id never lowers the current one
        manager.update_topology(1);
        assert_eq!(manager.current_topology_id(), 2);
    }

    #[test]
    fn test_receiver_delivers_in_order() {
        let manager = TriangleOrderManager::new(2);

        assert!(manager.is_next(0, 1, 7));
        assert!(!manager.is_next(0, 2, 7));
        manager.mark_delivered(0, 1, 7);
        assert!(manager.is_next(0, 2, 7));

        // no gap filling
        manager.mark_delivered(0, 3, 7);
        assert!(manager.is_next(0, 2, 7));

        // older topology is drained out, newer resets
        assert!(manager.is_next(0, 99, 6));
        assert!(manager.is_next(0, 1, 8));
        assert!(!manager.is_next(0, 2, 8));
    }

    #[test]
    fn test_resent_write_is_a_duplicate() {
        let manager = TriangleOrderManager::new(1);
        assert!(manager.is_next(0, 1, 4));
        manager.mark_delivered(0, 1, 4);

        assert!(manager.is_delivered(0, 1, 4));
        assert!(!manager.is_delivered(0, 2, 4));
        assert!(!manager.is_delivered(0, 1, 5));
    }

    #[test]
    fn test_skip_moves_past_lost_writes() {
        let manager = TriangleOrderManager::new(1);
        assert!(manager.is_next(0, 1, 4));
        assert!(!manager.is_next(0, 3, 4));

        assert_eq!(manager.skip_to(0, 3, 4), 2);
        assert!(manager.is_next(0, 3, 4));
        // never moves backwards
        assert_eq!(manager.skip_to(0, 2, 4), 0);
        assert!(manager.is_next(0, 3, 4));
    }
}
