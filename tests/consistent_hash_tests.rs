//! Placement properties of the ring consistent hash

use std::collections::HashSet;
use std::sync::Arc;

use kv_cache_dist::{ConsistentHash, ConsistentHashRef, DefaultConsistentHash, Member, UnionConsistentHash};

fn ring(members: &[Member], num_segments: usize) -> ConsistentHashRef {
    Arc::new(DefaultConsistentHash::new(members.to_vec(), num_segments).unwrap())
}

fn members(n: usize) -> Vec<Member> {
    (0..n).map(|i| Member::new(format!("10.0.0.{}:7800", i))).collect()
}

mod placement_tests {
    use super::*;

    #[test]
    fn test_every_key_has_owners() {
        let nodes = members(5);
        let ch = ring(&nodes, 128);
        for i in 0..1_000 {
            let owners = ch.locate(&format!("key-{}", i), 3);
            assert_eq!(owners.len(), 3);
            let distinct: HashSet<&Member> = owners.iter().collect();
            assert_eq!(distinct.len(), 3);
        }
    }

    #[test]
    fn test_same_members_same_placement() {
        let nodes = members(4);
        let first = ring(&nodes, 64);
        let second = ring(&nodes, 64);
        for i in 0..500 {
            let key = format!("key-{}", i);
            assert_eq!(first.locate(&key, 2), second.locate(&key, 2));
        }
    }

    #[test]
    fn test_departed_member_owns_nothing() {
        let nodes = members(4);
        let survivors: Vec<Member> = nodes.iter().take(3).cloned().collect();
        let after = ring(&survivors, 256);
        let departed = &nodes[3];

        assert!(after.segments_owned_by(departed, 2).is_empty());
        for i in 0..1_000 {
            let owners = after.locate(&format!("key-{}", i), 2);
            assert_eq!(owners.len(), 2);
            assert!(!owners.contains(departed));
        }
    }

    #[test]
    fn test_replacement_inherits_placement() {
        let nodes = members(3);
        let replacement = Member::new("10.0.0.9:7800");
        let before = ring(&nodes, 128);
        let after = ring(&[nodes[0].clone(), nodes[1].clone(), replacement.clone()], 128);

        for segment in 0..128 {
            let swapped: Vec<Member> = before
                .locate_segment(segment, 2)
                .into_iter()
                .map(|m| if m == nodes[2] { replacement.clone() } else { m })
                .collect();
            assert_eq!(after.locate_segment(segment, 2), swapped);
        }
    }

    #[test]
    fn test_union_covers_old_and_new_owners() {
        let nodes = members(3);
        let old = ring(&nodes[..2], 64);
        let new = ring(&nodes, 64);
        let union = UnionConsistentHash::new(old.clone(), new.clone());

        for segment in 0..64 {
            let owners = union.locate_segment(segment, 2);
            for member in old.locate_segment(segment, 2).iter().chain(new.locate_segment(segment, 2).iter()) {
                assert!(owners.contains(member));
            }
        }
        assert_eq!(union.members().len(), 3);
    }
}
