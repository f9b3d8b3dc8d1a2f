//! Tests for nodes joining a running cluster
//!
//! This module covers:
//! - pull-based state transfer to a joiner
//! - invalidation of entries the old owners gave up
//! - persisted entries taking part in the transfer
//! - locality queries once the cluster is stable

mod common;

use std::sync::Arc;

use common::{keys_with_primary, test_config, LocalCluster, MemoryCacheStore, TestNode};
use kv_cache_dist::{DataContainer, DataLocality, JoinState, RehashKind, WriteCommand};

async fn write_keys(node: &TestNode, count: usize) -> Vec<String> {
    let mut keys = Vec::new();
    for i in 0..count {
        let key = format!("user:{}", i);
        node.manager
            .handle_write(WriteCommand::put(key.clone(), format!("value-{}", i)))
            .await
            .unwrap();
        keys.push(key);
    }
    keys
}

/// Every key is held by exactly its owners
async fn assert_placement(nodes: &[Arc<TestNode>], keys: &[String]) {
    let reference = &nodes[0].manager;
    for key in keys {
        let owners = reference.locate(key);
        assert_eq!(owners.len(), reference.config().distribution.num_owners.min(nodes.len()));
        for node in nodes {
            let held = node.container.contains_key(key).await;
            assert_eq!(
                held,
                owners.contains(&node.member),
                "{} on {} (owners {:?})",
                key,
                node.member,
                owners
            );
        }
    }
}

mod join_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_node_starts_alone() {
        let cluster = LocalCluster::new(test_config());
        let a = cluster.start_node("10.0.0.1:7800").await;

        assert_eq!(a.manager.join_state(), JoinState::Joined);
        let topology = a.manager.topology().unwrap();
        assert!(!topology.topology().is_rehashing());
        assert_eq!(topology.topology().current_ch().members(), &[a.member.clone()]);
        assert!(a.manager.last_successful_consistent_hash().is_some());
        assert!(a.manager.is_local("anything"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_node_join_moves_state() {
        let cluster = LocalCluster::new(test_config());
        let a = cluster.start_node("10.0.0.1:7800").await;
        let b = cluster.start_node("10.0.0.2:7800").await;
        let keys = write_keys(&a, 100).await;
        assert_placement(&[a.clone(), b.clone()], &keys).await;

        let c = cluster.start_node("10.0.0.3:7800").await;
        let nodes = vec![a.clone(), b.clone(), c.clone()];
        let view_id = c.manager.context().rpc.view_id();
        cluster.await_rehash(&nodes, view_id).await;

        for node in &nodes {
            let topology = node.manager.topology().unwrap();
            assert!(!topology.topology().is_rehashing());
            assert_eq!(topology.topology().current_ch().members().len(), 3);
        }
        assert_placement(&nodes, &keys).await;

        let report = c.manager.last_report().unwrap();
        assert_eq!(report.kind, RehashKind::Join);
        assert!(report.success);
        assert!(report.keys_pulled > 0);
        assert!(report.failed_destinations.is_empty());

        for key in &keys {
            let value = c.manager.get(key).await.unwrap().unwrap();
            assert!(value.value.starts_with("value-"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_nodes_agree_on_topology_id() {
        let cluster = LocalCluster::new(test_config());
        let a = cluster.start_node("a:1").await;
        let b = cluster.start_node("b:1").await;
        let c = cluster.start_node("c:1").await;

        let ids: Vec<u64> = [&a, &b, &c]
            .iter()
            .map(|node| node.manager.topology().unwrap().topology_id())
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(
            kv_cache_dist::topology::view_of_topology(ids[0]),
            c.manager.context().rpc.view_id()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_persisted_entries_follow_their_owner() {
        let mut config = test_config();
        config.distribution.num_owners = 1;
        let cluster = LocalCluster::new(config);

        let store = Arc::new(MemoryCacheStore::default());
        for i in 0..50 {
            store.insert(&format!("persisted:{}", i), "on-disk");
        }
        let a = cluster.start_node_with_store("a:1", store.clone()).await;
        let b = cluster.start_node("b:1").await;

        let mut moved = 0;
        for i in 0..50 {
            let key = format!("persisted:{}", i);
            let owner = b.manager.locate(&key)[0].clone();
            if owner == b.member {
                moved += 1;
                assert!(b.container.contains_key(&key).await, "{} not pulled", key);
                assert!(!store.contains(&key), "{} still persisted on old owner", key);
            } else {
                assert_eq!(owner, a.member);
                assert!(store.contains(&key));
            }
        }
        assert!(moved > 0);
    }
}

mod locality_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_locality_matches_owners() {
        let mut config = test_config();
        config.distribution.num_owners = 1;
        let cluster = LocalCluster::new(config);
        let a = cluster.start_node("a:1").await;
        let b = cluster.start_node("b:1").await;

        let on_a = keys_with_primary(&a, &a.member, 5);
        let on_b = keys_with_primary(&a, &b.member, 5);
        for key in &on_a {
            assert_eq!(a.manager.locality(key), DataLocality::Local);
            assert_eq!(b.manager.locality(key), DataLocality::NotLocal);
            assert!(a.manager.is_key_local_to_address(&a.member, key));
            assert!(!a.manager.is_affected_by_rehash(key));
        }
        for key in &on_b {
            assert!(b.manager.is_local(key));
            assert!(!a.manager.is_local(key));
        }

        let mixed: Vec<String> = vec![on_a[0].clone(), on_b[0].clone()];
        let affected = a.manager.affected_nodes(&mixed);
        assert!(affected.contains(&a.member));
        assert!(affected.contains(&b.member));

        let located = a.manager.locate_all(&mixed);
        assert_eq!(located[&on_a[0]], vec![a.member.clone()]);
        assert_eq!(located[&on_b[0]], vec![b.member.clone()]);
    }

    #[tokio::test]
    async fn test_locality_uncertain_before_start() {
        let cluster = LocalCluster::new(test_config());
        let a = cluster.add_node("a:1", test_config()).await;

        assert_eq!(a.manager.locality("k"), DataLocality::NotLocalUncertain);
        assert!(a.manager.locate("k").is_empty());
        assert!(a.manager.get("k").await.is_err());
    }
}
