//! Tests for departures, rebalances and partition merges
//!
//! This module covers:
//! - push-based state transfer after a crash
//! - writes logged during a rehash being replayed on the new owners
//! - a node replaced within one view, and manual rebalances
//! - two partitions merging back, and a merge that cannot reach the other side

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{keys_with_primary, test_config, LocalCluster, TestNode};
use kv_cache_dist::{DataContainer, LeaveProtocol, RehashKind, WriteCommand};

async fn write_keys(node: &TestNode, prefix: &str, count: usize) -> Vec<String> {
    let mut keys = Vec::new();
    for i in 0..count {
        let key = format!("{}:{}", prefix, i);
        node.manager
            .handle_write(WriteCommand::put(key.clone(), format!("{}-value", key)))
            .await
            .unwrap();
        keys.push(key);
    }
    keys
}

async fn assert_fully_replicated(nodes: &[Arc<TestNode>], keys: &[String]) {
    let reference = &nodes[0].manager;
    for key in keys {
        let owners = reference.locate(key);
        for owner in &owners {
            let node = nodes.iter().find(|n| n.member == *owner).unwrap();
            let value = node.container.get(key).await;
            assert_eq!(
                value.map(|v| v.value),
                Some(format!("{}-value", key)),
                "{} missing on owner {}",
                key,
                owner
            );
        }
    }
}

async fn three_nodes(cluster: &Arc<LocalCluster>) -> (Arc<TestNode>, Arc<TestNode>, Arc<TestNode>) {
    let a = cluster.start_node("a:1").await;
    let b = cluster.start_node("b:1").await;
    let c = cluster.start_node("c:1").await;
    (a, b, c)
}

mod leave_tests {
    use super::*;

    async fn crash_and_check(protocol: LeaveProtocol) {
        let mut config = test_config();
        config.distribution.leave_protocol = protocol;
        let cluster = LocalCluster::new(config);
        let (a, b, c) = three_nodes(&cluster).await;
        let keys = write_keys(&a, "k", 100).await;

        let view_id = cluster.stop_node(&c.member).await;
        let survivors = vec![a.clone(), b.clone()];
        cluster.await_rehash(&survivors, view_id).await;

        for node in &survivors {
            let topology = node.manager.topology().unwrap();
            assert!(!topology.topology().is_rehashing());
            assert!(!topology.topology().current_ch().contains_member(&c.member));
            let report = node.manager.last_report().unwrap();
            assert!(report.success);
            assert!(matches!(report.kind, RehashKind::Leave | RehashKind::InvertedLeave));
        }
        // two owners left: every survivor holds every key
        assert_fully_replicated(&survivors, &keys).await;
        for key in &keys {
            assert!(a.container.contains_key(key).await);
            assert!(b.container.contains_key(key).await);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crash_with_inverted_leave() {
        crash_and_check(LeaveProtocol::Inverted).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crash_with_push_leave() {
        crash_and_check(LeaveProtocol::Push).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_logged_write_replayed_after_leave() {
        let cluster = LocalCluster::new(test_config());
        let (a, b, c) = three_nodes(&cluster).await;

        let key = keys_with_primary(&a, &a.member, 1).remove(0);
        a.manager.txlog().enable();
        a.manager
            .handle_write(WriteCommand::put(key.clone(), "logged"))
            .await
            .unwrap();
        // held back by the log, not applied yet
        assert!(a.container.get(&key).await.is_none());
        assert_eq!(a.manager.txlog().logged_count(), 1);

        let view_id = cluster.stop_node(&c.member).await;
        cluster.await_rehash(&[a.clone(), b.clone()], view_id).await;

        assert!(!a.manager.txlog().is_enabled());
        assert!(!a.manager.txlog().is_locked());
        assert_eq!(a.container.get(&key).await.unwrap().value, "logged");
        assert_eq!(b.container.get(&key).await.unwrap().value, "logged");
        assert!(a.manager.last_report().unwrap().commands_replayed >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_owner_loses_only_departed_data() {
        let mut config = test_config();
        config.distribution.num_owners = 1;
        let cluster = LocalCluster::new(config);
        let (a, b, c) = three_nodes(&cluster).await;

        let on_a = keys_with_primary(&a, &a.member, 10);
        for key in &on_a {
            a.manager
                .handle_write(WriteCommand::put(key.clone(), "kept"))
                .await
                .unwrap();
        }

        let view_id = cluster.stop_node(&c.member).await;
        cluster.await_rehash(&[a.clone(), b.clone()], view_id).await;

        for key in &on_a {
            let value = b.manager.get(key).await.unwrap();
            assert_eq!(value.map(|v| v.value), Some("kept".to_string()));
        }
    }
}

mod rebalance_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replaced_node_receives_state() {
        let cluster = LocalCluster::new(test_config());
        let (a, b, c) = three_nodes(&cluster).await;
        let keys = write_keys(&a, "r", 100).await;

        let (d, view_id) = cluster.replace_node(&c.member, "d:1").await;
        d.manager.start().await.unwrap();

        let nodes = vec![a.clone(), b.clone(), d.clone()];
        cluster.await_rehash(&nodes, view_id).await;

        for node in &nodes {
            let ch = node.manager.consistent_hash().unwrap();
            assert!(ch.contains_member(&d.member));
            assert!(!ch.contains_member(&c.member));
        }
        assert_eq!(a.manager.last_report().unwrap().kind, RehashKind::Rebalance);
        assert_fully_replicated(&nodes, &keys).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_manual_rebalance_keeps_placement() {
        let cluster = LocalCluster::new(test_config());
        let (a, b, c) = three_nodes(&cluster).await;
        let keys = write_keys(&b, "m", 50).await;
        let before = a.manager.topology().unwrap().topology_id();

        let final_id = a.manager.request_cluster_rebalance().await.unwrap();
        assert_eq!(final_id, before + 2);

        let nodes = vec![a.clone(), b.clone(), c.clone()];
        for node in &nodes {
            node.manager.wait_for_topology(final_id).await.unwrap();
            assert_eq!(node.manager.topology().unwrap().topology_id(), final_id);
            let report = node.manager.last_report().unwrap();
            assert_eq!(report.kind, RehashKind::Rebalance);
            assert_eq!(report.keys_pushed, 0);
        }
        assert_fully_replicated(&nodes, &keys).await;
    }
}

mod merge_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_partitions_merge_back() {
        let cluster = LocalCluster::new(test_config());
        let a = cluster.start_node("a:1").await;
        let b = cluster.start_node("b:1").await;
        let c = cluster.start_node("c:1").await;
        let d = cluster.start_node("d:1").await;
        let shared = write_keys(&a, "shared", 40).await;

        let left = vec![a.member.clone(), b.member.clone()];
        let right = vec![c.member.clone(), d.member.clone()];
        let views = cluster.partition(&[left.clone(), right.clone()]).await;
        cluster.await_rehash(&[a.clone(), b.clone()], views[0]).await;
        cluster.await_rehash(&[c.clone(), d.clone()], views[1]).await;

        let left_only = write_keys(&a, "left", 20).await;
        let right_only = write_keys(&c, "right", 20).await;

        let merged = cluster.merge(&[left, right]).await;
        let nodes = vec![a.clone(), b.clone(), c.clone(), d.clone()];
        cluster.await_rehash(&nodes, merged).await;

        for node in &nodes {
            let topology = node.manager.topology().unwrap();
            assert!(!topology.topology().is_rehashing());
            assert_eq!(topology.topology().current_ch().members().len(), 4);
            assert_eq!(node.manager.last_report().unwrap().kind, RehashKind::Merge);
        }
        assert_fully_replicated(&nodes, &left_only).await;
        assert_fully_replicated(&nodes, &right_only).await;
        for key in &shared {
            assert!(d.manager.get(key).await.unwrap().is_some(), "{} lost in merge", key);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_merge_releases_rehash_state() {
        let cluster = LocalCluster::new(test_config());
        let a = cluster.start_node("a:1").await;
        let b = cluster.start_node("b:1").await;
        let c = cluster.start_node("c:1").await;
        write_keys(&a, "before", 20).await;

        let left = vec![a.member.clone(), b.member.clone()];
        let right = vec![c.member.clone()];
        let views = cluster.partition(&[left.clone(), right.clone()]).await;
        cluster.await_rehash(&[a.clone(), b.clone()], views[0]).await;
        cluster.await_rehash(&[c.clone()], views[1]).await;

        cluster.set_unreachable(&a.member, true);
        cluster.set_unreachable(&b.member, true);
        cluster.merge(&[left, right]).await;

        let report = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(report) = c.manager.last_report() {
                    if report.kind == RehashKind::Merge && !c.manager.is_rehash_in_progress() {
                        return report;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("merge on c finished");

        assert!(!report.success);
        assert!(!c.manager.is_rehash_in_progress());
        assert!(!c.manager.txlog().is_enabled());
        assert!(!c.manager.txlog().is_locked());
    }
}
