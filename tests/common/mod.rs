//! In-process cluster used by the integration tests
//!
//! Every node gets its own distribution manager, container and notifier. RPCs
//! are routed straight to the target's `handle_command`. Each node sees its
//! own view, so partitions are just nodes with different views.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};

use kv_cache_dist::{
    CacheConfig, CacheContext, CacheStore, DataContainer, DistributionError, DistributionManager, InMemoryDataContainer,
    InternalCacheValue, Key, LocalMembershipNotifier, Member, RehashCommand, Response, ResponseMode, Result,
    RpcManager, ViewChangedEvent,
};

/// Config with timeouts short enough for tests
pub fn test_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.name = "test".to_string();
    config.distribution.num_segments = 64;
    config.distribution.rehash_rpc_timeout_ms = 5_000;
    config.distribution.rehash_wait_time_ms = 5_000;
    config.distribution.join_retry_base_ms = 10;
    config.distribution.join_retry_max_ms = 100;
    config.logging.level = kv_cache_dist::config::LogLevel::Debug;
    config
}

pub struct TestNode {
    pub member: Member,
    pub manager: Arc<DistributionManager>,
    pub container: Arc<InMemoryDataContainer>,
    pub notifier: Arc<LocalMembershipNotifier>,
}

#[derive(Default)]
struct Views {
    last_view_id: u64,
    /// Members of the whole cluster, in join order
    members: Vec<Member>,
    per_node: HashMap<Member, (u64, Vec<Member>)>,
}

pub struct LocalCluster {
    config: CacheConfig,
    nodes: RwLock<HashMap<Member, Arc<TestNode>>>,
    views: Mutex<Views>,
    unreachable: RwLock<HashSet<Member>>,
    multicast: bool,
}

impl LocalCluster {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        kv_cache_dist::log::init_logging(&config.logging);
        Arc::new(Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            views: Mutex::new(Views::default()),
            unreachable: RwLock::new(HashSet::new()),
            multicast: true,
        })
    }

    fn create_node(
        self: &Arc<Self>,
        member: Member,
        config: CacheConfig,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Arc<TestNode> {
        let rpc = Arc::new(NodeRpc {
            local: member.clone(),
            cluster: Arc::downgrade(self),
        });
        let container = Arc::new(InMemoryDataContainer::new());
        let notifier = Arc::new(LocalMembershipNotifier::new());
        let mut ctx = CacheContext::new(config, rpc, notifier.clone(), container.clone());
        if let Some(store) = store {
            ctx = ctx.with_store(store);
        }
        let manager = DistributionManager::new(ctx).expect("valid test config");
        let node = Arc::new(TestNode {
            member: member.clone(),
            manager,
            container,
            notifier,
        });
        self.nodes.write().insert(member, Arc::clone(&node));
        node
    }

    /// A manager over `container` that belongs to no view and is not started
    pub fn detached_manager(self: &Arc<Self>, address: &str, container: Arc<dyn DataContainer>) -> Arc<DistributionManager> {
        let member = Member::new(address);
        let rpc = Arc::new(NodeRpc {
            local: member,
            cluster: Arc::downgrade(self),
        });
        let notifier = Arc::new(LocalMembershipNotifier::new());
        let ctx = CacheContext::new(self.config.clone(), rpc, notifier, container);
        DistributionManager::new(ctx).expect("valid test config")
    }

    /// Add a node to the view and run its join to completion
    pub async fn start_node(self: &Arc<Self>, address: &str) -> Arc<TestNode> {
        let node = self.add_node(address, self.config.clone()).await;
        node.manager.start().await.expect("node joins");
        node
    }

    /// Start a node whose persisted entries take part in rehashing
    pub async fn start_node_with_store(self: &Arc<Self>, address: &str, store: Arc<dyn CacheStore>) -> Arc<TestNode> {
        let node = self.add_node_inner(address, self.config.clone(), Some(store)).await;
        node.manager.start().await.expect("node joins");
        node
    }

    /// Add a node to the view without starting it
    pub async fn add_node(self: &Arc<Self>, address: &str, config: CacheConfig) -> Arc<TestNode> {
        self.add_node_inner(address, config, None).await
    }

    async fn add_node_inner(
        self: &Arc<Self>,
        address: &str,
        config: CacheConfig,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Arc<TestNode> {
        let node = self.create_node(Member::new(address), config, store);
        let (old, new, view_id) = {
            let mut views = self.views.lock();
            let old = views.members.clone();
            views.members.push(node.member.clone());
            views.last_view_id += 1;
            let view_id = views.last_view_id;
            let new = views.members.clone();
            for member in &new {
                views.per_node.insert(member.clone(), (view_id, new.clone()));
            }
            (old, new, view_id)
        };
        self.notify(&old, ViewChangedEvent::new(view_id, old.clone(), new)).await;
        node
    }

    /// Crash a node: it stops answering and the survivors get a new view.
    /// Returns the new view id.
    pub async fn stop_node(self: &Arc<Self>, member: &Member) -> u64 {
        let node = self.nodes.write().remove(member);
        let (old, new, view_id) = {
            let mut views = self.views.lock();
            let old = views.members.clone();
            views.members.retain(|m| m != member);
            views.per_node.remove(member);
            views.last_view_id += 1;
            let view_id = views.last_view_id;
            let new = views.members.clone();
            for m in &new {
                views.per_node.insert(m.clone(), (view_id, new.clone()));
            }
            (old, new, view_id)
        };
        if let Some(node) = node {
            node.manager.stop().await;
        }
        self.notify(&new, ViewChangedEvent::new(view_id, old, new.clone())).await;
        view_id
    }

    /// Swap `leaver` for a fresh node in a single view change.
    /// Returns the new node, not yet started, and the view id.
    pub async fn replace_node(self: &Arc<Self>, leaver: &Member, address: &str) -> (Arc<TestNode>, u64) {
        let removed = self.nodes.write().remove(leaver);
        let node = self.create_node(Member::new(address), self.config.clone(), None);
        let (old, new, view_id) = {
            let mut views = self.views.lock();
            let old = views.members.clone();
            views.members.retain(|m| m != leaver);
            views.members.push(node.member.clone());
            views.per_node.remove(leaver);
            views.last_view_id += 1;
            let view_id = views.last_view_id;
            let new = views.members.clone();
            for m in &new {
                views.per_node.insert(m.clone(), (view_id, new.clone()));
            }
            (old, new, view_id)
        };
        if let Some(removed) = removed {
            removed.manager.stop().await;
        }
        let survivors: Vec<Member> = new.iter().filter(|m| **m != node.member).cloned().collect();
        self.notify(&survivors, ViewChangedEvent::new(view_id, old, new)).await;
        (node, view_id)
    }

    /// Split the cluster. Each group gets its own view, as if the others had
    /// crashed. Returns the view id of every group.
    pub async fn partition(self: &Arc<Self>, groups: &[Vec<Member>]) -> Vec<u64> {
        let mut view_ids = Vec::new();
        for group in groups {
            let (events, view_id) = {
                let mut views = self.views.lock();
                views.last_view_id += 1;
                let view_id = views.last_view_id;
                let mut events = Vec::new();
                for member in group {
                    let old = views
                        .per_node
                        .get(member)
                        .map(|(_, members)| members.clone())
                        .unwrap_or_default();
                    views.per_node.insert(member.clone(), (view_id, group.clone()));
                    events.push((member.clone(), ViewChangedEvent::new(view_id, old, group.clone())));
                }
                (events, view_id)
            };
            for (member, event) in events {
                self.notify_one(&member, &event).await;
            }
            view_ids.push(view_id);
        }
        view_ids
    }

    /// Heal every partition into one merged view. Returns its id.
    pub async fn merge(self: &Arc<Self>, groups: &[Vec<Member>]) -> u64 {
        let all: Vec<Member> = groups.iter().flatten().cloned().collect();
        let (events, view_id) = {
            let mut views = self.views.lock();
            views.last_view_id += 1;
            let view_id = views.last_view_id;
            let mut events = Vec::new();
            for member in &all {
                let old = views
                    .per_node
                    .get(member)
                    .map(|(_, members)| members.clone())
                    .unwrap_or_default();
                views.per_node.insert(member.clone(), (view_id, all.clone()));
                events.push((
                    member.clone(),
                    ViewChangedEvent::merge(view_id, old, all.clone(), groups.to_vec()),
                ));
            }
            views.members = all.clone();
            (events, view_id)
        };
        for (member, event) in events {
            self.notify_one(&member, &event).await;
        }
        view_id
    }

    pub fn set_unreachable(&self, member: &Member, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(member.clone());
        } else {
            set.remove(member);
        }
    }

    async fn notify(&self, targets: &[Member], event: ViewChangedEvent) {
        for member in targets {
            self.notify_one(member, &event).await;
        }
    }

    async fn notify_one(&self, member: &Member, event: &ViewChangedEvent) {
        let node = self.nodes.read().get(member).cloned();
        if let Some(node) = node {
            node.notifier.notify_view_changed(event).await;
        }
    }

    pub fn node(&self, member: &Member) -> Option<Arc<TestNode>> {
        self.nodes.read().get(member).cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        self.views.lock().members.clone()
    }

    fn view_of(&self, member: &Member) -> (u64, Vec<Member>) {
        self.views
            .lock()
            .per_node
            .get(member)
            .cloned()
            .unwrap_or_else(|| (0, vec![member.clone()]))
    }

    fn reachable(&self, member: &Member) -> Option<Arc<DistributionManager>> {
        if self.unreachable.read().contains(member) {
            return None;
        }
        self.nodes.read().get(member).map(|node| Arc::clone(&node.manager))
    }

    /// Wait until every node in `nodes` completed the rehash of `view_id`
    pub async fn await_rehash(&self, nodes: &[Arc<TestNode>], view_id: u64) {
        for node in nodes {
            node.manager
                .wait_for_rehash_to_complete(view_id)
                .await
                .unwrap_or_else(|e| panic!("{} did not complete view {}: {}", node.member, view_id, e));
        }
    }
}

/// Routes commands to the target node's distribution manager
pub struct NodeRpc {
    local: Member,
    cluster: Weak<LocalCluster>,
}

impl NodeRpc {
    fn cluster(&self) -> Result<Arc<LocalCluster>> {
        self.cluster.upgrade().ok_or(DistributionError::Stopped)
    }
}

#[async_trait]
impl RpcManager for NodeRpc {
    async fn invoke_remotely(
        &self,
        targets: &[Member],
        command: RehashCommand,
        mode: ResponseMode,
        timeout: Duration,
        _use_priority_executor: bool,
    ) -> Result<HashMap<Member, Response>> {
        let cluster = self.cluster()?;
        if cluster.unreachable.read().contains(&self.local) {
            return Ok(targets
                .iter()
                .map(|target| (target.clone(), Response::Failure("sender unreachable".to_string())))
                .collect());
        }

        match mode {
            ResponseMode::Asynchronous => {
                for target in targets {
                    if let Some(manager) = cluster.reachable(target) {
                        let command = command.clone();
                        tokio::spawn(async move {
                            manager.handle_command(command).await;
                        });
                    }
                }
                Ok(HashMap::new())
            }
            ResponseMode::Synchronous => {
                let calls = targets.iter().map(|target| {
                    let manager = cluster.reachable(target);
                    let command = command.clone();
                    let target = target.clone();
                    async move {
                        let response = match manager {
                            None => Response::Failure(format!("{} unreachable", target)),
                            Some(manager) => {
                                match tokio::time::timeout(timeout, manager.handle_command(command)).await {
                                    Ok(response) => response,
                                    Err(_) => Response::Failure(format!("{} timed out", target)),
                                }
                            }
                        };
                        (target, response)
                    }
                });
                Ok(join_all(calls).await.into_iter().collect())
            }
        }
    }

    async fn broadcast_rpc_command(
        &self,
        command: RehashCommand,
        sync: bool,
        use_priority_executor: bool,
    ) -> Result<HashMap<Member, Response>> {
        let cluster = self.cluster()?;
        let targets: Vec<Member> = cluster
            .view_of(&self.local)
            .1
            .into_iter()
            .filter(|member| *member != self.local)
            .collect();
        let mode = if sync {
            ResponseMode::Synchronous
        } else {
            ResponseMode::Asynchronous
        };
        let timeout = cluster.config.distribution.rehash_rpc_timeout();
        self.invoke_remotely(&targets, command, mode, timeout, use_priority_executor)
            .await
    }

    fn members(&self) -> Vec<Member> {
        self.cluster
            .upgrade()
            .map(|cluster| cluster.view_of(&self.local).1)
            .unwrap_or_else(|| vec![self.local.clone()])
    }

    fn coordinator(&self) -> Option<Member> {
        self.members().first().cloned()
    }

    fn local_address(&self) -> Member {
        self.local.clone()
    }

    fn is_multicast_capable(&self) -> bool {
        self.cluster.upgrade().is_some_and(|cluster| cluster.multicast)
    }

    fn view_id(&self) -> u64 {
        self.cluster
            .upgrade()
            .map(|cluster| cluster.view_of(&self.local).0)
            .unwrap_or(0)
    }
}

/// Cache store kept in memory, for rehash tests that include persisted keys
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<Key, InternalCacheValue>>,
}

impl MemoryCacheStore {
    pub fn insert(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .insert(key.to_string(), InternalCacheValue::new(value));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load_all_keys(&self, exclude: &HashSet<Key>) -> Result<HashSet<Key>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| !exclude.contains(*key))
            .cloned()
            .collect())
    }

    async fn load(&self, key: &str) -> Result<Option<InternalCacheValue>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Keys whose primary owner is `member` in the node's installed topology
pub fn keys_with_primary(node: &TestNode, member: &Member, count: usize) -> Vec<String> {
    let Some(topology) = node.manager.topology() else {
        return Vec::new();
    };
    (0..10_000)
        .map(|i| format!("key-{}", i))
        .filter(|key| topology.distribution(key).primary() == Some(member))
        .take(count)
        .collect()
}
