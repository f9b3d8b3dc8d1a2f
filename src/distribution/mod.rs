//! Distribution manager
//!
//! Owns the installed topology of one cache, answers locality questions
//! against it and reacts to membership changes by queueing rehash tasks. Tasks
//! run one at a time on a background worker.
//!
//! Join state moves `NotJoined -> Joining -> Joined`; whether a rehash is
//! running is tracked separately.

mod context;
mod handler;

pub use context::CacheContext;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ch::{create_consistent_hash, ConsistentHashRef};
use crate::command::{GlobalTransaction, PrepareCommand, WriteCommand};
use crate::config::{CacheConfig, LeaveProtocol};
use crate::error::{DistributionError, Result};
use crate::l1::L1Manager;
use crate::member::Member;
use crate::notifier::{ListenerId, ViewChangeListener, ViewChangedEvent};
use crate::rehash::{self, RehashKind, RehashReport, RehashTask};
use crate::rpc::{RehashCommand, Response, ResponseMode};
use crate::store::{InMemoryDataContainer, Key};
use crate::topology::{topology_ids_for_view, CacheTopology, DataLocality, LocalizedCacheTopology};
use crate::triangle::TriangleOrderManager;
use crate::txlog::TransactionLogger;

const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Join progress of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    NotJoined,
    Joining,
    Joined,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    /// Joiner currently holding join permission
    join_in_progress: Option<Member>,
    /// Members that finished their part, per final topology id
    confirmations: HashMap<u64, HashSet<Member>>,
}

struct RehashWorker {
    queue: mpsc::UnboundedSender<RehashTask>,
    handle: JoinHandle<()>,
}

pub struct DistributionManager {
    ctx: CacheContext,
    local: Member,
    txlog: TransactionLogger,
    l1: L1Manager,
    l1_container: InMemoryDataContainer,
    triangle: TriangleOrderManager,
    topology: RwLock<Option<Arc<LocalizedCacheTopology>>>,
    last_successful_ch: RwLock<Option<ConsistentHashRef>>,
    join_state: watch::Sender<JoinState>,
    completed_topology: watch::Sender<u64>,
    rehash_in_progress: AtomicBool,
    queued_tasks: AtomicUsize,
    last_view_id: AtomicU64,
    pending_leavers: Mutex<HashSet<Member>>,
    coordinator: Mutex<CoordinatorState>,
    prepared: DashMap<GlobalTransaction, PrepareCommand>,
    /// Serializes sequencing and applying of primary writes, per segment
    write_order: Vec<tokio::sync::Mutex<()>>,
    /// Backup writes waiting for an earlier sequence, per segment
    backup_writes: Vec<tokio::sync::Mutex<BTreeMap<(u64, u64), (Member, WriteCommand)>>>,
    /// Backup writes a backup did not take, resent ahead of its next write
    missed_backup_writes: Mutex<HashMap<Member, Vec<RehashCommand>>>,
    last_report: Mutex<Option<RehashReport>>,
    worker: Mutex<Option<RehashWorker>>,
    listener: Mutex<Option<ListenerId>>,
}

impl DistributionManager {
    pub fn new(ctx: CacheContext) -> Result<Arc<Self>> {
        ctx.config
            .validate()
            .map_err(|errors| DistributionError::InvalidConfiguration(errors.join("; ")))?;

        let local = ctx.rpc.local_address();
        let dist = &ctx.config.distribution;
        let l1 = L1Manager::new(
            &ctx.config.l1,
            Arc::clone(&ctx.rpc),
            Arc::clone(&ctx.metrics),
            dist.rehash_rpc_timeout(),
        );

        Ok(Arc::new(Self {
            txlog: TransactionLogger::new(dist.drain_lock_threshold),
            triangle: TriangleOrderManager::new(dist.num_segments),
            l1,
            l1_container: InMemoryDataContainer::new(),
            local,
            topology: RwLock::new(None),
            last_successful_ch: RwLock::new(None),
            join_state: watch::Sender::new(JoinState::NotJoined),
            completed_topology: watch::Sender::new(0),
            rehash_in_progress: AtomicBool::new(false),
            queued_tasks: AtomicUsize::new(0),
            last_view_id: AtomicU64::new(0),
            pending_leavers: Mutex::new(HashSet::new()),
            coordinator: Mutex::new(CoordinatorState::default()),
            prepared: DashMap::new(),
            write_order: (0..dist.num_segments).map(|_| tokio::sync::Mutex::new(())).collect(),
            backup_writes: (0..dist.num_segments)
                .map(|_| tokio::sync::Mutex::new(BTreeMap::new()))
                .collect(),
            missed_backup_writes: Mutex::new(HashMap::new()),
            last_report: Mutex::new(None),
            worker: Mutex::new(None),
            listener: Mutex::new(None),
            ctx,
        }))
    }

    /// Register for view changes, start the rehash worker and join the cluster.
    ///
    /// Returns once the node has joined, or with the join failure.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut listener = self.listener.lock();
            if listener.is_some() {
                return Ok(());
            }
            let this: Arc<dyn ViewChangeListener> = Arc::clone(self) as Arc<dyn ViewChangeListener>;
            *listener = Some(self.ctx.notifier.add_listener(this));
        }
        self.spawn_worker();

        let view_id = self.ctx.rpc.view_id();
        self.last_view_id.fetch_max(view_id, Ordering::SeqCst);
        let members = self.ctx.rpc.members();

        if members.iter().all(|member| *member == self.local) {
            let ch = self.build_consistent_hash(std::slice::from_ref(&self.local))?;
            let (_, topology_id) = topology_ids_for_view(view_id, 0);
            self.install_topology(CacheTopology::stable(topology_id, ch));
            self.complete_rehash(view_id, topology_id).await;
            self.join_state.send_replace(JoinState::Joined);
            tracing::info!("{} started as the only member of view {}", self.local, view_id);
            return Ok(());
        }

        self.join_state.send_replace(JoinState::Joining);
        match self.join_cluster(view_id).await {
            Ok(()) => {
                self.join_state.send_replace(JoinState::Joined);
                tracing::info!("{} joined the cluster in view {}", self.local, view_id);
                Ok(())
            }
            Err(e) => {
                self.join_state.send_replace(JoinState::NotJoined);
                tracing::error!("{} failed to join the cluster: {}", self.local, e);
                Err(e)
            }
        }
    }

    /// Deregister the view listener and stop the rehash worker
    pub async fn stop(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.ctx.notifier.remove_listener(id);
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            drop(worker.queue);
            let mut handle = worker.handle;
            if tokio::time::timeout(WORKER_STOP_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!("Rehash worker on {} did not stop in time, aborting it", self.local);
                handle.abort();
            }
        }

        self.join_state.send_replace(JoinState::NotJoined);
        tracing::info!("Distribution manager on {} stopped", self.local);
    }

    fn spawn_worker(self: &Arc<Self>) {
        let (queue, mut tasks) = mpsc::unbounded_channel::<RehashTask>();
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(task) = tasks.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.run_queued(task).await;
            }
        });
        *self.worker.lock() = Some(RehashWorker { queue, handle });
    }

    async fn run_queued(self: &Arc<Self>, task: RehashTask) {
        let kind = task.kind;
        let view_id = task.view_id;
        let result = rehash::run(self, task).await;
        self.queued_tasks.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(report) => self.confirm_push(view_id, report.topology_id).await,
            Err(e) => tracing::error!("{} rehash for view {} not confirmed: {}", kind, view_id, e),
        }
    }

    fn enqueue(&self, task: RehashTask) {
        let worker = self.worker.lock();
        let Some(worker) = worker.as_ref() else {
            tracing::warn!("{} not started, dropping {} rehash for view {}", self.local, task.kind, task.view_id);
            return;
        };
        self.queued_tasks.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Queueing {} rehash for view {}", task.kind, task.view_id);
        if let Err(rejected) = worker.queue.send(task) {
            self.queued_tasks.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Rehash worker stopped, dropping {} rehash", rejected.0.kind);
        }
    }

    async fn join_cluster(self: &Arc<Self>, view_id: u64) -> Result<()> {
        let topology = self.request_join_topology().await?;

        // a rebalance already placed this node in the hash
        if topology.current_ch().contains_member(&self.local) && !topology.is_rehashing() {
            let topology_id = topology.topology_id();
            tracing::info!("Topology {} already includes {}, installing it", topology_id, self.local);
            self.install_topology(topology);
            self.confirm_push(view_id, topology_id).await;
            return Ok(());
        }

        let report = rehash::run(self, RehashTask::join(view_id, topology)).await?;
        let command = RehashCommand::RehashCompleted {
            view_id,
            topology_id: report.topology_id,
        };
        for (member, response) in self.ctx.rpc.broadcast_rpc_command(command, true, true).await? {
            if !response.is_successful() {
                tracing::warn!("{} did not take the join completion: {:?}", member, response);
            }
        }
        Ok(())
    }

    /// Ask the coordinator for its topology and permission to join, retrying
    /// with jittered exponential backoff until the rehash wait time runs out
    async fn request_join_topology(&self) -> Result<CacheTopology> {
        let dist = &self.ctx.config.distribution;
        let deadline = Instant::now() + dist.rehash_wait_time();
        let mut delay = dist.join_retry_base();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let coordinator = self.ctx.rpc.coordinator();
            let reason = match &coordinator {
                None => "no coordinator in view".to_string(),
                Some(coordinator) => {
                    let command = RehashCommand::JoinRequest {
                        joiner: self.local.clone(),
                    };
                    match self
                        .ctx
                        .rpc
                        .invoke_remotely(
                            std::slice::from_ref(coordinator),
                            command,
                            ResponseMode::Synchronous,
                            dist.rehash_rpc_timeout(),
                            true,
                        )
                        .await
                    {
                        Ok(mut responses) => match responses.remove(coordinator) {
                            Some(Response::Topology { topology, .. }) => return Ok(topology),
                            Some(Response::Unsure) => "coordinator is busy".to_string(),
                            Some(Response::Failure(reason)) => reason,
                            Some(other) => format!("unexpected response {:?}", other),
                            None => "no response".to_string(),
                        },
                        Err(e) => e.to_string(),
                    }
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(DistributionError::TopologyRetrieval {
                    coordinator: coordinator
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                    attempts,
                    reason,
                });
            }

            let wait = jittered(delay).min(deadline - now);
            tracing::debug!(
                "Join request {} from {} not granted ({}), retrying in {:?}",
                attempts,
                self.local,
                reason,
                wait
            );
            tokio::time::sleep(wait).await;
            delay = (delay * 2).min(dist.join_retry_max());
        }
    }

    /// Tell the coordinator this node finished its part of a rehash
    async fn confirm_push(self: &Arc<Self>, view_id: u64, topology_id: u64) {
        match self.ctx.rpc.coordinator() {
            Some(coordinator) if coordinator == self.local => {
                self.on_push_completed(self.local.clone(), view_id, topology_id);
            }
            Some(coordinator) => {
                let command = RehashCommand::NodePushCompleted {
                    node: self.local.clone(),
                    view_id,
                    topology_id,
                };
                let responses = rehash::invoke_with_retry(
                    self.ctx.rpc.as_ref(),
                    std::slice::from_ref(&coordinator),
                    command,
                    self.ctx.config.distribution.rehash_rpc_timeout(),
                    rehash::RPC_ATTEMPTS,
                )
                .await;
                if !responses.get(&coordinator).is_some_and(Response::is_successful) {
                    tracing::error!("Coordinator {} did not take the push confirmation for topology {}", coordinator, topology_id);
                }
            }
            None => tracing::warn!("No coordinator to confirm topology {} to", topology_id),
        }
    }

    /// Coordinator side of push confirmations. Once every member of the
    /// current view confirmed, the completion is broadcast.
    fn on_push_completed(self: &Arc<Self>, node: Member, view_id: u64, topology_id: u64) -> Response {
        if !self.ctx.rpc.is_coordinator() {
            return Response::Failure(format!("{} is not the coordinator", self.local));
        }
        let members = self.ctx.rpc.members();
        let complete = {
            let mut coordinator = self.coordinator.lock();
            let confirmed = coordinator.confirmations.entry(topology_id).or_default();
            confirmed.insert(node.clone());
            let complete = members.iter().all(|member| confirmed.contains(member));
            if complete {
                coordinator.confirmations.retain(|id, _| *id > topology_id);
            }
            complete
        };
        tracing::debug!("{} confirmed topology {}", node, topology_id);

        if complete {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.broadcast_rehash_completed(view_id, topology_id).await;
            });
        }
        Response::Success
    }

    async fn broadcast_rehash_completed(&self, view_id: u64, topology_id: u64) {
        tracing::info!("All members confirmed topology {}, rehash for view {} complete", topology_id, view_id);
        let command = RehashCommand::RehashCompleted { view_id, topology_id };
        match self.ctx.rpc.broadcast_rpc_command(command, true, true).await {
            Ok(responses) => {
                for (member, response) in responses {
                    if !response.is_successful() {
                        tracing::warn!("{} did not take the rehash completion: {:?}", member, response);
                    }
                }
            }
            Err(e) => tracing::error!("Failed to broadcast rehash completion: {}", e),
        }
        self.complete_rehash(view_id, topology_id).await;
    }

    /// Finish a rehash locally: remember the hash, drop entries this node no
    /// longer owns and wake waiters
    pub(crate) async fn complete_rehash(&self, view_id: u64, topology_id: u64) {
        match self.topology() {
            Some(topology) if topology.topology_id() == topology_id && !topology.topology().is_rehashing() => {
                *self.last_successful_ch.write() = Some(topology.topology().current_ch().clone());
                self.invalidate_non_owned(&topology).await;
            }
            Some(topology) => tracing::debug!(
                "Installed topology {} is not {}, skipping invalidation",
                topology.topology_id(),
                topology_id
            ),
            None => {}
        }
        self.completed_topology.send_if_modified(|completed| {
            if topology_id > *completed {
                *completed = topology_id;
                true
            } else {
                false
            }
        });
        tracing::debug!("{} completed rehash to topology {} (view {})", self.local, topology_id, view_id);
    }

    async fn invalidate_non_owned(&self, topology: &LocalizedCacheTopology) {
        let mut removed = 0usize;
        for key in self.ctx.container.keys().await {
            if !topology.distribution(&key).is_write_owner() {
                self.ctx.container.remove(&key).await;
                removed += 1;
            }
        }
        if let Some(store) = &self.ctx.store {
            match store.load_all_keys(&HashSet::new()).await {
                Ok(keys) => {
                    for key in keys.iter().filter(|key| !topology.distribution(key).is_write_owner()) {
                        if let Err(e) = store.remove(key).await {
                            tracing::warn!("Failed to invalidate {} in cache store: {}", key, e);
                        }
                    }
                }
                Err(e) => tracing::warn!("Failed to list cache store keys for invalidation: {}", e),
            }
        }
        if removed > 0 {
            tracing::debug!("{} invalidated {} entries it no longer owns", self.local, removed);
        }
        self.ctx.metrics.record_keys_invalidated(removed);
    }

    /// Install a topology unless a newer one is already installed
    pub(crate) fn install_topology(&self, topology: CacheTopology) -> bool {
        let topology_id = topology.topology_id();
        let mut installed = self.topology.write();
        if let Some(current) = installed.as_ref() {
            if topology_id < current.topology_id() {
                tracing::debug!(
                    "Ignoring topology {}, {} is already installed",
                    topology_id,
                    current.topology_id()
                );
                return false;
            }
        }
        let rehashing = topology.is_rehashing();
        let localized = LocalizedCacheTopology::new(
            topology,
            self.local.clone(),
            self.ctx.config.distribution.num_owners,
        );
        self.triangle.update_topology(topology_id);
        *installed = Some(Arc::new(localized));
        tracing::info!(
            "{} installed topology {}{}",
            self.local,
            topology_id,
            if rehashing { " (rehashing)" } else { "" }
        );
        true
    }

    pub(crate) fn build_consistent_hash(&self, members: &[Member]) -> Result<ConsistentHashRef> {
        let dist = &self.ctx.config.distribution;
        create_consistent_hash(dist.consistent_hash, members, dist.num_segments)
    }

    pub(crate) fn begin_rehash(&self) -> Result<()> {
        if self.rehash_in_progress.swap(true, Ordering::SeqCst) {
            return Err(DistributionError::RehashInProgress {
                node: self.local.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn finish_rehash(&self) {
        self.rehash_in_progress.store(false, Ordering::SeqCst);
    }

    pub(crate) fn record_report(&self, report: RehashReport) {
        *self.last_report.lock() = Some(report);
    }

    pub(crate) fn is_pending_leaver(&self, member: &Member) -> bool {
        self.pending_leavers.lock().contains(member)
    }

    pub(crate) fn remove_pending_leavers(&self, leavers: &[Member]) {
        let mut pending = self.pending_leavers.lock();
        for leaver in leavers {
            pending.remove(leaver);
        }
    }

    /// Queue a rebalance against the current membership on this node.
    ///
    /// Returns the id of the topology the rebalance will install, unless
    /// another rehash is queued ahead of it.
    pub fn rebalance(&self) -> Result<u64> {
        let installed = self.topology().ok_or_else(|| self.not_joined())?;
        let view_id = self.ctx.rpc.view_id();
        let (_, final_id) = topology_ids_for_view(view_id, installed.topology_id());
        self.enqueue(RehashTask::rebalance(view_id, self.ctx.rpc.members()));
        Ok(final_id)
    }

    /// Queue a rebalance here and ask every other member to do the same
    pub async fn request_cluster_rebalance(&self) -> Result<u64> {
        let final_id = self.rebalance()?;
        let command = RehashCommand::StartRebalance {
            sender: self.local.clone(),
        };
        for (member, response) in self.ctx.rpc.broadcast_rpc_command(command, true, true).await? {
            if !response.is_successful() {
                tracing::warn!("{} did not start the rebalance: {:?}", member, response);
            }
        }
        Ok(final_id)
    }

    /// Wait until the rehash moving to `view_id` completed cluster-wide
    pub async fn wait_for_rehash_to_complete(&self, view_id: u64) -> Result<()> {
        let (_, topology_id) = topology_ids_for_view(view_id, 0);
        self.wait_for_topology(topology_id).await
    }

    /// Wait until a rehash that installs `topology_id` or later completed
    pub async fn wait_for_topology(&self, topology_id: u64) -> Result<()> {
        let mut completed = self.completed_topology.subscribe();
        let timeout = self.ctx.config.distribution.rehash_rpc_timeout();
        let outcome = tokio::time::timeout(timeout, completed.wait_for(|id| *id >= topology_id))
            .await
            .map(|reached| reached.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DistributionError::Stopped),
            Err(_) => Err(DistributionError::timeout(
                format!("rehash to topology {}", topology_id),
                timeout.as_millis() as u64,
            )),
        }
    }

    fn not_joined(&self) -> DistributionError {
        DistributionError::NotJoined(self.local.to_string())
    }

    pub fn local_member(&self) -> &Member {
        &self.local
    }

    pub fn context(&self) -> &CacheContext {
        &self.ctx
    }

    pub fn config(&self) -> &CacheConfig {
        &self.ctx.config
    }

    pub fn txlog(&self) -> &TransactionLogger {
        &self.txlog
    }

    pub fn l1(&self) -> &L1Manager {
        &self.l1
    }

    pub fn triangle(&self) -> &TriangleOrderManager {
        &self.triangle
    }

    pub fn join_state(&self) -> JoinState {
        *self.join_state.borrow()
    }

    pub fn is_joined(&self) -> bool {
        self.join_state() == JoinState::Joined
    }

    pub fn is_rehash_in_progress(&self) -> bool {
        self.rehash_in_progress.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<RehashReport> {
        self.last_report.lock().clone()
    }

    /// The installed topology, resolved for this node
    pub fn topology(&self) -> Option<Arc<LocalizedCacheTopology>> {
        self.topology.read().clone()
    }

    /// The hash reads are served from
    pub fn consistent_hash(&self) -> Option<ConsistentHashRef> {
        self.topology().map(|t| t.topology().current_ch().clone())
    }

    /// The hash installed by the last rehash that completed cluster-wide
    pub fn last_successful_consistent_hash(&self) -> Option<ConsistentHashRef> {
        self.last_successful_ch.read().clone()
    }

    pub fn locate(&self, key: &str) -> Vec<Member> {
        let num_owners = self.ctx.config.distribution.num_owners;
        self.consistent_hash()
            .map(|ch| ch.locate(key, num_owners))
            .unwrap_or_default()
    }

    pub fn locate_all(&self, keys: &[Key]) -> HashMap<Key, Vec<Member>> {
        let num_owners = self.ctx.config.distribution.num_owners;
        self.consistent_hash()
            .map(|ch| ch.locate_all(keys, num_owners))
            .unwrap_or_default()
    }

    pub fn locality(&self, key: &str) -> DataLocality {
        self.topology()
            .map(|t| t.locality(key))
            .unwrap_or(DataLocality::NotLocalUncertain)
    }

    pub fn is_local(&self, key: &str) -> bool {
        self.locality(key).is_local()
    }

    /// Whether a running rehash changes the owners of `key`
    pub fn is_affected_by_rehash(&self, key: &str) -> bool {
        let Some(topology) = self.topology() else {
            return false;
        };
        let num_owners = self.ctx.config.distribution.num_owners;
        match topology.topology().pending_ch() {
            Some(pending) => {
                let current: HashSet<Member> = topology.topology().current_ch().locate(key, num_owners).into_iter().collect();
                let target: HashSet<Member> = pending.locate(key, num_owners).into_iter().collect();
                current != target
            }
            None => false,
        }
    }

    /// Conservative ownership check against the write hash, which is the
    /// union of old and new while rehashing
    pub fn is_key_local_to_address(&self, member: &Member, key: &str) -> bool {
        let num_owners = self.ctx.config.distribution.num_owners;
        self.topology()
            .is_some_and(|t| t.topology().write_ch().is_key_local_to_address(member, key, num_owners))
    }

    /// Every member that owns at least one of `keys`
    pub fn affected_nodes(&self, keys: &[Key]) -> HashSet<Member> {
        let Some(topology) = self.topology() else {
            return HashSet::new();
        };
        let num_owners = self.ctx.config.distribution.num_owners;
        keys.iter()
            .flat_map(|key| topology.topology().write_ch().locate(key, num_owners))
            .collect()
    }

    /// Register a prepared transaction
    pub async fn prepare(&self, prepare: PrepareCommand) {
        if self.txlog.log_prepare_if_needed(&prepare).await {
            tracing::trace!("Logged prepare of {} during rehash", prepare.gtx);
        }
        self.prepared.insert(prepare.gtx.clone(), prepare);
    }

    /// Commit a prepared transaction. Returns `false` for an unknown transaction.
    pub async fn commit(&self, gtx: &GlobalTransaction) -> Result<bool> {
        let Some((_, prepare)) = self.prepared.remove(gtx) else {
            return Ok(false);
        };
        if self
            .txlog
            .log_commit_if_needed(gtx, prepare.modifications.clone())
            .await
        {
            self.ctx.metrics.record_command_logged();
            return Ok(true);
        }
        for modification in prepare.modifications {
            self.handle_write(modification).await?;
        }
        Ok(true)
    }

    pub async fn rollback(&self, gtx: &GlobalTransaction) -> bool {
        self.txlog.log_rollback_if_needed(gtx).await;
        self.prepared.remove(gtx).is_some()
    }

    pub fn prepared_transactions(&self) -> Vec<GlobalTransaction> {
        self.prepared.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl ViewChangeListener for DistributionManager {
    async fn on_view_changed(&self, event: &ViewChangedEvent) {
        self.last_view_id.fetch_max(event.view_id, Ordering::SeqCst);
        let joiners = event.joiners();
        let leavers = event.leavers();

        {
            let mut coordinator = self.coordinator.lock();
            if coordinator
                .join_in_progress
                .as_ref()
                .is_some_and(|joiner| leavers.contains(joiner))
            {
                coordinator.join_in_progress = None;
            }
        }

        let kind = if event.is_merge() {
            RehashKind::Merge
        } else if !event.old_members.contains(&self.local) {
            tracing::debug!("{} is new in view {}, its own start handles the join", self.local, event.view_id);
            return;
        } else if leavers.is_empty() {
            if !joiners.is_empty() {
                tracing::debug!("View {} only adds members, waiting for them to install a topology", event.view_id);
            }
            return;
        } else if joiners.is_empty() {
            match self.ctx.config.distribution.leave_protocol {
                LeaveProtocol::Push => RehashKind::Leave,
                LeaveProtocol::Inverted => RehashKind::InvertedLeave,
            }
        } else {
            RehashKind::Rebalance
        };

        if !self.ctx.config.distribution.rehash_enabled {
            tracing::warn!("Rehashing disabled, installing view {} without moving state", event.view_id);
            match self.build_consistent_hash(&event.new_members) {
                Ok(ch) => {
                    let installed_id = self.topology().map(|t| t.topology_id()).unwrap_or(0);
                    let (_, topology_id) = topology_ids_for_view(event.view_id, installed_id);
                    self.install_topology(CacheTopology::stable(topology_id, ch));
                }
                Err(e) => tracing::error!("Cannot build consistent hash for view {}: {}", event.view_id, e),
            }
            return;
        }

        if matches!(kind, RehashKind::Leave | RehashKind::InvertedLeave | RehashKind::Rebalance) {
            self.pending_leavers.lock().extend(leavers.iter().cloned());
        }
        self.enqueue(RehashTask::from_event(kind, event));
    }
}

fn jittered(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis < 2 {
        return delay;
    }
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_millis(100));
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
        assert_eq!(jittered(Duration::from_millis(1)), Duration::from_millis(1));
    }
}
