//! Rehash tasks
//!
//! Every membership change that moves data runs as one [`RehashTask`]. The
//! task kinds share a single skeleton in [`run`]: it marks the rehash as in
//! progress, runs the kind's strategy and always releases the transaction
//! logger and the in-progress flag on the way out, whatever the outcome.
//!
//! Joins and merges pull state from the old owners ([`join`]). Leaves and
//! rebalances push it from the surviving owners ([`leave`], [`rebalance`]).

pub mod join;
pub mod leave;
pub mod rebalance;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::ch::ConsistentHashRef;
use crate::command::{PrepareCommand, WriteCommand};
use crate::distribution::DistributionManager;
use crate::error::Result;
use crate::log::{log_rehash_operation, log_state_transfer};
use crate::member::Member;
use crate::notifier::ViewChangedEvent;
use crate::rpc::{RehashCommand, Response, ResponseMode, RpcManager};
use crate::store::{InternalCacheValue, Key, StateMap};
use crate::topology::CacheTopology;

/// Attempts made by [`invoke_with_retry`] before a target is given up
pub(crate) const RPC_ATTEMPTS: u32 = 3;

const RPC_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Which protocol a rehash runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RehashKind {
    Join,
    Leave,
    Rebalance,
    Merge,
    InvertedLeave,
}

impl RehashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RehashKind::Join => "join",
            RehashKind::Leave => "leave",
            RehashKind::Rebalance => "rebalance",
            RehashKind::Merge => "merge",
            RehashKind::InvertedLeave => "inverted_leave",
        }
    }
}

impl fmt::Display for RehashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one rehash on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehashReport {
    pub kind: RehashKind,
    pub view_id: u64,
    /// Id of the final topology the rehash installed
    pub topology_id: u64,
    pub keys_pushed: usize,
    pub keys_pulled: usize,
    pub commands_replayed: usize,
    /// Destinations whose state transfer failed; their data was not migrated
    pub failed_destinations: Vec<Member>,
    pub duration: Duration,
    pub success: bool,
}

impl RehashReport {
    fn new(kind: RehashKind, view_id: u64) -> Self {
        Self {
            kind,
            view_id,
            topology_id: 0,
            keys_pushed: 0,
            keys_pulled: 0,
            commands_replayed: 0,
            failed_destinations: Vec::new(),
            duration: Duration::ZERO,
            success: false,
        }
    }

    pub(crate) fn record_failure(&mut self, member: Member) {
        if !self.failed_destinations.contains(&member) {
            self.failed_destinations.push(member);
        }
    }
}

/// Input of a rehash
#[derive(Debug, Clone)]
pub struct RehashTask {
    pub kind: RehashKind,
    pub view_id: u64,
    /// Members of the view the rehash moves to
    pub new_members: Vec<Member>,
    pub leavers: Vec<Member>,
    pub merge_subgroups: Vec<Vec<Member>>,
    /// Topology handed out by the coordinator, joins only
    pub base_topology: Option<CacheTopology>,
}

impl RehashTask {
    pub fn join(view_id: u64, base_topology: CacheTopology) -> Self {
        Self {
            kind: RehashKind::Join,
            view_id,
            new_members: Vec::new(),
            leavers: Vec::new(),
            merge_subgroups: Vec::new(),
            base_topology: Some(base_topology),
        }
    }

    pub fn from_event(kind: RehashKind, event: &ViewChangedEvent) -> Self {
        Self {
            kind,
            view_id: event.view_id,
            new_members: event.new_members.clone(),
            leavers: event.leavers(),
            merge_subgroups: event.merge_subgroups.clone(),
            base_topology: None,
        }
    }

    pub fn rebalance(view_id: u64, members: Vec<Member>) -> Self {
        Self {
            kind: RehashKind::Rebalance,
            view_id,
            new_members: members,
            leavers: Vec::new(),
            merge_subgroups: Vec::new(),
            base_topology: None,
        }
    }
}

/// Releases the transaction logger and the in-progress flag on every exit path
struct RehashGuard<'a> {
    manager: &'a DistributionManager,
}

impl Drop for RehashGuard<'_> {
    fn drop(&mut self) {
        self.manager.txlog().unlock_and_disable();
        self.manager.finish_rehash();
    }
}

/// Run a rehash task on the local node
pub async fn run(manager: &Arc<DistributionManager>, task: RehashTask) -> Result<RehashReport> {
    manager.begin_rehash()?;
    let _guard = RehashGuard { manager: manager.as_ref() };

    let metrics = Arc::clone(&manager.context().metrics);
    let local = manager.local_member().clone();
    metrics.record_rehash_started(task.kind);
    tracing::info!(
        "{} starting {} rehash for view {}",
        local,
        task.kind,
        task.view_id
    );

    let started = Instant::now();
    let mut report = RehashReport::new(task.kind, task.view_id);
    let result = match task.kind {
        RehashKind::Join => join::perform_join(manager, &task, &mut report).await,
        RehashKind::Merge => join::perform_merge(manager, &task, &mut report).await,
        RehashKind::Leave | RehashKind::InvertedLeave => leave::perform(manager, &task, &mut report).await,
        RehashKind::Rebalance => rebalance::perform(manager, &task, &mut report).await,
    };

    report.duration = started.elapsed();
    report.success = result.is_ok();
    metrics.record_rehash_finished(task.kind, report.success, report.duration);
    log_rehash_operation(
        task.kind.as_str(),
        local.address(),
        report.success,
        report.duration,
        Some(vec![
            ("view_id", task.view_id.to_string()),
            ("topology_id", report.topology_id.to_string()),
            ("keys_pushed", report.keys_pushed.to_string()),
            ("keys_pulled", report.keys_pulled.to_string()),
            ("failed_destinations", report.failed_destinations.len().to_string()),
        ]),
    );
    manager.record_report(report.clone());

    match result {
        Ok(()) => Ok(report),
        Err(e) => {
            tracing::error!("{} rehash for view {} failed on {}: {}", task.kind, task.view_id, local, e);
            Err(e)
        }
    }
}

/// Invoke a command synchronously, retrying targets that did not answer
/// successfully. The last response of every target is returned.
pub(crate) async fn invoke_with_retry(
    rpc: &dyn RpcManager,
    targets: &[Member],
    command: RehashCommand,
    timeout: Duration,
    attempts: u32,
) -> HashMap<Member, Response> {
    let attempts = attempts.max(1);
    let mut responses = HashMap::new();
    let mut remaining: Vec<Member> = targets.to_vec();

    for attempt in 1..=attempts {
        if remaining.is_empty() {
            break;
        }

        let mut received = match rpc
            .invoke_remotely(&remaining, command.clone(), ResponseMode::Synchronous, timeout, true)
            .await
        {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(
                    "Attempt {}/{} of {} failed: {}",
                    attempt,
                    attempts,
                    command.name(),
                    e
                );
                remaining
                    .iter()
                    .map(|target| (target.clone(), Response::Failure(e.to_string())))
                    .collect()
            }
        };

        let mut retry = Vec::new();
        for target in remaining.drain(..) {
            let response = received
                .remove(&target)
                .unwrap_or_else(|| Response::Failure("no response".to_string()));
            if !response.is_successful() {
                tracing::debug!(
                    "{} to {} not successful on attempt {}: {:?}",
                    command.name(),
                    target,
                    attempt,
                    response
                );
                retry.push(target.clone());
            }
            responses.insert(target, response);
        }
        remaining = retry;

        if !remaining.is_empty() && attempt < attempts {
            tokio::time::sleep(RPC_RETRY_DELAY * attempt).await;
        }
    }

    responses
}

/// Every local entry: the in-memory ones, then cache store keys not already seen.
/// Store failures are logged and the key is skipped.
pub(crate) async fn local_entries(manager: &DistributionManager) -> Vec<(Key, InternalCacheValue)> {
    let ctx = manager.context();
    let mut entries = ctx.container.entries().await;

    if let Some(store) = &ctx.store {
        let seen: HashSet<Key> = entries.iter().map(|(key, _)| key.clone()).collect();
        match store.load_all_keys(&seen).await {
            Ok(keys) => {
                for key in keys {
                    match store.load(&key).await {
                        Ok(Some(value)) => entries.push((key, value)),
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Skipping key {} during rehash scan: {}", key, e),
                    }
                }
            }
            Err(e) => tracing::error!("Failed to load keys from cache store: {}", e),
        }
    }

    entries
}

/// Push state maps to their destinations concurrently.
///
/// Each push is bounded by the rehash RPC timeout. A failed or timed out push
/// is logged and recorded in the report; the other pushes still complete.
pub(crate) async fn push_state(
    manager: &DistributionManager,
    per_target: HashMap<Member, StateMap>,
    view_id: u64,
    report: &mut RehashReport,
) {
    let rpc = Arc::clone(&manager.context().rpc);
    let metrics = Arc::clone(&manager.context().metrics);
    let timeout = manager.config().distribution.rehash_rpc_timeout();
    let local = manager.local_member().clone();

    let mut pushes = JoinSet::new();
    for (target, state) in per_target {
        if state.is_empty() {
            continue;
        }
        let rpc = Arc::clone(&rpc);
        let sender = local.clone();
        pushes.spawn(async move {
            let keys = state.len();
            let started = Instant::now();
            let command = RehashCommand::PushState { sender, view_id, state };
            let invocation = rpc.invoke_remotely(
                std::slice::from_ref(&target),
                command,
                ResponseMode::Synchronous,
                timeout,
                true,
            );
            let outcome = match tokio::time::timeout(timeout, invocation).await {
                Ok(Ok(mut responses)) => match responses.remove(&target) {
                    Some(response) if response.is_successful() => Ok(()),
                    Some(Response::Failure(reason)) => Err(reason),
                    Some(other) => Err(format!("unexpected response {:?}", other)),
                    None => Err("no response".to_string()),
                },
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            };
            (target, keys, started.elapsed(), outcome)
        });
    }

    while let Some(joined) = pushes.join_next().await {
        match joined {
            Ok((target, keys, elapsed, Ok(()))) => {
                log_state_transfer("push", local.address(), target.address(), keys, true, elapsed);
                report.keys_pushed += keys;
                metrics.record_keys_pushed(keys);
            }
            Ok((target, keys, elapsed, Err(reason))) => {
                log_state_transfer("push", local.address(), target.address(), keys, false, elapsed);
                tracing::error!("Failed to push {} key(s) to {}: {}", keys, target, reason);
                report.record_failure(target);
            }
            Err(e) => tracing::error!("State push task failed: {}", e),
        }
    }
}

/// Drain the transaction log and replay it against the new owners.
///
/// Drains without the lock while the backlog is large, then once under the
/// lock. The lock stays held until the task's guard releases it.
pub(crate) async fn drain_and_replay(
    manager: &DistributionManager,
    old_ch: &ConsistentHashRef,
    new_ch: &ConsistentHashRef,
    report: &mut RehashReport,
) -> Result<()> {
    let txlog = manager.txlog();

    while txlog.should_drain_without_lock() {
        let batch = txlog.drain();
        tracing::debug!("Replaying {} logged command(s) without lock", batch.len());
        replay(manager, batch, old_ch, new_ch, report).await;
    }

    let locked = txlog.drain_and_lock().await;
    tracing::debug!(
        "Replaying {} logged command(s) and {} prepared transaction(s) under lock",
        locked.commands.len(),
        locked.pending_prepares.len()
    );
    replay(manager, locked.commands, old_ch, new_ch, report).await;
    forward_prepares(manager, locked.pending_prepares, new_ch, report).await;
    Ok(())
}

/// Apply logged writes locally where this node owns the key in either hash,
/// and forward them to the key's other new owners
async fn replay(
    manager: &DistributionManager,
    commands: Vec<WriteCommand>,
    old_ch: &ConsistentHashRef,
    new_ch: &ConsistentHashRef,
    report: &mut RehashReport,
) {
    if commands.is_empty() {
        return;
    }
    let ctx = manager.context();
    let local = manager.local_member().clone();
    let num_owners = manager.config().distribution.num_owners;
    let mut forwards: HashMap<Member, Vec<WriteCommand>> = HashMap::new();

    for command in commands {
        report.commands_replayed += 1;

        if command == WriteCommand::Clear {
            if let Err(e) = command.apply_to(ctx.container.as_ref()).await {
                tracing::error!("Failed to replay clear: {}", e);
            }
            for member in new_ch.members().iter().filter(|m| **m != local) {
                forwards.entry(member.clone()).or_default().push(WriteCommand::Clear);
            }
            continue;
        }

        for single in command.split_per_key() {
            let Some(key) = single.affected_keys().first().map(|key| (*key).clone()) else {
                continue;
            };
            let new_owners = new_ch.locate(&key, num_owners);
            if new_owners.contains(&local) || old_ch.is_key_local_to_address(&local, &key, num_owners) {
                if let Err(e) = single.apply_to(ctx.container.as_ref()).await {
                    tracing::error!("Failed to replay logged write of {}: {}", key, e);
                }
            }
            for owner in new_owners.into_iter().filter(|m| *m != local) {
                forwards.entry(owner).or_default().push(single.clone());
            }
        }
    }

    let timeout = manager.config().distribution.rehash_rpc_timeout();
    for (target, commands) in forwards {
        let count = commands.len();
        let command = RehashCommand::ApplyTxLog {
            sender: local.clone(),
            commands,
        };
        let responses = invoke_with_retry(ctx.rpc.as_ref(), std::slice::from_ref(&target), command, timeout, RPC_ATTEMPTS).await;
        if !responses.get(&target).is_some_and(Response::is_successful) {
            tracing::error!("Failed to forward {} logged write(s) to {}", count, target);
            report.record_failure(target);
        }
    }
}

/// Hand prepared, uncommitted transactions to the new owners of their keys
async fn forward_prepares(
    manager: &DistributionManager,
    prepares: Vec<PrepareCommand>,
    new_ch: &ConsistentHashRef,
    report: &mut RehashReport,
) {
    if prepares.is_empty() {
        return;
    }
    let ctx = manager.context();
    let local = manager.local_member().clone();
    let num_owners = manager.config().distribution.num_owners;

    let mut per_target: HashMap<Member, Vec<PrepareCommand>> = HashMap::new();
    for prepare in prepares {
        let mut targets: HashSet<Member> = HashSet::new();
        for key in prepare.affected_keys() {
            targets.extend(new_ch.locate(key, num_owners));
        }
        targets.remove(&local);
        for target in targets {
            per_target.entry(target).or_default().push(prepare.clone());
        }
    }

    let timeout = manager.config().distribution.rehash_rpc_timeout();
    for (target, prepares) in per_target {
        let count = prepares.len();
        let command = RehashCommand::ApplyPrepared {
            sender: local.clone(),
            prepares,
        };
        let responses = invoke_with_retry(ctx.rpc.as_ref(), std::slice::from_ref(&target), command, timeout, RPC_ATTEMPTS).await;
        if !responses.get(&target).is_some_and(Response::is_successful) {
            tracing::error!("Failed to hand {} prepared transaction(s) to {}", count, target);
            report.record_failure(target);
        }
    }
}
