//! Pull-based rehash: a node joining the cluster, or a partition merging back
//!
//! The joining side installs a union topology so writes reach it while it
//! pulls the segments it will own from their old owners. Writes that arrive
//! meanwhile are held in the transaction log and replayed after the pull.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use super::{drain_and_replay, invoke_with_retry, RehashKind, RehashReport, RehashTask, RPC_ATTEMPTS};
use crate::ch::ConsistentHashRef;
use crate::distribution::DistributionManager;
use crate::error::{DistributionError, Result};
use crate::log::log_state_transfer;
use crate::member::Member;
use crate::rpc::{RehashCommand, Response};
use crate::topology::{topology_ids_for_view, CacheTopology};

pub(crate) async fn perform_join(
    manager: &DistributionManager,
    task: &RehashTask,
    report: &mut RehashReport,
) -> Result<()> {
    let base = task.base_topology.as_ref().ok_or_else(|| {
        DistributionError::StateTransfer("join started without the coordinator's topology".to_string())
    })?;
    let local = manager.local_member().clone();

    let old_ch = base.current_ch().clone();
    let mut members = old_ch.members().to_vec();
    if !members.contains(&local) {
        members.push(local.clone());
    }
    let new_ch = manager.build_consistent_hash(&members)?;
    let (pending_id, final_id) = topology_ids_for_view(task.view_id, base.topology_id());
    report.topology_id = final_id;

    // enabled before anyone routes writes here
    manager.txlog().enable();
    let union = CacheTopology::rehashing(pending_id, old_ch.clone(), new_ch.clone());
    manager.install_topology(union.clone());

    let others: Vec<Member> = old_ch
        .members()
        .iter()
        .filter(|member| **member != local)
        .cloned()
        .collect();

    let transfer = async {
        broadcast_topology(manager, &others, task.view_id, union).await?;
        pull_state(manager, &old_ch, &new_ch, task.view_id, report).await?;
        drain_and_replay(manager, &old_ch, &new_ch, report).await
    }
    .await;

    match transfer {
        Ok(()) => {
            let final_topology = CacheTopology::stable(final_id, new_ch);
            manager.install_topology(final_topology.clone());
            if let Err(e) = broadcast_topology(manager, &others, task.view_id, final_topology).await {
                tracing::error!("Final topology {} did not reach every member: {}", final_id, e);
            }
            manager.complete_rehash(task.view_id, final_id).await;
            Ok(())
        }
        Err(e) => {
            tracing::error!("Join of {} failed, restoring the previous consistent hash: {}", local, e);
            let restored = CacheTopology::stable(final_id, old_ch);
            manager.install_topology(restored.clone());
            if let Err(restore_err) = broadcast_topology(manager, &others, task.view_id, restored).await {
                tracing::warn!("Could not restore topology on every member: {}", restore_err);
            }
            Err(e)
        }
    }
}

/// Merge of two partitions. The old hash is the one of the partition the
/// local node was not part of; there is no join permission and no broadcast.
pub(crate) async fn perform_merge(
    manager: &DistributionManager,
    task: &RehashTask,
    report: &mut RehashReport,
) -> Result<()> {
    let local = manager.local_member().clone();
    let installed = manager
        .topology()
        .ok_or_else(|| DistributionError::NotJoined(local.to_string()))?;
    let current_ch = installed.topology().current_ch().clone();

    let mut others: Vec<Member> = Vec::new();
    for group in task.merge_subgroups.iter().filter(|group| !group.contains(&local)) {
        for member in group {
            if !others.contains(member) {
                others.push(member.clone());
            }
        }
    }

    let new_ch = manager.build_consistent_hash(&task.new_members)?;
    let (pending_id, final_id) = topology_ids_for_view(task.view_id, 0);
    report.topology_id = final_id;

    if others.is_empty() {
        tracing::warn!("Merge view {} has no other partition, installing it directly", task.view_id);
        manager.install_topology(CacheTopology::stable(final_id, new_ch));
        return Ok(());
    }
    let old_ch = manager.build_consistent_hash(&others)?;
    tracing::info!(
        "Merging view {}: pulling from partition {:?}",
        task.view_id,
        others.iter().map(Member::address).collect::<Vec<_>>()
    );

    manager.txlog().enable();
    manager.install_topology(CacheTopology::rehashing(pending_id, current_ch.clone(), new_ch.clone()));

    // the merged ring is respaced, so segments also move inside this partition
    pull_state(manager, &old_ch, &new_ch, task.view_id, report).await?;
    pull_state(manager, &current_ch, &new_ch, task.view_id, report).await?;
    drain_and_replay(manager, &current_ch, &new_ch, report).await?;

    manager.install_topology(CacheTopology::stable(final_id, new_ch));
    Ok(())
}

/// Pull the segments an existing member gains when a joiner installs its
/// transitional topology here. Returns the number of keys received.
pub(crate) async fn pull_gained_segments(
    manager: &DistributionManager,
    old_ch: &ConsistentHashRef,
    new_ch: &ConsistentHashRef,
    view_id: u64,
) -> Result<usize> {
    let mut report = RehashReport::new(RehashKind::Join, view_id);
    pull_state(manager, old_ch, new_ch, view_id, &mut report).await?;
    Ok(report.keys_pulled)
}

/// Install a topology on `targets`, failing if any target did not accept it
pub(crate) async fn broadcast_topology(
    manager: &DistributionManager,
    targets: &[Member],
    view_id: u64,
    topology: CacheTopology,
) -> Result<()> {
    if targets.is_empty() {
        return Ok(());
    }
    let ctx = manager.context();
    let topology_id = topology.topology_id();
    let command = RehashCommand::InstallTopology {
        sender: manager.local_member().clone(),
        view_id,
        topology,
    };
    let timeout = manager.config().distribution.rehash_rpc_timeout();
    let responses = invoke_with_retry(ctx.rpc.as_ref(), targets, command, timeout, RPC_ATTEMPTS).await;

    let failed: Vec<&Member> = targets
        .iter()
        .filter(|target| !responses.get(*target).is_some_and(Response::is_successful))
        .collect();
    match failed.first() {
        None => {
            tracing::debug!("Topology {} installed on {} member(s)", topology_id, targets.len());
            Ok(())
        }
        Some(first) => Err(DistributionError::rpc(
            first,
            format!("{} member(s) did not install topology {}", failed.len(), topology_id),
        )),
    }
}

/// Pull the segments the local node gains from their old owners.
///
/// A response is applied as a whole or not at all. Fails if some gained
/// segment could not be fetched from any of its old owners.
async fn pull_state(
    manager: &DistributionManager,
    old_ch: &ConsistentHashRef,
    new_ch: &ConsistentHashRef,
    view_id: u64,
    report: &mut RehashReport,
) -> Result<()> {
    let ctx = manager.context();
    let local = manager.local_member().clone();
    let num_owners = manager.config().distribution.num_owners;
    let timeout = manager.config().distribution.rehash_rpc_timeout();

    let mut per_owner: BTreeMap<Member, Vec<usize>> = BTreeMap::new();
    let mut gained: HashSet<usize> = HashSet::new();
    for segment in 0..new_ch.num_segments() {
        if !new_ch.locate_segment(segment, num_owners).contains(&local) {
            continue;
        }
        let old_owners = old_ch.locate_segment(segment, num_owners);
        if old_owners.contains(&local) {
            continue;
        }
        gained.insert(segment);
        for owner in old_owners {
            per_owner.entry(owner).or_default().push(segment);
        }
    }
    tracing::debug!(
        "{} pulling {} segment(s) from {} old owner(s)",
        local,
        gained.len(),
        per_owner.len()
    );

    let mut served: HashSet<usize> = HashSet::new();
    for (owner, segments) in per_owner {
        let started = Instant::now();
        let command = RehashCommand::PullState {
            requester: local.clone(),
            view_id,
            segments: segments.clone(),
        };
        let mut responses =
            invoke_with_retry(ctx.rpc.as_ref(), std::slice::from_ref(&owner), command, timeout, RPC_ATTEMPTS).await;

        match responses.remove(&owner) {
            Some(Response::State(state)) => {
                let keys = manager.apply_state(state, &owner, view_id).await?;
                log_state_transfer("pull", local.address(), owner.address(), keys, true, started.elapsed());
                report.keys_pulled += keys;
                ctx.metrics.record_keys_pulled(keys);
                served.extend(segments);
            }
            other => {
                log_state_transfer("pull", local.address(), owner.address(), 0, false, started.elapsed());
                tracing::warn!("Could not pull state from {}: {:?}", owner, other);
                report.record_failure(owner);
            }
        }
    }

    let missing = gained.difference(&served).count();
    if missing > 0 {
        return Err(DistributionError::StateTransfer(format!(
            "no old owner answered for {} segment(s)",
            missing
        )));
    }
    Ok(())
}
