//! Push-based rehash after members left
//!
//! The survivors are respaced on the ring, so any entry whose owner set
//! changed may move, not only those a leaver owned. For each of them the first
//! surviving old owner pushes the entry to the new owners that did not hold it
//! before. The same algorithm serves both leave protocols.

use std::collections::HashMap;

use super::{drain_and_replay, local_entries, push_state, RehashReport, RehashTask};
use crate::distribution::DistributionManager;
use crate::error::{DistributionError, Result};
use crate::member::Member;
use crate::store::StateMap;
use crate::topology::{topology_ids_for_view, CacheTopology};

pub(crate) async fn perform(
    manager: &DistributionManager,
    task: &RehashTask,
    report: &mut RehashReport,
) -> Result<()> {
    let local = manager.local_member().clone();
    let num_owners = manager.config().distribution.num_owners;
    let installed = manager
        .topology()
        .ok_or_else(|| DistributionError::NotJoined(local.to_string()))?;
    let old_ch = installed.topology().current_ch().clone();

    // leavers an earlier task already handled are no longer in the hash
    let leavers: Vec<Member> = task
        .leavers
        .iter()
        .filter(|leaver| old_ch.contains_member(leaver) && manager.is_pending_leaver(leaver))
        .cloned()
        .collect();
    let survivors: Vec<Member> = old_ch
        .members()
        .iter()
        .filter(|member| !task.leavers.contains(member))
        .cloned()
        .collect();
    let new_ch = manager.build_consistent_hash(&survivors)?;

    let (pending_id, final_id) = topology_ids_for_view(task.view_id, installed.topology_id());
    report.topology_id = final_id;
    tracing::info!(
        "{} handling departure of {:?} for view {}",
        local,
        leavers.iter().map(Member::address).collect::<Vec<_>>(),
        task.view_id
    );

    manager.txlog().enable();
    manager.install_topology(CacheTopology::rehashing(pending_id, old_ch.clone(), new_ch.clone()));

    let mut per_target: HashMap<Member, StateMap> = HashMap::new();
    let mut orphaned = 0usize;
    if !leavers.is_empty() {
        for (key, value) in local_entries(manager).await {
            let old_owners = old_ch.locate(&key, num_owners);
            let new_owners = new_ch.locate(&key, num_owners);
            if new_owners.iter().all(|owner| old_owners.contains(owner)) {
                continue;
            }
            match old_owners.iter().find(|owner| new_ch.contains_member(owner)) {
                Some(pusher) if *pusher == local => {}
                Some(_) => continue,
                None => {
                    orphaned += 1;
                    continue;
                }
            }
            for target in new_owners.into_iter().filter(|owner| !old_owners.contains(owner)) {
                per_target.entry(target).or_default().insert(key.clone(), value.clone());
            }
        }
    }
    if orphaned > 0 {
        tracing::warn!("{} local entries had only departed owners", orphaned);
    }

    push_state(manager, per_target, task.view_id, report).await;
    drain_and_replay(manager, &old_ch, &new_ch, report).await?;

    manager.install_topology(CacheTopology::stable(final_id, new_ch));
    manager.remove_pending_leavers(&leavers);
    Ok(())
}
