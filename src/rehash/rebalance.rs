//! Full recompute of ownership against the current membership
//!
//! Every local entry is compared under the old and the new hash. The
//! continuity owner pushes it to owners that are new, and nodes that no longer
//! own it drop it once every push went through.

use std::collections::{HashMap, HashSet};

use super::{drain_and_replay, local_entries, push_state, RehashReport, RehashTask};
use crate::distribution::DistributionManager;
use crate::error::{DistributionError, Result};
use crate::member::Member;
use crate::store::{Key, StateMap};
use crate::topology::{topology_ids_for_view, CacheTopology};

pub(crate) async fn perform(
    manager: &DistributionManager,
    task: &RehashTask,
    report: &mut RehashReport,
) -> Result<()> {
    let ctx = manager.context();
    let local = manager.local_member().clone();
    let num_owners = manager.config().distribution.num_owners;
    let installed = manager
        .topology()
        .ok_or_else(|| DistributionError::NotJoined(local.to_string()))?;
    let old_ch = installed.topology().current_ch().clone();

    // surviving members keep their order, newcomers follow in view order
    let mut members: Vec<Member> = old_ch
        .members()
        .iter()
        .filter(|member| task.new_members.contains(member))
        .cloned()
        .collect();
    for member in &task.new_members {
        if !members.contains(member) {
            members.push(member.clone());
        }
    }
    let new_ch = manager.build_consistent_hash(&members)?;

    let (pending_id, final_id) = topology_ids_for_view(task.view_id, installed.topology_id());
    report.topology_id = final_id;

    manager.txlog().enable();
    manager.install_topology(CacheTopology::rehashing(pending_id, old_ch.clone(), new_ch.clone()));

    let mut per_target: HashMap<Member, StateMap> = HashMap::new();
    let mut no_longer_owned: Vec<Key> = Vec::new();
    for (key, value) in local_entries(manager).await {
        let old_owners = old_ch.locate(&key, num_owners);
        let new_owners = new_ch.locate(&key, num_owners);
        let old_set: HashSet<&Member> = old_owners.iter().collect();
        let new_set: HashSet<&Member> = new_owners.iter().collect();
        if old_set == new_set {
            continue;
        }

        let continuity_owner = old_owners
            .iter()
            .find(|owner| new_set.contains(owner))
            .or_else(|| old_owners.iter().find(|owner| task.new_members.contains(owner)));
        if continuity_owner == Some(&local) {
            for target in new_owners.iter().filter(|owner| !old_set.contains(owner)) {
                per_target
                    .entry(target.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
        }
        if !new_set.contains(&local) {
            no_longer_owned.push(key);
        }
    }

    push_state(manager, per_target, task.view_id, report).await;
    drain_and_replay(manager, &old_ch, &new_ch, report).await?;

    if report.failed_destinations.is_empty() {
        for key in &no_longer_owned {
            ctx.container.remove(key).await;
            if let Some(store) = &ctx.store {
                if let Err(e) = store.remove(key).await {
                    tracing::warn!("Failed to remove {} from cache store: {}", key, e);
                }
            }
        }
        ctx.metrics.record_keys_invalidated(no_longer_owned.len());
    } else {
        tracing::warn!(
            "Keeping {} entries no longer owned until pushes to {:?} succeed",
            no_longer_owned.len(),
            report.failed_destinations
        );
    }

    manager.install_topology(CacheTopology::stable(final_id, new_ch));
    Ok(())
}
