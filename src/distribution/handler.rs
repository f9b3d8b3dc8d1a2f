//! Inbound command handling, the write path and remote reads

use std::collections::HashSet;
use std::sync::Arc;

use super::DistributionManager;
use crate::ch::segment_for_key;
use crate::command::{PrepareCommand, WriteCommand};
use crate::error::{DistributionError, Result};
use crate::member::Member;
use crate::rehash::{self, RPC_ATTEMPTS};
use crate::rpc::{RehashCommand, Response, ResponseMode};

/// Outcome of a write offered to the local node as primary owner
enum PrimaryWrite {
    Applied,
    /// Ownership moved to a newer topology; route the write again
    NotPrimary,
}
use crate::store::{DataContainer, InternalCacheValue, Key, StateMap};

impl DistributionManager {
    /// Entry point for every command another node sends to this one
    pub async fn handle_command(self: &Arc<Self>, command: RehashCommand) -> Response {
        tracing::trace!("{} handling {}", self.local, command.name());
        match command {
            RehashCommand::JoinRequest { joiner } => self.handle_join_request(joiner),
            RehashCommand::InstallTopology {
                sender,
                view_id,
                topology,
            } => {
                if !topology.is_rehashing() {
                    let mut coordinator = self.coordinator.lock();
                    if coordinator.join_in_progress.as_ref() == Some(&sender) {
                        coordinator.join_in_progress = None;
                    }
                }
                tracing::debug!(
                    "{} installing topology {} from {} (view {})",
                    self.local,
                    topology.topology_id(),
                    sender,
                    view_id
                );
                let gained = if topology.is_rehashing() && sender != self.local {
                    topology
                        .pending_ch()
                        .map(|pending| (topology.current_ch().clone(), pending.clone()))
                } else {
                    None
                };
                self.install_topology(topology);

                // the ring is respaced on a join, so existing members may gain segments too
                if let Some((old_ch, new_ch)) = gained {
                    if let Err(e) = rehash::join::pull_gained_segments(self, &old_ch, &new_ch, view_id).await {
                        tracing::error!("{} could not pull segments gained in view {}: {}", self.local, view_id, e);
                        return Response::Failure(e.to_string());
                    }
                }
                Response::Success
            }
            RehashCommand::PullState {
                requester,
                view_id,
                segments,
            } => {
                let state = self.state_for_segments(&segments).await;
                tracing::debug!(
                    "{} handing {} key(s) of {} segment(s) to {} for view {}",
                    self.local,
                    state.len(),
                    segments.len(),
                    requester,
                    view_id
                );
                Response::State(state)
            }
            RehashCommand::PushState {
                sender,
                view_id,
                state,
            } => match self.apply_state(state, &sender, view_id).await {
                Ok(_) => Response::Success,
                Err(e) => Response::Failure(e.to_string()),
            },
            RehashCommand::ApplyTxLog { sender, commands } => {
                match self.apply_remote_tx_log(commands).await {
                    Ok(count) => {
                        tracing::debug!("{} applied {} logged write(s) from {}", self.local, count, sender);
                        Response::Success
                    }
                    Err(e) => Response::Failure(e.to_string()),
                }
            }
            RehashCommand::ApplyPrepared { sender, prepares } => {
                tracing::debug!("{} taking {} prepared transaction(s) from {}", self.local, prepares.len(), sender);
                self.apply_prepared(prepares).await;
                Response::Success
            }
            RehashCommand::NodePushCompleted {
                node,
                view_id,
                topology_id,
            } => self.on_push_completed(node, view_id, topology_id),
            RehashCommand::RehashCompleted { view_id, topology_id } => {
                self.complete_rehash(view_id, topology_id).await;
                Response::Success
            }
            RehashCommand::StartRebalance { sender } => {
                tracing::info!("{} asked {} to rebalance", sender, self.local);
                match self.rebalance() {
                    Ok(_) => Response::Success,
                    Err(e) => Response::Failure(e.to_string()),
                }
            }
            RehashCommand::ClusteredGet { requester, key } => self.handle_clustered_get(requester, key).await,
            RehashCommand::InvalidateL1 { origin, keys } => {
                for key in &keys {
                    self.l1_container.remove(key).await;
                }
                tracing::trace!("{} dropped {} L1 entr(ies) written on {}", self.local, keys.len(), origin);
                Response::Success
            }
            RehashCommand::ForwardWrite { sender, command } => self.handle_forward_write(sender, command).await,
            RehashCommand::BackupWrite {
                sender,
                segment,
                sequence,
                topology_id,
                command,
            } => {
                self.handle_backup_write(sender, segment, sequence, topology_id, command)
                    .await
            }
        }
    }

    fn handle_join_request(&self, joiner: Member) -> Response {
        if !self.ctx.rpc.is_coordinator() {
            return Response::Failure(format!("{} is not the coordinator", self.local));
        }
        let Some(installed) = self.topology() else {
            return Response::Unsure;
        };

        let mut coordinator = self.coordinator.lock();
        let busy = self.is_rehash_in_progress()
            || self.queued_tasks.load(std::sync::atomic::Ordering::SeqCst) > 0
            || self.ctx.rpc.view_id() > self.last_view_id.load(std::sync::atomic::Ordering::SeqCst)
            || installed.topology().is_rehashing()
            || coordinator
                .join_in_progress
                .as_ref()
                .is_some_and(|current| *current != joiner);
        if busy {
            tracing::debug!("Deferring join request from {}", joiner);
            return Response::Unsure;
        }

        if !installed.topology().current_ch().contains_member(&joiner) {
            coordinator.join_in_progress = Some(joiner.clone());
        }
        tracing::info!(
            "Granting join to {} with topology {}",
            joiner,
            installed.topology_id()
        );
        Response::Topology {
            topology: installed.topology().clone(),
            members: self.ctx.rpc.members(),
        }
    }

    async fn state_for_segments(&self, segments: &[usize]) -> StateMap {
        let wanted: HashSet<usize> = segments.iter().copied().collect();
        let num_segments = self.ctx.config.distribution.num_segments;
        rehash::local_entries(self)
            .await
            .into_iter()
            .filter(|(key, _)| wanted.contains(&segment_for_key(key, num_segments)))
            .collect()
    }

    async fn handle_clustered_get(&self, requester: Member, key: String) -> Response {
        let Some(topology) = self.topology() else {
            return Response::Unsure;
        };
        if !topology.distribution(&key).is_write_owner() {
            return Response::Unsure;
        }
        let value = self.ctx.container.get(&key).await;
        if value.is_some() && self.ctx.config.l1.enabled && requester != self.local {
            self.l1.add_requestor(&key, requester);
        }
        Response::Value(value)
    }

    async fn handle_forward_write(&self, sender: Member, command: WriteCommand) -> Response {
        match self.primary_write(command, &sender).await {
            Ok(PrimaryWrite::Applied) => Response::Success,
            Ok(PrimaryWrite::NotPrimary) => Response::Unsure,
            Err(e) => Response::Failure(e.to_string()),
        }
    }

    /// Apply a client write. Each key is written through its primary owner,
    /// which orders the write towards the backups.
    pub async fn handle_write(&self, command: WriteCommand) -> Result<()> {
        if command == WriteCommand::Clear {
            return self.handle_clear().await;
        }

        for single in command.split_per_key() {
            let Some(key) = single.affected_keys().first().map(|key| (*key).clone()) else {
                continue;
            };
            self.l1_container.remove(&key).await;
            self.write_through_primary(single, &key).await?;
        }
        Ok(())
    }

    /// Route a single-key write to the primary of `key`, following ownership
    /// to a newer topology if the primary moves meanwhile
    async fn write_through_primary(&self, command: WriteCommand, key: &str) -> Result<()> {
        let dist = &self.ctx.config.distribution;
        let mut last_primary = self.local.clone();

        for attempt in 1..=RPC_ATTEMPTS {
            let topology = self.topology().ok_or_else(|| self.not_joined())?;
            let primary = topology.distribution(key).primary().cloned().ok_or_else(|| {
                DistributionError::StateTransfer(format!("no primary owner for {}", key))
            })?;

            if primary == self.local {
                if let PrimaryWrite::Applied = self.primary_write(command.clone(), &self.local).await? {
                    return Ok(());
                }
            } else {
                let forward = RehashCommand::ForwardWrite {
                    sender: self.local.clone(),
                    command: command.clone(),
                };
                let mut responses = rehash::invoke_with_retry(
                    self.ctx.rpc.as_ref(),
                    std::slice::from_ref(&primary),
                    forward,
                    dist.rehash_rpc_timeout(),
                    RPC_ATTEMPTS,
                )
                .await;
                match responses.remove(&primary) {
                    Some(response) if response.is_successful() => return Ok(()),
                    Some(Response::Unsure) => {}
                    other => {
                        return Err(DistributionError::rpc(&primary, format!("write of {} failed: {:?}", key, other)))
                    }
                }
            }

            tracing::debug!("{} is no longer the primary of {} (attempt {})", primary, key, attempt);
            last_primary = primary;
            if attempt < RPC_ATTEMPTS {
                tokio::time::sleep(dist.join_retry_base()).await;
            }
        }
        Err(DistributionError::RehashInProgress {
            node: last_primary.to_string(),
        })
    }

    async fn handle_clear(&self) -> Result<()> {
        if !self.txlog.log_if_needed(WriteCommand::Clear).await {
            WriteCommand::Clear.apply_to(self.ctx.container.as_ref()).await?;
        }
        self.l1_container.clear().await;
        let command = RehashCommand::ApplyTxLog {
            sender: self.local.clone(),
            commands: vec![WriteCommand::Clear],
        };
        for (member, response) in self.ctx.rpc.broadcast_rpc_command(command, true, false).await? {
            if !response.is_successful() {
                tracing::warn!("{} did not apply clear: {:?}", member, response);
            }
        }
        Ok(())
    }

    /// Write a single-key command on its primary owner and replicate it to the
    /// backups in segment order.
    ///
    /// Sequencing and applying happen under the segment's write lock, so the
    /// backups see writes in the order the primary applied them. The lock is
    /// released before any RPC.
    async fn primary_write(&self, command: WriteCommand, origin: &Member) -> Result<PrimaryWrite> {
        let Some(key) = command.affected_keys().first().map(|key| (*key).clone()) else {
            return Ok(PrimaryWrite::Applied);
        };
        let is_primary = self
            .topology()
            .is_some_and(|topology| topology.distribution(&key).is_primary());
        if !is_primary {
            return Ok(PrimaryWrite::NotPrimary);
        }
        let segment = segment_for_key(&key, self.ctx.config.distribution.num_segments);

        let ordered = self.write_order[segment % self.write_order.len()].lock().await;
        if self.txlog.log_if_needed(command.clone()).await {
            self.ctx.metrics.record_command_logged();
            tracing::trace!("Logged write of {} during rehash", key);
            return Ok(PrimaryWrite::Applied);
        }

        // the logger may have blocked while a newer topology was installed
        let Some(topology) = self.topology() else {
            return Err(self.not_joined());
        };
        let info = topology.distribution(&key);
        if !info.is_primary() {
            return Ok(PrimaryWrite::NotPrimary);
        }
        let backups = info.write_backup_members();
        let sequence = if backups.is_empty() {
            None
        } else {
            match self.triangle.next(info.segment(), topology.topology_id()) {
                Ok(sequence) => Some(sequence),
                Err(DistributionError::OutdatedTopology { .. }) => return Ok(PrimaryWrite::NotPrimary),
                Err(e) => return Err(e),
            }
        };

        let applied = command.apply_to(self.ctx.container.as_ref()).await;
        drop(ordered);

        if let Some(sequence) = sequence {
            // a failed local write still consumes its sequence, so the backups get an empty one
            let replicated = match &applied {
                Ok(()) => command,
                Err(_) => WriteCommand::PutMap { entries: Vec::new() },
            };
            let backup = RehashCommand::BackupWrite {
                sender: self.local.clone(),
                segment: info.segment(),
                sequence,
                topology_id: topology.topology_id(),
                command: replicated,
            };
            self.replicate_to_backups(&backups, topology.topology_id(), backup).await;
        }
        applied?;

        if let Err(e) = self.l1.flush_cache(std::slice::from_ref(&key), origin).await {
            tracing::warn!("L1 invalidation of {} failed: {}", key, e);
        }
        Ok(PrimaryWrite::Applied)
    }

    /// Send a backup write to each backup, preceded by the writes that backup
    /// missed before in the same topology. Whatever does not get through is
    /// kept for the next write.
    async fn replicate_to_backups(&self, backups: &[Member], topology_id: u64, backup: RehashCommand) {
        let timeout = self.ctx.config.distribution.rehash_rpc_timeout();
        let limit = self.ctx.config.distribution.max_buffered_backup_writes;

        for member in backups {
            let mut outgoing = self.missed_backup_writes.lock().remove(member).unwrap_or_default();
            // writes missed in an older topology travel with the state transfer
            outgoing.retain(|missed| {
                matches!(missed, RehashCommand::BackupWrite { topology_id: missed_topology, .. } if *missed_topology >= topology_id)
            });
            outgoing.push(backup.clone());

            let mut undelivered = Vec::new();
            for command in outgoing {
                if !undelivered.is_empty() {
                    undelivered.push(command);
                    continue;
                }
                let responses = rehash::invoke_with_retry(
                    self.ctx.rpc.as_ref(),
                    std::slice::from_ref(member),
                    command.clone(),
                    timeout,
                    RPC_ATTEMPTS,
                )
                .await;
                if !responses.get(member).is_some_and(Response::is_successful) {
                    undelivered.push(command);
                }
            }
            if undelivered.is_empty() {
                continue;
            }

            tracing::warn!(
                "Backup {} did not take {} write(s), resending with its next write",
                member,
                undelivered.len()
            );
            let mut missed = self.missed_backup_writes.lock();
            let queue = missed.entry(member.clone()).or_default();
            queue.extend(undelivered);
            if queue.len() > limit {
                let dropped = queue.len() - limit;
                queue.drain(..dropped);
                tracing::error!("Dropped {} write(s) never taken by backup {}", dropped, member);
            }
        }
    }

    /// Deliver a backup write once every earlier write of its segment has been
    /// delivered. Out-of-order writes wait in a per-segment buffer.
    ///
    /// The segment's buffer lock is held while writes are applied and released
    /// before L1 invalidation goes out.
    pub async fn handle_backup_write(
        &self,
        sender: Member,
        segment: usize,
        sequence: u64,
        topology_id: u64,
        command: WriteCommand,
    ) -> Response {
        let limit = self.ctx.config.distribution.max_buffered_backup_writes;
        let mut delivered: Vec<(Member, Vec<Key>)> = Vec::new();
        {
            let mut pending = self.backup_writes[segment % self.backup_writes.len()].lock().await;
            pending.insert((topology_id, sequence), (sender, command));

            if pending.len() > limit {
                if let Some(&(oldest_topology, oldest_sequence)) = pending.keys().next() {
                    let skipped = self.triangle.skip_to(segment, oldest_sequence, oldest_topology);
                    tracing::error!(
                        "{} gave up on {} missing write(s) of segment {} in topology {}",
                        self.local,
                        skipped,
                        segment,
                        oldest_topology
                    );
                }
            }

            while let Some(entry) = pending.first_entry() {
                let (next_topology, next_sequence) = *entry.key();
                if self.triangle.is_delivered(segment, next_sequence, next_topology) {
                    entry.remove();
                    tracing::trace!("Dropping resent write {} of segment {}", next_sequence, segment);
                    continue;
                }
                if !self.triangle.is_next(segment, next_sequence, next_topology) {
                    tracing::trace!(
                        "Holding back write {} of segment {} in topology {}",
                        next_sequence,
                        segment,
                        next_topology
                    );
                    break;
                }
                let (origin, command) = entry.remove();
                if let Err(e) = self.apply_backup_write(&command).await {
                    tracing::error!("Failed to apply backup write {} of segment {}: {}", next_sequence, segment, e);
                }
                self.triangle.mark_delivered(segment, next_sequence, next_topology);
                let keys: Vec<Key> = command.affected_keys().into_iter().cloned().collect();
                if !keys.is_empty() {
                    delivered.push((origin, keys));
                }
            }
        }

        for (origin, keys) in delivered {
            if let Err(e) = self.l1.flush_cache(&keys, &origin).await {
                tracing::warn!("L1 invalidation after backup write failed: {}", e);
            }
        }
        Response::Success
    }

    async fn apply_backup_write(&self, command: &WriteCommand) -> Result<()> {
        if self.txlog.log_if_needed(command.clone()).await {
            self.ctx.metrics.record_command_logged();
            return Ok(());
        }
        command.apply_to(self.ctx.container.as_ref()).await
    }

    /// Read a key from the local container, the L1 cache or a remote owner
    pub async fn get(&self, key: &str) -> Result<Option<InternalCacheValue>> {
        let topology = self.topology().ok_or_else(|| self.not_joined())?;
        if topology.distribution(key).is_read_owner() {
            return Ok(self.ctx.container.get(key).await);
        }
        if self.ctx.config.l1.enabled {
            if let Some(value) = self.l1_container.get(key).await {
                return Ok(Some(value));
            }
        }
        self.retrieve_from_remote_source(key).await
    }

    /// Ask the read owners of `key` one at a time until one answers.
    ///
    /// A value found remotely is cached in L1 when L1 is enabled.
    pub async fn retrieve_from_remote_source(&self, key: &str) -> Result<Option<InternalCacheValue>> {
        let topology = self.topology().ok_or_else(|| self.not_joined())?;
        let owners: Vec<Member> = topology
            .distribution(key)
            .read_owners()
            .iter()
            .filter(|owner| **owner != self.local)
            .cloned()
            .collect();
        let timeout = self.ctx.config.distribution.rehash_rpc_timeout();

        for owner in owners {
            let command = RehashCommand::ClusteredGet {
                requester: self.local.clone(),
                key: key.to_string(),
            };
            let response = self
                .ctx
                .rpc
                .invoke_remotely(std::slice::from_ref(&owner), command, ResponseMode::Synchronous, timeout, false)
                .await
                .map(|mut responses| responses.remove(&owner));
            match response {
                Ok(Some(Response::Value(Some(value)))) => {
                    if self.ctx.config.l1.enabled {
                        self.l1_container
                            .put(key.to_string(), self.l1.transform_for_l1(value.clone()))
                            .await?;
                    }
                    return Ok(Some(value));
                }
                Ok(Some(Response::Value(None))) => return Ok(None),
                Ok(other) => tracing::debug!("{} could not serve {}: {:?}", owner, key, other),
                Err(e) => tracing::debug!("Remote get of {} from {} failed: {}", key, owner, e),
            }
        }
        tracing::debug!("No read owner answered for {}", key);
        Ok(None)
    }

    /// Store received state, retrying failed writes.
    ///
    /// The state is applied as a whole or not at all: if some key still fails
    /// after the last retry, the keys already written are removed again. State
    /// tagged with a view older than the last one seen is rejected.
    pub async fn apply_state(&self, state: StateMap, sender: &Member, view_id: u64) -> Result<usize> {
        let last_view = self.last_view_id.load(std::sync::atomic::Ordering::SeqCst);
        if view_id < last_view {
            return Err(DistributionError::StateTransfer(format!(
                "state from {} is for view {}, already in view {}",
                sender, view_id, last_view
            )));
        }

        let total = state.len();
        // a key already present was written through the union topology and is newer
        let mut pending: Vec<(Key, InternalCacheValue)> = Vec::with_capacity(total);
        let mut skipped = 0;
        for (key, value) in state {
            if self.ctx.container.contains_key(&key).await {
                skipped += 1;
            } else {
                pending.push((key, value));
            }
        }

        let mut written: Vec<Key> = Vec::with_capacity(pending.len());
        let mut last_error = None;
        for attempt in 0..=self.ctx.config.distribution.state_apply_retries {
            let mut failed = Vec::new();
            for (key, value) in pending {
                match self.ctx.container.put(key.clone(), value.clone()).await {
                    Ok(()) => written.push(key),
                    Err(e) => {
                        last_error = Some(e);
                        failed.push((key, value));
                    }
                }
            }
            pending = failed;
            if pending.is_empty() {
                break;
            }
            tracing::debug!("Retrying {} key(s) from {} (attempt {})", pending.len(), sender, attempt + 1);
        }

        if !pending.is_empty() {
            for (key, _) in &pending {
                tracing::error!("Could not apply state for {} from {}", key, sender);
            }
            // every written key was absent before
            for key in &written {
                self.ctx.container.remove(key).await;
            }
            tracing::warn!("Rolled back {} key(s) applied from {}", written.len(), sender);
            return Err(DistributionError::StateTransfer(format!(
                "{} of {} key(s) from {} not applied: {}",
                pending.len(),
                total,
                sender,
                last_error.map(|e| e.to_string()).unwrap_or_default()
            )));
        }
        tracing::debug!(
            "{} applied {} key(s) from {}, kept {} newer local value(s)",
            self.local,
            total - skipped,
            sender,
            skipped
        );
        Ok(total)
    }

    /// Apply writes replayed by another node's rehash
    pub async fn apply_remote_tx_log(&self, commands: Vec<WriteCommand>) -> Result<usize> {
        let count = commands.len();
        for command in commands {
            for key in command.affected_keys() {
                self.l1_container.remove(key).await;
            }
            if command == WriteCommand::Clear {
                self.l1_container.clear().await;
            }
            command.apply_to(self.ctx.container.as_ref()).await?;
        }
        Ok(count)
    }

    /// Take over prepared transactions from a previous owner
    pub async fn apply_prepared(&self, prepares: Vec<PrepareCommand>) {
        for prepare in prepares {
            self.txlog.log_prepare_if_needed(&prepare).await;
            self.prepared.insert(prepare.gtx.clone(), prepare);
        }
    }
}
