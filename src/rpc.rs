//! RPC transport contract and the rehash control commands
//!
//! The transport itself lives outside this crate. The distribution core only
//! needs unicast and broadcast invocation with a timeout and a response per
//! target, plus a few questions about the current view.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{PrepareCommand, WriteCommand};
use crate::error::Result;
use crate::member::Member;
use crate::store::{InternalCacheValue, Key, StateMap};
use crate::topology::CacheTopology;

/// Whether the caller waits for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Wait for a response from every target or the timeout
    Synchronous,
    /// Fire and forget; the returned map is empty
    Asynchronous,
}

/// Commands exchanged between distribution managers
#[derive(Debug, Clone)]
pub enum RehashCommand {
    /// Ask the coordinator for the installed topology and permission to join
    JoinRequest { joiner: Member },
    /// Install a topology; a pending hash means a rehash is in progress
    InstallTopology {
        sender: Member,
        view_id: u64,
        topology: CacheTopology,
    },
    /// Ask an old owner for the entries of some segments
    PullState {
        requester: Member,
        view_id: u64,
        segments: Vec<usize>,
    },
    /// Hand entries to a new owner
    PushState {
        sender: Member,
        view_id: u64,
        state: StateMap,
    },
    /// Replay writes logged while a rehash was running
    ApplyTxLog {
        sender: Member,
        commands: Vec<WriteCommand>,
    },
    /// Hand prepared, uncommitted transactions to their new owners
    ApplyPrepared {
        sender: Member,
        prepares: Vec<PrepareCommand>,
    },
    /// Tell the coordinator a node finished its part of a rehash
    NodePushCompleted {
        node: Member,
        view_id: u64,
        topology_id: u64,
    },
    /// Tell every node the cluster-wide rehash is done
    RehashCompleted { view_id: u64, topology_id: u64 },
    /// Ask every node to rebalance against the current membership
    StartRebalance { sender: Member },
    /// Read a key from one of its owners
    ClusteredGet { requester: Member, key: Key },
    /// Drop L1 copies of keys
    InvalidateL1 { origin: Member, keys: Vec<Key> },
    /// Hand a client write to the key's primary owner
    ForwardWrite {
        sender: Member,
        command: WriteCommand,
    },
    /// Primary-to-backup write, ordered per segment
    BackupWrite {
        sender: Member,
        segment: usize,
        sequence: u64,
        topology_id: u64,
        command: WriteCommand,
    },
}

impl RehashCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RehashCommand::JoinRequest { .. } => "join_request",
            RehashCommand::InstallTopology { .. } => "install_topology",
            RehashCommand::PullState { .. } => "pull_state",
            RehashCommand::PushState { .. } => "push_state",
            RehashCommand::ApplyTxLog { .. } => "apply_tx_log",
            RehashCommand::ApplyPrepared { .. } => "apply_prepared",
            RehashCommand::NodePushCompleted { .. } => "node_push_completed",
            RehashCommand::RehashCompleted { .. } => "rehash_completed",
            RehashCommand::StartRebalance { .. } => "start_rebalance",
            RehashCommand::ClusteredGet { .. } => "clustered_get",
            RehashCommand::InvalidateL1 { .. } => "invalidate_l1",
            RehashCommand::ForwardWrite { .. } => "forward_write",
            RehashCommand::BackupWrite { .. } => "backup_write",
        }
    }
}

/// Response to a [`RehashCommand`]
#[derive(Debug, Clone)]
pub enum Response {
    Success,
    Value(Option<InternalCacheValue>),
    State(StateMap),
    Topology {
        topology: CacheTopology,
        members: Vec<Member>,
    },
    /// The target cannot answer reliably right now; retry later
    Unsure,
    Failure(String),
}

impl Response {
    pub fn is_successful(&self) -> bool {
        !matches!(self, Response::Unsure | Response::Failure(_))
    }
}

/// The transport used by the distribution core.
///
/// Per-target failures are reported as [`Response::Failure`] entries in the
/// returned map; an `Err` means the invocation could not be attempted at all.
#[async_trait]
pub trait RpcManager: Send + Sync {
    async fn invoke_remotely(
        &self,
        targets: &[Member],
        command: RehashCommand,
        mode: ResponseMode,
        timeout: Duration,
        use_priority_executor: bool,
    ) -> Result<HashMap<Member, Response>>;

    /// Send to every member except the local one
    async fn broadcast_rpc_command(
        &self,
        command: RehashCommand,
        sync: bool,
        use_priority_executor: bool,
    ) -> Result<HashMap<Member, Response>>;

    /// Members of the current view, coordinator first
    fn members(&self) -> Vec<Member>;

    fn coordinator(&self) -> Option<Member>;

    fn local_address(&self) -> Member;

    fn is_multicast_capable(&self) -> bool;

    /// Id of the current view
    fn view_id(&self) -> u64;

    fn is_coordinator(&self) -> bool {
        self.coordinator().as_ref() == Some(&self.local_address())
    }
}
