//! Transaction log used while a rehash is in flight
//!
//! While enabled, writes are buffered here instead of being applied so the
//! rehash can replay them against the new owners once state has moved. The
//! log is drained in two phases: repeated lock-free drains while the backlog
//! is large, then one short drain under the write lock that blocks new writes
//! until [`TransactionLogger::unlock_and_disable`] is called.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::command::{GlobalTransaction, PrepareCommand, WriteCommand};

/// Result of the final, locked drain
#[derive(Debug, Default)]
pub struct LockedDrain {
    pub commands: Vec<WriteCommand>,
    pub pending_prepares: Vec<PrepareCommand>,
}

#[derive(Debug)]
pub struct TransactionLogger {
    enabled: AtomicBool,
    mutation_lock: Arc<RwLock<()>>,
    held_write_lock: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
    commands: Mutex<VecDeque<WriteCommand>>,
    uncommitted_prepares: Mutex<HashMap<GlobalTransaction, PrepareCommand>>,
    drain_lock_threshold: usize,
}

impl TransactionLogger {
    pub fn new(drain_lock_threshold: usize) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            mutation_lock: Arc::new(RwLock::new(())),
            held_write_lock: Mutex::new(None),
            commands: Mutex::new(VecDeque::new()),
            uncommitted_prepares: Mutex::new(HashMap::new()),
            drain_lock_threshold,
        }
    }

    /// Start buffering writes
    pub fn enable(&self) {
        tracing::trace!("Enabling transaction logger");
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Buffer a write if logging is enabled.
    ///
    /// Returns `true` when the command was logged; the caller must then not
    /// apply it, it will be replayed by the rehash. Blocks while the final
    /// drain holds the write lock.
    pub async fn log_if_needed(&self, command: WriteCommand) -> bool {
        let _read = self.mutation_lock.read().await;
        if !self.is_enabled() {
            return false;
        }
        self.commands.lock().push_back(command);
        true
    }

    /// Record a prepared transaction if logging is enabled
    pub async fn log_prepare_if_needed(&self, prepare: &PrepareCommand) -> bool {
        let _read = self.mutation_lock.read().await;
        if !self.is_enabled() {
            return false;
        }
        self.uncommitted_prepares
            .lock()
            .insert(prepare.gtx.clone(), prepare.clone());
        true
    }

    /// Move a committed transaction's modifications into the command log.
    ///
    /// The transaction is looked up among logged prepares; `modifications`
    /// are used when it was prepared before logging was enabled.
    pub async fn log_commit_if_needed(
        &self,
        gtx: &GlobalTransaction,
        modifications: Vec<WriteCommand>,
    ) -> bool {
        let _read = self.mutation_lock.read().await;
        if !self.is_enabled() {
            return false;
        }
        let prepared = self.uncommitted_prepares.lock().remove(gtx);
        let modifications = prepared.map(|p| p.modifications).unwrap_or(modifications);
        self.commands.lock().extend(modifications);
        true
    }

    /// Forget a rolled back transaction
    pub async fn log_rollback_if_needed(&self, gtx: &GlobalTransaction) -> bool {
        let _read = self.mutation_lock.read().await;
        if !self.is_enabled() {
            return false;
        }
        self.uncommitted_prepares.lock().remove(gtx);
        true
    }

    /// Whether the backlog is still large enough to drain without blocking writers
    pub fn should_drain_without_lock(&self) -> bool {
        self.commands.lock().len() > self.drain_lock_threshold
    }

    /// Take everything logged so far, without blocking writers
    pub fn drain(&self) -> Vec<WriteCommand> {
        self.commands.lock().drain(..).collect()
    }

    /// Block new writes and take the residual log and pending prepares.
    ///
    /// The write lock stays held until [`Self::unlock_and_disable`].
    pub async fn drain_and_lock(&self) -> LockedDrain {
        let guard = self.mutation_lock.clone().write_owned().await;
        *self.held_write_lock.lock() = Some(guard);

        LockedDrain {
            commands: self.drain(),
            pending_prepares: self.uncommitted_prepares.lock().values().cloned().collect(),
        }
    }

    /// Disable logging and release the write lock if held
    pub fn unlock_and_disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.uncommitted_prepares.lock().clear();
        let leftover = self.commands.lock().len();
        if leftover > 0 {
            tracing::warn!("Discarding {} undrained logged commands", leftover);
            self.commands.lock().clear();
        }
        let guard = self.held_write_lock.lock().take();
        drop(guard);
        tracing::trace!("Transaction logger unlocked and disabled");
    }

    pub fn is_locked(&self) -> bool {
        self.held_write_lock.lock().is_some()
    }

    pub fn logged_count(&self) -> usize {
        self.commands.lock().len()
    }
}

impl Default for TransactionLogger {
    fn default() -> Self {
        Self::new(10)
    }
}
