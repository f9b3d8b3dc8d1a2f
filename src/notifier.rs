//! Membership change subscription
//!
//! The membership layer delivers view changes to exactly one listener per
//! cache. Listeners are registered explicitly and removed on stop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::member::Member;

/// A new cluster view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewChangedEvent {
    pub view_id: u64,
    pub old_members: Vec<Member>,
    pub new_members: Vec<Member>,
    /// Member lists of the partitions being merged, empty for ordinary changes
    pub merge_subgroups: Vec<Vec<Member>>,
}

impl ViewChangedEvent {
    pub fn new(view_id: u64, old_members: Vec<Member>, new_members: Vec<Member>) -> Self {
        Self {
            view_id,
            old_members,
            new_members,
            merge_subgroups: Vec::new(),
        }
    }

    pub fn merge(view_id: u64, old_members: Vec<Member>, new_members: Vec<Member>, subgroups: Vec<Vec<Member>>) -> Self {
        Self {
            view_id,
            old_members,
            new_members,
            merge_subgroups: subgroups,
        }
    }

    pub fn is_merge(&self) -> bool {
        self.merge_subgroups.len() > 1
    }

    /// Members present in the new view only
    pub fn joiners(&self) -> Vec<Member> {
        let old: HashSet<&Member> = self.old_members.iter().collect();
        self.new_members
            .iter()
            .filter(|m| !old.contains(m))
            .cloned()
            .collect()
    }

    /// Members present in the old view only
    pub fn leavers(&self) -> Vec<Member> {
        let new: HashSet<&Member> = self.new_members.iter().collect();
        self.old_members
            .iter()
            .filter(|m| !new.contains(m))
            .cloned()
            .collect()
    }
}

/// Receives view changes
#[async_trait]
pub trait ViewChangeListener: Send + Sync {
    async fn on_view_changed(&self, event: &ViewChangedEvent);
}

/// Handle returned by [`MembershipNotifier::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Delivers view changes to registered listeners
pub trait MembershipNotifier: Send + Sync {
    fn add_listener(&self, listener: Arc<dyn ViewChangeListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// In-process notifier, driven by whoever observes the membership
#[derive(Default)]
pub struct LocalMembershipNotifier {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ViewChangeListener>)>>,
}

impl LocalMembershipNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every listener, one after another
    pub async fn notify_view_changed(&self, event: &ViewChangedEvent) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        tracing::debug!(
            "Delivering view {} to {} listener(s)",
            event.view_id,
            listeners.len()
        );
        for listener in listeners {
            listener.on_view_changed(event).await;
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl MembershipNotifier for LocalMembershipNotifier {
    fn add_listener(&self, listener: Arc<dyn ViewChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}
