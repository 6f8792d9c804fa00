//! Subscription bookkeeping.
//!
//! Tracks which `(server, service)` pair wants to hear about which setting.
//! The router itself does no I/O; the daemon asks it who to notify and
//! builds the `VALUE_UPDATED` messages.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::SettingName;

/// One remote interested party, as the bus identifies it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Subscriber {
    pub server: String,
    pub service: String,
}

impl Subscriber {
    pub fn new(server: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            service: service.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    interests: BTreeMap<SettingName, BTreeSet<Subscriber>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a set of names. Returns `true` when at least
    /// one `(name, subscriber)` pair was new; re-listening is idempotent.
    pub fn listen(&mut self, subscriber: &Subscriber, names: &[SettingName]) -> bool {
        let mut any_new = false;
        for name in names {
            if self
                .interests
                .entry(name.clone())
                .or_default()
                .insert(subscriber.clone())
            {
                any_new = true;
            }
        }
        any_new
    }

    /// Drop interest. Returns `true` when anything was actually removed;
    /// empty per-name sets are pruned.
    pub fn forget(&mut self, subscriber: &Subscriber, names: &[SettingName]) -> bool {
        let mut any_removed = false;
        for name in names {
            if let Some(set) = self.interests.get_mut(name) {
                if set.remove(subscriber) {
                    any_removed = true;
                }
                if set.is_empty() {
                    self.interests.remove(name);
                }
            }
        }
        any_removed
    }

    pub fn subscribers(&self, name: &SettingName) -> impl Iterator<Item = &Subscriber> {
        self.interests.get(name).into_iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}
