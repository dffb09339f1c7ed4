//! Per-connection subscription reconciliation.
//!
//! Three disjoint sets over a canonical subscription key: `desired`,
//! `pending`, `active`. A flush computes `desired − (active ∪ pending)` so a
//! duplicate SUBSCRIBE frame is never sent. On socket close the manager
//! collapses back to `desired` only.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeSet;

/// Canonical subscription key: a venue channel paired with a venue market,
/// rendered `channel|market`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct SubKey {
    pub channel: SmolStr,
    pub market: SmolStr,
}

impl SubKey {
    pub fn new(channel: impl Into<SmolStr>, market: impl Into<SmolStr>) -> Self {
        Self {
            channel: channel.into(),
            market: market.into(),
        }
    }

    pub fn id(&self) -> SmolStr {
        SmolStr::from(format!("{}|{}", self.channel, self.market))
    }
}

impl std::fmt::Display for SubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.channel, self.market)
    }
}

/// Subscription set reconciler for one connection.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionManager {
    desired: BTreeSet<SubKey>,
    pending: BTreeSet<SubKey>,
    active: BTreeSet<SubKey>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to `desired`. Returns `true` if the key was not yet desired
    /// (i.e. a flush is warranted).
    pub fn add_desired(&mut self, key: SubKey) -> bool {
        self.desired.insert(key)
    }

    pub fn remove_desired(&mut self, key: &SubKey) {
        self.desired.remove(key);
        self.pending.remove(key);
        self.active.remove(key);
    }

    /// Keys that must be sent in the next SUBSCRIBE frame:
    /// `desired − (active ∪ pending)`, deterministically ordered.
    pub fn flush_diff(&self) -> Vec<SubKey> {
        self.desired
            .iter()
            .filter(|key| !self.pending.contains(key) && !self.active.contains(key))
            .cloned()
            .collect()
    }

    /// Move keys into `pending` after their SUBSCRIBE frame was sent.
    pub fn mark_pending(&mut self, keys: &[SubKey]) {
        for key in keys {
            if self.desired.contains(key) && !self.active.contains(key) {
                self.pending.insert(key.clone());
            }
        }
        self.assert_invariants();
    }

    /// Promote confirmed keys from `pending` to `active`. Unknown or
    /// no-longer-desired keys are ignored; promotion is idempotent.
    pub fn mark_active(&mut self, keys: &[SubKey]) {
        for key in keys {
            self.pending.remove(key);
            if self.desired.contains(key) {
                self.active.insert(key.clone());
            }
        }
        self.assert_invariants();
    }

    /// Socket closed: everything in flight or confirmed is gone, only
    /// `desired` survives.
    pub fn on_disconnect(&mut self) {
        self.pending.clear();
        self.active.clear();
    }

    pub fn desired(&self) -> &BTreeSet<SubKey> {
        &self.desired
    }

    pub fn is_active(&self, key: &SubKey) -> bool {
        self.active.contains(key)
    }

    pub fn is_pending(&self, key: &SubKey) -> bool {
        self.pending.contains(key)
    }

    fn assert_invariants(&self) {
        debug_assert!(self.pending.is_disjoint(&self.active));
        debug_assert!(self.pending.is_subset(&self.desired));
        debug_assert!(self.active.is_subset(&self.desired));
    }
}
