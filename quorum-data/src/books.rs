//! Local order-book state and the snapshot-plus-delta reconcile sequencer.
//!
//! The invariant downstream relies on: a single snapshot immediately followed
//! by a strictly increasing sequence of deltas with no gap. Venue-specific
//! sequencing differences are captured by [`SequenceRule`]:
//!
//! - Binance spot: drop buffered deltas with `u <= lastUpdateId`; the first
//!   processed delta must satisfy `U <= lastUpdateId+1 <= u`; thereafter each
//!   delta's `U` must equal the previous `u + 1`.
//! - Binance futures: drop `u < lastUpdateId`; anchor `U <= lastUpdateId <= u`;
//!   thereafter each delta's `pu` must equal the previous `u`.
//! - OKX: `seqId`/`prevSeqId` chain verified the same way as the futures
//!   `pu` chain, with spot-style snapshot anchoring.

use crate::event::{BookLevel, OrderBookL2Delta, OrderBookL2Snapshot, ResyncReason};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Venue sequencing discipline for an L2 feed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceRule {
    SpotContiguous,
    FuturesPuChain,
    OkxSeqId,
}

impl SequenceRule {
    /// Whether a buffered delta predates the snapshot and must be discarded.
    fn is_outdated(&self, delta_last: u64, snapshot_id: u64) -> bool {
        match self {
            SequenceRule::SpotContiguous | SequenceRule::OkxSeqId => delta_last <= snapshot_id,
            SequenceRule::FuturesPuChain => delta_last < snapshot_id,
        }
    }

    /// Update id the first processed delta must cover.
    fn anchor(&self, snapshot_id: u64) -> u64 {
        match self {
            SequenceRule::SpotContiguous | SequenceRule::OkxSeqId => snapshot_id + 1,
            SequenceRule::FuturesPuChain => snapshot_id,
        }
    }

    /// Chain predicate between the applied state and the next delta.
    fn chain_ok(&self, state_last: u64, first: u64, prev: Option<u64>) -> bool {
        match self {
            SequenceRule::SpotContiguous => first == state_last + 1,
            SequenceRule::FuturesPuChain | SequenceRule::OkxSeqId => match prev {
                Some(prev) => prev == state_last,
                None => first == state_last + 1,
            },
        }
    }
}

/// Snapshot acquisition phase.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    #[default]
    Absent,
    InFlight,
    Present,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    #[default]
    Ok,
    Resyncing,
}

/// Mutable book state for one symbol × market type × stream.
#[derive(Clone, Debug, Default)]
pub struct OrderBookState {
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
    pub snapshot: SnapshotPhase,
    pub last_update_id: u64,
    pub prev_update_id: Option<u64>,
    pub status: BookStatus,
    pub sequence_broken: bool,
}

impl OrderBookState {
    /// Apply absolute levels; size zero deletes the level.
    pub fn apply_levels(&mut self, bids: &[BookLevel], asks: &[BookLevel]) {
        for level in bids {
            if level.size.is_zero() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level.size);
            }
        }
        for level in asks {
            if level.size.is_zero() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.size);
            }
        }
    }

    pub fn replace_from_snapshot(&mut self, snapshot: &OrderBookL2Snapshot) {
        self.bids.clear();
        self.asks.clear();
        self.apply_levels(&snapshot.bids, &snapshot.asks);
        self.last_update_id = snapshot.last_update_id;
        self.prev_update_id = None;
        self.snapshot = SnapshotPhase::Present;
        self.status = BookStatus::Ok;
        self.sequence_broken = false;
    }

    /// Gap or explicit disconnect: empty the book and mark broken.
    pub fn reset_broken(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.snapshot = SnapshotPhase::Absent;
        self.last_update_id = 0;
        self.prev_update_id = None;
        self.status = BookStatus::Resyncing;
        self.sequence_broken = true;
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, s)| (*p, *s))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, s)| (*p, *s))
    }

    /// Summed size over the top `n` levels on each side.
    pub fn depth(&self, n: usize) -> (f64, f64) {
        let bid: Decimal = self.bids.values().rev().take(n).copied().sum();
        let ask: Decimal = self.asks.values().take(n).copied().sum();
        (
            bid.to_f64().unwrap_or(f64::NAN),
            ask.to_f64().unwrap_or(f64::NAN),
        )
    }
}

/// Result of feeding one input to the [`BookReconciler`].
#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// Delta buffered until the snapshot lands.
    Buffered,
    /// Delta predates the snapshot; dropped.
    Discarded,
    /// Events to publish downstream, in order.
    Emit(Vec<ReconcileEvent>),
    /// Sequencing broke; caller must publish a resync request and fetch a
    /// fresh snapshot.
    Resync(ResyncReason),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileEvent {
    Snapshot(OrderBookL2Snapshot),
    Delta(OrderBookL2Delta),
}

/// Snapshot-plus-delta reconcile FSM for one symbol on one stream.
#[derive(Clone, Debug)]
pub struct BookReconciler {
    rule: SequenceRule,
    pub state: OrderBookState,
    buffered: Vec<OrderBookL2Delta>,
}

impl BookReconciler {
    pub fn new(rule: SequenceRule) -> Self {
        Self {
            rule,
            state: OrderBookState::default(),
            buffered: Vec::new(),
        }
    }

    pub fn rule(&self) -> SequenceRule {
        self.rule
    }

    /// Snapshot request went out; deltas buffer until it lands.
    pub fn begin_snapshot(&mut self) {
        self.state.snapshot = SnapshotPhase::InFlight;
    }

    pub fn is_resyncing(&self) -> bool {
        self.state.status == BookStatus::Resyncing || self.state.snapshot != SnapshotPhase::Present
    }

    /// Feed one live delta.
    pub fn on_delta(&mut self, delta: OrderBookL2Delta) -> ReconcileOutcome {
        match self.state.snapshot {
            SnapshotPhase::Absent | SnapshotPhase::InFlight => {
                self.buffered.push(delta);
                ReconcileOutcome::Buffered
            }
            SnapshotPhase::Present => {
                if self.rule.chain_ok(
                    self.state.last_update_id,
                    delta.first_update_id,
                    delta.prev_update_id,
                ) {
                    self.apply_delta(&delta);
                    ReconcileOutcome::Emit(vec![ReconcileEvent::Delta(delta)])
                } else if self
                    .rule
                    .is_outdated(delta.last_update_id, self.state.last_update_id)
                {
                    // Stragglers already covered by the applied state
                    ReconcileOutcome::Discarded
                } else {
                    let reason = if delta.first_update_id > self.state.last_update_id + 1 {
                        ResyncReason::Gap
                    } else {
                        ResyncReason::OutOfOrder
                    };
                    self.state.reset_broken();
                    self.buffered.clear();
                    ReconcileOutcome::Resync(reason)
                }
            }
        }
    }

    /// Feed the snapshot. Buffered deltas are sorted by
    /// `(first_update_id, last_update_id, ts_event)`, outdated ones dropped,
    /// and the remainder must anchor onto the snapshot.
    pub fn on_snapshot(&mut self, snapshot: OrderBookL2Snapshot) -> ReconcileOutcome {
        let snapshot_id = snapshot.last_update_id;

        let mut retained: Vec<OrderBookL2Delta> = std::mem::take(&mut self.buffered);
        retained.sort_by_key(|delta| {
            (
                delta.first_update_id,
                delta.last_update_id,
                delta.meta.ts_event,
            )
        });
        retained.retain(|delta| !self.rule.is_outdated(delta.last_update_id, snapshot_id));

        let anchor = self.rule.anchor(snapshot_id);
        if let Some(earliest) = retained.first() {
            if earliest.first_update_id > anchor {
                self.state.reset_broken();
                return ReconcileOutcome::Resync(ResyncReason::Gap);
            }
        }

        self.state.replace_from_snapshot(&snapshot);
        let mut events = vec![ReconcileEvent::Snapshot(snapshot)];

        let mut anchored = false;
        for delta in retained {
            let ok = if anchored {
                self.rule.chain_ok(
                    self.state.last_update_id,
                    delta.first_update_id,
                    delta.prev_update_id,
                )
            } else {
                delta.first_update_id <= anchor && anchor <= delta.last_update_id
            };
            if !ok {
                self.state.reset_broken();
                return ReconcileOutcome::Resync(ResyncReason::Gap);
            }
            anchored = true;
            self.apply_delta(&delta);
            events.push(ReconcileEvent::Delta(delta));
        }

        ReconcileOutcome::Emit(events)
    }

    /// Connection lost: full reset, buffered deltas are worthless.
    pub fn on_disconnect(&mut self) {
        self.buffered.clear();
        self.state.reset_broken();
    }

    pub fn snapshot_present(&self) -> bool {
        self.state.snapshot == SnapshotPhase::Present
    }

    /// Whether `delta` would satisfy the chain predicate right now. Lets the
    /// caller tolerate isolated gaps (OKX) before committing to a resync.
    pub fn chain_would_hold(&self, delta: &OrderBookL2Delta) -> bool {
        self.rule.chain_ok(
            self.state.last_update_id,
            delta.first_update_id,
            delta.prev_update_id,
        )
    }

    /// Apply a delta without chain verification (gap explicitly tolerated).
    pub fn force_apply(&mut self, delta: &OrderBookL2Delta) {
        self.apply_delta(delta);
    }

    fn apply_delta(&mut self, delta: &OrderBookL2Delta) {
        self.state.apply_levels(&delta.bids, &delta.asks);
        self.state.prev_update_id = Some(self.state.last_update_id);
        self.state.last_update_id = delta.last_update_id;
    }
}
