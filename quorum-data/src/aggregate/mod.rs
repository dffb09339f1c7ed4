//! Aggregation kernel: TTL-windowed, weighted, deterministic multi-source
//! merge.
//!
//! Every aggregator keeps a latest-value store keyed by
//! `(symbol, market type) -> stream -> state` and recomputes its aggregate on
//! each update. Stream maps are `BTreeMap` so weighted sums always accumulate
//! in stream-sorted order, which keeps replayed output byte-identical.

use crate::{
    confidence::{ConfidenceInputs, compute_confidence_score},
    event::{MarketType, QualityFlags, StreamId},
    symbol::Symbol,
    time::Ts,
};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Flow aggregation: per-venue CVD calculation and consolidation.
pub mod cvd;

/// Funding rate consolidation.
pub mod funding;

/// Bucketed liquidation consolidation.
pub mod liquidation;

/// Order-book liquidity metrics and consolidation.
pub mod liquidity;

/// Open interest consolidation with unit grouping.
pub mod open_interest;

/// Canonical price and price index consolidation.
pub mod price;

/// Latest observation for one stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceState<V> {
    pub ts: Ts,
    pub value: V,
}

/// Per-(symbol, market type) latest-value store.
#[derive(Debug)]
pub struct LatestStore<V> {
    map: FnvHashMap<(Symbol, MarketType), BTreeMap<StreamId, SourceState<V>>>,
}

impl<V> Default for LatestStore<V> {
    fn default() -> Self {
        Self {
            map: FnvHashMap::default(),
        }
    }
}

impl<V> LatestStore<V> {
    pub fn update(
        &mut self,
        symbol: &Symbol,
        market_type: MarketType,
        stream_id: &StreamId,
        ts: Ts,
        value: V,
    ) {
        self.map
            .entry((symbol.clone(), market_type))
            .or_default()
            .insert(stream_id.clone(), SourceState { ts, value });
    }

    pub fn sources(
        &self,
        symbol: &Symbol,
        market_type: MarketType,
    ) -> Option<&BTreeMap<StreamId, SourceState<V>>> {
        self.map.get(&(symbol.clone(), market_type))
    }

    /// Drop entries older than `ttl_ms` at `now_ts` (garbage collection run
    /// after each emission).
    pub fn prune_stale(&mut self, symbol: &Symbol, market_type: MarketType, now_ts: Ts, ttl_ms: i64) {
        if let Some(sources) = self.map.get_mut(&(symbol.clone(), market_type)) {
            sources.retain(|_, state| now_ts - state.ts <= ttl_ms);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Relative venue disagreement: `(max - min) / min >= 0.1` with `min > 0`.
pub fn detect_mismatch(values: impl IntoIterator<Item = f64>) -> bool {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut count = 0usize;
    for value in values {
        if !value.is_finite() {
            continue;
        }
        min = min.min(value);
        max = max.max(value);
        count += 1;
    }
    count >= 2 && min > 0.0 && (max - min) / min >= 0.1
}

/// Shared aggregator tuning.
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    pub ttl_ms: i64,
    pub weights: BTreeMap<StreamId, f64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 15_000,
            weights: BTreeMap::new(),
        }
    }
}

impl AggregatorConfig {
    pub fn weight(&self, stream_id: &StreamId) -> f64 {
        self.weights.get(stream_id).copied().unwrap_or(1.0)
    }
}

/// Result of one TTL-windowed weighted merge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeOutcome {
    pub value: f64,
    pub venue_breakdown: BTreeMap<StreamId, f64>,
    pub sources_used: Vec<StreamId>,
    pub weights_used: BTreeMap<StreamId, f64>,
    pub fresh_sources_count: usize,
    pub stale_sources_dropped: Vec<StreamId>,
    pub mismatch_detected: bool,
}

/// Weighted mean over fresh sources, accumulated in stream-sorted order.
/// Returns `None` when the fresh weight sum is zero (caller suppresses with
/// `STALE_INPUT`).
pub fn merge_scalar(
    now_ts: Ts,
    sources: &BTreeMap<StreamId, SourceState<f64>>,
    config: &AggregatorConfig,
) -> Option<MergeOutcome> {
    let mut outcome = MergeOutcome::default();
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;

    for (stream_id, state) in sources {
        if now_ts - state.ts > config.ttl_ms {
            outcome.stale_sources_dropped.push(stream_id.clone());
            continue;
        }
        let weight = config.weight(stream_id);
        weighted_sum += state.value * weight;
        weight_sum += weight;
        outcome.venue_breakdown.insert(stream_id.clone(), state.value);
        outcome.weights_used.insert(stream_id.clone(), weight);
        outcome.sources_used.push(stream_id.clone());
    }

    if weight_sum == 0.0 {
        return None;
    }

    outcome.value = weighted_sum / weight_sum;
    outcome.fresh_sources_count = outcome.sources_used.len();
    outcome.mismatch_detected = detect_mismatch(outcome.venue_breakdown.values().copied());
    Some(outcome)
}

/// Derive the confidence inputs shared by every kernel-based aggregator.
pub fn kernel_confidence_inputs(
    outcome: &MergeOutcome,
    expected_sources: Option<usize>,
    flags: &QualityFlags,
) -> ConfidenceInputs {
    ConfidenceInputs {
        fresh_sources_count: outcome.fresh_sources_count,
        expected_sources,
        stale_sources_dropped_count: Some(outcome.stale_sources_dropped.len()),
        mismatch_detected: Some(outcome.mismatch_detected),
        gap_detected: flags.gap_detected.then_some(true),
        sequence_broken: flags.sequence_broken.then_some(true),
        lag_detected: flags.lag_detected.then_some(true),
        outlier_detected: flags.outlier_detected.then_some(true),
        fallback_penalty: flags.fallback_penalty,
        source_penalty: flags.source_penalty,
        source_cap: flags.source_cap,
    }
}

/// Confidence score for kernel outputs.
pub fn kernel_confidence(
    outcome: &MergeOutcome,
    expected_sources: Option<usize>,
    flags: &QualityFlags,
) -> f64 {
    compute_confidence_score(&kernel_confidence_inputs(outcome, expected_sources, flags)).score
}

/// Latest canonical price shared between the price aggregator (writer) and
/// the open-interest aggregator (reader, for base -> USD conversion).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CanonicalPriceEntry {
    pub ts: Ts,
    pub price: f64,
    pub confidence_score: f64,
}

#[derive(Default)]
pub struct CanonicalPriceCache {
    inner: Mutex<FnvHashMap<(Symbol, MarketType), CanonicalPriceEntry>>,
}

impl CanonicalPriceCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn store(&self, symbol: &Symbol, market_type: MarketType, entry: CanonicalPriceEntry) {
        self.inner
            .lock()
            .insert((symbol.clone(), market_type), entry);
    }

    pub fn get(&self, symbol: &Symbol, market_type: MarketType) -> Option<CanonicalPriceEntry> {
        self.inner
            .lock()
            .get(&(symbol.clone(), market_type))
            .copied()
    }
}
