//! Order-book liquidity aggregator.
//!
//! Maintains an independent copy of every stream's book built from the
//! published snapshots/deltas (never sharing state with the producing
//! client), derives per-stream metrics, and consolidates them over fixed
//! buckets. Streams currently resyncing are reported, not hidden: their
//! status lands in `venue_status` and the `sequence_broken` quality flag.

use super::{SourceState, price::agg_meta};
use crate::{
    books::OrderBookState,
    bus::EventBus,
    confidence::{ConfidenceInputs, compute_confidence_score},
    event::{
        AggregateEvent, AggregateKind, BusEvent, BusPayload, EventMeta, LiquidityMetrics,
        MarketType, OrderBookL2Delta, OrderBookL2Snapshot, QualityFlags, StreamId, Topic,
        VenueBookStatus,
    },
    registry::{Metric, SourceRegistry, SuppressReason},
    symbol::Symbol,
    time::{Ts, bucket_start},
};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct LiquidityAggConfig {
    pub bucket_ms: i64,
    /// Depth is summed over the top N levels each side.
    pub depth_levels: usize,
    pub weights: BTreeMap<StreamId, f64>,
}

impl Default for LiquidityAggConfig {
    fn default() -> Self {
        Self {
            bucket_ms: 1_000,
            depth_levels: 10,
            weights: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct LiquidityState {
    books: BTreeMap<StreamId, OrderBookState>,
    latest_metrics: BTreeMap<StreamId, SourceState<LiquidityMetrics>>,
    broken: BTreeMap<StreamId, bool>,
    bucket_start_ts: Option<Ts>,
    last_meta: Option<EventMeta>,
}

pub struct LiquidityAggregator {
    bus: Arc<EventBus>,
    registry: Arc<SourceRegistry>,
    config: LiquidityAggConfig,
    state: Mutex<FnvHashMap<(Symbol, MarketType), LiquidityState>>,
}

impl LiquidityAggregator {
    pub fn attach(
        bus: Arc<EventBus>,
        registry: Arc<SourceRegistry>,
        config: LiquidityAggConfig,
    ) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            bus: Arc::clone(&bus),
            registry,
            config,
            state: Mutex::new(FnvHashMap::default()),
        });

        {
            let handler = Arc::clone(&aggregator);
            bus.subscribe(
                Topic::MarketOrderbookL2Snapshot,
                "agg:liquidity:snapshot",
                move |event| {
                    if let BusPayload::OrderBookSnapshot(snapshot) = &event.payload {
                        handler.on_snapshot(snapshot);
                    }
                    Ok(())
                },
            );
        }
        {
            let handler = Arc::clone(&aggregator);
            bus.subscribe(
                Topic::MarketOrderbookL2Delta,
                "agg:liquidity:delta",
                move |event| {
                    if let BusPayload::OrderBookDelta(delta) = &event.payload {
                        handler.on_delta(delta);
                    }
                    Ok(())
                },
            );
        }
        {
            let handler = Arc::clone(&aggregator);
            bus.subscribe(
                Topic::MarketResyncRequested,
                "agg:liquidity:resync",
                move |event| {
                    if let BusPayload::ResyncRequested(resync) = &event.payload {
                        handler.on_resync(resync.symbol.clone(), resync.market_type, &resync.stream_id);
                    }
                    Ok(())
                },
            );
        }
        {
            let handler = Arc::clone(&aggregator);
            bus.subscribe(
                Topic::MarketDisconnected,
                "agg:liquidity:disconnect",
                move |event| {
                    if let BusPayload::Disconnected(disconnected) = &event.payload {
                        handler.on_disconnected(&disconnected.stream_id);
                    }
                    Ok(())
                },
            );
        }
        aggregator
    }

    fn on_snapshot(&self, snapshot: &OrderBookL2Snapshot) {
        if snapshot.market_type == MarketType::Unknown {
            return;
        }
        let key = (snapshot.symbol.clone(), snapshot.market_type);
        let closed = {
            let mut state = self.state.lock();
            let entry = state.entry(key).or_default();
            let stream_id = &snapshot.meta.stream_id;

            let book = entry.books.entry(stream_id.clone()).or_default();
            book.replace_from_snapshot(snapshot);
            entry.broken.insert(stream_id.clone(), false);

            self.refresh_metrics(entry, stream_id, snapshot.meta.ts_event);
            Self::roll_bucket(entry, snapshot.meta.ts_event, &snapshot.meta, self.config.bucket_ms)
        };
        self.emit_closed(&snapshot.symbol, snapshot.market_type, closed);
    }

    fn on_delta(&self, delta: &OrderBookL2Delta) {
        if delta.market_type == MarketType::Unknown {
            return;
        }
        let key = (delta.symbol.clone(), delta.market_type);
        let closed = {
            let mut state = self.state.lock();
            let entry = state.entry(key).or_default();
            let stream_id = &delta.meta.stream_id;

            let book = entry.books.entry(stream_id.clone()).or_default();
            book.apply_levels(&delta.bids, &delta.asks);
            book.last_update_id = delta.last_update_id;

            self.refresh_metrics(entry, stream_id, delta.meta.ts_event);
            Self::roll_bucket(entry, delta.meta.ts_event, &delta.meta, self.config.bucket_ms)
        };
        self.emit_closed(&delta.symbol, delta.market_type, closed);
    }

    fn on_resync(&self, symbol: Symbol, market_type: MarketType, stream_id: &StreamId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(&(symbol, market_type)) {
            entry.broken.insert(stream_id.clone(), true);
            entry.books.remove(stream_id);
        }
    }

    fn on_disconnected(&self, stream_id: &StreamId) {
        let mut state = self.state.lock();
        for entry in state.values_mut() {
            if entry.books.remove(stream_id).is_some() || entry.broken.contains_key(stream_id) {
                entry.broken.insert(stream_id.clone(), true);
            }
        }
    }

    fn refresh_metrics(&self, entry: &mut LiquidityState, stream_id: &StreamId, ts: Ts) {
        let Some(book) = entry.books.get(stream_id) else {
            return;
        };
        let (Some((bid_px, _)), Some((ask_px, _))) = (book.best_bid(), book.best_ask()) else {
            return;
        };
        let best_bid = bid_px.to_f64().unwrap_or(f64::NAN);
        let best_ask = ask_px.to_f64().unwrap_or(f64::NAN);
        let (depth_bid, depth_ask) = book.depth(self.config.depth_levels);
        let depth_sum = depth_bid + depth_ask;
        let imbalance = if depth_sum > 0.0 {
            (depth_bid - depth_ask) / depth_sum
        } else {
            0.0
        };

        entry.latest_metrics.insert(
            stream_id.clone(),
            SourceState {
                ts,
                value: LiquidityMetrics {
                    best_bid,
                    best_ask,
                    spread: best_ask - best_bid,
                    depth_bid,
                    depth_ask,
                    imbalance,
                    mid_price: (best_bid + best_ask) / 2.0,
                },
            },
        );
    }

    /// Advance the bucket cursor; returns the closed bucket bounds plus the
    /// metric snapshot to aggregate when a bucket rolled over.
    fn roll_bucket(
        entry: &mut LiquidityState,
        ts: Ts,
        meta: &EventMeta,
        bucket_ms: i64,
    ) -> Option<ClosedBucket> {
        let event_bucket = bucket_start(ts, bucket_ms);
        let closed = match entry.bucket_start_ts {
            Some(current) if event_bucket > current => {
                let bucket_end = current + bucket_ms;
                let contributing: BTreeMap<StreamId, LiquidityMetrics> = entry
                    .latest_metrics
                    .iter()
                    .filter(|(_, state)| state.ts >= current && state.ts < bucket_end)
                    .map(|(stream, state)| (stream.clone(), state.value.clone()))
                    .collect();
                let status: BTreeMap<StreamId, VenueBookStatus> = entry
                    .broken
                    .iter()
                    .map(|(stream, broken)| {
                        (
                            stream.clone(),
                            VenueBookStatus {
                                sequence_broken: *broken,
                            },
                        )
                    })
                    .collect();
                Some(ClosedBucket {
                    bucket_start_ts: current,
                    bucket_end_ts: bucket_end,
                    contributing,
                    status,
                    trigger: entry.last_meta.clone().unwrap_or_else(|| meta.clone()),
                })
            }
            _ => None,
        };

        if closed.is_some() || entry.bucket_start_ts.is_none() {
            entry.bucket_start_ts = Some(event_bucket);
        }
        entry.last_meta = Some(meta.clone());
        closed
    }

    fn emit_closed(&self, symbol: &Symbol, market_type: MarketType, closed: Option<ClosedBucket>) {
        let Some(bucket) = closed else {
            return;
        };

        if bucket.contributing.is_empty() {
            let any_broken = bucket.status.values().any(|status| status.sequence_broken);
            self.registry.record_suppression(
                symbol,
                market_type,
                Metric::Liquidity,
                if any_broken {
                    SuppressReason::ResyncActive
                } else {
                    SuppressReason::StaleInput
                },
            );
            return;
        }

        // Weighted mean per metric, stream-sorted accumulation
        let mut venue_breakdown = BTreeMap::new();
        let mut weights_used = BTreeMap::new();
        let mut sources_used = Vec::new();
        let mut weight_sum = 0.0;
        let mut acc = LiquidityMetrics::default();
        for (stream_id, metrics) in &bucket.contributing {
            let weight = self.config.weights.get(stream_id).copied().unwrap_or(1.0);
            weight_sum += weight;
            acc.best_bid += metrics.best_bid * weight;
            acc.best_ask += metrics.best_ask * weight;
            acc.spread += metrics.spread * weight;
            acc.depth_bid += metrics.depth_bid * weight;
            acc.depth_ask += metrics.depth_ask * weight;
            acc.imbalance += metrics.imbalance * weight;
            acc.mid_price += metrics.mid_price * weight;
            venue_breakdown.insert(stream_id.clone(), metrics.mid_price);
            weights_used.insert(stream_id.clone(), weight);
            sources_used.push(stream_id.clone());
        }
        if weight_sum == 0.0 {
            return;
        }
        let metrics = LiquidityMetrics {
            best_bid: acc.best_bid / weight_sum,
            best_ask: acc.best_ask / weight_sum,
            spread: acc.spread / weight_sum,
            depth_bid: acc.depth_bid / weight_sum,
            depth_ask: acc.depth_ask / weight_sum,
            imbalance: acc.imbalance / weight_sum,
            mid_price: acc.mid_price / weight_sum,
        };

        let sequence_broken = bucket.status.values().any(|status| status.sequence_broken);
        let flags = QualityFlags {
            sequence_broken,
            ..Default::default()
        };
        let inputs = ConfidenceInputs {
            fresh_sources_count: sources_used.len(),
            expected_sources: self.registry.expected(symbol, market_type, Metric::Liquidity),
            stale_sources_dropped_count: Some(0),
            mismatch_detected: Some(false),
            sequence_broken: sequence_broken.then_some(true),
            ..Default::default()
        };
        let confidence_score = compute_confidence_score(&inputs).score;

        let event = AggregateEvent {
            symbol: symbol.clone(),
            ts: bucket.bucket_end_ts,
            market_type,
            value: metrics.mid_price,
            venue_breakdown,
            sources_used: sources_used.clone(),
            weights_used,
            fresh_sources_count: sources_used.len(),
            stale_sources_dropped: vec![],
            mismatch_detected: false,
            confidence_score,
            quality_flags: flags,
            provider: SmolStr::from(super::price::PROVIDER),
            meta: agg_meta(&bucket.trigger, bucket.bucket_end_ts),
            kind: AggregateKind::Liquidity {
                metrics,
                venue_status: bucket.status,
                bucket_start_ts: bucket.bucket_start_ts,
                bucket_end_ts: bucket.bucket_end_ts,
            },
        };

        self.registry.mark_agg_emitted(
            symbol,
            market_type,
            Metric::Liquidity,
            &sources_used,
            bucket.bucket_end_ts,
        );
        self.bus
            .publish(BusEvent::new(Topic::MarketLiquidityAgg, BusPayload::Aggregate(event)));
    }
}

struct ClosedBucket {
    bucket_start_ts: Ts,
    bucket_end_ts: Ts,
    contributing: BTreeMap<StreamId, LiquidityMetrics>,
    status: BTreeMap<StreamId, VenueBookStatus>,
    trigger: EventMeta,
}
