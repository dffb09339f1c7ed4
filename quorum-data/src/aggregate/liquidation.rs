//! Bucketed liquidation aggregator.
//!
//! Liquidations accumulate into fixed-width buckets per symbol × market
//! type. A bucket is emitted when the first liquidation of a later bucket
//! arrives. Unit selection: `usd` only when every source in the bucket
//! provided a notional, else `base`.

use super::price::agg_meta;
use crate::{
    bus::EventBus,
    confidence::{TrustContext, source_trust_adjustments},
    event::{
        AggregateEvent, AggregateKind, BusEvent, BusPayload, EventMeta, Liquidation,
        LiquidationUnit, MarketType, QualityFlags, StreamId, Topic,
    },
    registry::{Metric, SourceRegistry},
    symbol::Symbol,
    time::{Ts, bucket_start},
};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct LiquidationAggConfig {
    pub bucket_ms: i64,
    pub weights: BTreeMap<StreamId, f64>,
}

impl Default for LiquidationAggConfig {
    fn default() -> Self {
        Self {
            bucket_ms: 10_000,
            weights: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct StreamTotals {
    base: f64,
    usd: f64,
    count: u64,
    usd_count: u64,
}

#[derive(Clone, Debug)]
struct Bucket {
    start_ts: Ts,
    streams: BTreeMap<StreamId, StreamTotals>,
    count: u64,
    usd_count: u64,
    last_meta: EventMeta,
}

pub struct LiquidationAggregator {
    bus: Arc<EventBus>,
    registry: Arc<SourceRegistry>,
    config: LiquidationAggConfig,
    buckets: Mutex<FnvHashMap<(Symbol, MarketType), Bucket>>,
}

impl LiquidationAggregator {
    pub fn attach(
        bus: Arc<EventBus>,
        registry: Arc<SourceRegistry>,
        config: LiquidationAggConfig,
    ) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            bus: Arc::clone(&bus),
            registry,
            config,
            buckets: Mutex::new(FnvHashMap::default()),
        });

        let handler = Arc::clone(&aggregator);
        bus.subscribe(Topic::MarketLiquidation, "agg:liquidations", move |event| {
            if let BusPayload::Liquidation(liquidation) = &event.payload {
                handler.on_liquidation(liquidation);
            }
            Ok(())
        });
        aggregator
    }

    fn on_liquidation(&self, liquidation: &Liquidation) {
        if liquidation.market_type == MarketType::Unknown {
            return;
        }
        let key = (liquidation.symbol.clone(), liquidation.market_type);
        let event_bucket = bucket_start(liquidation.meta.ts_event, self.config.bucket_ms);

        let closed = {
            let mut buckets = self.buckets.lock();
            let mut closed = None;
            match buckets.get_mut(&key) {
                Some(bucket) if event_bucket > bucket.start_ts => {
                    // Bucket close detected by the next liquidation
                    closed = buckets.remove(&key);
                }
                _ => {}
            }

            let bucket = buckets.entry(key).or_insert_with(|| Bucket {
                start_ts: event_bucket,
                streams: BTreeMap::new(),
                count: 0,
                usd_count: 0,
                last_meta: liquidation.meta.clone(),
            });

            let totals = bucket
                .streams
                .entry(liquidation.meta.stream_id.clone())
                .or_default();
            totals.base += liquidation.size;
            totals.count += 1;
            bucket.count += 1;
            if let Some(notional) = liquidation.notional_usd {
                totals.usd += notional;
                totals.usd_count += 1;
                bucket.usd_count += 1;
            }
            bucket.last_meta = liquidation.meta.clone();
            closed
        };

        if let Some(bucket) = closed {
            self.emit(&liquidation.symbol, liquidation.market_type, bucket);
        }
    }

    fn emit(&self, symbol: &Symbol, market_type: MarketType, bucket: Bucket) {
        let unit = if bucket.usd_count == bucket.count && bucket.count > 0 {
            LiquidationUnit::Usd
        } else {
            LiquidationUnit::Base
        };

        let mut venue_breakdown = BTreeMap::new();
        let mut weights_used = BTreeMap::new();
        let mut sources_used = Vec::new();
        let mut value = 0.0;
        for (stream_id, totals) in &bucket.streams {
            let total = match unit {
                LiquidationUnit::Usd => totals.usd,
                LiquidationUnit::Base => totals.base,
            };
            let weight = self
                .config
                .weights
                .get(stream_id)
                .copied()
                .unwrap_or(1.0);
            value += total * weight;
            venue_breakdown.insert(stream_id.clone(), total);
            weights_used.insert(stream_id.clone(), weight);
            sources_used.push(stream_id.clone());
        }

        let trust = source_trust_adjustments(TrustContext::Liquidation, &sources_used);
        let flags = QualityFlags {
            source_penalty: trust.source_penalty,
            source_cap: trust.source_cap,
            ..Default::default()
        };

        let inputs = crate::confidence::ConfidenceInputs {
            fresh_sources_count: sources_used.len(),
            expected_sources: self.registry.expected(symbol, market_type, Metric::Flow),
            stale_sources_dropped_count: Some(0),
            mismatch_detected: Some(false),
            source_penalty: trust.source_penalty,
            source_cap: trust.source_cap,
            ..Default::default()
        };
        let confidence_score = crate::confidence::compute_confidence_score(&inputs).score;

        let bucket_end_ts = bucket.start_ts + self.config.bucket_ms;
        let event = AggregateEvent {
            symbol: symbol.clone(),
            ts: bucket_end_ts,
            market_type,
            value,
            venue_breakdown,
            sources_used: sources_used.clone(),
            weights_used,
            fresh_sources_count: sources_used.len(),
            stale_sources_dropped: vec![],
            mismatch_detected: false,
            confidence_score,
            quality_flags: flags,
            provider: SmolStr::from(super::price::PROVIDER),
            meta: agg_meta(&bucket.last_meta, bucket_end_ts),
            kind: AggregateKind::Liquidations {
                unit,
                count: bucket.count,
                bucket_start_ts: bucket.start_ts,
                bucket_end_ts,
            },
        };

        self.registry
            .mark_agg_emitted(symbol, market_type, Metric::Flow, &sources_used, bucket_end_ts);
        self.bus.publish(BusEvent::new(
            Topic::MarketLiquidationsAgg,
            BusPayload::Aggregate(event),
        ));
    }
}
