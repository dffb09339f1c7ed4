//! Cumulative volume delta: per-venue bucketed calculation and
//! venue-consolidated aggregation with the mismatch-v1 flow detector.

use super::{SourceState, price::agg_meta};
use crate::{
    bus::EventBus,
    confidence::{ConfidenceInputs, compute_confidence_score},
    event::{
        AggregateEvent, AggregateKind, BusEvent, BusPayload, Cvd, CvdMismatch, CvdMismatchType,
        EventMeta, MarketType, QualityFlags, StreamId, Topic, Trade,
    },
    registry::{Metric, SourceRegistry, SuppressReason},
    symbol::Symbol,
    time::{Ts, bucket_start},
};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// ------------------------------------------------------------------------
// CvdCalculator
// ------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CvdCalcConfig {
    pub bucket_ms: i64,
    /// Verbose per-trade logging (`BOT_CVD_DEBUG`).
    pub debug: bool,
}

impl Default for CvdCalcConfig {
    fn default() -> Self {
        Self {
            bucket_ms: 60_000,
            debug: false,
        }
    }
}

#[derive(Clone, Debug)]
struct CvdState {
    bucket_start: Ts,
    delta: f64,
    total: f64,
    last_meta: EventMeta,
}

/// Per-(symbol, market type, stream) signed-volume bucket accumulator.
/// The previous bucket is emitted on the first trade of a newer bucket.
pub struct CvdCalculator {
    bus: Arc<EventBus>,
    config: CvdCalcConfig,
    state: Mutex<FnvHashMap<(Symbol, MarketType, StreamId), CvdState>>,
}

impl CvdCalculator {
    pub fn attach(bus: Arc<EventBus>, config: CvdCalcConfig) -> Arc<Self> {
        let calculator = Arc::new(Self {
            bus: Arc::clone(&bus),
            config,
            state: Mutex::new(FnvHashMap::default()),
        });

        let handler = Arc::clone(&calculator);
        bus.subscribe(Topic::MarketTrade, "calc:cvd", move |event| {
            if let BusPayload::Trade(trade) = &event.payload {
                handler.on_trade(trade);
            }
            Ok(())
        });
        calculator
    }

    fn on_trade(&self, trade: &Trade) {
        eprintln!("DEBUG on_trade enter ts={}", trade.meta.ts_event);
        let Some(side) = trade.side else {
            return;
        };
        if trade.market_type == MarketType::Unknown {
            return;
        }
        let signed = side.sign() * trade.size;
        let event_bucket = bucket_start(trade.meta.ts_event, self.config.bucket_ms);
        let key = (
            trade.symbol.clone(),
            trade.market_type,
            trade.meta.stream_id.clone(),
        );

        eprintln!("DEBUG on_trade before lock");
        let emitted = {
            let mut state = self.state.lock();
            eprintln!("DEBUG on_trade locked state");
            match state.get_mut(&key) {
                None => {
                    state.insert(
                        key,
                        CvdState {
                            bucket_start: event_bucket,
                            delta: signed,
                            total: signed,
                            last_meta: trade.meta.clone(),
                        },
                    );
                    None
                }
                Some(entry) if event_bucket > entry.bucket_start => {
                    // First trade of a newer bucket: emit the previous one
                    let emitted = self.bucket_event(trade, entry);
                    entry.bucket_start = event_bucket;
                    entry.delta = signed;
                    entry.total += signed;
                    entry.last_meta = trade.meta.clone();
                    Some(emitted)
                }
                Some(entry) => {
                    // Same bucket, or a late straggler folded into it
                    entry.delta += signed;
                    entry.total += signed;
                    entry.last_meta = trade.meta.clone();
                    None
                }
            }
        };

        if let Some(event) = emitted {
            if self.config.debug {
                debug!(
                    symbol = %event.symbol,
                    stream = %event.meta.stream_id,
                    delta = event.cvd_delta,
                    total = event.cvd_total,
                    "cvd bucket closed"
                );
            }
            let topic = match event.market_type {
                MarketType::Spot => Topic::MarketCvdSpot,
                _ => Topic::MarketCvdFutures,
            };
            eprintln!("DEBUG on_trade before publish");
            self.bus.publish(BusEvent::new(topic, BusPayload::Cvd(event)));
            eprintln!("DEBUG on_trade after publish");
        }
        eprintln!("DEBUG on_trade exit");
    }

    fn bucket_event(&self, trade: &Trade, state: &CvdState) -> Cvd {
        let bucket_end = state.bucket_start + self.config.bucket_ms;
        Cvd {
            symbol: trade.symbol.clone(),
            market_type: trade.market_type,
            cvd_delta: state.delta,
            cvd_total: state.total,
            bucket_start_ts: state.bucket_start,
            bucket_end_ts: bucket_end,
            bucket_size_ms: self.config.bucket_ms,
            unit: SmolStr::from("base"),
            meta: state.last_meta.inherit(
                bucket_end,
                state.last_meta.ts_ingest,
                state.last_meta.source.as_str(),
                state.last_meta.stream_id.clone(),
            ),
        }
    }
}

// ------------------------------------------------------------------------
// Mismatch-v1 detector
// ------------------------------------------------------------------------

/// Tuning for the per-bucket flow mismatch detector
/// (`BOT_CVD_MISMATCH_*` environment set).
#[derive(Clone, Debug)]
pub struct CvdMismatchPolicy {
    pub ewma_alpha: f64,
    pub min_ewma_abs: f64,
    pub min_abs_scaled: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    pub sign_agreement_threshold: f64,
    pub z_thresh: f64,
    pub z_max: f64,
    pub ratio_thresh: f64,
    pub ratio_max: f64,
    pub penalty_sign: f64,
    pub penalty_dispersion: f64,
}

impl Default for CvdMismatchPolicy {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.2,
            min_ewma_abs: 1e-9,
            min_abs_scaled: 1.0,
            min_scale: 0.25,
            max_scale: 4.0,
            sign_agreement_threshold: 0.6,
            z_thresh: 3.5,
            z_max: 8.0,
            ratio_thresh: 10.0,
            ratio_max: 30.0,
            penalty_sign: 0.5,
            penalty_dispersion: 0.7,
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Evaluate the per-bucket flow mismatch over per-venue `cvd_delta` values.
///
/// Each venue's raw delta is rescaled to the median activity level
/// (`clamp(median_ewma / stream_ewma, min_scale, max_scale)`), then checked
/// for sign disagreement and, failing that, robust dispersion (median + MAD
/// z-score and max/median absolute ratio).
pub fn evaluate_cvd_mismatch_v1(
    deltas: &BTreeMap<StreamId, f64>,
    ewma: &BTreeMap<StreamId, f64>,
    policy: &CvdMismatchPolicy,
) -> Option<CvdMismatch> {
    if deltas.len() < 2 {
        return None;
    }

    let mut ewma_values: Vec<f64> = deltas
        .keys()
        .map(|stream| ewma.get(stream).copied().unwrap_or(0.0).max(policy.min_ewma_abs))
        .collect();
    let median_ewma = median(&mut ewma_values).max(policy.min_ewma_abs);

    let scaled: BTreeMap<&StreamId, f64> = deltas
        .iter()
        .map(|(stream, delta)| {
            let stream_ewma = ewma
                .get(stream)
                .copied()
                .unwrap_or(0.0)
                .max(policy.min_ewma_abs);
            let scale = (median_ewma / stream_ewma).clamp(policy.min_scale, policy.max_scale);
            (stream, delta * scale)
        })
        .collect();

    // Sign agreement over venues with meaningful scaled flow
    let qualifying: Vec<f64> = scaled
        .values()
        .copied()
        .filter(|value| value.abs() >= policy.min_abs_scaled)
        .collect();
    if qualifying.len() >= 2 {
        let positive = qualifying.iter().filter(|value| **value > 0.0).count();
        let negative = qualifying.len() - positive;
        let agreement = positive.max(negative) as f64 / qualifying.len() as f64;
        if agreement < policy.sign_agreement_threshold {
            return Some(CvdMismatch {
                mismatch_type: CvdMismatchType::Sign,
                severity: 1.0 - agreement,
                confidence_penalty: policy.penalty_sign,
                sign_agreement: agreement,
                max_abs_z: 0.0,
                max_median_ratio: 0.0,
            });
        }
    }

    // Robust dispersion: median + MAD z-score, and max/median absolute ratio
    let values: Vec<f64> = scaled.values().copied().collect();
    let mut sorted = values.clone();
    let med = median(&mut sorted);
    let mut abs_devs: Vec<f64> = values.iter().map(|value| (value - med).abs()).collect();
    let mad = median(&mut abs_devs);
    let spread = (mad * 1.4826).max(policy.min_ewma_abs);
    let max_abs_z = values
        .iter()
        .map(|value| (value - med).abs() / spread)
        .fold(0.0f64, f64::max);

    let mut abs_values: Vec<f64> = values.iter().map(|value| value.abs()).collect();
    let median_abs = median(&mut abs_values).max(policy.min_ewma_abs);
    let max_abs = values.iter().map(|value| value.abs()).fold(0.0f64, f64::max);
    let max_median_ratio = max_abs / median_abs;

    if max_abs_z >= policy.z_thresh || max_median_ratio >= policy.ratio_thresh {
        let z_severity =
            ((max_abs_z - policy.z_thresh) / (policy.z_max - policy.z_thresh)).clamp(0.0, 1.0);
        let ratio_severity = ((max_median_ratio - policy.ratio_thresh)
            / (policy.ratio_max - policy.ratio_thresh))
            .clamp(0.0, 1.0);
        let severity = z_severity.max(ratio_severity);
        return Some(CvdMismatch {
            mismatch_type: CvdMismatchType::Dispersion,
            severity,
            confidence_penalty: 1.0 - severity * (1.0 - policy.penalty_dispersion),
            sign_agreement: 1.0,
            max_abs_z,
            max_median_ratio,
        });
    }

    None
}

// ------------------------------------------------------------------------
// CvdAggregator
// ------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
struct CvdPoint {
    delta: f64,
    total: f64,
    bucket_start_ts: Ts,
    bucket_end_ts: Ts,
    bucket_size_ms: i64,
}

#[derive(Default)]
struct CvdAggState {
    latest: BTreeMap<StreamId, SourceState<CvdPoint>>,
    ewma: BTreeMap<StreamId, f64>,
}

#[derive(Clone, Debug)]
pub struct CvdAggConfig {
    pub ttl_ms: i64,
    pub weights: BTreeMap<StreamId, f64>,
}

impl Default for CvdAggConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 180_000,
            weights: BTreeMap::new(),
        }
    }
}

/// Venue-consolidated CVD: weighted-sum running totals plus the mismatch-v1
/// per-bucket detector.
pub struct CvdAggregator {
    bus: Arc<EventBus>,
    registry: Arc<SourceRegistry>,
    config: CvdAggConfig,
    policy: CvdMismatchPolicy,
    state: Mutex<FnvHashMap<(Symbol, MarketType), CvdAggState>>,
}

impl CvdAggregator {
    pub fn attach(
        bus: Arc<EventBus>,
        registry: Arc<SourceRegistry>,
        config: CvdAggConfig,
        policy: CvdMismatchPolicy,
    ) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            bus: Arc::clone(&bus),
            registry,
            config,
            policy,
            state: Mutex::new(FnvHashMap::default()),
        });

        for (topic, id) in [
            (Topic::MarketCvdSpot, "agg:cvd_spot"),
            (Topic::MarketCvdFutures, "agg:cvd_futures"),
        ] {
            let handler = Arc::clone(&aggregator);
            bus.subscribe(topic, id, move |event| {
                if let BusPayload::Cvd(cvd) = &event.payload {
                    handler.on_cvd(cvd);
                }
                Ok(())
            });
        }
        aggregator
    }

    fn on_cvd(&self, cvd: &Cvd) {
        if cvd.market_type == MarketType::Unknown {
            return;
        }
        let key = (cvd.symbol.clone(), cvd.market_type);
        let now_ts = cvd.meta.ts_event;
        let stream_id = cvd.meta.stream_id.clone();

        let mut state = self.state.lock();
        let entry = state.entry(key).or_default();

        // EWMA of |cvd_delta| per stream, seeded on first observation
        let ewma = entry
            .ewma
            .entry(stream_id.clone())
            .or_insert(cvd.cvd_delta.abs());
        *ewma = self.policy.ewma_alpha * cvd.cvd_delta.abs()
            + (1.0 - self.policy.ewma_alpha) * *ewma;

        entry.latest.insert(
            stream_id,
            SourceState {
                ts: now_ts,
                value: CvdPoint {
                    delta: cvd.cvd_delta,
                    total: cvd.cvd_total,
                    bucket_start_ts: cvd.bucket_start_ts,
                    bucket_end_ts: cvd.bucket_end_ts,
                    bucket_size_ms: cvd.bucket_size_ms,
                },
            },
        );

        // Weighted-sum totals over fresh streams, stream-sorted
        let mut venue_breakdown = BTreeMap::new();
        let mut weights_used = BTreeMap::new();
        let mut sources_used = Vec::new();
        let mut stale_sources_dropped = Vec::new();
        let mut total = 0.0;
        let mut bucket_deltas: BTreeMap<StreamId, f64> = BTreeMap::new();

        for (stream, source) in &entry.latest {
            if now_ts - source.ts > self.config.ttl_ms {
                stale_sources_dropped.push(stream.clone());
                continue;
            }
            let weight = self.config.weights.get(stream).copied().unwrap_or(1.0);
            total += source.value.total * weight;
            venue_breakdown.insert(stream.clone(), source.value.total);
            weights_used.insert(stream.clone(), weight);
            sources_used.push(stream.clone());
            if source.value.bucket_start_ts == cvd.bucket_start_ts {
                bucket_deltas.insert(stream.clone(), source.value.delta);
            }
        }

        if sources_used.is_empty() {
            self.registry.record_suppression(
                &cvd.symbol,
                cvd.market_type,
                Metric::Flow,
                SuppressReason::StaleInput,
            );
            return;
        }

        let mismatch = evaluate_cvd_mismatch_v1(&bucket_deltas, &entry.ewma, &self.policy);

        entry
            .latest
            .retain(|_, source| now_ts - source.ts <= self.config.ttl_ms);
        drop(state);

        let flags = QualityFlags {
            source_penalty: mismatch.as_ref().map(|m| m.confidence_penalty),
            ..Default::default()
        };
        let inputs = ConfidenceInputs {
            fresh_sources_count: sources_used.len(),
            expected_sources: self.registry.expected(&cvd.symbol, cvd.market_type, Metric::Flow),
            stale_sources_dropped_count: Some(stale_sources_dropped.len()),
            source_penalty: flags.source_penalty,
            ..Default::default()
        };
        let confidence_score = compute_confidence_score(&inputs).score;

        let event = AggregateEvent {
            symbol: cvd.symbol.clone(),
            ts: now_ts,
            market_type: cvd.market_type,
            value: total,
            venue_breakdown,
            sources_used: sources_used.clone(),
            weights_used,
            fresh_sources_count: sources_used.len(),
            stale_sources_dropped,
            mismatch_detected: mismatch.is_some(),
            confidence_score,
            quality_flags: flags,
            provider: SmolStr::from(super::price::PROVIDER),
            meta: agg_meta(&cvd.meta, now_ts),
            kind: AggregateKind::Cvd {
                cvd_total: total,
                bucket_start_ts: cvd.bucket_start_ts,
                bucket_end_ts: cvd.bucket_end_ts,
                bucket_size_ms: cvd.bucket_size_ms,
                mismatch,
            },
        };

        self.registry.mark_agg_emitted(
            &cvd.symbol,
            cvd.market_type,
            Metric::Flow,
            &sources_used,
            now_ts,
        );
        let topic = match cvd.market_type {
            MarketType::Spot => Topic::MarketCvdSpotAgg,
            _ => Topic::MarketCvdFuturesAgg,
        };
        self.bus.publish(BusEvent::new(topic, BusPayload::Aggregate(event)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Side;
    use parking_lot::Mutex as PMutex;

    fn trade(stream: &str, ts: i64, side: Side, size: f64) -> Trade {
        Trade {
            symbol: Symbol::from("BTCUSDT"),
            market_type: MarketType::Futures,
            side: Some(side),
            price: 100.0,
            size,
            meta: EventMeta::new(ts, ts + 1, "test", StreamId::from(stream)),
        }
    }

    fn stream(id: &str) -> StreamId {
        StreamId::from(id)
    }

    #[test]
    fn test_calculator_emits_previous_bucket_on_rollover() {
        let bus = Arc::new(EventBus::new());
        let _calculator = CvdCalculator::attach(
            Arc::clone(&bus),
            CvdCalcConfig {
                bucket_ms: 60_000,
                debug: false,
            },
        );

        let sink = Arc::new(PMutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        bus.subscribe(Topic::MarketCvdFutures, "test:collector", move |event| {
            if let BusPayload::Cvd(cvd) = &event.payload {
                captured.lock().push(cvd.clone());
            }
            Ok(())
        });

        let publish = |t: Trade| {
            bus.publish(BusEvent::new(Topic::MarketTrade, BusPayload::Trade(t)));
        };

        publish(trade("binance.futures.usd", 10_000, Side::Buy, 2.0));
        publish(trade("binance.futures.usd", 20_000, Side::Sell, 0.5));
        assert!(sink.lock().is_empty());

        // First trade of the next bucket closes [0, 60_000)
        publish(trade("binance.futures.usd", 61_000, Side::Buy, 1.0));

        let events = sink.lock();
        assert_eq!(events.len(), 1);
        let cvd = &events[0];
        assert_eq!(cvd.bucket_start_ts, 0);
        assert_eq!(cvd.bucket_end_ts, 60_000);
        assert_eq!(cvd.bucket_end_ts - cvd.bucket_start_ts, cvd.bucket_size_ms);
        assert!((cvd.cvd_delta - 1.5).abs() < 1e-12);
        assert!((cvd.cvd_total - 1.5).abs() < 1e-12);
        assert_eq!(cvd.unit, "base");

        // Trade without a side contributes nothing
        let mut no_side = trade("binance.futures.usd", 62_000, Side::Buy, 5.0);
        no_side.side = None;
        publish(no_side);
        publish(trade("binance.futures.usd", 121_000, Side::Buy, 0.25));
        let events = sink.lock();
        let last = events.last().unwrap();
        assert!((last.cvd_delta - 1.0).abs() < 1e-12);
        // Running total carries across buckets: 1.5 + 1.0
        assert!((last.cvd_total - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_mismatch_v1_sign() {
        let policy = CvdMismatchPolicy::default();
        let deltas = BTreeMap::from([
            (stream("binance.futures.usd"), 10.0),
            (stream("okx.public.swap"), -10.0),
        ]);
        let ewma = BTreeMap::from([
            (stream("binance.futures.usd"), 10.0),
            (stream("okx.public.swap"), 10.0),
        ]);

        let mismatch = evaluate_cvd_mismatch_v1(&deltas, &ewma, &policy).unwrap();
        assert_eq!(mismatch.mismatch_type, CvdMismatchType::Sign);
        assert!((mismatch.sign_agreement - 0.5).abs() < 1e-12);
        assert_eq!(mismatch.confidence_penalty, policy.penalty_sign);
    }

    #[test]
    fn test_mismatch_v1_dispersion() {
        let policy = CvdMismatchPolicy::default();
        let deltas = BTreeMap::from([
            (stream("binance.futures.usd"), 10.0),
            (stream("okx.public.swap"), 11.0),
            (stream("bybit.public.linear.v5"), 500.0),
        ]);
        let ewma = BTreeMap::from([
            (stream("binance.futures.usd"), 10.0),
            (stream("okx.public.swap"), 10.0),
            (stream("bybit.public.linear.v5"), 10.0),
        ]);

        let mismatch = evaluate_cvd_mismatch_v1(&deltas, &ewma, &policy).unwrap();
        assert_eq!(mismatch.mismatch_type, CvdMismatchType::Dispersion);
        assert!(mismatch.severity > 0.99);
        assert!((mismatch.confidence_penalty - policy.penalty_dispersion).abs() < 1e-9);
    }

    #[test]
    fn test_mismatch_v1_agreeing_flows_pass() {
        let policy = CvdMismatchPolicy::default();
        let deltas = BTreeMap::from([
            (stream("binance.futures.usd"), 10.0),
            (stream("okx.public.swap"), 12.0),
            (stream("bybit.public.linear.v5"), 9.0),
        ]);
        let ewma = BTreeMap::from([
            (stream("binance.futures.usd"), 10.0),
            (stream("okx.public.swap"), 10.0),
            (stream("bybit.public.linear.v5"), 10.0),
        ]);

        assert_eq!(evaluate_cvd_mismatch_v1(&deltas, &ewma, &policy), None);
    }

    #[test]
    fn test_mismatch_v1_scales_by_activity() {
        // okx's flow is 10x binance's typical activity; after rescaling to
        // the median EWMA its delta shrinks and no dispersion fires.
        let policy = CvdMismatchPolicy {
            max_scale: 10.0,
            min_scale: 0.1,
            ..Default::default()
        };
        let deltas = BTreeMap::from([
            (stream("binance.futures.usd"), 10.0),
            (stream("okx.public.swap"), 100.0),
        ]);
        let ewma = BTreeMap::from([
            (stream("binance.futures.usd"), 10.0),
            (stream("okx.public.swap"), 100.0),
        ]);

        assert_eq!(evaluate_cvd_mismatch_v1(&deltas, &ewma, &policy), None);
    }

    #[test]
    fn test_aggregator_weighted_sum_and_mismatch_flag() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(SourceRegistry::new());
        let _aggregator = CvdAggregator::attach(
            Arc::clone(&bus),
            registry,
            CvdAggConfig::default(),
            CvdMismatchPolicy::default(),
        );

        let sink = Arc::new(PMutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        bus.subscribe(Topic::MarketCvdFuturesAgg, "test:collector", move |event| {
            if let BusPayload::Aggregate(aggregate) = &event.payload {
                captured.lock().push(aggregate.clone());
            }
            Ok(())
        });

        let cvd = |stream: &str, delta: f64, total: f64| Cvd {
            symbol: Symbol::from("BTCUSDT"),
            market_type: MarketType::Futures,
            cvd_delta: delta,
            cvd_total: total,
            bucket_start_ts: 0,
            bucket_end_ts: 60_000,
            bucket_size_ms: 60_000,
            unit: SmolStr::from("base"),
            meta: EventMeta::new(60_000, 60_001, "test", StreamId::from(stream)),
        };

        bus.publish(BusEvent::new(
            Topic::MarketCvdFutures,
            BusPayload::Cvd(cvd("binance.futures.usd", 10.0, 10.0)),
        ));
        bus.publish(BusEvent::new(
            Topic::MarketCvdFutures,
            BusPayload::Cvd(cvd("okx.public.swap", -10.0, -10.0)),
        ));

        let events = sink.lock();
        assert_eq!(events.len(), 2);
        let last = &events[1];
        // Weighted sum of totals: 10 + (-10)
        assert!((last.value - 0.0).abs() < 1e-12);
        assert_eq!(last.fresh_sources_count, 2);
        // Opposite signs at equal activity: SIGN mismatch
        assert!(last.mismatch_detected);
        let AggregateKind::Cvd { mismatch, .. } = &last.kind else {
            panic!("expected cvd kind");
        };
        let mismatch = mismatch.as_ref().unwrap();
        assert_eq!(mismatch.mismatch_type, CvdMismatchType::Sign);
        // confidence = base 1.0 * penalty 0.5
        assert!((last.confidence_score - 0.5).abs() < 1e-12);
    }
}
