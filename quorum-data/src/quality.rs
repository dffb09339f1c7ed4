//! Quality monitor: stale and mismatch detection over aggregated events,
//! degraded/recovered transitions, and confidence re-emission.
//!
//! The monitor is purely reactive plus an externally driven `on_tick`; it
//! never sleeps, so its computation stays synchronous with the triggering
//! event (the server wiring owns the tick cadence).

use crate::{
    bus::EventBus,
    confidence::ConfidenceInputs,
    event::{
        AggregateEvent, BusEvent, BusPayload, DegradeReason, MarketType, OiUnit, OpenInterest,
        QualityEvent, QualityKind, StreamId, Topic,
    },
    symbol::Symbol,
    time::Ts,
};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Baseline strategy for open-interest mismatch comparison.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OiBaseline {
    Bybit,
    Median,
}

/// Stale/mismatch policy. Pure data with compile-time defaults.
#[derive(Clone, Debug)]
pub struct QualityPolicy {
    pub expected_interval_ms: BTreeMap<Topic, i64>,
    pub default_expected_interval_ms: i64,
    pub stale_multiplier: f64,
    pub startup_grace_ms: i64,
    pub min_samples: u32,
    pub log_throttle_ms: i64,
    pub mismatch_threshold: f64,
    pub mismatch_abs_threshold: f64,
    pub mismatch_baseline_epsilon: f64,
    pub mismatch_window_ms: i64,
    pub oi_baseline: OiBaseline,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            expected_interval_ms: BTreeMap::from([
                (Topic::MarketPriceCanonical, 5_000),
                (Topic::MarketPriceIndex, 5_000),
                (Topic::MarketFundingAgg, 60_000),
                (Topic::MarketOiAgg, 30_000),
                (Topic::MarketLiquidityAgg, 5_000),
                (Topic::MarketCvdSpotAgg, 120_000),
                (Topic::MarketCvdFuturesAgg, 120_000),
            ]),
            default_expected_interval_ms: 30_000,
            stale_multiplier: 3.0,
            startup_grace_ms: 30_000,
            min_samples: 3,
            log_throttle_ms: 60_000,
            mismatch_threshold: 0.01,
            mismatch_abs_threshold: 1.0,
            mismatch_baseline_epsilon: 1e-9,
            mismatch_window_ms: 5_000,
            oi_baseline: OiBaseline::Bybit,
        }
    }
}

impl QualityPolicy {
    fn expected_interval(&self, topic: Topic) -> i64 {
        self.expected_interval_ms
            .get(&topic)
            .copied()
            .unwrap_or(self.default_expected_interval_ms)
    }

    fn stale_threshold(&self, topic: Topic) -> i64 {
        let expected = self.expected_interval(topic);
        expected.max((expected as f64 * self.stale_multiplier) as i64)
    }
}

/// Aggregated topics the monitor watches.
const WATCHED_TOPICS: [Topic; 9] = [
    Topic::MarketPriceCanonical,
    Topic::MarketPriceIndex,
    Topic::MarketFundingAgg,
    Topic::MarketOiAgg,
    Topic::MarketLiquidationsAgg,
    Topic::MarketLiquidityAgg,
    Topic::MarketCvdSpotAgg,
    Topic::MarketCvdFuturesAgg,
    Topic::MarketOiRaw,
];

#[derive(Debug, Default)]
struct KeyState {
    first_seen_ts: Option<Ts>,
    last_ts: Option<Ts>,
    samples: u32,
    market_type: Option<MarketType>,
    mismatch_above_since: Option<Ts>,
    degraded: Option<DegradeReason>,
    last_error_ts: Option<Ts>,
    last_stale_log_ts: Option<Ts>,
    stale_flagged: bool,
}

#[derive(Debug, Clone, Copy)]
struct RawOiSample {
    ts: Ts,
    value: f64,
    unit: OiUnit,
    usd: Option<f64>,
}

type Key = (Topic, Symbol, SmolStr);

pub struct QualityMonitor {
    bus: Arc<EventBus>,
    policy: QualityPolicy,
    keys: Mutex<FnvHashMap<Key, KeyState>>,
    raw_oi: Mutex<FnvHashMap<(Symbol, MarketType), BTreeMap<StreamId, RawOiSample>>>,
}

impl QualityMonitor {
    pub fn attach(bus: Arc<EventBus>, policy: QualityPolicy) -> Arc<Self> {
        let monitor = Arc::new(Self {
            bus: Arc::clone(&bus),
            policy,
            keys: Mutex::new(FnvHashMap::default()),
            raw_oi: Mutex::new(FnvHashMap::default()),
        });

        for topic in WATCHED_TOPICS {
            let handler = Arc::clone(&monitor);
            bus.subscribe(topic, "quality:monitor", move |event| {
                handler.on_event(event);
                Ok(())
            });
        }
        monitor
    }

    fn on_event(&self, event: &BusEvent) {
        match (&event.payload, event.topic) {
            (BusPayload::OpenInterestRaw(raw), Topic::MarketOiRaw) => {
                if let Ok(value) = raw.open_interest.parse::<f64>() {
                    self.raw_oi
                        .lock()
                        .entry((raw.symbol.clone(), raw.market_type))
                        .or_default()
                        .insert(
                            raw.meta.stream_id.clone(),
                            RawOiSample {
                                ts: raw.meta.ts_event,
                                value,
                                unit: raw.unit,
                                usd: raw
                                    .open_interest_usd
                                    .as_deref()
                                    .and_then(|raw| raw.parse::<f64>().ok()),
                            },
                        );
                }
            }
            (BusPayload::Aggregate(aggregate), topic) => self.on_aggregate(topic, aggregate),
            _ => {}
        }
    }

    fn on_aggregate(&self, topic: Topic, aggregate: &AggregateEvent) {
        let key: Key = (
            topic,
            aggregate.symbol.clone(),
            SmolStr::from(aggregate.provider.as_str()),
        );
        let now_ts = aggregate.ts;

        // Confidence re-emission with inputs derived from the quality flags
        self.emit(QualityEvent {
            symbol: aggregate.symbol.clone(),
            market_type: aggregate.market_type,
            observed_topic: topic,
            provider: aggregate.provider.clone(),
            ts: now_ts,
            kind: QualityKind::Confidence {
                score: aggregate.confidence_score,
                inputs: derive_confidence_inputs(aggregate),
            },
        });

        let mut mismatch_now = if topic == Topic::MarketOiAgg {
            self.oi_mismatch(aggregate, now_ts)
        } else {
            self.generic_mismatch(topic, aggregate, now_ts)
        };

        // A suppressed OI diagnostic is surfaced immediately but is never a
        // mismatch: it must not open the window or degrade the key.
        if matches!(mismatch_now, Some(QualityKind::MismatchSuppressed { .. })) {
            if let Some(kind) = mismatch_now.take() {
                self.emit(QualityEvent {
                    symbol: aggregate.symbol.clone(),
                    market_type: aggregate.market_type,
                    observed_topic: topic,
                    provider: aggregate.provider.clone(),
                    ts: now_ts,
                    kind,
                });
            }
        }

        let mut keys = self.keys.lock();
        let state = keys.entry(key).or_default();
        state.first_seen_ts.get_or_insert(now_ts);
        state.samples += 1;
        state.last_ts = Some(now_ts);
        state.market_type = Some(aggregate.market_type);

        // Mismatch window accounting
        let mismatch_held = match mismatch_now {
            Some(_) => {
                let since = *state.mismatch_above_since.get_or_insert(now_ts);
                now_ts - since >= self.policy.mismatch_window_ms
            }
            None => {
                state.mismatch_above_since = None;
                false
            }
        };

        if mismatch_held {
            if let Some(kind) = mismatch_now {
                state.degraded = Some(DegradeReason::Mismatch);
                state.last_error_ts = Some(now_ts);
                drop(keys);
                self.emit(QualityEvent {
                    symbol: aggregate.symbol.clone(),
                    market_type: aggregate.market_type,
                    observed_topic: topic,
                    provider: aggregate.provider.clone(),
                    ts: now_ts,
                    kind,
                });
                self.emit_degraded(topic, aggregate, DegradeReason::Mismatch, now_ts);
                return;
            }
        }

        // Recovery: fresh event, no live mismatch and no stale flag
        if state.degraded.is_some() && !state.stale_flagged && mismatch_now.is_none() {
            let last_error_ts = state.last_error_ts;
            state.degraded = None;
            drop(keys);
            self.emit(QualityEvent {
                symbol: aggregate.symbol.clone(),
                market_type: aggregate.market_type,
                observed_topic: topic,
                provider: aggregate.provider.clone(),
                ts: now_ts,
                kind: QualityKind::Recovered { last_error_ts },
            });
        }
    }

    /// Periodic stale sweep. `now_ts` comes from the caller's clock so the
    /// monitor itself never reads wall time.
    pub fn on_tick(&self, now_ts: Ts) {
        let mut stale_events = Vec::new();
        {
            let mut keys = self.keys.lock();
            for ((topic, symbol, provider), state) in keys.iter_mut() {
                let market_type = state.market_type.unwrap_or(MarketType::Unknown);
                let Some(last_ts) = state.last_ts else {
                    continue;
                };
                let Some(first_seen) = state.first_seen_ts else {
                    continue;
                };
                if now_ts - first_seen < self.policy.startup_grace_ms {
                    continue;
                }
                if state.samples < self.policy.min_samples {
                    continue;
                }
                let threshold = self.policy.stale_threshold(*topic);
                if now_ts - last_ts > threshold {
                    if !state.stale_flagged {
                        state.stale_flagged = true;
                        state.degraded = Some(DegradeReason::Stale);
                        state.last_error_ts = Some(now_ts);
                        stale_events.push((
                            *topic,
                            symbol.clone(),
                            provider.clone(),
                            market_type,
                            last_ts,
                            threshold,
                        ));
                    }
                    // Log once per throttle window
                    let should_log = state
                        .last_stale_log_ts
                        .is_none_or(|last| now_ts - last >= self.policy.log_throttle_ms);
                    if should_log {
                        state.last_stale_log_ts = Some(now_ts);
                        warn!(
                            topic = %topic,
                            symbol = %symbol,
                            age_ms = now_ts - last_ts,
                            threshold_ms = threshold,
                            "aggregate stale"
                        );
                    }
                } else {
                    state.stale_flagged = false;
                }
            }
        }

        for (topic, symbol, provider, market_type, last_ts, threshold) in stale_events {
            let expected = self.policy.expected_interval(topic);
            self.emit(QualityEvent {
                symbol: symbol.clone(),
                market_type,
                observed_topic: topic,
                provider: provider.clone(),
                ts: now_ts,
                kind: QualityKind::Stale {
                    last_ts,
                    stale_threshold_ms: threshold,
                    expected_interval_ms: expected,
                },
            });
            self.bus.publish(BusEvent::new(
                Topic::DataSourceDegraded,
                BusPayload::Quality(QualityEvent {
                    symbol,
                    market_type,
                    observed_topic: topic,
                    provider,
                    ts: now_ts,
                    kind: QualityKind::Degraded {
                        reason: DegradeReason::Stale,
                        since_ts: now_ts,
                    },
                }),
            ));
        }
    }

    /// Relative mismatch with an absolute-diff fallback near zero; requires
    /// at least two finite positive venues.
    fn generic_mismatch(
        &self,
        _topic: Topic,
        aggregate: &AggregateEvent,
        _now_ts: Ts,
    ) -> Option<QualityKind> {
        let finite: Vec<(&StreamId, f64)> = aggregate
            .venue_breakdown
            .iter()
            .map(|(stream, value)| (stream, *value))
            .filter(|(_, value)| value.is_finite() && *value > 0.0)
            .collect();
        if finite.len() < 2 {
            return None;
        }

        let (min_stream, min_value) = finite
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .copied()?;
        let (max_stream, max_value) = finite
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .copied()?;

        let baseline = min_value;
        let (diff, relative, above) = if baseline.abs() < self.policy.mismatch_baseline_epsilon {
            let diff = max_value - min_value;
            (diff, false, diff >= self.policy.mismatch_abs_threshold)
        } else {
            let diff = (max_value - min_value) / baseline.abs();
            (diff, true, diff >= self.policy.mismatch_threshold)
        };

        above.then(|| QualityKind::Mismatch {
            min_stream: min_stream.clone(),
            min_value,
            max_stream: max_stream.clone(),
            max_value,
            diff,
            relative,
            window_ms: self.policy.mismatch_window_ms,
        })
    }

    /// OI comparison restricted to comparable unit groups: prefer
    /// USD-equivalent values, fall back to `base`, never use `contracts`.
    fn oi_mismatch(&self, aggregate: &AggregateEvent, now_ts: Ts) -> Option<QualityKind> {
        let raw = self.raw_oi.lock();
        let samples = raw.get(&(aggregate.symbol.clone(), aggregate.market_type))?;

        let fresh: Vec<(&StreamId, &RawOiSample)> = samples
            .iter()
            .filter(|(_, sample)| now_ts - sample.ts <= self.policy.stale_threshold(Topic::MarketOiAgg))
            .collect();

        let usd_group: BTreeMap<&StreamId, f64> = fresh
            .iter()
            .filter_map(|(stream, sample)| sample.usd.map(|usd| (*stream, usd)))
            .collect();
        let base_group: BTreeMap<&StreamId, f64> = fresh
            .iter()
            .filter(|(_, sample)| sample.unit == OiUnit::Base)
            .map(|(stream, sample)| (*stream, sample.value))
            .collect();

        let group = if usd_group.len() >= 2 {
            usd_group
        } else if base_group.len() >= 2 {
            base_group
        } else {
            // Fewer than two comparable venues: suppressed diagnostic only
            let reason = if usd_group.is_empty() && base_group.is_empty() {
                "NO_COMPARABLE_UNITS"
            } else {
                "INSUFFICIENT_COMPARABLE_VENUES"
            };
            return Some(QualityKind::MismatchSuppressed {
                reason: SmolStr::from(reason),
            });
        };

        let baseline = match self.policy.oi_baseline {
            OiBaseline::Bybit => group
                .iter()
                .find(|(stream, _)| stream.contains("bybit"))
                .map(|(_, value)| *value),
            OiBaseline::Median => None,
        }
        .unwrap_or_else(|| {
            let mut values: Vec<f64> = group.values().copied().collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = values.len() / 2;
            if values.len() % 2 == 0 {
                (values[mid - 1] + values[mid]) / 2.0
            } else {
                values[mid]
            }
        });

        let (min_stream, min_value) = group
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(stream, value)| ((*stream).clone(), *value))?;
        let (max_stream, max_value) = group
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(stream, value)| ((*stream).clone(), *value))?;

        let (diff, relative, above) = if baseline.abs() < self.policy.mismatch_baseline_epsilon {
            let diff = max_value - min_value;
            (diff, false, diff >= self.policy.mismatch_abs_threshold)
        } else {
            let diff = (max_value - min_value) / baseline.abs();
            (diff, true, diff >= self.policy.mismatch_threshold)
        };

        above.then(|| QualityKind::Mismatch {
            min_stream,
            min_value,
            max_stream,
            max_value,
            diff,
            relative,
            window_ms: self.policy.mismatch_window_ms,
        })
    }

    fn emit_degraded(
        &self,
        topic: Topic,
        aggregate: &AggregateEvent,
        reason: DegradeReason,
        now_ts: Ts,
    ) {
        self.bus.publish(BusEvent::new(
            Topic::DataSourceDegraded,
            BusPayload::Quality(QualityEvent {
                symbol: aggregate.symbol.clone(),
                market_type: aggregate.market_type,
                observed_topic: topic,
                provider: aggregate.provider.clone(),
                ts: now_ts,
                kind: QualityKind::Degraded {
                    reason,
                    since_ts: now_ts,
                },
            }),
        ));
    }

    fn emit(&self, event: QualityEvent) {
        let topic = match &event.kind {
            QualityKind::Stale { .. } => Topic::DataStale,
            QualityKind::Mismatch { .. } | QualityKind::MismatchSuppressed { .. } => {
                Topic::DataMismatch
            }
            QualityKind::Confidence { .. } => Topic::DataConfidence,
            QualityKind::Degraded { .. } => Topic::DataSourceDegraded,
            QualityKind::Recovered { .. } => Topic::DataSourceRecovered,
        };
        self.bus.publish(BusEvent::new(topic, BusPayload::Quality(event)));
    }
}

/// Rebuild the confidence inputs from an emitted aggregate's flags.
fn derive_confidence_inputs(aggregate: &AggregateEvent) -> ConfidenceInputs {
    let flags = &aggregate.quality_flags;
    ConfidenceInputs {
        fresh_sources_count: aggregate.fresh_sources_count,
        expected_sources: None,
        stale_sources_dropped_count: Some(aggregate.stale_sources_dropped.len()),
        mismatch_detected: Some(aggregate.mismatch_detected),
        gap_detected: flags.gap_detected.then_some(true),
        sequence_broken: flags.sequence_broken.then_some(true),
        lag_detected: flags.lag_detected.then_some(true),
        outlier_detected: flags.outlier_detected.then_some(true),
        fallback_penalty: flags.fallback_penalty,
        source_penalty: flags.source_penalty,
        source_cap: flags.source_cap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AggregateKind, EventMeta, QualityFlags};
    use parking_lot::Mutex as PMutex;

    fn aggregate(breakdown: &[(&str, f64)], ts: Ts) -> AggregateEvent {
        let venue_breakdown: BTreeMap<StreamId, f64> = breakdown
            .iter()
            .map(|(stream, value)| (StreamId::from(*stream), *value))
            .collect();
        let sources_used: Vec<StreamId> = venue_breakdown.keys().cloned().collect();
        AggregateEvent {
            symbol: Symbol::from("BTCUSDT"),
            ts,
            market_type: MarketType::Futures,
            value: 100.0,
            weights_used: sources_used.iter().map(|s| (s.clone(), 1.0)).collect(),
            fresh_sources_count: sources_used.len(),
            sources_used,
            venue_breakdown,
            stale_sources_dropped: vec![],
            mismatch_detected: false,
            confidence_score: 1.0,
            quality_flags: QualityFlags::default(),
            provider: SmolStr::from("quorum"),
            meta: EventMeta::new(ts, ts + 1, "test", StreamId::from("test")),
            kind: AggregateKind::PriceIndex,
        }
    }

    fn capture(bus: &Arc<EventBus>, topic: Topic) -> Arc<PMutex<Vec<QualityEvent>>> {
        let sink = Arc::new(PMutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        bus.subscribe(topic, "test:quality", move |event| {
            if let BusPayload::Quality(quality) = &event.payload {
                captured.lock().push(quality.clone());
            }
            Ok(())
        });
        sink
    }

    fn publish_agg(bus: &Arc<EventBus>, event: AggregateEvent) {
        bus.publish(BusEvent::new(
            Topic::MarketPriceIndex,
            BusPayload::Aggregate(event),
        ));
    }

    #[test]
    fn test_confidence_reemitted_for_every_aggregate() {
        let bus = Arc::new(EventBus::new());
        let _monitor = QualityMonitor::attach(Arc::clone(&bus), QualityPolicy::default());
        let confidence = capture(&bus, Topic::DataConfidence);

        publish_agg(&bus, aggregate(&[("a", 100.0)], 1_000));
        let events = confidence.lock();
        assert_eq!(events.len(), 1);
        let QualityKind::Confidence { score, inputs } = &events[0].kind else {
            panic!("expected confidence kind");
        };
        assert_eq!(*score, 1.0);
        assert_eq!(inputs.fresh_sources_count, 1);
    }

    #[test]
    fn test_mismatch_requires_window() {
        let bus = Arc::new(EventBus::new());
        let policy = QualityPolicy {
            mismatch_threshold: 0.01,
            mismatch_window_ms: 5_000,
            ..Default::default()
        };
        let _monitor = QualityMonitor::attach(Arc::clone(&bus), policy);
        let mismatches = capture(&bus, Topic::DataMismatch);
        let degraded = capture(&bus, Topic::DataSourceDegraded);

        // 5% apart: above threshold but the window has not elapsed yet
        publish_agg(&bus, aggregate(&[("a", 100.0), ("b", 105.0)], 1_000));
        assert!(mismatches.lock().is_empty());

        // Still above after the window: mismatch + degraded
        publish_agg(&bus, aggregate(&[("a", 100.0), ("b", 105.0)], 7_000));
        {
            let events = mismatches.lock();
            assert_eq!(events.len(), 1);
            let QualityKind::Mismatch {
                min_value,
                max_value,
                relative,
                ..
            } = &events[0].kind
            else {
                panic!("expected mismatch kind");
            };
            assert_eq!(*min_value, 100.0);
            assert_eq!(*max_value, 105.0);
            assert!(*relative);
        }
        assert_eq!(degraded.lock().len(), 1);
    }

    #[test]
    fn test_mismatch_window_resets_when_below() {
        let bus = Arc::new(EventBus::new());
        let _monitor = QualityMonitor::attach(Arc::clone(&bus), QualityPolicy::default());
        let mismatches = capture(&bus, Topic::DataMismatch);

        publish_agg(&bus, aggregate(&[("a", 100.0), ("b", 105.0)], 1_000));
        // Converged again: window resets
        publish_agg(&bus, aggregate(&[("a", 100.0), ("b", 100.1)], 3_000));
        publish_agg(&bus, aggregate(&[("a", 100.0), ("b", 105.0)], 7_000));
        assert!(mismatches.lock().is_empty());
    }

    #[test]
    fn test_recovery_emitted_after_mismatch_clears() {
        let bus = Arc::new(EventBus::new());
        let _monitor = QualityMonitor::attach(Arc::clone(&bus), QualityPolicy::default());
        let recovered = capture(&bus, Topic::DataSourceRecovered);

        publish_agg(&bus, aggregate(&[("a", 100.0), ("b", 105.0)], 1_000));
        publish_agg(&bus, aggregate(&[("a", 100.0), ("b", 105.0)], 7_000));
        publish_agg(&bus, aggregate(&[("a", 100.0), ("b", 100.05)], 8_000));

        let events = recovered.lock();
        assert_eq!(events.len(), 1);
        let QualityKind::Recovered { last_error_ts } = &events[0].kind else {
            panic!("expected recovered kind");
        };
        assert_eq!(*last_error_ts, Some(7_000));
    }

    #[test]
    fn test_stale_detection_on_tick() {
        let bus = Arc::new(EventBus::new());
        let monitor = QualityMonitor::attach(
            Arc::clone(&bus),
            QualityPolicy {
                startup_grace_ms: 0,
                min_samples: 1,
                ..Default::default()
            },
        );
        let stale = capture(&bus, Topic::DataStale);

        publish_agg(&bus, aggregate(&[("a", 100.0)], 1_000));
        // price_index expected 5s, threshold 15s; 20s later with no events
        monitor.on_tick(21_000);

        let events = stale.lock();
        assert!(!events.is_empty());
        let QualityKind::Stale {
            last_ts,
            expected_interval_ms,
            ..
        } = &events[0].kind
        else {
            panic!("expected stale kind");
        };
        assert_eq!(*last_ts, 1_000);
        assert_eq!(*expected_interval_ms, 5_000);
    }

    #[test]
    fn test_oi_mismatch_suppressed_without_comparable_group() {
        let bus = Arc::new(EventBus::new());
        let policy = QualityPolicy {
            mismatch_window_ms: 0,
            ..Default::default()
        };
        let _monitor = QualityMonitor::attach(Arc::clone(&bus), policy);
        let mismatches = capture(&bus, Topic::DataMismatch);

        // Raw OI from a single contracts-unit venue only
        bus.publish(BusEvent::new(
            Topic::MarketOiRaw,
            BusPayload::OpenInterestRaw(crate::event::OpenInterestRaw {
                symbol: Symbol::from("BTCUSDT"),
                market_type: MarketType::Futures,
                open_interest: "50000".to_string(),
                unit: OiUnit::Contracts,
                open_interest_usd: None,
                meta: EventMeta::new(1_000, 1_001, "okx", StreamId::from("okx.public.swap")),
            }),
        ));

        let mut oi_agg = aggregate(&[("okx.public.swap", 50_000.0)], 1_500);
        oi_agg.kind = AggregateKind::OpenInterest {
            unit: OiUnit::Contracts,
            open_interest_value_usd: None,
        };
        bus.publish(BusEvent::new(Topic::MarketOiAgg, BusPayload::Aggregate(oi_agg)));

        let events = mismatches.lock();
        assert_eq!(events.len(), 1);
        let QualityKind::MismatchSuppressed { reason } = &events[0].kind else {
            panic!("expected suppressed kind, got {:?}", events[0].kind);
        };
        assert_eq!(reason, "NO_COMPARABLE_UNITS");
    }

    #[test]
    fn test_oi_mismatch_uses_usd_group_with_bybit_baseline() {
        let bus = Arc::new(EventBus::new());
        let policy = QualityPolicy {
            mismatch_window_ms: 0,
            mismatch_threshold: 0.01,
            ..Default::default()
        };
        let _monitor = QualityMonitor::attach(Arc::clone(&bus), policy);
        let mismatches = capture(&bus, Topic::DataMismatch);

        let raw = |stream: &str, usd: f64| {
            BusPayload::OpenInterestRaw(crate::event::OpenInterestRaw {
                symbol: Symbol::from("BTCUSDT"),
                market_type: MarketType::Futures,
                open_interest: "50000".to_string(),
                unit: OiUnit::Base,
                open_interest_usd: Some(usd.to_string()),
                meta: EventMeta::new(1_000, 1_001, "test", StreamId::from(stream)),
            })
        };
        bus.publish(BusEvent::new(Topic::MarketOiRaw, raw("bybit.public.linear.v5", 1_000_000.0)));
        bus.publish(BusEvent::new(Topic::MarketOiRaw, raw("okx.public.swap", 1_100_000.0)));

        let mut oi_agg = aggregate(
            &[("bybit.public.linear.v5", 50_000.0), ("okx.public.swap", 50_000.0)],
            1_500,
        );
        oi_agg.kind = AggregateKind::OpenInterest {
            unit: OiUnit::Base,
            open_interest_value_usd: None,
        };
        bus.publish(BusEvent::new(Topic::MarketOiAgg, BusPayload::Aggregate(oi_agg)));

        let events = mismatches.lock();
        assert_eq!(events.len(), 1);
        let QualityKind::Mismatch { diff, relative, .. } = &events[0].kind else {
            panic!("expected mismatch kind, got {:?}", events[0].kind);
        };
        assert!(*relative);
        // (1.1M - 1.0M) / bybit baseline 1.0M
        assert!((diff - 0.1).abs() < 1e-12);
    }
}
