//! Open interest aggregator with unit grouping.
//!
//! Venues disagree on the unit their OI figure is denominated in, so sources
//! are grouped by unit and only the dominant group (largest fresh count,
//! lexicographic unit tie-break) is consolidated. A `base`-unit result is
//! additionally converted to USD via the latest fresh canonical price.

use super::{
    AggregatorConfig, CanonicalPriceCache, LatestStore, SourceState, kernel_confidence,
    merge_scalar, price::agg_meta,
};
use crate::{
    bus::EventBus,
    event::{
        AggregateEvent, AggregateKind, BusEvent, BusPayload, MarketType, OiUnit, OpenInterest,
        QualityFlags, StreamId, Topic,
    },
    registry::{Metric, SourceRegistry, SuppressReason},
    time::Ts,
};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tuning for base -> USD conversion via the canonical price.
#[derive(Clone, Debug)]
pub struct OiConversionConfig {
    pub canonical_ttl_ms: i64,
    pub canonical_min_confidence: f64,
}

impl Default for OiConversionConfig {
    fn default() -> Self {
        Self {
            canonical_ttl_ms: 30_000,
            canonical_min_confidence: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct OiValue {
    value: f64,
    unit: OiUnit,
}

pub struct OpenInterestAggregator {
    bus: Arc<EventBus>,
    registry: Arc<SourceRegistry>,
    cache: Arc<CanonicalPriceCache>,
    config: AggregatorConfig,
    conversion: OiConversionConfig,
    store: Mutex<LatestStore<OiValue>>,
}

impl OpenInterestAggregator {
    pub fn attach(
        bus: Arc<EventBus>,
        registry: Arc<SourceRegistry>,
        cache: Arc<CanonicalPriceCache>,
        config: AggregatorConfig,
        conversion: OiConversionConfig,
    ) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            bus: Arc::clone(&bus),
            registry,
            cache,
            config,
            conversion,
            store: Mutex::new(LatestStore::default()),
        });

        let handler = Arc::clone(&aggregator);
        bus.subscribe(Topic::MarketOi, "agg:oi", move |event| {
            if let BusPayload::OpenInterest(oi) = &event.payload {
                handler.on_open_interest(oi);
            }
            Ok(())
        });
        aggregator
    }

    fn on_open_interest(&self, oi: &OpenInterest) {
        if oi.market_type == MarketType::Unknown {
            return;
        }
        let mut store = self.store.lock();
        store.update(
            &oi.symbol,
            oi.market_type,
            &oi.meta.stream_id,
            oi.meta.ts_event,
            OiValue {
                value: oi.open_interest,
                unit: oi.unit,
            },
        );

        let now_ts = oi.meta.ts_event;
        let Some(sources) = store.sources(&oi.symbol, oi.market_type) else {
            return;
        };

        // Group fresh sources by unit; track stale drops across all units
        let mut stale: Vec<StreamId> = Vec::new();
        let mut groups: BTreeMap<OiUnit, BTreeMap<StreamId, SourceState<f64>>> = BTreeMap::new();
        for (stream_id, state) in sources {
            if now_ts - state.ts > self.config.ttl_ms {
                stale.push(stream_id.clone());
                continue;
            }
            groups.entry(state.value.unit).or_default().insert(
                stream_id.clone(),
                SourceState {
                    ts: state.ts,
                    value: state.value.value,
                },
            );
        }

        let units_seen = groups.len();
        // Dominant group: largest fresh count; BTreeMap iteration makes the
        // tie-break lexicographic on the unit name.
        let Some((unit, group)) = groups
            .iter()
            .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(a.0)))
            .map(|(unit, group)| (*unit, group.clone()))
        else {
            self.registry.record_suppression(
                &oi.symbol,
                oi.market_type,
                Metric::Derivatives,
                SuppressReason::StaleInput,
            );
            return;
        };

        let Some(mut outcome) = merge_scalar(now_ts, &group, &self.config) else {
            self.registry.record_suppression(
                &oi.symbol,
                oi.market_type,
                Metric::Derivatives,
                SuppressReason::StaleInput,
            );
            return;
        };
        outcome.stale_sources_dropped = stale;

        let consistent_units = units_seen == 1;
        let flags = QualityFlags {
            consistent_units: Some(consistent_units),
            ..Default::default()
        };
        let expected = self
            .registry
            .expected(&oi.symbol, oi.market_type, Metric::Derivatives);
        let confidence_score = kernel_confidence(&outcome, expected, &flags);

        let open_interest_value_usd = if unit == OiUnit::Base {
            self.usd_conversion(&oi.symbol, oi.market_type, now_ts, outcome.value)
        } else {
            None
        };

        let event = AggregateEvent {
            symbol: oi.symbol.clone(),
            ts: now_ts,
            market_type: oi.market_type,
            value: outcome.value,
            venue_breakdown: outcome.venue_breakdown.clone(),
            sources_used: outcome.sources_used.clone(),
            weights_used: outcome.weights_used.clone(),
            fresh_sources_count: outcome.fresh_sources_count,
            stale_sources_dropped: outcome.stale_sources_dropped.clone(),
            mismatch_detected: outcome.mismatch_detected,
            confidence_score,
            quality_flags: flags,
            provider: SmolStr::from(super::price::PROVIDER),
            meta: agg_meta(&oi.meta, now_ts),
            kind: AggregateKind::OpenInterest {
                unit,
                open_interest_value_usd,
            },
        };

        self.registry.mark_agg_emitted(
            &oi.symbol,
            oi.market_type,
            Metric::Derivatives,
            &outcome.sources_used,
            now_ts,
        );
        store.prune_stale(&oi.symbol, oi.market_type, now_ts, self.config.ttl_ms);
        drop(store);

        self.bus
            .publish(BusEvent::new(Topic::MarketOiAgg, BusPayload::Aggregate(event)));
    }

    fn usd_conversion(
        &self,
        symbol: &crate::symbol::Symbol,
        market_type: MarketType,
        now_ts: Ts,
        open_interest: f64,
    ) -> Option<f64> {
        let canonical = self.cache.get(symbol, market_type)?;
        if now_ts - canonical.ts > self.conversion.canonical_ttl_ms {
            return None;
        }
        if canonical.confidence_score < self.conversion.canonical_min_confidence {
            return None;
        }
        Some(open_interest * canonical.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::CanonicalPriceEntry;
    use crate::event::EventMeta;
    use crate::symbol::Symbol;
    use parking_lot::Mutex as PMutex;

    fn oi(stream: &str, ts: i64, value: f64, unit: OiUnit) -> OpenInterest {
        OpenInterest {
            symbol: Symbol::from("BTCUSDT"),
            market_type: MarketType::Futures,
            open_interest: value,
            unit,
            open_interest_usd: None,
            meta: EventMeta::new(ts, ts + 1, "test", StreamId::from(stream)),
        }
    }

    fn setup() -> (
        Arc<EventBus>,
        Arc<CanonicalPriceCache>,
        Arc<PMutex<Vec<AggregateEvent>>>,
    ) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(SourceRegistry::new());
        let cache = CanonicalPriceCache::new();
        let _aggregator = OpenInterestAggregator::attach(
            Arc::clone(&bus),
            registry,
            Arc::clone(&cache),
            AggregatorConfig::default(),
            OiConversionConfig {
                canonical_ttl_ms: 10_000,
                canonical_min_confidence: 0.5,
            },
        );

        let sink = Arc::new(PMutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        bus.subscribe(Topic::MarketOiAgg, "test:collector", move |event| {
            if let BusPayload::Aggregate(aggregate) = &event.payload {
                captured.lock().push(aggregate.clone());
            }
            Ok(())
        });
        (bus, cache, sink)
    }

    #[test]
    fn test_dominant_unit_group_wins() {
        let (bus, _cache, sink) = setup();

        bus.publish(BusEvent::new(
            Topic::MarketOi,
            BusPayload::OpenInterest(oi("binance.futures.usd", 1_000, 50_000.0, OiUnit::Contracts)),
        ));
        bus.publish(BusEvent::new(
            Topic::MarketOi,
            BusPayload::OpenInterest(oi("okx.public.swap", 1_100, 51_000.0, OiUnit::Contracts)),
        ));
        bus.publish(BusEvent::new(
            Topic::MarketOi,
            BusPayload::OpenInterest(oi("bybit.public.linear.v5", 1_200, 49_000.0, OiUnit::Base)),
        ));

        let events = sink.lock();
        let last = events.last().unwrap();
        // Two contracts sources beat one base source
        let AggregateKind::OpenInterest { unit, .. } = &last.kind else {
            panic!("expected OI kind");
        };
        assert_eq!(*unit, OiUnit::Contracts);
        assert_eq!(last.fresh_sources_count, 2);
        assert_eq!(last.quality_flags.consistent_units, Some(false));
        assert!((last.value - 50_500.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_tie_break_lexicographic() {
        let (bus, _cache, sink) = setup();

        bus.publish(BusEvent::new(
            Topic::MarketOi,
            BusPayload::OpenInterest(oi("binance.futures.usd", 1_000, 50_000.0, OiUnit::Contracts)),
        ));
        bus.publish(BusEvent::new(
            Topic::MarketOi,
            BusPayload::OpenInterest(oi("bybit.public.linear.v5", 1_100, 49_000.0, OiUnit::Base)),
        ));

        let events = sink.lock();
        let last = events.last().unwrap();
        // 1 vs 1: "base" < "contracts" lexicographically
        let AggregateKind::OpenInterest { unit, .. } = &last.kind else {
            panic!("expected OI kind");
        };
        assert_eq!(*unit, OiUnit::Base);
    }

    #[test]
    fn test_base_unit_usd_conversion_gated_on_canonical() {
        let (bus, cache, sink) = setup();
        let symbol = Symbol::from("BTCUSDT");

        // No canonical price yet: no conversion
        bus.publish(BusEvent::new(
            Topic::MarketOi,
            BusPayload::OpenInterest(oi("bybit.public.linear.v5", 1_000, 100.0, OiUnit::Base)),
        ));
        {
            let events = sink.lock();
            let AggregateKind::OpenInterest {
                open_interest_value_usd,
                ..
            } = &events.last().unwrap().kind
            else {
                panic!("expected OI kind");
            };
            assert_eq!(*open_interest_value_usd, None);
        }

        // Fresh, confident canonical price: converted
        cache.store(
            &symbol,
            MarketType::Futures,
            CanonicalPriceEntry {
                ts: 1_500,
                price: 43_000.0,
                confidence_score: 0.9,
            },
        );
        bus.publish(BusEvent::new(
            Topic::MarketOi,
            BusPayload::OpenInterest(oi("bybit.public.linear.v5", 2_000, 100.0, OiUnit::Base)),
        ));
        {
            let events = sink.lock();
            let AggregateKind::OpenInterest {
                open_interest_value_usd,
                ..
            } = &events.last().unwrap().kind
            else {
                panic!("expected OI kind");
            };
            assert_eq!(*open_interest_value_usd, Some(4_300_000.0));
        }

        // Low-confidence canonical price: conversion withheld
        cache.store(
            &symbol,
            MarketType::Futures,
            CanonicalPriceEntry {
                ts: 2_500,
                price: 43_000.0,
                confidence_score: 0.2,
            },
        );
        bus.publish(BusEvent::new(
            Topic::MarketOi,
            BusPayload::OpenInterest(oi("bybit.public.linear.v5", 3_000, 100.0, OiUnit::Base)),
        ));
        let events = sink.lock();
        let AggregateKind::OpenInterest {
            open_interest_value_usd,
            ..
        } = &events.last().unwrap().kind
        else {
            panic!("expected OI kind");
        };
        assert_eq!(*open_interest_value_usd, None);
    }
}
