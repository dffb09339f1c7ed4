//! Canonical price and price index aggregators.
//!
//! The canonical price picks one of three ticker fields in priority order
//! (index, then mark, then last), demoting with a recorded fallback reason
//! and a confidence penalty (1.0 / 0.85 / 0.60).

use super::{
    AggregatorConfig, CanonicalPriceCache, CanonicalPriceEntry, LatestStore, kernel_confidence,
    merge_scalar,
};
use crate::{
    bus::EventBus,
    event::{
        AggregateEvent, AggregateKind, BusEvent, BusPayload, EventMeta, FallbackReason, MarketType,
        PriceType, QualityFlags, Ticker, Topic,
    },
    registry::{Metric, SourceRegistry, SuppressReason},
    symbol::Symbol,
};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::sync::Arc;

/// Confidence penalty for a canonical price built from the index price.
pub const FALLBACK_PENALTY_INDEX: f64 = 1.0;
/// Confidence penalty for a canonical price demoted to the mark price.
pub const FALLBACK_PENALTY_MARK: f64 = 0.85;
/// Confidence penalty for a canonical price demoted to the last trade price.
pub const FALLBACK_PENALTY_LAST: f64 = 0.60;

/// Provider stamp on every aggregate this crate emits.
pub const PROVIDER: &str = "quorum";

/// Venue-consolidated price index over ticker index prices.
pub struct PriceIndexAggregator {
    bus: Arc<EventBus>,
    registry: Arc<SourceRegistry>,
    config: AggregatorConfig,
    store: Mutex<LatestStore<f64>>,
}

impl PriceIndexAggregator {
    pub fn attach(
        bus: Arc<EventBus>,
        registry: Arc<SourceRegistry>,
        config: AggregatorConfig,
    ) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            bus: Arc::clone(&bus),
            registry,
            config,
            store: Mutex::new(LatestStore::default()),
        });

        let handler = Arc::clone(&aggregator);
        bus.subscribe(Topic::MarketTicker, "agg:price_index", move |event| {
            if let BusPayload::Ticker(ticker) = &event.payload {
                handler.on_ticker(ticker);
            }
            Ok(())
        });
        aggregator
    }

    fn on_ticker(&self, ticker: &Ticker) {
        if ticker.market_type == MarketType::Unknown {
            return;
        }
        let mut store = self.store.lock();
        if let Some(index_price) = ticker.index_price {
            store.update(
                &ticker.symbol,
                ticker.market_type,
                &ticker.meta.stream_id,
                ticker.meta.ts_event,
                index_price,
            );
        }

        let now_ts = ticker.meta.ts_event;
        let Some(sources) = store.sources(&ticker.symbol, ticker.market_type) else {
            return;
        };
        let Some(outcome) = merge_scalar(now_ts, sources, &self.config) else {
            self.registry.record_suppression(
                &ticker.symbol,
                ticker.market_type,
                Metric::Price,
                SuppressReason::StaleInput,
            );
            return;
        };

        let flags = QualityFlags::default();
        let expected = self
            .registry
            .expected(&ticker.symbol, ticker.market_type, Metric::Price);
        let confidence_score = kernel_confidence(&outcome, expected, &flags);

        let event = AggregateEvent {
            symbol: ticker.symbol.clone(),
            ts: now_ts,
            market_type: ticker.market_type,
            value: outcome.value,
            venue_breakdown: outcome.venue_breakdown,
            sources_used: outcome.sources_used.clone(),
            weights_used: outcome.weights_used,
            fresh_sources_count: outcome.fresh_sources_count,
            stale_sources_dropped: outcome.stale_sources_dropped,
            mismatch_detected: outcome.mismatch_detected,
            confidence_score,
            quality_flags: flags,
            provider: SmolStr::from(PROVIDER),
            meta: agg_meta(&ticker.meta, now_ts),
            kind: AggregateKind::PriceIndex,
        };

        self.registry.mark_agg_emitted(
            &ticker.symbol,
            ticker.market_type,
            Metric::Price,
            &outcome.sources_used,
            now_ts,
        );
        store.prune_stale(&ticker.symbol, ticker.market_type, now_ts, self.config.ttl_ms);
        drop(store);

        self.bus
            .publish(BusEvent::new(Topic::MarketPriceIndex, BusPayload::Aggregate(event)));
    }
}

/// Canonical price aggregator with index -> mark -> last fallback.
pub struct CanonicalPriceAggregator {
    bus: Arc<EventBus>,
    registry: Arc<SourceRegistry>,
    cache: Arc<CanonicalPriceCache>,
    config: AggregatorConfig,
    index: Mutex<LatestStore<f64>>,
    mark: Mutex<LatestStore<f64>>,
    last: Mutex<LatestStore<f64>>,
}

impl CanonicalPriceAggregator {
    pub fn attach(
        bus: Arc<EventBus>,
        registry: Arc<SourceRegistry>,
        cache: Arc<CanonicalPriceCache>,
        config: AggregatorConfig,
    ) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            bus: Arc::clone(&bus),
            registry,
            cache,
            config,
            index: Mutex::new(LatestStore::default()),
            mark: Mutex::new(LatestStore::default()),
            last: Mutex::new(LatestStore::default()),
        });

        let handler = Arc::clone(&aggregator);
        bus.subscribe(Topic::MarketTicker, "agg:price_canonical", move |event| {
            if let BusPayload::Ticker(ticker) = &event.payload {
                handler.on_ticker(ticker);
            }
            Ok(())
        });
        aggregator
    }

    fn on_ticker(&self, ticker: &Ticker) {
        if ticker.market_type == MarketType::Unknown {
            return;
        }
        let symbol = &ticker.symbol;
        let market_type = ticker.market_type;
        let stream_id = &ticker.meta.stream_id;
        let ts = ticker.meta.ts_event;

        if let Some(price) = ticker.index_price {
            self.index.lock().update(symbol, market_type, stream_id, ts, price);
        }
        if let Some(price) = ticker.mark_price {
            self.mark.lock().update(symbol, market_type, stream_id, ts, price);
        }
        if let Some(price) = ticker.last_price {
            self.last.lock().update(symbol, market_type, stream_id, ts, price);
        }

        self.recompute(symbol, market_type, &ticker.meta);
    }

    fn recompute(&self, symbol: &Symbol, market_type: MarketType, trigger: &EventMeta) {
        let now_ts = trigger.ts_event;

        let mut fallback_reason = None;
        let picked = self
            .try_field(&self.index, symbol, market_type, now_ts)
            .map(|outcome| (outcome, PriceType::Index, FALLBACK_PENALTY_INDEX))
            .or_else(|| {
                fallback_reason = Some(if self.has_sources(&self.index, symbol, market_type) {
                    FallbackReason::IndexStale
                } else {
                    FallbackReason::NoIndex
                });
                self.try_field(&self.mark, symbol, market_type, now_ts)
                    .map(|outcome| (outcome, PriceType::Mark, FALLBACK_PENALTY_MARK))
            })
            .or_else(|| {
                fallback_reason = Some(if self.has_sources(&self.mark, symbol, market_type) {
                    FallbackReason::MarkStale
                } else {
                    FallbackReason::NoMark
                });
                self.try_field(&self.last, symbol, market_type, now_ts)
                    .map(|outcome| (outcome, PriceType::Last, FALLBACK_PENALTY_LAST))
            });

        let Some((outcome, price_type, penalty)) = picked else {
            self.registry.record_suppression(
                symbol,
                market_type,
                Metric::Price,
                SuppressReason::NoCanonicalPrice,
            );
            return;
        };

        let flags = QualityFlags {
            fallback_penalty: Some(penalty),
            ..Default::default()
        };
        let expected = self.registry.expected(symbol, market_type, Metric::Price);
        let confidence_score = kernel_confidence(&outcome, expected, &flags);

        let event = AggregateEvent {
            symbol: symbol.clone(),
            ts: now_ts,
            market_type,
            value: outcome.value,
            venue_breakdown: outcome.venue_breakdown.clone(),
            sources_used: outcome.sources_used.clone(),
            weights_used: outcome.weights_used.clone(),
            fresh_sources_count: outcome.fresh_sources_count,
            stale_sources_dropped: outcome.stale_sources_dropped.clone(),
            mismatch_detected: outcome.mismatch_detected,
            confidence_score,
            quality_flags: flags,
            provider: SmolStr::from(PROVIDER),
            meta: agg_meta(trigger, now_ts),
            kind: AggregateKind::PriceCanonical {
                price_type_used: price_type,
                fallback_reason: if price_type == PriceType::Index {
                    None
                } else {
                    fallback_reason
                },
            },
        };

        self.cache.store(
            symbol,
            market_type,
            CanonicalPriceEntry {
                ts: now_ts,
                price: outcome.value,
                confidence_score,
            },
        );
        self.registry.mark_agg_emitted(
            symbol,
            market_type,
            Metric::Price,
            &outcome.sources_used,
            now_ts,
        );
        for store in [&self.index, &self.mark, &self.last] {
            store
                .lock()
                .prune_stale(symbol, market_type, now_ts, self.config.ttl_ms);
        }

        self.bus.publish(BusEvent::new(
            Topic::MarketPriceCanonical,
            BusPayload::Aggregate(event),
        ));
    }

    fn try_field(
        &self,
        store: &Mutex<LatestStore<f64>>,
        symbol: &Symbol,
        market_type: MarketType,
        now_ts: crate::time::Ts,
    ) -> Option<super::MergeOutcome> {
        let store = store.lock();
        let sources = store.sources(symbol, market_type)?;
        merge_scalar(now_ts, sources, &self.config)
    }

    fn has_sources(
        &self,
        store: &Mutex<LatestStore<f64>>,
        symbol: &Symbol,
        market_type: MarketType,
    ) -> bool {
        store
            .lock()
            .sources(symbol, market_type)
            .is_some_and(|sources| !sources.is_empty())
    }
}

/// Aggregate meta derived from the triggering event: correlation id and
/// ingest time propagate unchanged so replayed aggregates match live ones.
pub(crate) fn agg_meta(trigger: &EventMeta, ts: crate::time::Ts) -> EventMeta {
    trigger.inherit(
        ts,
        trigger.ts_ingest,
        trigger.source.as_str(),
        trigger.stream_id.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamId;
    use parking_lot::Mutex as PMutex;

    fn ticker(
        stream: &str,
        ts: i64,
        last: Option<f64>,
        mark: Option<f64>,
        index: Option<f64>,
    ) -> Ticker {
        Ticker {
            symbol: Symbol::from("BTCUSDT"),
            market_type: MarketType::Futures,
            last_price: last,
            mark_price: mark,
            index_price: index,
            meta: EventMeta::new(ts, ts + 1, "test", StreamId::from(stream)),
        }
    }

    fn collect_aggregates(bus: &Arc<EventBus>, topic: Topic) -> Arc<PMutex<Vec<AggregateEvent>>> {
        let sink = Arc::new(PMutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        bus.subscribe(topic, "test:collector", move |event| {
            if let BusPayload::Aggregate(aggregate) = &event.payload {
                captured.lock().push(aggregate.clone());
            }
            Ok(())
        });
        sink
    }

    #[test]
    fn test_canonical_price_suppression_then_single_emission() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(SourceRegistry::new());
        let cache = CanonicalPriceCache::new();
        let _aggregator = CanonicalPriceAggregator::attach(
            Arc::clone(&bus),
            Arc::clone(&registry),
            cache,
            AggregatorConfig::default(),
        );
        let sink = collect_aggregates(&bus, Topic::MarketPriceCanonical);

        // Ticker with no price fields: zero emissions, NO_CANONICAL_PRICE
        bus.publish(BusEvent::new(
            Topic::MarketTicker,
            BusPayload::Ticker(ticker("s1", 1_000, None, None, None)),
        ));
        assert!(sink.lock().is_empty());
        assert_eq!(
            registry.suppression_count(
                &Symbol::from("BTCUSDT"),
                MarketType::Futures,
                Metric::Price,
                SuppressReason::NoCanonicalPrice
            ),
            1
        );

        // Index price arrives: exactly one emission
        bus.publish(BusEvent::new(
            Topic::MarketTicker,
            BusPayload::Ticker(ticker("s1", 2_000, None, None, Some(100.0))),
        ));
        let events = sink.lock();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.value, 100.0);
        assert_eq!(event.sources_used, vec![StreamId::from("s1")]);
        assert!((event.confidence_score - 1.0).abs() < 1e-12);
        assert!(matches!(
            event.kind,
            AggregateKind::PriceCanonical {
                price_type_used: PriceType::Index,
                fallback_reason: None
            }
        ));
    }

    #[test]
    fn test_canonical_price_fallback_chain() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(SourceRegistry::new());
        let cache = CanonicalPriceCache::new();
        let _aggregator = CanonicalPriceAggregator::attach(
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&cache),
            AggregatorConfig::default(),
        );
        let sink = collect_aggregates(&bus, Topic::MarketPriceCanonical);

        // Only a mark price known: falls back with NO_INDEX and 0.85 penalty
        bus.publish(BusEvent::new(
            Topic::MarketTicker,
            BusPayload::Ticker(ticker("s1", 1_000, None, Some(99.5), None)),
        ));
        {
            let events = sink.lock();
            let event = events.last().unwrap();
            assert!(matches!(
                event.kind,
                AggregateKind::PriceCanonical {
                    price_type_used: PriceType::Mark,
                    fallback_reason: Some(FallbackReason::NoIndex)
                }
            ));
            assert_eq!(event.quality_flags.fallback_penalty, Some(0.85));
            assert!((event.confidence_score - 0.85).abs() < 1e-12);
        }

        // Only a last price: NO_MARK would be wrong (mark exists but is fresh)
        // so push time far ahead to stale out the mark, leaving last only.
        bus.publish(BusEvent::new(
            Topic::MarketTicker,
            BusPayload::Ticker(ticker("s1", 60_000, Some(100.2), None, None)),
        ));
        {
            let events = sink.lock();
            let event = events.last().unwrap();
            assert!(matches!(
                event.kind,
                AggregateKind::PriceCanonical {
                    price_type_used: PriceType::Last,
                    fallback_reason: Some(FallbackReason::MarkStale)
                }
            ));
            assert_eq!(event.quality_flags.fallback_penalty, Some(0.60));
        }

        // Canonical cache tracked the latest emission
        let entry = cache.get(&Symbol::from("BTCUSDT"), MarketType::Futures).unwrap();
        assert_eq!(entry.price, 100.2);
    }

    #[test]
    fn test_price_index_aggregates_across_streams() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(SourceRegistry::new());
        let _aggregator = PriceIndexAggregator::attach(
            Arc::clone(&bus),
            Arc::clone(&registry),
            AggregatorConfig::default(),
        );
        let sink = collect_aggregates(&bus, Topic::MarketPriceIndex);

        bus.publish(BusEvent::new(
            Topic::MarketTicker,
            BusPayload::Ticker(ticker("binance.futures.usd", 1_000, None, None, Some(100.0))),
        ));
        bus.publish(BusEvent::new(
            Topic::MarketTicker,
            BusPayload::Ticker(ticker("okx.public.swap", 1_100, None, None, Some(101.0))),
        ));

        let events = sink.lock();
        assert_eq!(events.len(), 2);
        let event = &events[1];
        assert_eq!(event.fresh_sources_count, 2);
        assert!((event.value - 100.5).abs() < 1e-12);
        assert_eq!(
            event.sources_used,
            vec![
                StreamId::from("binance.futures.usd"),
                StreamId::from("okx.public.swap")
            ]
        );
    }
}
