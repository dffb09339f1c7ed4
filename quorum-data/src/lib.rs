#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Quorum-Data
//! A real-time multi-venue crypto market-data ingestion and consolidation pipeline -
//! batteries included. It is:
//! * **Normalised**: heterogeneous wire events from Binance, OKX and Bybit are mapped onto one
//!   canonical schema before anything downstream sees them.
//! * **Consolidated**: deterministic TTL-windowed, weighted fan-in produces venue-consolidated
//!   signals (canonical price, price index, funding, open interest, liquidations, CVD flow,
//!   order-book liquidity) with quality flags and a versioned confidence score.
//! * **Sequenced**: per-venue order books are reconciled snapshot-plus-delta with venue-specific
//!   chain predicates, and resync automatically on any gap.
//! * **Replayable**: every normalised event lands in an append-only journal; replaying a journal
//!   onto a fresh bus reproduces the aggregate stream byte-for-byte.
//!
//! ## Shape
//! Venue clients feed a bounded channel drained by a single dispatcher onto the synchronous
//! [`bus::EventBus`]; aggregators, the [`quality::QualityMonitor`] and the
//! [`journal::Journal`] are plain bus subscribers. The [`replay::ReplayRunner`] republishes
//! journal records with `meta.source = "replay"` and no venue clients involved.

/// TTL-windowed weighted aggregators and the flow calculator.
pub mod aggregate;

/// Reconnect and REST backoff with deterministic jitter.
pub mod backoff;

/// Local order books and the snapshot-plus-delta reconcile sequencer.
pub mod books;

/// Synchronous typed pub/sub and the dispatcher task.
pub mod bus;

/// Generic venue client: lifecycle, subscriptions, book sequencing.
pub mod client;

/// Versioned confidence scoring and source trust rules.
pub mod confidence;

/// Environment-variable configuration.
pub mod config;

/// Shared serde deserialisation helpers.
pub mod de;

/// Errors generated by the crate.
pub mod error;

/// Canonical event model and bus topics.
pub mod event;

/// Venue connectors (Binance, OKX, Bybit).
pub mod exchange;

/// Append-only JSON-lines journal.
pub mod journal;

/// Derivatives REST poller (open interest, funding).
pub mod poller;

/// Stale/mismatch quality monitor.
pub mod quality;

/// Source observability ledger.
pub mod registry;

/// Deterministic journal replay.
pub mod replay;

/// Per-connection subscription reconciliation.
pub mod subscription;

/// Canonical symbol normalisation.
pub mod symbol;

/// Clocks and fixed-width bucket math.
pub mod time;

pub use bus::EventBus;
pub use error::DataError;
pub use event::{BusEvent, BusPayload, MarketType, Side, StreamId, Topic};
pub use symbol::Symbol;

#[cfg(test)]
mod tests {
    //! Whole-pipeline checks: identical input sequences produce
    //! byte-identical aggregate sequences, live or replayed.

    use crate::{
        aggregate::{
            AggregatorConfig, CanonicalPriceCache,
            cvd::{CvdAggConfig, CvdAggregator, CvdCalcConfig, CvdCalculator, CvdMismatchPolicy},
            funding::FundingAggregator,
            open_interest::{OiConversionConfig, OpenInterestAggregator},
            price::{CanonicalPriceAggregator, PriceIndexAggregator},
        },
        bus::EventBus,
        event::{
            BusEvent, BusPayload, EventMeta, MarketType, Side, StreamId, Ticker, Topic, Trade,
        },
        journal::JournalRecord,
        registry::SourceRegistry,
        replay::{ReplayConfig, ReplayRunner},
        symbol::Symbol,
    };
    use parking_lot::Mutex;
    use smol_str::SmolStr;
    use std::sync::Arc;

    const AGG_TOPICS: [Topic; 6] = [
        Topic::MarketPriceCanonical,
        Topic::MarketPriceIndex,
        Topic::MarketFundingAgg,
        Topic::MarketOiAgg,
        Topic::MarketCvdSpotAgg,
        Topic::MarketCvdFuturesAgg,
    ];

    /// Wire every kernel aggregator onto a fresh bus and capture aggregate
    /// JSON in emission order.
    fn wired_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(SourceRegistry::new());
        let cache = CanonicalPriceCache::new();

        let _ = PriceIndexAggregator::attach(
            Arc::clone(&bus),
            Arc::clone(&registry),
            AggregatorConfig::default(),
        );
        let _ = CanonicalPriceAggregator::attach(
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&cache),
            AggregatorConfig::default(),
        );
        let _ = FundingAggregator::attach(
            Arc::clone(&bus),
            Arc::clone(&registry),
            AggregatorConfig::default(),
        );
        let _ = OpenInterestAggregator::attach(
            Arc::clone(&bus),
            Arc::clone(&registry),
            cache,
            AggregatorConfig::default(),
            OiConversionConfig::default(),
        );
        let _ = CvdCalculator::attach(Arc::clone(&bus), CvdCalcConfig::default());
        let _ = CvdAggregator::attach(
            Arc::clone(&bus),
            registry,
            CvdAggConfig::default(),
            CvdMismatchPolicy::default(),
        );

        let sink = Arc::new(Mutex::new(Vec::new()));
        for topic in AGG_TOPICS {
            let captured = Arc::clone(&sink);
            bus.subscribe(topic, "test:agg_sink", move |event| {
                if let BusPayload::Aggregate(aggregate) = &event.payload {
                    captured
                        .lock()
                        .push(serde_json::to_string(aggregate).unwrap());
                }
                Ok(())
            });
        }
        (bus, sink)
    }

    fn meta(stream: &str, ts: i64) -> EventMeta {
        let mut meta = EventMeta::new(ts, ts + 3, "binance", StreamId::from(stream));
        meta.ts_exchange = Some(ts);
        meta
    }

    fn input_events() -> Vec<BusEvent> {
        let symbol = Symbol::from("BTCUSDT");
        let ticker = |stream: &str, ts: i64, index: f64| {
            BusEvent::new(
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol: symbol.clone(),
                    market_type: MarketType::Futures,
                    last_price: None,
                    mark_price: Some(index - 0.5),
                    index_price: Some(index),
                    meta: meta(stream, ts),
                }),
            )
        };
        let trade = |stream: &str, ts: i64, side: Side, size: f64| {
            BusEvent::new(
                Topic::MarketTrade,
                BusPayload::Trade(Trade {
                    symbol: symbol.clone(),
                    market_type: MarketType::Futures,
                    side: Some(side),
                    price: 43_000.0,
                    size,
                    meta: meta(stream, ts),
                }),
            )
        };

        vec![
            ticker("binance.futures.usd", 1_000, 43_000.0),
            ticker("okx.public.swap", 1_200, 43_010.0),
            trade("binance.futures.usd", 2_000, Side::Buy, 1.5),
            trade("binance.futures.usd", 30_000, Side::Sell, 0.5),
            ticker("binance.futures.usd", 40_000, 43_005.0),
            // Bucket rollover: closes the first CVD bucket
            trade("binance.futures.usd", 61_000, Side::Buy, 0.25),
            ticker("okx.public.swap", 62_000, 43_015.0),
        ]
    }

    #[test]
    fn test_identical_inputs_yield_identical_aggregate_bytes() {
        let (bus_a, sink_a) = wired_bus();
        let (bus_b, sink_b) = wired_bus();

        for event in input_events() {
            bus_a.publish(event);
        }
        for event in input_events() {
            bus_b.publish(event);
        }

        let a = sink_a.lock().clone();
        let b = sink_b.lock().clone();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    /// Journal one stream's tickers, replay the scope into a fresh wired
    /// bus, and require the aggregate sequence to match the live run
    /// byte-for-byte modulo `meta.source`.
    #[tokio::test]
    async fn test_replay_reproduces_live_aggregates() {
        let symbol = Symbol::from("BTCUSDT");
        let stream = StreamId::from("binance.futures.usd");
        let inputs: Vec<BusEvent> = [
            (1_000, 43_000.0),
            (6_000, 43_004.0),
            (30_000, 43_010.0),
            (31_000, 42_990.0),
        ]
        .into_iter()
        .map(|(ts, index)| {
            BusEvent::new(
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol: symbol.clone(),
                    market_type: MarketType::Futures,
                    last_price: Some(index + 1.0),
                    mark_price: Some(index - 0.5),
                    index_price: Some(index),
                    meta: meta(stream.as_str(), ts),
                }),
            )
        })
        .collect();

        let (live_bus, live_sink) = wired_bus();
        for event in &inputs {
            live_bus.publish(event.clone());
        }

        // Hand-build the journal the pipeline would have written
        let base = std::env::temp_dir().join(format!(
            "quorum-pipeline-replay-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&base);
        let dir = base
            .join(stream.as_str())
            .join(symbol.as_str())
            .join(Topic::MarketTicker.dir_name())
            .join("run-1");
        std::fs::create_dir_all(&dir).unwrap();
        let content: String = inputs
            .iter()
            .enumerate()
            .map(|(index, event)| {
                let event_meta = event.payload.meta().unwrap();
                let record = JournalRecord {
                    seq: index as u64 + 1,
                    stream_id: event_meta.stream_id.clone(),
                    run_id: SmolStr::from("run-1"),
                    topic: event.topic,
                    symbol: symbol.clone(),
                    ts_ingest: event_meta.ts_ingest,
                    payload: event.payload.to_json().unwrap(),
                };
                format!("{}\n", serde_json::to_string(&record).unwrap())
            })
            .collect();
        std::fs::write(dir.join("1970-01-01.jsonl"), content).unwrap();

        let (replay_bus, replay_sink) = wired_bus();
        let runner = ReplayRunner::new(
            Arc::clone(&replay_bus),
            ReplayConfig::new(&base, stream, symbol, Topic::MarketTicker),
        );
        let stats = runner.run().await.unwrap();
        assert_eq!(stats.emitted, inputs.len() as u64);

        // Bit-identical modulo meta.source
        let strip = |raw: &String| {
            let mut value: serde_json::Value = serde_json::from_str(raw).unwrap();
            if let Some(meta) = value.pointer_mut("/meta") {
                meta.as_object_mut().unwrap().remove("source");
            }
            serde_json::to_string(&value).unwrap()
        };
        let live: Vec<String> = live_sink.lock().iter().map(strip).collect();
        let replayed: Vec<String> = replay_sink.lock().iter().map(strip).collect();
        assert!(!live.is_empty());
        assert_eq!(live, replayed);

        let _ = std::fs::remove_dir_all(&base);
    }
}
