//! Consolidate synthetic multi-venue tickers into canonical price events.
//!
//! Run with: cargo run --example consolidated_prices

use quorum_data::{
    EventBus, Symbol,
    aggregate::{
        AggregatorConfig, CanonicalPriceCache,
        price::{CanonicalPriceAggregator, PriceIndexAggregator},
    },
    event::{BusEvent, BusPayload, EventMeta, MarketType, StreamId, Ticker, Topic},
    registry::SourceRegistry,
};
use std::sync::Arc;
use tracing::info;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(SourceRegistry::new());
    let cache = CanonicalPriceCache::new();

    let _index = PriceIndexAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        AggregatorConfig::default(),
    );
    let _canonical = CanonicalPriceAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        cache,
        AggregatorConfig::default(),
    );

    bus.subscribe(Topic::MarketPriceCanonical, "example:print", |event| {
        if let BusPayload::Aggregate(aggregate) = &event.payload {
            info!(
                symbol = %aggregate.symbol,
                value = aggregate.value,
                confidence = aggregate.confidence_score,
                sources = aggregate.fresh_sources_count,
                "canonical price"
            );
        }
        Ok(())
    });

    let ticker = |stream: &str, ts: i64, index: f64| {
        let mut meta = EventMeta::new(ts, ts + 2, "example", StreamId::from(stream));
        meta.ts_exchange = Some(ts);
        BusEvent::new(
            Topic::MarketTicker,
            BusPayload::Ticker(Ticker {
                symbol: Symbol::from("BTCUSDT"),
                market_type: MarketType::Futures,
                last_price: None,
                mark_price: Some(index - 0.5),
                index_price: Some(index),
                meta,
            }),
        )
    };

    bus.publish(ticker("binance.futures.usd", 1_000, 43_000.0));
    bus.publish(ticker("okx.public.swap", 1_200, 43_010.0));
    bus.publish(ticker("bybit.public.linear.v5", 1_400, 43_005.0));
}
