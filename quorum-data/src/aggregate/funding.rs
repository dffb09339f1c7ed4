//! Funding rate aggregator: TTL-windowed weighted mean over venue funding
//! rates.

use super::{AggregatorConfig, LatestStore, kernel_confidence, merge_scalar, price::agg_meta};
use crate::{
    bus::EventBus,
    event::{
        AggregateEvent, AggregateKind, BusEvent, BusPayload, Funding, MarketType, QualityFlags,
        Topic,
    },
    registry::{Metric, SourceRegistry, SuppressReason},
};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::sync::Arc;

pub struct FundingAggregator {
    bus: Arc<EventBus>,
    registry: Arc<SourceRegistry>,
    config: AggregatorConfig,
    store: Mutex<LatestStore<f64>>,
}

impl FundingAggregator {
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
        bus.subscribe(Topic::MarketFunding, "agg:funding", move |event| {
            if let BusPayload::Funding(funding) = &event.payload {
                handler.on_funding(funding);
            }
            Ok(())
        });
        aggregator
    }

    fn on_funding(&self, funding: &Funding) {
        if funding.market_type == MarketType::Unknown {
            return;
        }
        let mut store = self.store.lock();
        store.update(
            &funding.symbol,
            funding.market_type,
            &funding.meta.stream_id,
            funding.meta.ts_event,
            funding.funding_rate,
        );

        let now_ts = funding.meta.ts_event;
        let Some(sources) = store.sources(&funding.symbol, funding.market_type) else {
            return;
        };
        let Some(outcome) = merge_scalar(now_ts, sources, &self.config) else {
            self.registry.record_suppression(
                &funding.symbol,
                funding.market_type,
                Metric::Derivatives,
                SuppressReason::StaleInput,
            );
            return;
        };

        let flags = QualityFlags::default();
        let expected =
            self.registry
                .expected(&funding.symbol, funding.market_type, Metric::Derivatives);
        let confidence_score = kernel_confidence(&outcome, expected, &flags);

        let event = AggregateEvent {
            symbol: funding.symbol.clone(),
            ts: now_ts,
            market_type: funding.market_type,
            value: outcome.value,
            venue_breakdown: outcome.venue_breakdown,
            sources_used: outcome.sources_used.clone(),
            weights_used: outcome.weights_used,
            fresh_sources_count: outcome.fresh_sources_count,
            stale_sources_dropped: outcome.stale_sources_dropped,
            mismatch_detected: outcome.mismatch_detected,
            confidence_score,
            quality_flags: flags,
            provider: SmolStr::from(super::price::PROVIDER),
            meta: agg_meta(&funding.meta, now_ts),
            kind: AggregateKind::Funding,
        };

        self.registry.mark_agg_emitted(
            &funding.symbol,
            funding.market_type,
            Metric::Derivatives,
            &outcome.sources_used,
            now_ts,
        );
        store.prune_stale(
            &funding.symbol,
            funding.market_type,
            now_ts,
            self.config.ttl_ms,
        );
        drop(store);

        self.bus
            .publish(BusEvent::new(Topic::MarketFundingAgg, BusPayload::Aggregate(event)));
    }
}
