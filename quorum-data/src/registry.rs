//! Observability ledger of expected / used / suppressed sources.
//!
//! Sources are lazily created on first observation and persist for the
//! process lifetime. The registry is a process-wide singleton in production
//! wiring, injected as an `Arc` so tests construct fresh instances.

use crate::{
    event::{MarketType, StreamId},
    symbol::Symbol,
    time::Ts,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Aggregated signal family tracked per symbol × market type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Derivatives,
    Flow,
    Liquidity,
    Price,
}

/// Raw inbound feed tracked per symbol × market type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Feed {
    Funding,
    IndexPrice,
    Klines,
    MarkPrice,
    Oi,
    Orderbook,
    Trades,
}

/// Why an aggregate emission was suppressed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuppressReason {
    ConfidenceTooLow,
    GapsDetected,
    LagTooHigh,
    NoCanonicalPrice,
    ResyncActive,
    StaleInput,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricLedger {
    pub expected: BTreeSet<StreamId>,
    pub last_used: BTreeSet<StreamId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_emitted_ts: Option<Ts>,
    pub suppressions: BTreeMap<SuppressReason, u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedLedger {
    pub observed: BTreeSet<StreamId>,
    pub last_ts_by_stream: BTreeMap<StreamId, Ts>,
    pub non_monotonic: BTreeSet<StreamId>,
}

/// Deterministic snapshot for one symbol × market type: all lists and maps
/// key-sorted.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub ts: Ts,
    pub metrics: BTreeMap<Metric, MetricLedger>,
    pub feeds: BTreeMap<Feed, FeedLedger>,
}

#[derive(Default)]
struct RegistryInner {
    metrics: BTreeMap<(Symbol, MarketType, Metric), MetricLedger>,
    feeds: BTreeMap<(Symbol, MarketType, Feed), FeedLedger>,
}

/// Process-wide source ledger.
#[derive(Default)]
pub struct SourceRegistry {
    inner: Mutex<RegistryInner>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the sources expected to contribute to a metric.
    pub fn set_expected(
        &self,
        symbol: &Symbol,
        market_type: MarketType,
        metric: Metric,
        expected: impl IntoIterator<Item = StreamId>,
    ) {
        let mut inner = self.inner.lock();
        let ledger = inner
            .metrics
            .entry((symbol.clone(), market_type, metric))
            .or_default();
        ledger.expected = expected.into_iter().collect();
    }

    pub fn expected(
        &self,
        symbol: &Symbol,
        market_type: MarketType,
        metric: Metric,
    ) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .metrics
            .get(&(symbol.clone(), market_type, metric))
            .map(|ledger| ledger.expected.len())
            .filter(|len| *len > 0)
    }

    /// Record a successful aggregate emission and the sources it used.
    pub fn mark_agg_emitted(
        &self,
        symbol: &Symbol,
        market_type: MarketType,
        metric: Metric,
        used: &[StreamId],
        ts: Ts,
    ) {
        let mut inner = self.inner.lock();
        let ledger = inner
            .metrics
            .entry((symbol.clone(), market_type, metric))
            .or_default();
        ledger.last_used = used.iter().cloned().collect();
        ledger.last_emitted_ts = Some(ts);
    }

    /// Count one suppressed emission for `reason`.
    pub fn record_suppression(
        &self,
        symbol: &Symbol,
        market_type: MarketType,
        metric: Metric,
        reason: SuppressReason,
    ) {
        let mut inner = self.inner.lock();
        let ledger = inner
            .metrics
            .entry((symbol.clone(), market_type, metric))
            .or_default();
        *ledger.suppressions.entry(reason).or_insert(0) += 1;
    }

    pub fn suppression_count(
        &self,
        symbol: &Symbol,
        market_type: MarketType,
        metric: Metric,
        reason: SuppressReason,
    ) -> u64 {
        let inner = self.inner.lock();
        inner
            .metrics
            .get(&(symbol.clone(), market_type, metric))
            .and_then(|ledger| ledger.suppressions.get(&reason).copied())
            .unwrap_or(0)
    }

    /// Record a raw feed sample. A sample with `ts` older than the last one
    /// observed for its stream marks the source non-monotonic. Klines are
    /// exempt: they legitimately re-emit on close.
    pub fn observe_feed(
        &self,
        symbol: &Symbol,
        market_type: MarketType,
        feed: Feed,
        stream_id: &StreamId,
        ts: Ts,
    ) {
        let mut inner = self.inner.lock();
        let ledger = inner
            .feeds
            .entry((symbol.clone(), market_type, feed))
            .or_default();
        ledger.observed.insert(stream_id.clone());

        match ledger.last_ts_by_stream.get(stream_id) {
            Some(&last) if ts < last && feed != Feed::Klines => {
                ledger.non_monotonic.insert(stream_id.clone());
            }
            _ => {
                ledger.last_ts_by_stream.insert(stream_id.clone(), ts);
            }
        }
    }

    /// Deterministic snapshot for one symbol × market type.
    pub fn snapshot(&self, now_ts: Ts, symbol: &Symbol, market_type: MarketType) -> RegistrySnapshot {
        let inner = self.inner.lock();
        let metrics = inner
            .metrics
            .iter()
            .filter(|((s, mt, _), _)| s == symbol && *mt == market_type)
            .map(|((_, _, metric), ledger)| (*metric, ledger.clone()))
            .collect();
        let feeds = inner
            .feeds
            .iter()
            .filter(|((s, mt, _), _)| s == symbol && *mt == market_type)
            .map(|((_, _, feed), ledger)| (*feed, ledger.clone()))
            .collect();

        RegistrySnapshot {
            ts: now_ts,
            metrics,
            feeds,
        }
    }

    /// Symbols the registry has observed, sorted.
    pub fn known_symbols(&self) -> Vec<Symbol> {
        let inner = self.inner.lock();
        let symbols: BTreeSet<Symbol> = inner
            .metrics
            .keys()
            .map(|(symbol, _, _)| symbol.clone())
            .chain(inner.feeds.keys().map(|(symbol, _, _)| symbol.clone()))
            .collect();
        symbols.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol_str::SmolStr;

    fn sym() -> Symbol {
        Symbol::from("BTCUSDT")
    }

    #[test]
    fn test_suppression_counters() {
        let registry = SourceRegistry::new();
        registry.record_suppression(
            &sym(),
            MarketType::Futures,
            Metric::Price,
            SuppressReason::NoCanonicalPrice,
        );
        registry.record_suppression(
            &sym(),
            MarketType::Futures,
            Metric::Price,
            SuppressReason::NoCanonicalPrice,
        );
        registry.record_suppression(
            &sym(),
            MarketType::Futures,
            Metric::Price,
            SuppressReason::StaleInput,
        );

        assert_eq!(
            registry.suppression_count(
                &sym(),
                MarketType::Futures,
                Metric::Price,
                SuppressReason::NoCanonicalPrice
            ),
            2
        );
        assert_eq!(
            registry.suppression_count(
                &sym(),
                MarketType::Futures,
                Metric::Price,
                SuppressReason::StaleInput
            ),
            1
        );
    }

    #[test]
    fn test_non_monotonic_detection_excludes_klines() {
        let registry = SourceRegistry::new();
        let stream = StreamId::from("okx.public.swap");

        registry.observe_feed(&sym(), MarketType::Futures, Feed::Trades, &stream, 100);
        registry.observe_feed(&sym(), MarketType::Futures, Feed::Trades, &stream, 90);
        registry.observe_feed(&sym(), MarketType::Futures, Feed::Klines, &stream, 100);
        registry.observe_feed(&sym(), MarketType::Futures, Feed::Klines, &stream, 90);

        let snapshot = registry.snapshot(200, &sym(), MarketType::Futures);
        assert!(
            snapshot.feeds[&Feed::Trades]
                .non_monotonic
                .contains(&stream)
        );
        assert!(
            snapshot.feeds[&Feed::Klines]
                .non_monotonic
                .is_empty()
        );
    }

    #[test]
    fn test_snapshot_deterministic() {
        let registry = SourceRegistry::new();
        let okx = StreamId::from("okx.public.swap");
        let binance = StreamId::from("binance.futures.usd");

        registry.set_expected(
            &sym(),
            MarketType::Futures,
            Metric::Price,
            vec![okx.clone(), binance.clone()],
        );
        registry.mark_agg_emitted(
            &sym(),
            MarketType::Futures,
            Metric::Price,
            &[okx.clone(), binance.clone()],
            1_000,
        );

        let a = registry.snapshot(2_000, &sym(), MarketType::Futures);
        let b = registry.snapshot(2_000, &sym(), MarketType::Futures);
        assert_eq!(a, b);

        let json = serde_json::to_string(&a).unwrap();
        // BTreeSet serialises sorted: binance before okx
        assert!(json.find("binance.futures.usd").unwrap() < json.find("okx.public.swap").unwrap());
        assert_eq!(
            a.metrics[&Metric::Price].last_emitted_ts,
            Some(1_000)
        );
        assert_eq!(a.metrics[&Metric::Price].expected.len(), 2);
    }

    #[test]
    fn test_expected_none_when_unset() {
        let registry = SourceRegistry::new();
        assert_eq!(
            registry.expected(&sym(), MarketType::Futures, Metric::Flow),
            None
        );
        registry.set_expected(
            &sym(),
            MarketType::Futures,
            Metric::Flow,
            vec![SmolStr::from("okx.public.swap")],
        );
        assert_eq!(
            registry.expected(&sym(), MarketType::Futures, Metric::Flow),
            Some(1)
        );
    }
}
