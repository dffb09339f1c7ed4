//! Canonical event model shared by every component.
//!
//! Venue adapters normalise wire payloads into these records; aggregators,
//! the quality monitor, the journal and the replay runner only ever see this
//! schema. Every record carries symbol, stream id, market type and an
//! [`EventMeta`].

use crate::{confidence::ConfidenceInputs, symbol::Symbol, time::Ts};
use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smol_str::SmolStr;
use std::collections::BTreeMap;

/// Stable per-(venue, market type) stream identifier, e.g. `okx.public.swap`.
/// The fan-in unit for all aggregation.
pub type StreamId = SmolStr;

/// Market type of an instrument. `Unknown` is terminal for emission: no
/// aggregate is published for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
    Unknown,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Futures => "futures",
            MarketType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggressor side of a trade or liquidation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Case-insensitive venue side mapping: `{buy, b} -> Buy`,
    /// `{sell, s} -> Sell`, anything else is undefined.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "buy" | "b" => Some(Side::Buy),
            "sell" | "s" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    /// Signed multiplier for volume-delta accumulation.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl Serialize for Side {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Side {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Side::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid side: {raw}")))
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata attached to every event.
///
/// Invariants: `ts_event <= ts_ingest + clock_skew_tolerance`;
/// `correlation_id` propagates unchanged through [`EventMeta::inherit`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    /// Logical/exchange event time.
    pub ts_event: Ts,
    /// Local observation time.
    pub ts_ingest: Ts,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ts_exchange: Option<Ts>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence: Option<u64>,
    /// Origin of the record: a venue name, or `replay`.
    pub source: SmolStr,
    pub stream_id: StreamId,
    pub correlation_id: SmolStr,
}

impl EventMeta {
    pub fn new(ts_event: Ts, ts_ingest: Ts, source: &str, stream_id: StreamId) -> Self {
        Self {
            ts_event,
            ts_ingest,
            ts_exchange: None,
            sequence: None,
            source: SmolStr::from(source),
            stream_id: stream_id.clone(),
            correlation_id: SmolStr::from(format!("{stream_id}-{ts_event}")),
        }
    }

    /// Derive meta for an event produced from this one. The correlation id is
    /// propagated unchanged from the root event through every derivative.
    pub fn inherit(&self, ts_event: Ts, ts_ingest: Ts, source: &str, stream_id: StreamId) -> Self {
        Self {
            ts_event,
            ts_ingest,
            ts_exchange: self.ts_exchange,
            sequence: self.sequence,
            source: SmolStr::from(source),
            stream_id,
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// One price level of an order book, exact decimal forms.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize, Constructor)]
pub struct BookLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
}

// ------------------------------------------------------------------------
// Canonical market events
// ------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub symbol: Symbol,
    pub market_type: MarketType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub side: Option<Side>,
    pub price: f64,
    pub size: f64,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kline {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub interval: SmolStr,
    pub start_ts: Ts,
    pub end_ts: Ts,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: Symbol,
    pub market_type: MarketType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mark_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index_price: Option<f64>,
    pub meta: EventMeta,
}

/// Unit an open-interest figure is denominated in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OiUnit {
    Base,
    Contracts,
    Unknown,
    Usd,
}

impl OiUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            OiUnit::Base => "base",
            OiUnit::Contracts => "contracts",
            OiUnit::Unknown => "unknown",
            OiUnit::Usd => "usd",
        }
    }
}

impl std::fmt::Display for OiUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterest {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub open_interest: f64,
    pub unit: OiUnit,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub open_interest_usd: Option<f64>,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Funding {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub funding_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_funding_ts: Option<Ts>,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Liquidation {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub notional_usd: Option<f64>,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookL2Snapshot {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub last_update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookL2Delta {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub first_update_id: u64,
    pub last_update_id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prev_update_id: Option<u64>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub meta: EventMeta,
}

/// Closed flow bucket: signed volume delta over `[bucket_start_ts, bucket_end_ts)`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cvd {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub cvd_delta: f64,
    pub cvd_total: f64,
    pub bucket_start_ts: Ts,
    pub bucket_end_ts: Ts,
    pub bucket_size_ms: i64,
    pub unit: SmolStr,
    pub meta: EventMeta,
}

// ------------------------------------------------------------------------
// Raw mirrors: venue-normalised records pre-aggregation, exact string forms
// ------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRaw {
    pub symbol: Symbol,
    pub market_type: MarketType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub side: Option<Side>,
    pub price: String,
    pub size: String,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerRaw {
    pub symbol: Symbol,
    pub market_type: MarketType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mark_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index_price: Option<String>,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KlineRaw {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub interval: SmolStr,
    pub start_ts: Ts,
    pub end_ts: Ts,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub closed: bool,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestRaw {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub open_interest: String,
    pub unit: OiUnit,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub open_interest_usd: Option<String>,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRaw {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub funding_rate: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_funding_ts: Option<Ts>,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationRaw {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub side: Side,
    pub price: String,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub notional_usd: Option<f64>,
    pub meta: EventMeta,
}

// ------------------------------------------------------------------------
// Control events
// ------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    Gap,
    OutOfOrder,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequested {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    pub reason: ResyncReason,
    pub ts: Ts,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnected {
    pub stream_id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub close_code: Option<u16>,
    pub ts: Ts,
}

// ------------------------------------------------------------------------
// Aggregated events
// ------------------------------------------------------------------------

/// Quality flags carried on every aggregated event. The quality monitor
/// re-derives [`ConfidenceInputs`] from these.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityFlags {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub consistent_units: Option<bool>,
    #[serde(default)]
    pub sequence_broken: bool,
    #[serde(default)]
    pub gap_detected: bool,
    #[serde(default)]
    pub lag_detected: bool,
    #[serde(default)]
    pub outlier_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fallback_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_cap: Option<f64>,
}

/// Which ticker field a canonical price was produced from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    Index,
    Mark,
    Last,
}

/// Why canonical price priority was demoted from index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackReason {
    IndexStale,
    NoIndex,
    MarkStale,
    NoMark,
}

/// Unit a liquidation bucket total is denominated in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidationUnit {
    Base,
    Usd,
}

/// Per-stream book health reported on liquidity aggregates.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueBookStatus {
    pub sequence_broken: bool,
}

/// Per-bucket liquidity metrics (weighted mean over contributing streams).
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityMetrics {
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub depth_bid: f64,
    pub depth_ask: f64,
    pub imbalance: f64,
    pub mid_price: f64,
}

/// Flow mismatch classification produced by the CVD mismatch-v1 detector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CvdMismatchType {
    Sign,
    Dispersion,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CvdMismatch {
    pub mismatch_type: CvdMismatchType,
    pub severity: f64,
    pub confidence_penalty: f64,
    pub sign_agreement: f64,
    pub max_abs_z: f64,
    pub max_median_ratio: f64,
}

/// Metric-specific fields of an aggregated event.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", tag = "metric")]
pub enum AggregateKind {
    #[serde(rename_all = "camelCase")]
    PriceCanonical {
        price_type_used: PriceType,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        fallback_reason: Option<FallbackReason>,
    },
    PriceIndex,
    Funding,
    #[serde(rename_all = "camelCase")]
    OpenInterest {
        unit: OiUnit,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        open_interest_value_usd: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Liquidations {
        unit: LiquidationUnit,
        count: u64,
        bucket_start_ts: Ts,
        bucket_end_ts: Ts,
    },
    #[serde(rename_all = "camelCase")]
    Liquidity {
        metrics: LiquidityMetrics,
        venue_status: BTreeMap<StreamId, VenueBookStatus>,
        bucket_start_ts: Ts,
        bucket_end_ts: Ts,
    },
    #[serde(rename_all = "camelCase")]
    Cvd {
        cvd_total: f64,
        bucket_start_ts: Ts,
        bucket_end_ts: Ts,
        bucket_size_ms: i64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        mismatch: Option<CvdMismatch>,
    },
}

/// Common envelope of every venue-consolidated event. All mappings are
/// `BTreeMap` and `sources_used` is sorted ascending so journal output is
/// byte-stable.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateEvent {
    pub symbol: Symbol,
    pub ts: Ts,
    pub market_type: MarketType,
    pub value: f64,
    pub venue_breakdown: BTreeMap<StreamId, f64>,
    pub sources_used: Vec<StreamId>,
    pub weights_used: BTreeMap<StreamId, f64>,
    pub fresh_sources_count: usize,
    pub stale_sources_dropped: Vec<StreamId>,
    pub mismatch_detected: bool,
    pub confidence_score: f64,
    pub quality_flags: QualityFlags,
    pub provider: SmolStr,
    pub meta: EventMeta,
    #[serde(flatten)]
    pub kind: AggregateKind,
}

// ------------------------------------------------------------------------
// Quality / replay / system events
// ------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    Stale,
    Mismatch,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum QualityKind {
    #[serde(rename_all = "camelCase")]
    Stale {
        last_ts: Ts,
        stale_threshold_ms: i64,
        expected_interval_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    Mismatch {
        min_stream: StreamId,
        min_value: f64,
        max_stream: StreamId,
        max_value: f64,
        diff: f64,
        relative: bool,
        window_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    MismatchSuppressed { reason: SmolStr },
    #[serde(rename_all = "camelCase")]
    Confidence {
        score: f64,
        inputs: ConfidenceInputs,
    },
    #[serde(rename_all = "camelCase")]
    Degraded { reason: DegradeReason, since_ts: Ts },
    #[serde(rename_all = "camelCase")]
    Recovered {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        last_error_ts: Option<Ts>,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityEvent {
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub observed_topic: Topic,
    pub provider: SmolStr,
    pub ts: Ts,
    #[serde(flatten)]
    pub kind: QualityKind,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ReplayEvent {
    #[serde(rename_all = "camelCase")]
    Started { run_id: SmolStr, files: usize },
    #[serde(rename_all = "camelCase")]
    Progress {
        emitted: u64,
        files_done: usize,
        files_total: usize,
    },
    #[serde(rename_all = "camelCase")]
    Warning { file: String, line: u64, detail: String },
    #[serde(rename_all = "camelCase")]
    Error { file: String, detail: String },
    #[serde(rename_all = "camelCase")]
    Finished {
        emitted: u64,
        warnings: u64,
        errors: u64,
        files: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataStatus {
    pub ts: Ts,
    pub connections: BTreeMap<SmolStr, SmolStr>,
    pub symbols: Vec<Symbol>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusErrorEvent {
    pub topic: Topic,
    pub handler_id: SmolStr,
    pub detail: String,
}

// ------------------------------------------------------------------------
// Topics
// ------------------------------------------------------------------------

/// Every topic name published on the bus. Names are contractual.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Topic {
    MarketTrade,
    MarketTradeRaw,
    MarketTicker,
    MarketTickerRaw,
    MarketKline,
    MarketKlineRaw,
    MarketOi,
    MarketOiRaw,
    MarketFunding,
    MarketFundingRaw,
    MarketLiquidation,
    MarketLiquidationRaw,
    MarketOrderbookL2Snapshot,
    MarketOrderbookL2Delta,
    MarketResyncRequested,
    MarketDisconnected,
    MarketPriceCanonical,
    MarketPriceIndex,
    MarketFundingAgg,
    MarketOiAgg,
    MarketLiquidationsAgg,
    MarketLiquidityAgg,
    MarketCvdSpot,
    MarketCvdFutures,
    MarketCvdSpotAgg,
    MarketCvdFuturesAgg,
    DataStale,
    DataMismatch,
    DataConfidence,
    DataSourceDegraded,
    DataSourceRecovered,
    ReplayStarted,
    ReplayProgress,
    ReplayWarning,
    ReplayError,
    ReplayFinished,
    SystemMarketDataStatus,
    BusError,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MarketTrade => "market:trade",
            Topic::MarketTradeRaw => "market:trade_raw",
            Topic::MarketTicker => "market:ticker",
            Topic::MarketTickerRaw => "market:ticker_raw",
            Topic::MarketKline => "market:kline",
            Topic::MarketKlineRaw => "market:kline_raw",
            Topic::MarketOi => "market:oi",
            Topic::MarketOiRaw => "market:oi_raw",
            Topic::MarketFunding => "market:funding",
            Topic::MarketFundingRaw => "market:funding_raw",
            Topic::MarketLiquidation => "market:liquidation",
            Topic::MarketLiquidationRaw => "market:liquidation_raw",
            Topic::MarketOrderbookL2Snapshot => "market:orderbook_l2_snapshot",
            Topic::MarketOrderbookL2Delta => "market:orderbook_l2_delta",
            Topic::MarketResyncRequested => "market:resync_requested",
            Topic::MarketDisconnected => "market:disconnected",
            Topic::MarketPriceCanonical => "market:price_canonical",
            Topic::MarketPriceIndex => "market:price_index",
            Topic::MarketFundingAgg => "market:funding_agg",
            Topic::MarketOiAgg => "market:oi_agg",
            Topic::MarketLiquidationsAgg => "market:liquidations_agg",
            Topic::MarketLiquidityAgg => "market:liquidity_agg",
            Topic::MarketCvdSpot => "market:cvd_spot",
            Topic::MarketCvdFutures => "market:cvd_futures",
            Topic::MarketCvdSpotAgg => "market:cvd_spot_agg",
            Topic::MarketCvdFuturesAgg => "market:cvd_futures_agg",
            Topic::DataStale => "data:stale",
            Topic::DataMismatch => "data:mismatch",
            Topic::DataConfidence => "data:confidence",
            Topic::DataSourceDegraded => "data:sourceDegraded",
            Topic::DataSourceRecovered => "data:sourceRecovered",
            Topic::ReplayStarted => "replay:started",
            Topic::ReplayProgress => "replay:progress",
            Topic::ReplayWarning => "replay:warning",
            Topic::ReplayError => "replay:error",
            Topic::ReplayFinished => "replay:finished",
            Topic::SystemMarketDataStatus => "system:market_data_status",
            Topic::BusError => "bus:error",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|topic| topic.as_str() == raw)
    }

    /// Journal path segment: topic name with the namespace separator folded.
    pub fn dir_name(&self) -> String {
        self.as_str().replace(':', "_")
    }

    /// Map a raw-mirror topic back to its canonical topic; canonical topics
    /// map to themselves. Replay always re-emits canonical topics.
    pub fn canonical(&self) -> Topic {
        match self {
            Topic::MarketTradeRaw => Topic::MarketTrade,
            Topic::MarketTickerRaw => Topic::MarketTicker,
            Topic::MarketKlineRaw => Topic::MarketKline,
            Topic::MarketOiRaw => Topic::MarketOi,
            Topic::MarketFundingRaw => Topic::MarketFunding,
            Topic::MarketLiquidationRaw => Topic::MarketLiquidation,
            other => *other,
        }
    }

    pub const ALL: [Topic; 38] = [
        Topic::MarketTrade,
        Topic::MarketTradeRaw,
        Topic::MarketTicker,
        Topic::MarketTickerRaw,
        Topic::MarketKline,
        Topic::MarketKlineRaw,
        Topic::MarketOi,
        Topic::MarketOiRaw,
        Topic::MarketFunding,
        Topic::MarketFundingRaw,
        Topic::MarketLiquidation,
        Topic::MarketLiquidationRaw,
        Topic::MarketOrderbookL2Snapshot,
        Topic::MarketOrderbookL2Delta,
        Topic::MarketResyncRequested,
        Topic::MarketDisconnected,
        Topic::MarketPriceCanonical,
        Topic::MarketPriceIndex,
        Topic::MarketFundingAgg,
        Topic::MarketOiAgg,
        Topic::MarketLiquidationsAgg,
        Topic::MarketLiquidityAgg,
        Topic::MarketCvdSpot,
        Topic::MarketCvdFutures,
        Topic::MarketCvdSpotAgg,
        Topic::MarketCvdFuturesAgg,
        Topic::DataStale,
        Topic::DataMismatch,
        Topic::DataConfidence,
        Topic::DataSourceDegraded,
        Topic::DataSourceRecovered,
        Topic::ReplayStarted,
        Topic::ReplayProgress,
        Topic::ReplayWarning,
        Topic::ReplayError,
        Topic::ReplayFinished,
        Topic::SystemMarketDataStatus,
        Topic::BusError,
    ];
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::from_str(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown topic: {raw}")))
    }
}

// ------------------------------------------------------------------------
// Bus payload union
// ------------------------------------------------------------------------

/// Central payload union carried on the bus (design-note mapping of the
/// source's discriminated records onto one tagged variant).
#[derive(Clone, Debug, PartialEq)]
pub enum BusPayload {
    Trade(Trade),
    TradeRaw(TradeRaw),
    Ticker(Ticker),
    TickerRaw(TickerRaw),
    Kline(Kline),
    KlineRaw(KlineRaw),
    OpenInterest(OpenInterest),
    OpenInterestRaw(OpenInterestRaw),
    Funding(Funding),
    FundingRaw(FundingRaw),
    Liquidation(Liquidation),
    LiquidationRaw(LiquidationRaw),
    OrderBookSnapshot(OrderBookL2Snapshot),
    OrderBookDelta(OrderBookL2Delta),
    ResyncRequested(ResyncRequested),
    Disconnected(Disconnected),
    Cvd(Cvd),
    Aggregate(AggregateEvent),
    Quality(QualityEvent),
    Replay(ReplayEvent),
    Status(MarketDataStatus),
    Error(BusErrorEvent),
}

impl BusPayload {
    /// Serialize the inner record (journal `payload` field).
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            BusPayload::Trade(event) => serde_json::to_value(event),
            BusPayload::TradeRaw(event) => serde_json::to_value(event),
            BusPayload::Ticker(event) => serde_json::to_value(event),
            BusPayload::TickerRaw(event) => serde_json::to_value(event),
            BusPayload::Kline(event) => serde_json::to_value(event),
            BusPayload::KlineRaw(event) => serde_json::to_value(event),
            BusPayload::OpenInterest(event) => serde_json::to_value(event),
            BusPayload::OpenInterestRaw(event) => serde_json::to_value(event),
            BusPayload::Funding(event) => serde_json::to_value(event),
            BusPayload::FundingRaw(event) => serde_json::to_value(event),
            BusPayload::Liquidation(event) => serde_json::to_value(event),
            BusPayload::LiquidationRaw(event) => serde_json::to_value(event),
            BusPayload::OrderBookSnapshot(event) => serde_json::to_value(event),
            BusPayload::OrderBookDelta(event) => serde_json::to_value(event),
            BusPayload::ResyncRequested(event) => serde_json::to_value(event),
            BusPayload::Disconnected(event) => serde_json::to_value(event),
            BusPayload::Cvd(event) => serde_json::to_value(event),
            BusPayload::Aggregate(event) => serde_json::to_value(event),
            BusPayload::Quality(event) => serde_json::to_value(event),
            BusPayload::Replay(event) => serde_json::to_value(event),
            BusPayload::Status(event) => serde_json::to_value(event),
            BusPayload::Error(event) => serde_json::to_value(event),
        }
    }

    /// Deserialize a journal `payload` back into the payload matching `topic`.
    pub fn from_topic_json(
        topic: Topic,
        value: serde_json::Value,
    ) -> serde_json::Result<BusPayload> {
        Ok(match topic.canonical() {
            Topic::MarketTrade => BusPayload::Trade(serde_json::from_value(value)?),
            Topic::MarketTicker => BusPayload::Ticker(serde_json::from_value(value)?),
            Topic::MarketKline => BusPayload::Kline(serde_json::from_value(value)?),
            Topic::MarketOi => BusPayload::OpenInterest(serde_json::from_value(value)?),
            Topic::MarketFunding => BusPayload::Funding(serde_json::from_value(value)?),
            Topic::MarketLiquidation => BusPayload::Liquidation(serde_json::from_value(value)?),
            Topic::MarketOrderbookL2Snapshot => {
                BusPayload::OrderBookSnapshot(serde_json::from_value(value)?)
            }
            Topic::MarketOrderbookL2Delta => {
                BusPayload::OrderBookDelta(serde_json::from_value(value)?)
            }
            Topic::MarketCvdSpot | Topic::MarketCvdFutures => {
                BusPayload::Cvd(serde_json::from_value(value)?)
            }
            Topic::MarketResyncRequested => {
                BusPayload::ResyncRequested(serde_json::from_value(value)?)
            }
            Topic::MarketDisconnected => BusPayload::Disconnected(serde_json::from_value(value)?),
            _ => BusPayload::Aggregate(serde_json::from_value(value)?),
        })
    }

    /// Symbol carried by the record, where one exists.
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            BusPayload::Trade(event) => Some(&event.symbol),
            BusPayload::TradeRaw(event) => Some(&event.symbol),
            BusPayload::Ticker(event) => Some(&event.symbol),
            BusPayload::TickerRaw(event) => Some(&event.symbol),
            BusPayload::Kline(event) => Some(&event.symbol),
            BusPayload::KlineRaw(event) => Some(&event.symbol),
            BusPayload::OpenInterest(event) => Some(&event.symbol),
            BusPayload::OpenInterestRaw(event) => Some(&event.symbol),
            BusPayload::Funding(event) => Some(&event.symbol),
            BusPayload::FundingRaw(event) => Some(&event.symbol),
            BusPayload::Liquidation(event) => Some(&event.symbol),
            BusPayload::LiquidationRaw(event) => Some(&event.symbol),
            BusPayload::OrderBookSnapshot(event) => Some(&event.symbol),
            BusPayload::OrderBookDelta(event) => Some(&event.symbol),
            BusPayload::ResyncRequested(event) => Some(&event.symbol),
            BusPayload::Cvd(event) => Some(&event.symbol),
            BusPayload::Aggregate(event) => Some(&event.symbol),
            BusPayload::Quality(event) => Some(&event.symbol),
            _ => None,
        }
    }

    /// Overwrite `meta.source`, preserving every other meta field. Used by
    /// replay, which re-emits records with `source = "replay"`.
    pub fn set_source(&mut self, source: &str) {
        if let Some(meta) = self.meta_mut() {
            meta.source = SmolStr::from(source);
        }
    }

    fn meta_mut(&mut self) -> Option<&mut EventMeta> {
        match self {
            BusPayload::Trade(event) => Some(&mut event.meta),
            BusPayload::TradeRaw(event) => Some(&mut event.meta),
            BusPayload::Ticker(event) => Some(&mut event.meta),
            BusPayload::TickerRaw(event) => Some(&mut event.meta),
            BusPayload::Kline(event) => Some(&mut event.meta),
            BusPayload::KlineRaw(event) => Some(&mut event.meta),
            BusPayload::OpenInterest(event) => Some(&mut event.meta),
            BusPayload::OpenInterestRaw(event) => Some(&mut event.meta),
            BusPayload::Funding(event) => Some(&mut event.meta),
            BusPayload::FundingRaw(event) => Some(&mut event.meta),
            BusPayload::Liquidation(event) => Some(&mut event.meta),
            BusPayload::LiquidationRaw(event) => Some(&mut event.meta),
            BusPayload::OrderBookSnapshot(event) => Some(&mut event.meta),
            BusPayload::OrderBookDelta(event) => Some(&mut event.meta),
            BusPayload::Cvd(event) => Some(&mut event.meta),
            BusPayload::Aggregate(event) => Some(&mut event.meta),
            _ => None,
        }
    }

    /// Meta carried by the record, where one exists.
    pub fn meta(&self) -> Option<&EventMeta> {
        match self {
            BusPayload::Trade(event) => Some(&event.meta),
            BusPayload::TradeRaw(event) => Some(&event.meta),
            BusPayload::Ticker(event) => Some(&event.meta),
            BusPayload::TickerRaw(event) => Some(&event.meta),
            BusPayload::Kline(event) => Some(&event.meta),
            BusPayload::KlineRaw(event) => Some(&event.meta),
            BusPayload::OpenInterest(event) => Some(&event.meta),
            BusPayload::OpenInterestRaw(event) => Some(&event.meta),
            BusPayload::Funding(event) => Some(&event.meta),
            BusPayload::FundingRaw(event) => Some(&event.meta),
            BusPayload::Liquidation(event) => Some(&event.meta),
            BusPayload::LiquidationRaw(event) => Some(&event.meta),
            BusPayload::OrderBookSnapshot(event) => Some(&event.meta),
            BusPayload::OrderBookDelta(event) => Some(&event.meta),
            BusPayload::Cvd(event) => Some(&event.meta),
            BusPayload::Aggregate(event) => Some(&event.meta),
            _ => None,
        }
    }
}

/// One published record: topic plus payload.
#[derive(Clone, Debug, PartialEq)]
pub struct BusEvent {
    pub topic: Topic,
    pub payload: BusPayload,
}

impl BusEvent {
    pub fn new(topic: Topic, payload: BusPayload) -> Self {
        Self { topic, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parse() {
        struct TestCase {
            input: &'static str,
            expected: Option<Side>,
        }

        let tests = vec![
            // TC0: lowercase buy
            TestCase {
                input: "buy",
                expected: Some(Side::Buy),
            },
            // TC1: single letter
            TestCase {
                input: "B",
                expected: Some(Side::Buy),
            },
            // TC2: mixed case sell
            TestCase {
                input: "SeLL",
                expected: Some(Side::Sell),
            },
            // TC3: single letter sell
            TestCase {
                input: "s",
                expected: Some(Side::Sell),
            },
            // TC4: unknown side is undefined
            TestCase {
                input: "unknown",
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(Side::parse(test.input), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_topic_roundtrip() {
        for topic in Topic::ALL {
            assert_eq!(Topic::from_str(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::from_str("market:nope"), None);
        assert_eq!(Topic::MarketTradeRaw.canonical(), Topic::MarketTrade);
        assert_eq!(
            Topic::MarketOrderbookL2Delta.canonical(),
            Topic::MarketOrderbookL2Delta
        );
        assert_eq!(Topic::MarketTrade.dir_name(), "market_trade");
    }

    #[test]
    fn test_meta_inherit_propagates_correlation_id() {
        let root = EventMeta::new(1_000, 1_001, "binance", StreamId::from("binance.futures.usd"));
        let derived = root.inherit(2_000, 2_001, "quorum", StreamId::from("binance.futures.usd"));
        assert_eq!(derived.correlation_id, root.correlation_id);
        assert_eq!(derived.ts_event, 2_000);
        assert_eq!(derived.source, "quorum");
    }

    #[test]
    fn test_aggregate_event_json_key_order_stable() {
        let mut venue_breakdown = BTreeMap::new();
        venue_breakdown.insert(StreamId::from("okx.public.swap"), 100.0);
        venue_breakdown.insert(StreamId::from("binance.futures.usd"), 101.0);

        let event = AggregateEvent {
            symbol: Symbol::from("BTCUSDT"),
            ts: 1_700_000_000_000,
            market_type: MarketType::Futures,
            value: 100.5,
            venue_breakdown,
            sources_used: vec![
                StreamId::from("binance.futures.usd"),
                StreamId::from("okx.public.swap"),
            ],
            weights_used: BTreeMap::new(),
            fresh_sources_count: 2,
            stale_sources_dropped: vec![],
            mismatch_detected: false,
            confidence_score: 1.0,
            quality_flags: QualityFlags::default(),
            provider: SmolStr::from("quorum"),
            meta: EventMeta::new(
                1_700_000_000_000,
                1_700_000_000_001,
                "quorum",
                StreamId::from("quorum.agg"),
            ),
            kind: AggregateKind::PriceIndex,
        };

        let json = serde_json::to_string(&event).unwrap();
        // BTreeMap keys serialise sorted ascending
        let binance_at = json.find("binance.futures.usd").unwrap();
        let okx_at = json.find("okx.public.swap").unwrap();
        assert!(binance_at < okx_at);

        // Round-trips structurally
        let back: AggregateEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
