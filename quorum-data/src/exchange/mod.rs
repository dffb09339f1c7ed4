//! Venue connectors: wire-format adapters plus connection metadata.
//!
//! A [`Connector`] owns everything venue-specific (URLs, keepalive, the
//! SUBSCRIBE frame dialect, and the pure payload normalisers) while the
//! generic client in [`crate::client`] owns the lifecycle state machine,
//! subscription reconciliation and order-book sequencing that are common to
//! every venue.

use crate::{
    books::SequenceRule,
    error::DataError,
    event::{BusPayload, MarketType, OrderBookL2Delta, OrderBookL2Snapshot, StreamId, Topic},
    subscription::SubKey,
    symbol::Symbol,
    time::Ts,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Binance spot + futures wire types and adapters.
pub mod binance;

/// Bybit v5 wire types and adapters.
pub mod bybit;

/// OKX public-channel wire types and adapters.
pub mod okx;

/// An exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Okx,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Bybit => "bybit",
            Venue::Okx => "okx",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Feed families a client can subscribe to on a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FeedChannel {
    Trades,
    Ticker,
    Orderbook,
    Klines,
    Liquidations,
}

/// Keepalive specification for a connection.
#[derive(Clone, Debug)]
pub struct PingSpec {
    pub interval: Duration,
    pub frame: String,
}

/// One classified inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Normalised events ready for the bus, in wire order.
    Events(Vec<(Topic, BusPayload)>),
    /// Order-book delta routed through the reconcile FSM.
    BookDelta(OrderBookL2Delta),
    /// Order-book snapshot delivered in-band (OKX `action: "snapshot"`).
    BookSnapshot(OrderBookL2Snapshot),
    /// Subscribe confirmation matched by request id (Binance, Bybit).
    SubAckId(u64),
    /// Subscribe confirmation carrying the confirmed keys (OKX).
    SubAckKeys(Vec<SubKey>),
    /// Venue rejected a subscription.
    SubError(String),
    /// Keepalive response.
    Pong,
    /// Anything else: dropped silently (counted by the client).
    Ignore,
}

/// Everything venue-specific, behind one object-safe trait.
pub trait Connector: Send + Sync {
    /// Stable stream id, e.g. `okx.public.swap`. Doubles as the connection id.
    fn stream_id(&self) -> StreamId;

    fn venue(&self) -> Venue;

    fn market_type(&self) -> MarketType;

    fn ws_url(&self) -> &str;

    fn ping(&self) -> Option<PingSpec> {
        None
    }

    /// Canonical subscription keys for a feed on this connection; empty when
    /// the venue does not support the feed. A feed may span several venue
    /// channels (e.g. mark and index price alongside the ticker). `interval`
    /// applies to kline subscriptions.
    fn sub_keys(&self, feed: FeedChannel, symbol: &Symbol, interval: Option<&str>) -> Vec<SubKey>;

    /// Build the SUBSCRIBE frame(s) for a flush diff. `request_id` correlates
    /// venue acks that echo an id instead of the subscribed args.
    fn subscribe_frames(&self, keys: &[SubKey], request_id: u64) -> Vec<String>;

    /// Build UNSUBSCRIBE frame(s); used to force a fresh in-band snapshot on
    /// venues whose book snapshot has no REST endpoint.
    fn unsubscribe_frames(&self, _keys: &[SubKey], _request_id: u64) -> Vec<String> {
        vec![]
    }

    /// Classify and normalise one text frame. Pure given `(text, now_ms)`.
    fn parse(&self, text: &str, now_ms: Ts) -> Vec<Inbound>;

    /// Sequencing discipline of this connection's L2 feed.
    fn book_rule(&self) -> SequenceRule;

    /// REST snapshot URL, or `None` when the snapshot arrives in-band.
    fn book_snapshot_url(&self, symbol: &Symbol) -> Option<String>;

    /// Parse the REST snapshot response body.
    fn parse_book_snapshot(
        &self,
        symbol: &Symbol,
        body: &serde_json::Value,
        now_ms: Ts,
    ) -> Result<OrderBookL2Snapshot, DataError>;

    /// Current-day kline bootstrap URL, or `None` when unsupported.
    fn kline_bootstrap_url(&self, symbol: &Symbol, interval: &str, day_start_ms: Ts)
    -> Option<String>;

    /// Parse the kline bootstrap response into closed kline events.
    fn parse_kline_bootstrap(
        &self,
        symbol: &Symbol,
        interval: &str,
        body: &serde_json::Value,
        now_ms: Ts,
    ) -> Result<Vec<(Topic, BusPayload)>, DataError>;
}
