//! OKX public-channel connector.
//!
//! Frames are `{arg:{channel,instId|instType}, data:[..]}`; book frames add
//! `action: "snapshot"|"update"` and chain on `seqId`/`prevSeqId`.
//! Subscription frames are `{op:"subscribe", args:[arg]}` and the venue acks
//! each arg with `{event:"subscribe", arg}`.
//!
//! See docs: <https://www.okx.com/docs-v5/en/#websocket-api-public-channel>

use super::{Connector, FeedChannel, Inbound, PingSpec, Venue};
use crate::{
    books::SequenceRule,
    error::DataError,
    event::{
        BookLevel, BusPayload, EventMeta, Funding, FundingRaw, Kline, KlineRaw, Liquidation,
        LiquidationRaw, MarketType, OrderBookL2Delta, OrderBookL2Snapshot, Side, StreamId, Ticker,
        TickerRaw, Topic, Trade, TradeRaw,
    },
    subscription::SubKey,
    symbol::{Symbol, canonical_symbol, okx_inst_id},
    time::{Ts, interval_duration_ms},
};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use smol_str::SmolStr;
use std::time::Duration;

/// [`Okx`] public WebSocket url.
pub const WS_URL_OKX: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// [`Okx`] keepalive interval: the venue disconnects after 30 s of silence.
///
/// See docs: <https://www.okx.com/docs-v5/en/#websocket-api-connect>
pub const PING_INTERVAL_OKX: Duration = Duration::from_secs(29);

/// [`Okx`] HTTP open interest url (REST poller).
pub const HTTP_OPEN_INTEREST_URL_OKX: &str = "https://www.okx.com/api/v5/public/open-interest";

/// [`Okx`] HTTP funding rate url (REST poller).
pub const HTTP_FUNDING_RATE_URL_OKX: &str = "https://www.okx.com/api/v5/public/funding-rate";

/// [`Okx`] HTTP candles url (kline bootstrap).
pub const HTTP_CANDLES_URL_OKX: &str = "https://www.okx.com/api/v5/market/candles";

/// OKX connector for one market type (spot inst-ids or `-SWAP` inst-ids).
#[derive(Clone, Copy, Debug)]
pub struct Okx {
    market: MarketType,
}

impl Okx {
    pub fn spot() -> Self {
        Self {
            market: MarketType::Spot,
        }
    }

    pub fn swap() -> Self {
        Self {
            market: MarketType::Futures,
        }
    }

    fn is_swap(&self) -> bool {
        self.market == MarketType::Futures
    }

    fn inst_id(&self, symbol: &Symbol) -> Option<String> {
        okx_inst_id(symbol, self.is_swap())
    }

    fn meta(&self, ts_event: Ts, now_ms: Ts, sequence: Option<u64>) -> EventMeta {
        let mut meta = EventMeta::new(ts_event, now_ms, "okx", self.stream_id());
        meta.ts_exchange = Some(ts_event);
        meta.sequence = sequence;
        meta
    }
}

impl Connector for Okx {
    fn stream_id(&self) -> StreamId {
        if self.is_swap() {
            StreamId::from("okx.public.swap")
        } else {
            StreamId::from("okx.public.spot")
        }
    }

    fn venue(&self) -> Venue {
        Venue::Okx
    }

    fn market_type(&self) -> MarketType {
        self.market
    }

    fn ws_url(&self) -> &str {
        WS_URL_OKX
    }

    fn ping(&self) -> Option<PingSpec> {
        Some(PingSpec {
            interval: PING_INTERVAL_OKX,
            frame: "ping".to_string(),
        })
    }

    fn sub_keys(&self, feed: FeedChannel, symbol: &Symbol, interval: Option<&str>) -> Vec<SubKey> {
        let Some(inst_id) = self.inst_id(symbol) else {
            return vec![];
        };
        match feed {
            FeedChannel::Trades => vec![SubKey::new("trades", inst_id)],
            FeedChannel::Ticker => {
                let mut keys = vec![SubKey::new("tickers", inst_id.clone())];
                if self.is_swap() {
                    keys.push(SubKey::new("mark-price", inst_id));
                    // Index tickers use the underlying spot pair
                    if let Some(index_id) = okx_inst_id(symbol, false) {
                        keys.push(SubKey::new("index-tickers", index_id));
                    }
                }
                keys
            }
            FeedChannel::Orderbook => vec![SubKey::new("books", inst_id)],
            FeedChannel::Klines => match interval {
                Some(interval) => vec![SubKey::new(
                    format!("candle{}", interval),
                    inst_id,
                )],
                None => vec![],
            },
            FeedChannel::Liquidations => {
                if self.is_swap() {
                    // Liquidation channel expects derivatives metadata
                    vec![SubKey::new("liquidation-orders", "SWAP")]
                } else {
                    vec![]
                }
            }
        }
    }

    fn subscribe_frames(&self, keys: &[SubKey], _request_id: u64) -> Vec<String> {
        vec![
            json!({
                "op": "subscribe",
                "args": keys.iter().map(sub_arg).collect::<Vec<_>>(),
            })
            .to_string(),
        ]
    }

    fn unsubscribe_frames(&self, keys: &[SubKey], _request_id: u64) -> Vec<String> {
        vec![
            json!({
                "op": "unsubscribe",
                "args": keys.iter().map(sub_arg).collect::<Vec<_>>(),
            })
            .to_string(),
        ]
    }

    fn parse(&self, text: &str, now_ms: Ts) -> Vec<Inbound> {
        if text == "pong" {
            return vec![Inbound::Pong];
        }
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return vec![Inbound::Ignore];
        };

        if let Some(event) = value.get("event").and_then(Value::as_str) {
            return match event {
                "subscribe" => match value.get("arg").and_then(arg_to_key) {
                    Some(key) => vec![Inbound::SubAckKeys(vec![key])],
                    None => vec![Inbound::Ignore],
                },
                "error" => vec![Inbound::SubError(
                    value
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or("okx subscribe error")
                        .to_string(),
                )],
                _ => vec![Inbound::Ignore],
            };
        }

        let Some(channel) = value
            .pointer("/arg/channel")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return vec![Inbound::Ignore];
        };

        match channel.as_str() {
            "trades" => match serde_json::from_value::<OkxMessage<OkxTrade>>(value) {
                Ok(message) => vec![Inbound::Events(self.trade_events(message, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "tickers" => match serde_json::from_value::<OkxMessage<OkxTicker>>(value) {
                Ok(message) => vec![Inbound::Events(self.ticker_events(message, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "mark-price" => match serde_json::from_value::<OkxMessage<OkxMarkPrice>>(value) {
                Ok(message) => vec![Inbound::Events(self.mark_price_events(message, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "index-tickers" => match serde_json::from_value::<OkxMessage<OkxIndexTicker>>(value) {
                Ok(message) => vec![Inbound::Events(self.index_ticker_events(message, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "books" => match serde_json::from_value::<OkxBookMessage>(value) {
                Ok(message) => self.book_inbound(message, now_ms),
                Err(_) => vec![Inbound::Ignore],
            },
            "liquidation-orders" => {
                match serde_json::from_value::<OkxMessage<OkxLiquidation>>(value) {
                    Ok(message) => vec![Inbound::Events(self.liquidation_events(message, now_ms))],
                    Err(_) => vec![Inbound::Ignore],
                }
            }
            channel if channel.starts_with("candle") => {
                match serde_json::from_value::<OkxMessage<OkxCandle>>(value) {
                    Ok(message) => {
                        vec![Inbound::Events(self.candle_events(&channel[6..], message, now_ms))]
                    }
                    Err(_) => vec![Inbound::Ignore],
                }
            }
            _ => vec![Inbound::Ignore],
        }
    }

    fn book_rule(&self) -> SequenceRule {
        SequenceRule::OkxSeqId
    }

    fn book_snapshot_url(&self, _symbol: &Symbol) -> Option<String> {
        // Snapshot arrives in-band as the books channel's first frame
        None
    }

    fn parse_book_snapshot(
        &self,
        _symbol: &Symbol,
        _body: &Value,
        _now_ms: Ts,
    ) -> Result<OrderBookL2Snapshot, DataError> {
        Err(DataError::Protocol(
            "okx book snapshots are delivered in-band".to_string(),
        ))
    }

    fn kline_bootstrap_url(
        &self,
        symbol: &Symbol,
        interval: &str,
        _day_start_ms: Ts,
    ) -> Option<String> {
        let inst_id = self.inst_id(symbol)?;
        Some(format!(
            "{HTTP_CANDLES_URL_OKX}?instId={inst_id}&bar={interval}&limit=300"
        ))
    }

    fn parse_kline_bootstrap(
        &self,
        symbol: &Symbol,
        interval: &str,
        body: &Value,
        now_ms: Ts,
    ) -> Result<Vec<(Topic, BusPayload)>, DataError> {
        let response: OkxRestResponse<OkxCandle> = serde_json::from_value(body.clone())?;
        let mut events = Vec::new();
        // REST candles arrive newest-first
        for candle in response.data.into_iter().rev() {
            if candle.confirm != "1" {
                continue;
            }
            events.extend(self.candle_pair(symbol.clone(), interval, candle, now_ms));
        }
        Ok(events)
    }
}

impl Okx {
    fn trade_events(&self, message: OkxMessage<OkxTrade>, now_ms: Ts) -> Vec<(Topic, BusPayload)> {
        let mut events = Vec::new();
        for trade in message.data {
            let (Ok(price), Ok(size), Ok(ts)) = (
                trade.price.parse::<f64>(),
                trade.size.parse::<f64>(),
                trade.ts.parse::<i64>(),
            ) else {
                continue;
            };
            if !price.is_finite() || !size.is_finite() || ts <= 0 {
                continue;
            }

            let symbol = canonical_symbol(&trade.inst_id);
            let side = Side::parse(&trade.side);
            let sequence = trade.trade_id.as_deref().and_then(|id| id.parse().ok());
            let meta = self.meta(ts, now_ms, sequence);

            events.push((
                Topic::MarketTradeRaw,
                BusPayload::TradeRaw(TradeRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    side,
                    price: trade.price.clone(),
                    size: trade.size.clone(),
                    meta: meta.clone(),
                }),
            ));
            events.push((
                Topic::MarketTrade,
                BusPayload::Trade(Trade {
                    symbol,
                    market_type: self.market,
                    side,
                    price,
                    size,
                    meta,
                }),
            ));
        }
        events
    }

    fn ticker_events(&self, message: OkxMessage<OkxTicker>, now_ms: Ts) -> Vec<(Topic, BusPayload)> {
        let mut events = Vec::new();
        for ticker in message.data {
            let Ok(ts) = ticker.ts.parse::<i64>() else {
                continue;
            };
            let symbol = canonical_symbol(&ticker.inst_id);
            let meta = self.meta(ts, now_ms, None);
            let last = ticker.last.as_ref().and_then(|raw| raw.parse::<f64>().ok());

            events.push((
                Topic::MarketTickerRaw,
                BusPayload::TickerRaw(TickerRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_price: ticker.last.clone(),
                    mark_price: None,
                    index_price: None,
                    meta: meta.clone(),
                }),
            ));
            events.push((
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol,
                    market_type: self.market,
                    last_price: last,
                    mark_price: None,
                    index_price: None,
                    meta,
                }),
            ));
        }
        events
    }

    fn mark_price_events(
        &self,
        message: OkxMessage<OkxMarkPrice>,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let mut events = Vec::new();
        for mark in message.data {
            let Ok(ts) = mark.ts.parse::<i64>() else {
                continue;
            };
            let symbol = canonical_symbol(&mark.inst_id);
            let meta = self.meta(ts, now_ms, None);
            let mark_px = mark.mark_price.as_ref().and_then(|raw| raw.parse::<f64>().ok());

            events.push((
                Topic::MarketTickerRaw,
                BusPayload::TickerRaw(TickerRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_price: None,
                    mark_price: mark.mark_price.clone(),
                    index_price: None,
                    meta: meta.clone(),
                }),
            ));
            events.push((
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol,
                    market_type: self.market,
                    last_price: None,
                    mark_price: mark_px,
                    index_price: None,
                    meta,
                }),
            ));
        }
        events
    }

    fn index_ticker_events(
        &self,
        message: OkxMessage<OkxIndexTicker>,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let mut events = Vec::new();
        for ticker in message.data {
            let Ok(ts) = ticker.ts.parse::<i64>() else {
                continue;
            };
            let symbol = canonical_symbol(&ticker.inst_id);
            let meta = self.meta(ts, now_ms, None);
            let index_px = ticker.index_price.as_ref().and_then(|raw| raw.parse::<f64>().ok());

            events.push((
                Topic::MarketTickerRaw,
                BusPayload::TickerRaw(TickerRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_price: None,
                    mark_price: None,
                    index_price: ticker.index_price.clone(),
                    meta: meta.clone(),
                }),
            ));
            events.push((
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol,
                    market_type: self.market,
                    last_price: None,
                    mark_price: None,
                    index_price: index_px,
                    meta,
                }),
            ));
        }
        events
    }

    fn book_inbound(&self, message: OkxBookMessage, now_ms: Ts) -> Vec<Inbound> {
        let symbol = canonical_symbol(&message.arg.inst_id);
        let mut inbound = Vec::new();
        for data in message.data {
            let Ok(ts) = data.ts.parse::<i64>() else {
                continue;
            };
            let seq_id = data.seq_id.unwrap_or(0);
            let prev_seq_id = data.prev_seq_id.filter(|prev| *prev >= 0).map(|prev| prev as u64);
            let bids: Vec<BookLevel> = data.bids.iter().map(OkxLevel::to_book_level).collect();
            let asks: Vec<BookLevel> = data.asks.iter().map(OkxLevel::to_book_level).collect();
            let meta = self.meta(ts, now_ms, Some(seq_id));

            match message.action {
                OkxBookAction::Snapshot => inbound.push(Inbound::BookSnapshot(OrderBookL2Snapshot {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_update_id: seq_id,
                    bids,
                    asks,
                    meta,
                })),
                OkxBookAction::Update => inbound.push(Inbound::BookDelta(OrderBookL2Delta {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    first_update_id: seq_id,
                    last_update_id: seq_id,
                    prev_update_id: prev_seq_id,
                    bids,
                    asks,
                    meta,
                })),
            }
        }
        if inbound.is_empty() {
            vec![Inbound::Ignore]
        } else {
            inbound
        }
    }

    fn candle_events(
        &self,
        interval: &str,
        message: OkxMessage<OkxCandle>,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let symbol = canonical_symbol(&message.arg.inst_id);
        let mut events = Vec::new();
        for candle in message.data {
            // Emit on confirm only
            if candle.confirm != "1" {
                continue;
            }
            events.extend(self.candle_pair(symbol.clone(), interval, candle, now_ms));
        }
        events
    }

    fn candle_pair(
        &self,
        symbol: Symbol,
        interval: &str,
        candle: OkxCandle,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let Ok(start_ts) = candle.ts.parse::<i64>() else {
            return vec![];
        };
        let parsed: Option<(f64, f64, f64, f64, f64)> = (|| {
            Some((
                candle.open.parse().ok()?,
                candle.high.parse().ok()?,
                candle.low.parse().ok()?,
                candle.close.parse().ok()?,
                candle.volume.parse().ok()?,
            ))
        })();
        let Some((open, high, low, close, volume)) = parsed else {
            return vec![];
        };

        // OKX candles carry no explicit close time
        let end_ts = start_ts + interval_duration_ms(interval).unwrap_or(60_000);
        let meta = self.meta(end_ts, now_ms, None);

        vec![
            (
                Topic::MarketKlineRaw,
                BusPayload::KlineRaw(KlineRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    interval: SmolStr::from(interval),
                    start_ts,
                    end_ts,
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    volume: candle.volume,
                    closed: true,
                    meta: meta.clone(),
                }),
            ),
            (
                Topic::MarketKline,
                BusPayload::Kline(Kline {
                    symbol,
                    market_type: self.market,
                    interval: SmolStr::from(interval),
                    start_ts,
                    end_ts,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    closed: true,
                    meta,
                }),
            ),
        ]
    }

    fn liquidation_events(
        &self,
        message: OkxMessage<OkxLiquidation>,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let mut events = Vec::new();
        for liquidation in message.data {
            let symbol = canonical_symbol(&liquidation.inst_id);
            for detail in liquidation.details {
                let Some(side) = Side::parse(&detail.side) else {
                    continue;
                };
                let (Ok(price), Ok(size), Ok(ts)) = (
                    detail.price.parse::<f64>(),
                    detail.size.parse::<f64>(),
                    detail.ts.parse::<i64>(),
                ) else {
                    continue;
                };
                if !price.is_finite() || !size.is_finite() {
                    continue;
                }

                let meta = self.meta(ts, now_ms, None);
                let notional_usd = Some(price * size);

                events.push((
                    Topic::MarketLiquidationRaw,
                    BusPayload::LiquidationRaw(LiquidationRaw {
                        symbol: symbol.clone(),
                        market_type: self.market,
                        side,
                        price: detail.price.clone(),
                        size: detail.size.clone(),
                        notional_usd,
                        meta: meta.clone(),
                    }),
                ));
                events.push((
                    Topic::MarketLiquidation,
                    BusPayload::Liquidation(Liquidation {
                        symbol: symbol.clone(),
                        market_type: self.market,
                        side,
                        price,
                        size,
                        notional_usd,
                        meta,
                    }),
                ));
            }
        }
        events
    }
}

fn sub_arg(key: &SubKey) -> Value {
    if key.channel == "liquidation-orders" {
        json!({ "channel": key.channel.as_str(), "instType": key.market.as_str() })
    } else {
        json!({ "channel": key.channel.as_str(), "instId": key.market.as_str() })
    }
}

fn arg_to_key(arg: &Value) -> Option<SubKey> {
    let channel = arg.get("channel")?.as_str()?;
    let market = arg
        .get("instId")
        .or_else(|| arg.get("instType"))?
        .as_str()?;
    Some(SubKey::new(channel, market))
}

// ------------------------------------------------------------------------
// Wire types
// ------------------------------------------------------------------------

/// Generic `{arg, data}` frame wrapper.
#[derive(Clone, Debug, Deserialize)]
pub struct OkxMessage<T> {
    pub arg: OkxArg,
    pub data: Vec<T>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OkxArg {
    pub channel: String,
    #[serde(rename = "instId", default)]
    pub inst_id: String,
    #[serde(rename = "instType", default)]
    pub inst_type: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OkxTrade {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "tradeId", default)]
    pub trade_id: Option<String>,
    #[serde(rename = "px")]
    pub price: String,
    #[serde(rename = "sz")]
    pub size: String,
    pub side: String,
    pub ts: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OkxTicker {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(default)]
    pub last: Option<String>,
    pub ts: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OkxMarkPrice {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "markPx", default)]
    pub mark_price: Option<String>,
    pub ts: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OkxIndexTicker {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "idxPx", default)]
    pub index_price: Option<String>,
    pub ts: String,
}

/// Book frame: `{arg, action, data:[{asks, bids, ts, seqId, prevSeqId}]}`.
#[derive(Clone, Debug, Deserialize)]
pub struct OkxBookMessage {
    pub arg: OkxArg,
    pub action: OkxBookAction,
    pub data: Vec<OkxBookData>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OkxBookAction {
    Snapshot,
    Update,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OkxBookData {
    pub asks: Vec<OkxLevel>,
    pub bids: Vec<OkxLevel>,
    pub ts: String,
    #[serde(rename = "seqId", default)]
    pub seq_id: Option<u64>,
    /// `-1` on snapshots.
    #[serde(rename = "prevSeqId", default)]
    pub prev_seq_id: Option<i64>,
}

/// OKX level: `["price", "size", "deprecated", "numOrders"]`.
#[derive(Clone, Debug)]
pub struct OkxLevel {
    pub price: String,
    pub size: String,
}

impl OkxLevel {
    fn to_book_level(&self) -> BookLevel {
        BookLevel {
            price: self.price.parse().unwrap_or_default(),
            size: self.size.parse().unwrap_or_default(),
        }
    }
}

impl<'de> Deserialize<'de> for OkxLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let arr: Vec<String> = Deserialize::deserialize(deserializer)?;
        if arr.len() < 2 {
            return Err(serde::de::Error::custom("expected >= 2 elements in level array"));
        }
        let mut iter = arr.into_iter();
        Ok(OkxLevel {
            price: iter.next().unwrap_or_default(),
            size: iter.next().unwrap_or_default(),
        })
    }
}

/// Candle row: `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`.
#[derive(Clone, Debug)]
pub struct OkxCandle {
    pub ts: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub confirm: String,
}

impl<'de> Deserialize<'de> for OkxCandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let arr: Vec<String> = Deserialize::deserialize(deserializer)?;
        if arr.len() < 6 {
            return Err(serde::de::Error::custom("expected >= 6 candle columns"));
        }
        let confirm = arr.last().cloned().unwrap_or_default();
        let mut iter = arr.into_iter();
        Ok(OkxCandle {
            ts: iter.next().unwrap_or_default(),
            open: iter.next().unwrap_or_default(),
            high: iter.next().unwrap_or_default(),
            low: iter.next().unwrap_or_default(),
            close: iter.next().unwrap_or_default(),
            volume: iter.next().unwrap_or_default(),
            confirm,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OkxLiquidation {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(default)]
    pub details: Vec<OkxLiquidationDetail>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OkxLiquidationDetail {
    pub side: String,
    #[serde(rename = "bkPx")]
    pub price: String,
    #[serde(rename = "sz")]
    pub size: String,
    pub ts: String,
}

/// Generic OKX REST envelope `{code, msg, data}`.
#[derive(Clone, Debug, Deserialize)]
pub struct OkxRestResponse<T> {
    pub code: String,
    pub data: Vec<T>,
}

/// REST open interest row (poller).
#[derive(Clone, Debug, Deserialize)]
pub struct OkxOpenInterestData {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "oi")]
    pub contracts: String,
    #[serde(rename = "oiCcy", default)]
    pub base_amount: Option<String>,
    #[serde(rename = "oiUsd", default)]
    pub usd_amount: Option<String>,
    pub ts: String,
}

/// REST funding rate row (poller).
#[derive(Clone, Debug, Deserialize)]
pub struct OkxFundingRateData {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "fundingRate")]
    pub funding_rate: String,
    #[serde(rename = "nextFundingTime", default)]
    pub next_funding_time: Option<String>,
    #[serde(rename = "fundingTime", default)]
    pub funding_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_okx_trade_mapping() {
        // arg {channel:'trades', instId:'BTC-USDT-SWAP'},
        // data [{px:'100', sz:'1', side:'buy', ts:'1700000000000'}]
        let connector = Okx::swap();
        let frame = r#"{
            "arg":{"channel":"trades","instId":"BTC-USDT-SWAP"},
            "data":[{"instId":"BTC-USDT-SWAP","tradeId":"42","px":"100","sz":"1",
                     "side":"buy","ts":"1700000000000"}]
        }"#;

        let inbound = connector.parse(frame, 1_700_000_000_050);
        let Inbound::Events(events) = &inbound[0] else {
            panic!("expected events, got {inbound:?}");
        };
        assert_eq!(events.len(), 2);

        let (_, BusPayload::Trade(trade)) = &events[1] else {
            panic!("expected trade payload");
        };
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.side, Some(Side::Buy));
        assert_eq!(trade.price, 100.0);
        assert_eq!(trade.size, 1.0);
        assert_eq!(trade.market_type, MarketType::Futures);
        assert_eq!(trade.meta.ts_exchange, Some(1_700_000_000_000));
        assert_eq!(trade.meta.stream_id, "okx.public.swap");
    }

    #[test]
    fn test_okx_book_snapshot_and_update() {
        let connector = Okx::swap();
        let snapshot = r#"{
            "arg":{"channel":"books","instId":"BTC-USDT-SWAP"},
            "action":"snapshot",
            "data":[{
                "asks":[["41006.8","0.60038921","0","1"]],
                "bids":[["41006.7","0.30178218","0","2"]],
                "ts":"1629966436396","seqId":123456,"prevSeqId":-1,
                "checksum":-855196043
            }]
        }"#;

        let inbound = connector.parse(snapshot, 1_629_966_436_400);
        let Inbound::BookSnapshot(book) = &inbound[0] else {
            panic!("expected snapshot, got {inbound:?}");
        };
        assert_eq!(book.last_update_id, 123456);
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.symbol, "BTCUSDT");

        let update = r#"{
            "arg":{"channel":"books","instId":"BTC-USDT-SWAP"},
            "action":"update",
            "data":[{
                "asks":[],
                "bids":[["41006.7","0","0","0"]],
                "ts":"1629966436500","seqId":123457,"prevSeqId":123456
            }]
        }"#;
        let inbound = connector.parse(update, 1_629_966_436_600);
        let Inbound::BookDelta(delta) = &inbound[0] else {
            panic!("expected delta, got {inbound:?}");
        };
        assert_eq!(delta.first_update_id, 123457);
        assert_eq!(delta.prev_update_id, Some(123456));
        assert!(delta.bids[0].size.is_zero());
    }

    #[test]
    fn test_okx_candle_confirm_gating() {
        let connector = Okx::swap();
        let open = r#"{
            "arg":{"channel":"candle1m","instId":"BTC-USDT-SWAP"},
            "data":[["1700000000000","100","101","99","100.5","10","415000","0","0"]]
        }"#;
        let inbound = connector.parse(open, 1_700_000_030_000);
        assert_eq!(inbound, vec![Inbound::Events(vec![])]);

        let confirmed = open.replace(r#","0"]"#, r#","1"]"#);
        let inbound = connector.parse(&confirmed, 1_700_000_060_001);
        let Inbound::Events(events) = &inbound[0] else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        let (_, BusPayload::Kline(kline)) = &events[1] else {
            panic!("expected kline payload");
        };
        assert_eq!(kline.start_ts, 1_700_000_000_000);
        assert_eq!(kline.end_ts, 1_700_000_060_000);
        assert_eq!(kline.interval, "1m");
    }

    #[test]
    fn test_okx_subscribe_frames_and_ack() {
        let connector = Okx::swap();
        let keys = connector.sub_keys(FeedChannel::Trades, &Symbol::from("BTCUSDT"), None);
        assert_eq!(keys, vec![SubKey::new("trades", "BTC-USDT-SWAP")]);

        let frames = connector.subscribe_frames(&keys, 1);
        let value: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "trades");
        assert_eq!(value["args"][0]["instId"], "BTC-USDT-SWAP");

        let ack = r#"{"event":"subscribe","arg":{"channel":"trades","instId":"BTC-USDT-SWAP"}}"#;
        assert_eq!(
            connector.parse(ack, 0),
            vec![Inbound::SubAckKeys(vec![SubKey::new(
                "trades",
                "BTC-USDT-SWAP"
            )])]
        );

        assert_eq!(connector.parse("pong", 0), vec![Inbound::Pong]);
    }

    #[test]
    fn test_okx_liquidation_events() {
        let connector = Okx::swap();
        let frame = r#"{
            "arg":{"channel":"liquidation-orders","instType":"SWAP"},
            "data":[{
                "instId":"BTC-USDT-SWAP","instFamily":"BTC-USDT",
                "details":[{"side":"sell","bkPx":"43000","sz":"0.5","bkLoss":"0","ts":"1700000000000"}]
            }]
        }"#;

        let inbound = connector.parse(frame, 1_700_000_000_100);
        let Inbound::Events(events) = &inbound[0] else {
            panic!("expected events");
        };
        let (_, BusPayload::Liquidation(liq)) = &events[1] else {
            panic!("expected liquidation payload");
        };
        assert_eq!(liq.side, Side::Sell);
        assert_eq!(liq.notional_usd, Some(21500.0));
    }

    #[test]
    fn test_okx_ticker_keys_for_swap_include_mark_and_index() {
        let connector = Okx::swap();
        let keys = connector.sub_keys(FeedChannel::Ticker, &Symbol::from("BTCUSDT"), None);
        assert_eq!(
            keys,
            vec![
                SubKey::new("tickers", "BTC-USDT-SWAP"),
                SubKey::new("mark-price", "BTC-USDT-SWAP"),
                SubKey::new("index-tickers", "BTC-USDT"),
            ]
        );

        let spot = Okx::spot();
        let keys = spot.sub_keys(FeedChannel::Ticker, &Symbol::from("BTCUSDT"), None);
        assert_eq!(keys, vec![SubKey::new("tickers", "BTC-USDT")]);
    }

    #[test]
    fn test_okx_rest_candles_reversed_and_confirmed_only() {
        let connector = Okx::swap();
        let body: Value = serde_json::from_str(
            r#"{"code":"0","msg":"","data":[
                ["1700000060000","100.5","102","100","101.5","12","0","0","0"],
                ["1700000000000","100","101","99","100.5","10","0","0","1"]
            ]}"#,
        )
        .unwrap();

        let events = connector
            .parse_kline_bootstrap(&Symbol::from("BTCUSDT"), "1m", &body, 1_700_000_090_000)
            .unwrap();
        // Only the confirmed (older) row survives
        assert_eq!(events.len(), 2);
        let (_, BusPayload::Kline(kline)) = &events[1] else {
            panic!("expected kline payload");
        };
        assert_eq!(kline.start_ts, 1_700_000_000_000);
    }
}
