//! Bybit v5 public connector.
//!
//! Frames are keyed by `topic` (`publicTrade.*`, `tickers.*`, `orderbook.*`,
//! `kline.*`, `allLiquidation.*`) wrapped in the common
//! `{topic, type, ts, data}` payload envelope. Subscription frames are
//! `{"op":"subscribe","args":[..],"req_id":N}`.
//!
//! See docs: <https://bybit-exchange.github.io/docs/v5/ws/connect>

use super::{Connector, FeedChannel, Inbound, PingSpec, Venue};
use crate::{
    books::SequenceRule,
    error::DataError,
    event::{
        BookLevel, BusPayload, EventMeta, Funding, FundingRaw, Kline, KlineRaw, Liquidation,
        LiquidationRaw, MarketType, OiUnit, OpenInterest, OpenInterestRaw, OrderBookL2Delta,
        OrderBookL2Snapshot, Side, StreamId, Ticker, TickerRaw, Topic, Trade, TradeRaw,
    },
    subscription::SubKey,
    symbol::{Symbol, canonical_symbol},
    time::{Ts, interval_duration_ms},
};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use smol_str::SmolStr;
use std::time::Duration;

/// [`Bybit`] spot public WebSocket url.
pub const WS_URL_BYBIT_SPOT: &str = "wss://stream.bybit.com/v5/public/spot";

/// [`Bybit`] linear perpetuals public WebSocket url.
pub const WS_URL_BYBIT_LINEAR: &str = "wss://stream.bybit.com/v5/public/linear";

/// [`Bybit`] keepalive interval: the venue recommends a ping every 20 s.
pub const PING_INTERVAL_BYBIT: Duration = Duration::from_secs(20);

/// [`Bybit`] HTTP kline url (bootstrap).
pub const HTTP_KLINES_URL_BYBIT: &str = "https://api.bybit.com/v5/market/kline";

/// Bybit connector for one market type.
#[derive(Clone, Copy, Debug)]
pub struct Bybit {
    market: MarketType,
}

impl Bybit {
    pub fn spot() -> Self {
        Self {
            market: MarketType::Spot,
        }
    }

    pub fn linear() -> Self {
        Self {
            market: MarketType::Futures,
        }
    }

    fn category(&self) -> &'static str {
        match self.market {
            MarketType::Futures => "linear",
            _ => "spot",
        }
    }

    fn meta(&self, ts_event: Ts, now_ms: Ts, sequence: Option<u64>) -> EventMeta {
        let mut meta = EventMeta::new(ts_event, now_ms, "bybit", self.stream_id());
        meta.ts_exchange = Some(ts_event);
        meta.sequence = sequence;
        meta
    }

    /// Map a canonical interval to Bybit's interval token ("1m" -> "1").
    fn bybit_interval(interval: &str) -> Option<String> {
        let duration_ms = interval_duration_ms(interval)?;
        Some(match duration_ms {
            86_400_000 => "D".to_string(),
            604_800_000 => "W".to_string(),
            minutes_ms => (minutes_ms / 60_000).to_string(),
        })
    }
}

impl Connector for Bybit {
    fn stream_id(&self) -> StreamId {
        match self.market {
            MarketType::Futures => StreamId::from("bybit.public.linear.v5"),
            _ => StreamId::from("bybit.public.spot.v5"),
        }
    }

    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    fn market_type(&self) -> MarketType {
        self.market
    }

    fn ws_url(&self) -> &str {
        match self.market {
            MarketType::Futures => WS_URL_BYBIT_LINEAR,
            _ => WS_URL_BYBIT_SPOT,
        }
    }

    fn ping(&self) -> Option<PingSpec> {
        Some(PingSpec {
            interval: PING_INTERVAL_BYBIT,
            frame: json!({"op": "ping"}).to_string(),
        })
    }

    fn sub_keys(&self, feed: FeedChannel, symbol: &Symbol, interval: Option<&str>) -> Vec<SubKey> {
        let market = SmolStr::from(symbol.as_str());
        match feed {
            FeedChannel::Trades => vec![SubKey::new("publicTrade", market)],
            FeedChannel::Ticker => vec![SubKey::new("tickers", market)],
            FeedChannel::Orderbook => vec![SubKey::new("orderbook.50", market)],
            FeedChannel::Klines => match interval.and_then(Self::bybit_interval) {
                Some(interval) => vec![SubKey::new(format!("kline.{interval}"), market)],
                None => vec![],
            },
            FeedChannel::Liquidations => {
                if self.market == MarketType::Futures {
                    vec![SubKey::new("allLiquidation", market)]
                } else {
                    vec![]
                }
            }
        }
    }

    fn subscribe_frames(&self, keys: &[SubKey], request_id: u64) -> Vec<String> {
        let args: Vec<String> = keys
            .iter()
            .map(|key| format!("{}.{}", key.channel, key.market))
            .collect();
        vec![
            json!({
                "op": "subscribe",
                "args": args,
                "req_id": request_id.to_string(),
            })
            .to_string(),
        ]
    }

    fn unsubscribe_frames(&self, keys: &[SubKey], request_id: u64) -> Vec<String> {
        let args: Vec<String> = keys
            .iter()
            .map(|key| format!("{}.{}", key.channel, key.market))
            .collect();
        vec![
            json!({
                "op": "unsubscribe",
                "args": args,
                "req_id": request_id.to_string(),
            })
            .to_string(),
        ]
    }

    fn parse(&self, text: &str, now_ms: Ts) -> Vec<Inbound> {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return vec![Inbound::Ignore];
        };

        if let Some(op) = value.get("op").and_then(Value::as_str) {
            return match op {
                "pong" | "ping" => vec![Inbound::Pong],
                "subscribe" => {
                    let success = value
                        .get("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if !success {
                        return vec![Inbound::SubError(
                            value
                                .get("ret_msg")
                                .and_then(Value::as_str)
                                .unwrap_or("bybit subscribe rejected")
                                .to_string(),
                        )];
                    }
                    match value
                        .get("req_id")
                        .and_then(Value::as_str)
                        .and_then(|raw| raw.parse::<u64>().ok())
                    {
                        Some(id) => vec![Inbound::SubAckId(id)],
                        None => vec![Inbound::Ignore],
                    }
                }
                _ => vec![Inbound::Ignore],
            };
        }

        let Some(topic) = value.get("topic").and_then(Value::as_str) else {
            return vec![Inbound::Ignore];
        };
        let Some((channel, _market)) = topic.rsplit_once('.') else {
            return vec![Inbound::Ignore];
        };

        match channel {
            "publicTrade" => match serde_json::from_value::<BybitPayload<Vec<BybitTrade>>>(value) {
                Ok(payload) => vec![Inbound::Events(self.trade_events(payload, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "tickers" => match serde_json::from_value::<BybitPayload<BybitTickerData>>(value) {
                Ok(payload) => vec![Inbound::Events(self.ticker_events(payload, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "allLiquidation" => {
                match serde_json::from_value::<BybitPayload<Vec<BybitLiquidation>>>(value) {
                    Ok(payload) => vec![Inbound::Events(self.liquidation_events(payload, now_ms))],
                    Err(_) => vec![Inbound::Ignore],
                }
            }
            channel if channel.starts_with("orderbook") => {
                match serde_json::from_value::<BybitPayload<BybitBookData>>(value) {
                    Ok(payload) => self.book_inbound(payload, now_ms),
                    Err(_) => vec![Inbound::Ignore],
                }
            }
            channel if channel.starts_with("kline") => {
                match serde_json::from_value::<BybitPayload<Vec<BybitKline>>>(value) {
                    Ok(payload) => vec![Inbound::Events(self.kline_events(payload, now_ms))],
                    Err(_) => vec![Inbound::Ignore],
                }
            }
            _ => vec![Inbound::Ignore],
        }
    }

    fn book_rule(&self) -> SequenceRule {
        SequenceRule::SpotContiguous
    }

    fn book_snapshot_url(&self, _symbol: &Symbol) -> Option<String> {
        // Snapshot arrives in-band as the orderbook topic's first frame
        None
    }

    fn parse_book_snapshot(
        &self,
        _symbol: &Symbol,
        _body: &Value,
        _now_ms: Ts,
    ) -> Result<OrderBookL2Snapshot, DataError> {
        Err(DataError::Protocol(
            "bybit book snapshots are delivered in-band".to_string(),
        ))
    }

    fn kline_bootstrap_url(
        &self,
        symbol: &Symbol,
        interval: &str,
        day_start_ms: Ts,
    ) -> Option<String> {
        let interval = Self::bybit_interval(interval)?;
        Some(format!(
            "{HTTP_KLINES_URL_BYBIT}?category={}&symbol={symbol}&interval={interval}&start={day_start_ms}&limit=1000",
            self.category()
        ))
    }

    fn parse_kline_bootstrap(
        &self,
        symbol: &Symbol,
        interval: &str,
        body: &Value,
        now_ms: Ts,
    ) -> Result<Vec<(Topic, BusPayload)>, DataError> {
        let response: BybitKlineRestResponse = serde_json::from_value(body.clone())?;
        let duration_ms = interval_duration_ms(interval).unwrap_or(60_000);
        let mut events = Vec::new();
        // REST rows arrive newest-first
        for row in response.result.list.into_iter().rev() {
            let Ok(start_ts) = row.start.parse::<i64>() else {
                continue;
            };
            let end_ts = start_ts + duration_ms;
            if end_ts > now_ms {
                continue;
            }
            events.extend(self.kline_pair(
                symbol.clone(),
                interval,
                start_ts,
                end_ts,
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
                now_ms,
            ));
        }
        Ok(events)
    }
}

impl Bybit {
    fn trade_events(
        &self,
        payload: BybitPayload<Vec<BybitTrade>>,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let mut events = Vec::new();
        for trade in payload.data {
            let (Ok(price), Ok(size)) = (trade.price.parse::<f64>(), trade.size.parse::<f64>())
            else {
                continue;
            };
            if !price.is_finite() || !size.is_finite() || trade.time <= 0 {
                continue;
            }

            let symbol = canonical_symbol(&trade.market);
            let side = Side::parse(&trade.side);
            let meta = self.meta(trade.time, now_ms, None);

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

    fn ticker_events(
        &self,
        payload: BybitPayload<BybitTickerData>,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let ticker = payload.data;
        let symbol = canonical_symbol(&ticker.market);
        let meta = self.meta(payload.ts, now_ms, None);
        let mut events = Vec::new();

        let has_price_field =
            ticker.last_price.is_some() || ticker.mark_price.is_some() || ticker.index_price.is_some();
        if has_price_field {
            events.push((
                Topic::MarketTickerRaw,
                BusPayload::TickerRaw(TickerRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_price: ticker.last_price.clone(),
                    mark_price: ticker.mark_price.clone(),
                    index_price: ticker.index_price.clone(),
                    meta: meta.clone(),
                }),
            ));
            events.push((
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_price: parse_opt(&ticker.last_price),
                    mark_price: parse_opt(&ticker.mark_price),
                    index_price: parse_opt(&ticker.index_price),
                    meta: meta.clone(),
                }),
            ));
        }

        // Linear tickers piggyback open interest and funding
        if let Some(raw_oi) = ticker.open_interest.clone() {
            if let Ok(oi) = raw_oi.parse::<f64>() {
                events.push((
                    Topic::MarketOiRaw,
                    BusPayload::OpenInterestRaw(OpenInterestRaw {
                        symbol: symbol.clone(),
                        market_type: self.market,
                        open_interest: raw_oi,
                        unit: OiUnit::Base,
                        open_interest_usd: ticker.open_interest_value.clone(),
                        meta: meta.clone(),
                    }),
                ));
                events.push((
                    Topic::MarketOi,
                    BusPayload::OpenInterest(OpenInterest {
                        symbol: symbol.clone(),
                        market_type: self.market,
                        open_interest: oi,
                        unit: OiUnit::Base,
                        open_interest_usd: parse_opt(&ticker.open_interest_value),
                        meta: meta.clone(),
                    }),
                ));
            }
        }

        if let Some(raw_rate) = ticker.funding_rate.clone() {
            if let Ok(rate) = raw_rate.parse::<f64>() {
                let next_funding_ts = ticker
                    .next_funding_time
                    .as_deref()
                    .and_then(|raw| raw.parse::<i64>().ok());
                events.push((
                    Topic::MarketFundingRaw,
                    BusPayload::FundingRaw(FundingRaw {
                        symbol: symbol.clone(),
                        market_type: self.market,
                        funding_rate: raw_rate,
                        next_funding_ts,
                        meta: meta.clone(),
                    }),
                ));
                events.push((
                    Topic::MarketFunding,
                    BusPayload::Funding(Funding {
                        symbol,
                        market_type: self.market,
                        funding_rate: rate,
                        next_funding_ts,
                        meta,
                    }),
                ));
            }
        }

        events
    }

    fn book_inbound(&self, payload: BybitPayload<BybitBookData>, now_ms: Ts) -> Vec<Inbound> {
        let data = payload.data;
        let symbol = canonical_symbol(&data.market);
        let bids: Vec<BookLevel> = data.bids.iter().map(BybitLevel::to_book_level).collect();
        let asks: Vec<BookLevel> = data.asks.iter().map(BybitLevel::to_book_level).collect();
        let meta = self.meta(payload.ts, now_ms, Some(data.update_id));

        match payload.kind.as_deref() {
            Some("snapshot") => vec![Inbound::BookSnapshot(OrderBookL2Snapshot {
                symbol,
                market_type: self.market,
                last_update_id: data.update_id,
                bids,
                asks,
                meta,
            })],
            Some("delta") => vec![Inbound::BookDelta(OrderBookL2Delta {
                symbol,
                market_type: self.market,
                first_update_id: data.update_id,
                last_update_id: data.update_id,
                prev_update_id: None,
                bids,
                asks,
                meta,
            })],
            _ => vec![Inbound::Ignore],
        }
    }

    fn kline_events(
        &self,
        payload: BybitPayload<Vec<BybitKline>>,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let Some((_, market)) = payload.topic.rsplit_once('.') else {
            return vec![];
        };
        let symbol = canonical_symbol(market);
        let mut events = Vec::new();
        for kline in payload.data {
            // Emit on confirm only
            if !kline.confirm {
                continue;
            }
            let interval = canonical_interval(&kline.interval);
            events.extend(self.kline_pair(
                symbol.clone(),
                &interval,
                kline.start,
                kline.end,
                kline.open,
                kline.high,
                kline.low,
                kline.close,
                kline.volume,
                now_ms,
            ));
        }
        events
    }

    #[allow(clippy::too_many_arguments)]
    fn kline_pair(
        &self,
        symbol: Symbol,
        interval: &str,
        start_ts: Ts,
        end_ts: Ts,
        open: String,
        high: String,
        low: String,
        close: String,
        volume: String,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let parsed: Option<(f64, f64, f64, f64, f64)> = (|| {
            Some((
                open.parse().ok()?,
                high.parse().ok()?,
                low.parse().ok()?,
                close.parse().ok()?,
                volume.parse().ok()?,
            ))
        })();
        let Some((open_px, high_px, low_px, close_px, vol)) = parsed else {
            return vec![];
        };

        let end_ts = if end_ts > start_ts {
            end_ts
        } else {
            start_ts + interval_duration_ms(interval).unwrap_or(60_000)
        };
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
                    open,
                    high,
                    low,
                    close,
                    volume,
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
                    open: open_px,
                    high: high_px,
                    low: low_px,
                    close: close_px,
                    volume: vol,
                    closed: true,
                    meta,
                }),
            ),
        ]
    }

    fn liquidation_events(
        &self,
        payload: BybitPayload<Vec<BybitLiquidation>>,
        now_ms: Ts,
    ) -> Vec<(Topic, BusPayload)> {
        let mut events = Vec::new();
        for entry in payload.data {
            let Some(side) = Side::parse(&entry.side) else {
                continue;
            };
            let (Ok(price), Ok(size)) = (entry.price.parse::<f64>(), entry.size.parse::<f64>())
            else {
                continue;
            };
            if !price.is_finite() || !size.is_finite() {
                continue;
            }

            let symbol = canonical_symbol(&entry.market);
            let meta = self.meta(entry.time, now_ms, None);
            let notional_usd = Some(price * size);

            events.push((
                Topic::MarketLiquidationRaw,
                BusPayload::LiquidationRaw(LiquidationRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    side,
                    price: entry.price.clone(),
                    size: entry.size.clone(),
                    notional_usd,
                    meta: meta.clone(),
                }),
            ));
            events.push((
                Topic::MarketLiquidation,
                BusPayload::Liquidation(Liquidation {
                    symbol,
                    market_type: self.market,
                    side,
                    price,
                    size,
                    notional_usd,
                    meta,
                }),
            ));
        }
        events
    }
}

fn parse_opt(raw: &Option<String>) -> Option<f64> {
    raw.as_deref()
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// Map Bybit's interval token back to canonical form ("1" -> "1m").
fn canonical_interval(bybit_interval: &str) -> String {
    match bybit_interval {
        "D" => "1d".to_string(),
        "W" => "1w".to_string(),
        minutes => match minutes.parse::<i64>() {
            Ok(m) if m >= 60 && m % 60 == 0 => format!("{}h", m / 60),
            Ok(m) => format!("{m}m"),
            Err(_) => format!("{bybit_interval}m"),
        },
    }
}

// ------------------------------------------------------------------------
// Wire types
// ------------------------------------------------------------------------

/// Common Bybit payload envelope: `{topic, type, ts, data}`.
#[derive(Clone, Debug, Deserialize)]
pub struct BybitPayload<T> {
    pub topic: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(deserialize_with = "crate::de::de_flexible_i64")]
    pub ts: i64,
    pub data: T,
}

/// ### Raw Payload Examples
/// See docs: <https://bybit-exchange.github.io/docs/v5/websocket/public/trade>
/// ```json
/// {
///     "T": 1672304486865,
///     "s": "BTCUSDT",
///     "S": "Buy",
///     "v": "0.001",
///     "p": "16578.50",
///     "L": "PlusTick",
///     "i": "20f43950-d8dd-5b31-9112-a178eb6023af",
///     "BT": false
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct BybitTrade {
    #[serde(alias = "T", deserialize_with = "crate::de::de_flexible_i64")]
    pub time: i64,
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(alias = "v")]
    pub size: String,
    #[serde(alias = "p")]
    pub price: String,
}

/// Subset of the `tickers` stream required for price, open interest and
/// funding. Delta frames omit unchanged fields.
#[derive(Clone, Debug, Deserialize)]
pub struct BybitTickerData {
    #[serde(rename = "symbol")]
    pub market: String,
    #[serde(rename = "lastPrice", default)]
    pub last_price: Option<String>,
    #[serde(rename = "markPrice", default)]
    pub mark_price: Option<String>,
    #[serde(rename = "indexPrice", default)]
    pub index_price: Option<String>,
    #[serde(rename = "openInterest", default)]
    pub open_interest: Option<String>,
    #[serde(rename = "openInterestValue", default)]
    pub open_interest_value: Option<String>,
    #[serde(rename = "fundingRate", default)]
    pub funding_rate: Option<String>,
    #[serde(rename = "nextFundingTime", default)]
    pub next_funding_time: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BybitBookData {
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "b")]
    pub bids: Vec<BybitLevel>,
    #[serde(rename = "a")]
    pub asks: Vec<BybitLevel>,
    #[serde(rename = "u")]
    pub update_id: u64,
}

/// `["16493.50", "0.006"]`
#[derive(Clone, Debug)]
pub struct BybitLevel {
    pub price: String,
    pub size: String,
}

impl BybitLevel {
    fn to_book_level(&self) -> BookLevel {
        BookLevel {
            price: self.price.parse().unwrap_or_default(),
            size: self.size.parse().unwrap_or_default(),
        }
    }
}

impl<'de> Deserialize<'de> for BybitLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let arr: Vec<String> = Deserialize::deserialize(deserializer)?;
        if arr.len() < 2 {
            return Err(serde::de::Error::custom("expected 2 elements in level array"));
        }
        let mut iter = arr.into_iter();
        Ok(BybitLevel {
            price: iter.next().unwrap_or_default(),
            size: iter.next().unwrap_or_default(),
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BybitKline {
    #[serde(deserialize_with = "crate::de::de_flexible_i64")]
    pub start: i64,
    #[serde(deserialize_with = "crate::de::de_flexible_i64", default)]
    pub end: i64,
    pub interval: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub confirm: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BybitLiquidation {
    #[serde(alias = "T", deserialize_with = "crate::de::de_flexible_i64")]
    pub time: i64,
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(alias = "v")]
    pub size: String,
    #[serde(alias = "p")]
    pub price: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BybitKlineRestResponse {
    pub result: BybitKlineRestResult,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BybitKlineRestResult {
    pub list: Vec<BybitKlineRestRow>,
}

/// `[startTs, open, high, low, close, volume, turnover]`
#[derive(Clone, Debug)]
pub struct BybitKlineRestRow {
    pub start: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

impl<'de> Deserialize<'de> for BybitKlineRestRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let arr: Vec<String> = Deserialize::deserialize(deserializer)?;
        if arr.len() < 6 {
            return Err(serde::de::Error::custom("expected >= 6 kline columns"));
        }
        let mut iter = arr.into_iter();
        Ok(BybitKlineRestRow {
            start: iter.next().unwrap_or_default(),
            open: iter.next().unwrap_or_default(),
            high: iter.next().unwrap_or_default(),
            low: iter.next().unwrap_or_default(),
            close: iter.next().unwrap_or_default(),
            volume: iter.next().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bybit_trade_payload() {
        let connector = Bybit::linear();
        let frame = r#"{
            "topic": "publicTrade.BTCUSDT",
            "type": "snapshot",
            "ts": 1672304486868,
            "data": [
                {
                    "T": 1672304486865,
                    "s": "BTCUSDT",
                    "S": "Buy",
                    "v": "0.001",
                    "p": "16578.50",
                    "L": "PlusTick",
                    "i": "20f43950-d8dd-5b31-9112-a178eb6023af",
                    "BT": false
                },
                {
                    "T": 1672304486865,
                    "s": "BTCUSDT",
                    "S": "Sell",
                    "v": "0.001",
                    "p": "16578.50",
                    "L": "PlusTick",
                    "i": "20f43950-d8dd-5b31-9112-a178eb6023af",
                    "BT": false
                }
            ]
        }"#;

        let inbound = connector.parse(frame, 1_672_304_486_900);
        let Inbound::Events(events) = &inbound[0] else {
            panic!("expected events, got {inbound:?}");
        };
        assert_eq!(events.len(), 4);

        let (_, BusPayload::Trade(first)) = &events[1] else {
            panic!("expected trade payload");
        };
        assert_eq!(first.side, Some(Side::Buy));
        assert_eq!(first.price, 16578.50);
        assert_eq!(first.meta.stream_id, "bybit.public.linear.v5");

        let (_, BusPayload::Trade(second)) = &events[3] else {
            panic!("expected trade payload");
        };
        assert_eq!(second.side, Some(Side::Sell));
    }

    #[test]
    fn test_bybit_ticker_piggybacks_oi_and_funding() {
        let connector = Bybit::linear();
        let frame = r#"{
            "topic": "tickers.BTCUSDT",
            "type": "snapshot",
            "ts": 1700000000000,
            "data": {
                "symbol": "BTCUSDT",
                "lastPrice": "43000.5",
                "markPrice": "43001.0",
                "indexPrice": "43000.8",
                "openInterest": "50000",
                "openInterestValue": "2150000000",
                "fundingRate": "0.0001",
                "nextFundingTime": "1700028800000"
            }
        }"#;

        let inbound = connector.parse(frame, 1_700_000_000_100);
        let Inbound::Events(events) = &inbound[0] else {
            panic!("expected events");
        };
        // ticker raw+canonical, oi raw+canonical, funding raw+canonical
        assert_eq!(events.len(), 6);

        let (_, BusPayload::OpenInterest(oi)) = &events[3] else {
            panic!("expected open interest payload");
        };
        assert_eq!(oi.unit, OiUnit::Base);
        assert_eq!(oi.open_interest, 50_000.0);
        assert_eq!(oi.open_interest_usd, Some(2_150_000_000.0));

        let (_, BusPayload::Funding(funding)) = &events[5] else {
            panic!("expected funding payload");
        };
        assert_eq!(funding.funding_rate, 0.0001);
        assert_eq!(funding.next_funding_ts, Some(1_700_028_800_000));
    }

    #[test]
    fn test_bybit_orderbook_snapshot_then_delta() {
        let connector = Bybit::linear();
        let snapshot = r#"{
            "topic": "orderbook.50.BTCUSDT",
            "type": "snapshot",
            "ts": 1700000000000,
            "data": {"s":"BTCUSDT","b":[["16493.50","0.006"]],"a":[["16494.00","0.1"]],"u":100,"seq":555}
        }"#;
        let inbound = connector.parse(snapshot, 1_700_000_000_001);
        let Inbound::BookSnapshot(book) = &inbound[0] else {
            panic!("expected snapshot, got {inbound:?}");
        };
        assert_eq!(book.last_update_id, 100);

        let delta = r#"{
            "topic": "orderbook.50.BTCUSDT",
            "type": "delta",
            "ts": 1700000000100,
            "data": {"s":"BTCUSDT","b":[],"a":[["16494.00","0"]],"u":101,"seq":556}
        }"#;
        let inbound = connector.parse(delta, 1_700_000_000_101);
        let Inbound::BookDelta(delta) = &inbound[0] else {
            panic!("expected delta");
        };
        assert_eq!(delta.first_update_id, 101);
        assert_eq!(delta.last_update_id, 101);
    }

    #[test]
    fn test_bybit_kline_confirm_gating_and_interval_mapping() {
        let connector = Bybit::linear();
        let frame = r#"{
            "topic": "kline.1.BTCUSDT",
            "type": "snapshot",
            "ts": 1700000060000,
            "data": [{
                "start": 1700000000000, "end": 1700000060000, "interval": "1",
                "open": "100", "high": "101", "low": "99", "close": "100.5",
                "volume": "10", "turnover": "1000", "confirm": true, "timestamp": 1700000060000
            }]
        }"#;

        let inbound = connector.parse(frame, 1_700_000_060_100);
        let Inbound::Events(events) = &inbound[0] else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        let (_, BusPayload::Kline(kline)) = &events[1] else {
            panic!("expected kline payload");
        };
        assert_eq!(kline.interval, "1m");
        assert_eq!(kline.end_ts, 1_700_000_060_000);

        let unconfirmed = frame.replace("\"confirm\": true", "\"confirm\": false");
        let inbound = connector.parse(&unconfirmed, 1_700_000_060_100);
        assert_eq!(inbound, vec![Inbound::Events(vec![])]);
    }

    #[test]
    fn test_bybit_subscribe_frame_and_ack() {
        let connector = Bybit::linear();
        let keys = connector.sub_keys(FeedChannel::Orderbook, &Symbol::from("BTCUSDT"), None);
        let frames = connector.subscribe_frames(&keys, 9);
        let value: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0], "orderbook.50.BTCUSDT");
        assert_eq!(value["req_id"], "9");

        let ack = r#"{"success":true,"op":"subscribe","req_id":"9","conn_id":"abc"}"#;
        assert_eq!(connector.parse(ack, 0), vec![Inbound::SubAckId(9)]);

        let pong = r#"{"success":true,"op":"pong","req_id":"","conn_id":"abc"}"#;
        assert_eq!(connector.parse(pong, 0), vec![Inbound::Pong]);
    }

    #[test]
    fn test_bybit_interval_token_mapping() {
        assert_eq!(Bybit::bybit_interval("1m").as_deref(), Some("1"));
        assert_eq!(Bybit::bybit_interval("5m").as_deref(), Some("5"));
        assert_eq!(Bybit::bybit_interval("1h").as_deref(), Some("60"));
        assert_eq!(Bybit::bybit_interval("1d").as_deref(), Some("D"));
        assert_eq!(canonical_interval("1"), "1m");
        assert_eq!(canonical_interval("60"), "1h");
        assert_eq!(canonical_interval("D"), "1d");
    }
}
