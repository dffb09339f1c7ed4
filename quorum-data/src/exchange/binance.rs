//! Binance spot + USD-margined futures connector.
//!
//! WebSocket frames are keyed by `e`
//! (`aggTrade`/`trade`/`kline`/`depthUpdate`/`markPriceUpdate`/`24hrTicker`/
//! `forceOrder`); subscription frames are
//! `{"method":"SUBSCRIBE","params":[..],"id":N}` and the venue acks with
//! `{"result":null,"id":N}`.
//!
//! See docs: <https://binance-docs.github.io/apidocs/futures/en/#websocket-market-streams>

use super::{Connector, FeedChannel, Inbound, Venue};
use crate::{
    books::SequenceRule,
    de::de_flexible_i64,
    error::DataError,
    event::{
        BookLevel, BusPayload, EventMeta, Funding, FundingRaw, Kline, KlineRaw, Liquidation,
        LiquidationRaw, MarketType, OrderBookL2Delta, OrderBookL2Snapshot, Side, StreamId, Ticker,
        TickerRaw, Topic, Trade, TradeRaw,
    },
    subscription::SubKey,
    symbol::{Symbol, canonical_symbol},
    time::{Ts, interval_duration_ms},
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use smol_str::SmolStr;

/// [`Binance`] spot WebSocket base url.
pub const WS_URL_BINANCE_SPOT: &str = "wss://stream.binance.com:9443/ws";

/// [`Binance`] USD-margined futures WebSocket base url.
pub const WS_URL_BINANCE_FUTURES_USD: &str = "wss://fstream.binance.com/ws";

/// [`Binance`] spot HTTP OrderBook L2 snapshot url.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#order-book>
pub const HTTP_BOOK_SNAPSHOT_URL_BINANCE_SPOT: &str = "https://api.binance.com/api/v3/depth";

/// [`Binance`] futures HTTP OrderBook L2 snapshot url.
pub const HTTP_BOOK_SNAPSHOT_URL_BINANCE_FUTURES: &str = "https://fapi.binance.com/fapi/v1/depth";

/// [`Binance`] spot HTTP klines url.
pub const HTTP_KLINES_URL_BINANCE_SPOT: &str = "https://api.binance.com/api/v3/klines";

/// [`Binance`] futures HTTP klines url.
pub const HTTP_KLINES_URL_BINANCE_FUTURES: &str = "https://fapi.binance.com/fapi/v1/klines";

/// [`Binance`] futures HTTP open interest url (REST poller).
pub const HTTP_OPEN_INTEREST_URL_BINANCE: &str = "https://fapi.binance.com/fapi/v1/openInterest";

/// [`Binance`] futures HTTP premium index url: mark/index price + funding.
pub const HTTP_PREMIUM_INDEX_URL_BINANCE: &str = "https://fapi.binance.com/fapi/v1/premiumIndex";

/// Binance connector for one market type.
#[derive(Clone, Copy, Debug)]
pub struct Binance {
    market: MarketType,
}

impl Binance {
    pub fn spot() -> Self {
        Self {
            market: MarketType::Spot,
        }
    }

    pub fn futures_usd() -> Self {
        Self {
            market: MarketType::Futures,
        }
    }

    fn meta(&self, ts_event: Ts, now_ms: Ts, sequence: Option<u64>) -> EventMeta {
        let mut meta = EventMeta::new(ts_event, now_ms, "binance", self.stream_id());
        meta.ts_exchange = Some(ts_event);
        meta.sequence = sequence;
        meta
    }
}

impl Connector for Binance {
    fn stream_id(&self) -> StreamId {
        match self.market {
            MarketType::Futures => StreamId::from("binance.futures.usd"),
            _ => StreamId::from("binance.spot"),
        }
    }

    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn market_type(&self) -> MarketType {
        self.market
    }

    fn ws_url(&self) -> &str {
        match self.market {
            MarketType::Futures => WS_URL_BINANCE_FUTURES_USD,
            _ => WS_URL_BINANCE_SPOT,
        }
    }

    fn sub_keys(&self, feed: FeedChannel, symbol: &Symbol, interval: Option<&str>) -> Vec<SubKey> {
        let market = SmolStr::from(symbol.as_str());
        let channels: Vec<SmolStr> = match feed {
            FeedChannel::Trades => {
                if self.market == MarketType::Futures {
                    vec![SmolStr::from("aggTrade")]
                } else {
                    vec![SmolStr::from("trade")]
                }
            }
            FeedChannel::Ticker => {
                if self.market == MarketType::Futures {
                    // markPrice carries mark/index price and the funding rate
                    vec![SmolStr::from("ticker"), SmolStr::from("markPrice")]
                } else {
                    vec![SmolStr::from("ticker")]
                }
            }
            FeedChannel::Orderbook => vec![SmolStr::from("depth@100ms")],
            FeedChannel::Klines => match interval {
                Some(interval) => vec![SmolStr::from(format!("kline_{interval}"))],
                None => vec![],
            },
            FeedChannel::Liquidations => {
                if self.market == MarketType::Futures {
                    vec![SmolStr::from("forceOrder")]
                } else {
                    vec![]
                }
            }
        };
        channels
            .into_iter()
            .map(|channel| SubKey {
                channel,
                market: market.clone(),
            })
            .collect()
    }

    fn subscribe_frames(&self, keys: &[SubKey], request_id: u64) -> Vec<String> {
        let params: Vec<String> = keys
            .iter()
            .map(|key| format!("{}@{}", key.market.to_ascii_lowercase(), key.channel))
            .collect();
        vec![
            json!({
                "method": "SUBSCRIBE",
                "params": params,
                "id": request_id,
            })
            .to_string(),
        ]
    }

    fn parse(&self, text: &str, now_ms: Ts) -> Vec<Inbound> {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return vec![Inbound::Ignore];
        };

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if value.get("result").is_some_and(Value::is_null) {
                return vec![Inbound::SubAckId(id)];
            }
            if let Some(error) = value.get("error") {
                return vec![Inbound::SubError(error.to_string())];
            }
        }

        let Some(event_kind) = value.get("e").and_then(Value::as_str) else {
            return vec![Inbound::Ignore];
        };

        match event_kind {
            "aggTrade" | "trade" => match serde_json::from_value::<BinanceTrade>(value) {
                Ok(trade) => vec![Inbound::Events(self.trade_events(trade, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "kline" => match serde_json::from_value::<BinanceKlineMessage>(value) {
                Ok(kline) => vec![Inbound::Events(self.kline_events(kline, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "depthUpdate" => match serde_json::from_value::<BinanceDepthUpdate>(value) {
                Ok(update) => vec![Inbound::BookDelta(self.depth_delta(update, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "markPriceUpdate" => match serde_json::from_value::<BinanceMarkPrice>(value) {
                Ok(mark) => vec![Inbound::Events(self.mark_price_events(mark, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "24hrTicker" => match serde_json::from_value::<Binance24hrTicker>(value) {
                Ok(ticker) => vec![Inbound::Events(self.ticker_events(ticker, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            "forceOrder" => match serde_json::from_value::<BinanceForceOrder>(value) {
                Ok(order) => vec![Inbound::Events(self.liquidation_events(order, now_ms))],
                Err(_) => vec![Inbound::Ignore],
            },
            _ => vec![Inbound::Ignore],
        }
    }

    fn book_rule(&self) -> SequenceRule {
        match self.market {
            MarketType::Futures => SequenceRule::FuturesPuChain,
            _ => SequenceRule::SpotContiguous,
        }
    }

    fn book_snapshot_url(&self, symbol: &Symbol) -> Option<String> {
        let base = match self.market {
            MarketType::Futures => HTTP_BOOK_SNAPSHOT_URL_BINANCE_FUTURES,
            _ => HTTP_BOOK_SNAPSHOT_URL_BINANCE_SPOT,
        };
        Some(format!("{base}?symbol={symbol}&limit=1000"))
    }

    fn parse_book_snapshot(
        &self,
        symbol: &Symbol,
        body: &Value,
        now_ms: Ts,
    ) -> Result<OrderBookL2Snapshot, DataError> {
        let snapshot: BinanceDepthSnapshot = serde_json::from_value(body.clone())?;
        let ts_event = snapshot.transaction_time.unwrap_or(now_ms);
        Ok(OrderBookL2Snapshot {
            symbol: symbol.clone(),
            market_type: self.market,
            last_update_id: snapshot.last_update_id,
            bids: snapshot.bids.into_iter().map(BookLevel::from).collect(),
            asks: snapshot.asks.into_iter().map(BookLevel::from).collect(),
            meta: self.meta(ts_event, now_ms, Some(snapshot.last_update_id)),
        })
    }

    fn kline_bootstrap_url(
        &self,
        symbol: &Symbol,
        interval: &str,
        day_start_ms: Ts,
    ) -> Option<String> {
        let base = match self.market {
            MarketType::Futures => HTTP_KLINES_URL_BINANCE_FUTURES,
            _ => HTTP_KLINES_URL_BINANCE_SPOT,
        };
        Some(format!(
            "{base}?symbol={symbol}&interval={interval}&startTime={day_start_ms}&limit=1500"
        ))
    }

    fn parse_kline_bootstrap(
        &self,
        symbol: &Symbol,
        interval: &str,
        body: &Value,
        now_ms: Ts,
    ) -> Result<Vec<(Topic, BusPayload)>, DataError> {
        let rows: Vec<BinanceKlineRow> = serde_json::from_value(body.clone())?;
        let mut events = Vec::new();
        for row in rows {
            // Bootstrap only re-emits completed bars
            if row.close_time >= now_ms {
                continue;
            }
            events.extend(self.kline_pair(
                symbol.clone(),
                interval,
                row.open_time,
                row.close_time + 1,
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

impl Binance {
    fn trade_events(&self, trade: BinanceTrade, now_ms: Ts) -> Vec<(Topic, BusPayload)> {
        let (Ok(price), Ok(size)) = (trade.price.parse::<f64>(), trade.size.parse::<f64>()) else {
            return vec![];
        };
        if !price.is_finite() || !size.is_finite() || trade.trade_time <= 0 {
            return vec![];
        }

        let symbol = canonical_symbol(&trade.market);
        // isBuyerMaker == true means the aggressor sold
        let side = Some(if trade.is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        });
        let meta = self.meta(trade.trade_time, now_ms, trade.trade_id);

        vec![
            (
                Topic::MarketTradeRaw,
                BusPayload::TradeRaw(TradeRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    side,
                    price: trade.price.clone(),
                    size: trade.size.clone(),
                    meta: meta.clone(),
                }),
            ),
            (
                Topic::MarketTrade,
                BusPayload::Trade(Trade {
                    symbol,
                    market_type: self.market,
                    side,
                    price,
                    size,
                    meta,
                }),
            ),
        ]
    }

    fn kline_events(&self, message: BinanceKlineMessage, now_ms: Ts) -> Vec<(Topic, BusPayload)> {
        let kline = message.kline;
        // Emit on close only
        if !kline.closed {
            return vec![];
        }
        let symbol = canonical_symbol(&message.market);
        self.kline_pair(
            symbol,
            &kline.interval,
            kline.start_ts,
            kline.end_ts + 1,
            kline.open,
            kline.high,
            kline.low,
            kline.close,
            kline.volume,
            now_ms,
        )
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

        // Derive end when the venue omitted it
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

    fn depth_delta(&self, update: BinanceDepthUpdate, now_ms: Ts) -> OrderBookL2Delta {
        OrderBookL2Delta {
            symbol: canonical_symbol(&update.market),
            market_type: self.market,
            first_update_id: update.first_update_id,
            last_update_id: update.last_update_id,
            prev_update_id: update.prev_update_id,
            bids: update.bids.into_iter().map(BookLevel::from).collect(),
            asks: update.asks.into_iter().map(BookLevel::from).collect(),
            meta: self.meta(update.event_time, now_ms, Some(update.last_update_id)),
        }
    }

    fn mark_price_events(&self, mark: BinanceMarkPrice, now_ms: Ts) -> Vec<(Topic, BusPayload)> {
        let symbol = canonical_symbol(&mark.market);
        let meta = self.meta(mark.event_time, now_ms, None);
        let mark_px = mark.mark_price.as_ref().and_then(|raw| raw.parse::<f64>().ok());
        let index_px = mark.index_price.as_ref().and_then(|raw| raw.parse::<f64>().ok());

        let mut events = vec![
            (
                Topic::MarketTickerRaw,
                BusPayload::TickerRaw(TickerRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_price: None,
                    mark_price: mark.mark_price.clone(),
                    index_price: mark.index_price.clone(),
                    meta: meta.clone(),
                }),
            ),
            (
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_price: None,
                    mark_price: mark_px,
                    index_price: index_px,
                    meta: meta.clone(),
                }),
            ),
        ];

        if let Some(raw_rate) = mark.funding_rate.clone() {
            if let Ok(rate) = raw_rate.parse::<f64>() {
                events.push((
                    Topic::MarketFundingRaw,
                    BusPayload::FundingRaw(FundingRaw {
                        symbol: symbol.clone(),
                        market_type: self.market,
                        funding_rate: raw_rate,
                        next_funding_ts: mark.next_funding_time,
                        meta: meta.clone(),
                    }),
                ));
                events.push((
                    Topic::MarketFunding,
                    BusPayload::Funding(Funding {
                        symbol,
                        market_type: self.market,
                        funding_rate: rate,
                        next_funding_ts: mark.next_funding_time,
                        meta,
                    }),
                ));
            }
        }

        events
    }

    fn ticker_events(&self, ticker: Binance24hrTicker, now_ms: Ts) -> Vec<(Topic, BusPayload)> {
        let symbol = canonical_symbol(&ticker.market);
        let meta = self.meta(ticker.event_time, now_ms, None);
        let last = ticker.last_price.parse::<f64>().ok().filter(|px| px.is_finite());

        vec![
            (
                Topic::MarketTickerRaw,
                BusPayload::TickerRaw(TickerRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    last_price: Some(ticker.last_price.clone()),
                    mark_price: None,
                    index_price: None,
                    meta: meta.clone(),
                }),
            ),
            (
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol,
                    market_type: self.market,
                    last_price: last,
                    mark_price: None,
                    index_price: None,
                    meta,
                }),
            ),
        ]
    }

    fn liquidation_events(&self, message: BinanceForceOrder, now_ms: Ts) -> Vec<(Topic, BusPayload)> {
        let order = message.order;
        let Some(side) = Side::parse(&order.side) else {
            return vec![];
        };
        // Average fill price where present, else the order price
        let raw_price = if order.avg_price.as_deref().is_some_and(|px| !px.is_empty()) {
            order.avg_price.clone().unwrap_or_default()
        } else {
            order.price.clone()
        };
        let (Ok(price), Ok(size)) = (raw_price.parse::<f64>(), order.size.parse::<f64>()) else {
            return vec![];
        };
        if !price.is_finite() || !size.is_finite() {
            return vec![];
        }

        let symbol = canonical_symbol(&order.market);
        let meta = self.meta(order.trade_time, now_ms, None);
        let notional_usd = Some(price * size);

        vec![
            (
                Topic::MarketLiquidationRaw,
                BusPayload::LiquidationRaw(LiquidationRaw {
                    symbol: symbol.clone(),
                    market_type: self.market,
                    side,
                    price: raw_price,
                    size: order.size.clone(),
                    notional_usd,
                    meta: meta.clone(),
                }),
            ),
            (
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
            ),
        ]
    }
}

// ------------------------------------------------------------------------
// Wire types
// ------------------------------------------------------------------------

/// One `["price", "size"]` depth level.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BinanceLevel {
    pub price: String,
    pub size: String,
}

impl<'de> Deserialize<'de> for BinanceLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let arr: Vec<String> = Deserialize::deserialize(deserializer)?;
        if arr.len() < 2 {
            return Err(serde::de::Error::custom("expected 2 elements in level array"));
        }
        let mut iter = arr.into_iter();
        Ok(BinanceLevel {
            price: iter.next().unwrap_or_default(),
            size: iter.next().unwrap_or_default(),
        })
    }
}

impl From<BinanceLevel> for BookLevel {
    fn from(level: BinanceLevel) -> Self {
        BookLevel {
            price: level.price.parse().unwrap_or_default(),
            size: level.size.parse().unwrap_or_default(),
        }
    }
}

/// `aggTrade` / `trade` frame.
///
/// ```json
/// {"e":"aggTrade","E":1700000000100,"s":"BTCUSDT","a":12345,
///  "p":"43000.10","q":"0.5","T":1700000000099,"m":false}
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct BinanceTrade {
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub size: String,
    #[serde(rename = "T", deserialize_with = "de_flexible_i64")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
    #[serde(alias = "a", alias = "t", default)]
    pub trade_id: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BinanceKlineMessage {
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "k")]
    pub kline: BinanceKlineData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BinanceKlineData {
    #[serde(rename = "t", deserialize_with = "de_flexible_i64")]
    pub start_ts: i64,
    #[serde(rename = "T", deserialize_with = "de_flexible_i64", default)]
    pub end_ts: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub closed: bool,
}

/// `depthUpdate` frame. `pu` is present on futures only and chains onto the
/// previous frame's `u`.
#[derive(Clone, Debug, Deserialize)]
pub struct BinanceDepthUpdate {
    #[serde(rename = "E", deserialize_with = "de_flexible_i64")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub last_update_id: u64,
    #[serde(rename = "pu", default)]
    pub prev_update_id: Option<u64>,
    #[serde(rename = "b")]
    pub bids: Vec<BinanceLevel>,
    #[serde(rename = "a")]
    pub asks: Vec<BinanceLevel>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BinanceMarkPrice {
    #[serde(rename = "E", deserialize_with = "de_flexible_i64")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "p", default)]
    pub mark_price: Option<String>,
    #[serde(rename = "i", default)]
    pub index_price: Option<String>,
    #[serde(rename = "r", default)]
    pub funding_rate: Option<String>,
    #[serde(rename = "T", default)]
    pub next_funding_time: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Binance24hrTicker {
    #[serde(rename = "E", deserialize_with = "de_flexible_i64")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "c")]
    pub last_price: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BinanceForceOrder {
    #[serde(rename = "o")]
    pub order: BinanceForceOrderInner,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BinanceForceOrderInner {
    #[serde(rename = "s")]
    pub market: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "q")]
    pub size: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "ap", default)]
    pub avg_price: Option<String>,
    #[serde(rename = "T", deserialize_with = "de_flexible_i64")]
    pub trade_time: i64,
}

/// REST depth snapshot response.
#[derive(Clone, Debug, Deserialize)]
pub struct BinanceDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    #[serde(rename = "T", default)]
    pub transaction_time: Option<i64>,
    pub bids: Vec<BinanceLevel>,
    pub asks: Vec<BinanceLevel>,
}

/// One REST klines row:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`.
#[derive(Clone, Debug)]
pub struct BinanceKlineRow {
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
}

impl<'de> Deserialize<'de> for BinanceKlineRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let arr: Vec<Value> = Deserialize::deserialize(deserializer)?;
        if arr.len() < 7 {
            return Err(serde::de::Error::custom("expected >= 7 kline columns"));
        }
        let as_str = |value: &Value| -> String {
            value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string())
        };
        Ok(BinanceKlineRow {
            open_time: arr[0].as_i64().unwrap_or_default(),
            open: as_str(&arr[1]),
            high: as_str(&arr[2]),
            low: as_str(&arr[3]),
            close: as_str(&arr[4]),
            volume: as_str(&arr[5]),
            close_time: arr[6].as_i64().unwrap_or_default(),
        })
    }
}

/// REST open interest response (poller).
#[derive(Clone, Debug, Deserialize)]
pub struct BinanceOpenInterestResponse {
    #[serde(rename = "openInterest")]
    pub open_interest: String,
    #[serde(deserialize_with = "de_flexible_i64")]
    pub time: i64,
}

/// REST premium index response (poller): mark/index price + funding rate.
#[derive(Clone, Debug, Deserialize)]
pub struct BinancePremiumIndexResponse {
    #[serde(rename = "markPrice", default)]
    pub mark_price: Option<String>,
    #[serde(rename = "indexPrice", default)]
    pub index_price: Option<String>,
    #[serde(rename = "lastFundingRate", default)]
    pub last_funding_rate: Option<String>,
    #[serde(rename = "nextFundingTime", default)]
    pub next_funding_time: Option<i64>,
    #[serde(deserialize_with = "de_flexible_i64")]
    pub time: i64,
}
