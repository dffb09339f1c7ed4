//! Periodic REST polling for open interest and funding.
//!
//! One poller task per venue walks its symbols on a fixed interval; repeated
//! failures escalate a per-symbol backoff
//! (`min(300 s, base * 2^min(6, failures))` with deterministic jitter) and a
//! poll is skipped while `now < next_allowed_ts`. Abort errors are never
//! counted as failures.

use crate::{
    backoff::RestBackoff,
    client::RestApi,
    error::DataError,
    event::{
        BusEvent, BusPayload, EventMeta, Funding, FundingRaw, MarketType, OiUnit, OpenInterest,
        OpenInterestRaw, StreamId, Ticker, TickerRaw, Topic,
    },
    exchange::{
        binance::{
            BinanceOpenInterestResponse, BinancePremiumIndexResponse, HTTP_OPEN_INTEREST_URL_BINANCE,
            HTTP_PREMIUM_INDEX_URL_BINANCE,
        },
        okx::{
            HTTP_FUNDING_RATE_URL_OKX, HTTP_OPEN_INTEREST_URL_OKX, OkxFundingRateData,
            OkxOpenInterestData, OkxRestResponse,
        },
    },
    symbol::{Symbol, okx_inst_id},
    time::{SharedClock, Ts},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Venue a poller instance serves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollerVenue {
    BinanceFuturesUsd,
    OkxSwap,
}

impl PollerVenue {
    fn stream_id(&self) -> StreamId {
        match self {
            PollerVenue::BinanceFuturesUsd => StreamId::from("binance.futures.usd"),
            PollerVenue::OkxSwap => StreamId::from("okx.public.swap"),
        }
    }

    fn source(&self) -> &'static str {
        match self {
            PollerVenue::BinanceFuturesUsd => "binance",
            PollerVenue::OkxSwap => "okx",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub backoff_base_ms: i64,
    pub jitter_seed: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            backoff_base_ms: 10_000,
            jitter_seed: 0,
        }
    }
}

pub struct DerivativesPoller {
    venue: PollerVenue,
    symbols: Vec<Symbol>,
    rest: Arc<dyn RestApi>,
    events: mpsc::Sender<BusEvent>,
    clock: SharedClock,
    config: PollerConfig,
    shutdown: watch::Receiver<bool>,
}

impl DerivativesPoller {
    pub fn new(
        venue: PollerVenue,
        symbols: Vec<Symbol>,
        rest: Arc<dyn RestApi>,
        events: mpsc::Sender<BusEvent>,
        clock: SharedClock,
        config: PollerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            venue,
            symbols,
            rest,
            events,
            clock,
            config,
            shutdown,
        }
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = RestBackoff::new(self.config.backoff_base_ms, self.config.jitter_seed);
            let mut timer = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() {
                            debug!(venue = ?self.venue, "poller stopped");
                            return;
                        }
                        continue;
                    }
                }

                for symbol in self.symbols.clone() {
                    let now = self.clock.now_ms();
                    if !backoff.ready(symbol.as_str(), now) {
                        continue;
                    }
                    match self.poll_symbol(&symbol, now).await {
                        Ok(events) => {
                            backoff.record_success(symbol.as_str());
                            for (topic, payload) in events {
                                if self.events.send(BusEvent::new(topic, payload)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) if err.is_abort() => {
                            // Shutdown-driven aborts neither log nor bump backoff
                            return;
                        }
                        Err(err) => {
                            backoff.record_failure(symbol.as_str(), now);
                            warn!(
                                venue = ?self.venue,
                                symbol = %symbol,
                                failures = backoff.failures(symbol.as_str()),
                                %err,
                                "derivatives poll failed"
                            );
                        }
                    }
                }
            }
        })
    }

    fn meta(&self, ts_event: Ts, now_ms: Ts) -> EventMeta {
        let mut meta = EventMeta::new(ts_event, now_ms, self.venue.source(), self.venue.stream_id());
        meta.ts_exchange = Some(ts_event);
        meta
    }

    async fn poll_symbol(
        &self,
        symbol: &Symbol,
        now_ms: Ts,
    ) -> Result<Vec<(Topic, BusPayload)>, DataError> {
        match self.venue {
            PollerVenue::BinanceFuturesUsd => self.poll_binance(symbol, now_ms).await,
            PollerVenue::OkxSwap => self.poll_okx(symbol, now_ms).await,
        }
    }

    async fn poll_binance(
        &self,
        symbol: &Symbol,
        now_ms: Ts,
    ) -> Result<Vec<(Topic, BusPayload)>, DataError> {
        let mut events = Vec::new();

        let oi_url = format!("{HTTP_OPEN_INTEREST_URL_BINANCE}?symbol={symbol}");
        let premium_url = format!("{HTTP_PREMIUM_INDEX_URL_BINANCE}?symbol={symbol}");
        let (oi_body, premium_body) = futures::join!(
            self.rest.get_json(&oi_url),
            self.rest.get_json(&premium_url)
        );

        let response: BinanceOpenInterestResponse = serde_json::from_value(oi_body?)?;
        if let Ok(value) = response.open_interest.parse::<f64>() {
            let meta = self.meta(response.time, now_ms);
            events.push((
                Topic::MarketOiRaw,
                BusPayload::OpenInterestRaw(OpenInterestRaw {
                    symbol: symbol.clone(),
                    market_type: MarketType::Futures,
                    open_interest: response.open_interest.clone(),
                    unit: OiUnit::Base,
                    open_interest_usd: None,
                    meta: meta.clone(),
                }),
            ));
            events.push((
                Topic::MarketOi,
                BusPayload::OpenInterest(OpenInterest {
                    symbol: symbol.clone(),
                    market_type: MarketType::Futures,
                    open_interest: value,
                    unit: OiUnit::Base,
                    open_interest_usd: None,
                    meta,
                }),
            ));
        }

        let premium: BinancePremiumIndexResponse = serde_json::from_value(premium_body?)?;
        let meta = self.meta(premium.time, now_ms);

        let mark = premium.mark_price.as_ref().and_then(|raw| raw.parse::<f64>().ok());
        let index = premium.index_price.as_ref().and_then(|raw| raw.parse::<f64>().ok());
        if mark.is_some() || index.is_some() {
            events.push((
                Topic::MarketTickerRaw,
                BusPayload::TickerRaw(TickerRaw {
                    symbol: symbol.clone(),
                    market_type: MarketType::Futures,
                    last_price: None,
                    mark_price: premium.mark_price.clone(),
                    index_price: premium.index_price.clone(),
                    meta: meta.clone(),
                }),
            ));
            events.push((
                Topic::MarketTicker,
                BusPayload::Ticker(Ticker {
                    symbol: symbol.clone(),
                    market_type: MarketType::Futures,
                    last_price: None,
                    mark_price: mark,
                    index_price: index,
                    meta: meta.clone(),
                }),
            ));
        }
        if let Some(raw_rate) = premium.last_funding_rate.clone() {
            if let Ok(rate) = raw_rate.parse::<f64>() {
                events.push((
                    Topic::MarketFundingRaw,
                    BusPayload::FundingRaw(FundingRaw {
                        symbol: symbol.clone(),
                        market_type: MarketType::Futures,
                        funding_rate: raw_rate,
                        next_funding_ts: premium.next_funding_time,
                        meta: meta.clone(),
                    }),
                ));
                events.push((
                    Topic::MarketFunding,
                    BusPayload::Funding(Funding {
                        symbol: symbol.clone(),
                        market_type: MarketType::Futures,
                        funding_rate: rate,
                        next_funding_ts: premium.next_funding_time,
                        meta,
                    }),
                ));
            }
        }

        Ok(events)
    }

    async fn poll_okx(
        &self,
        symbol: &Symbol,
        now_ms: Ts,
    ) -> Result<Vec<(Topic, BusPayload)>, DataError> {
        let Some(inst_id) = okx_inst_id(symbol, true) else {
            return Ok(vec![]);
        };
        let mut events = Vec::new();

        let oi_url = format!("{HTTP_OPEN_INTEREST_URL_OKX}?instType=SWAP&instId={inst_id}");
        let funding_url = format!("{HTTP_FUNDING_RATE_URL_OKX}?instId={inst_id}");
        let (oi_body, funding_body) = futures::join!(
            self.rest.get_json(&oi_url),
            self.rest.get_json(&funding_url)
        );

        let response: OkxRestResponse<OkxOpenInterestData> = serde_json::from_value(oi_body?)?;
        if response.code != "0" {
            return Err(DataError::Protocol(format!(
                "okx open-interest error code {}",
                response.code
            )));
        }
        if let Some(data) = response.data.into_iter().next() {
            let ts = data.ts.parse::<i64>().unwrap_or(now_ms);
            if let Ok(contracts) = data.contracts.parse::<f64>() {
                let meta = self.meta(ts, now_ms);
                events.push((
                    Topic::MarketOiRaw,
                    BusPayload::OpenInterestRaw(OpenInterestRaw {
                        symbol: symbol.clone(),
                        market_type: MarketType::Futures,
                        open_interest: data.contracts.clone(),
                        unit: OiUnit::Contracts,
                        open_interest_usd: data.usd_amount.clone(),
                        meta: meta.clone(),
                    }),
                ));
                events.push((
                    Topic::MarketOi,
                    BusPayload::OpenInterest(OpenInterest {
                        symbol: symbol.clone(),
                        market_type: MarketType::Futures,
                        open_interest: contracts,
                        unit: OiUnit::Contracts,
                        open_interest_usd: data
                            .usd_amount
                            .as_deref()
                            .and_then(|raw| raw.parse::<f64>().ok()),
                        meta,
                    }),
                ));
            }
        }

        let response: OkxRestResponse<OkxFundingRateData> = serde_json::from_value(funding_body?)?;
        if let Some(data) = response.data.into_iter().next() {
            if let Ok(rate) = data.funding_rate.parse::<f64>() {
                let ts = data
                    .funding_time
                    .as_deref()
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(now_ms);
                let next_funding_ts = data
                    .next_funding_time
                    .as_deref()
                    .and_then(|raw| raw.parse::<i64>().ok());
                let meta = self.meta(ts, now_ms);
                events.push((
                    Topic::MarketFundingRaw,
                    BusPayload::FundingRaw(FundingRaw {
                        symbol: symbol.clone(),
                        market_type: MarketType::Futures,
                        funding_rate: data.funding_rate.clone(),
                        next_funding_ts,
                        meta: meta.clone(),
                    }),
                ));
                events.push((
                    Topic::MarketFunding,
                    BusPayload::Funding(Funding {
                        symbol: symbol.clone(),
                        market_type: MarketType::Futures,
                        funding_rate: rate,
                        next_funding_ts,
                        meta,
                    }),
                ));
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::VirtualClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedRest {
        responses: Mutex<VecDeque<Result<serde_json::Value, DataError>>>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RestApi for ScriptedRest {
        async fn get_json(&self, url: &str) -> Result<serde_json::Value, DataError> {
            self.requests.lock().push(url.to_string());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(DataError::Transport("exhausted".to_string())))
        }
    }

    fn poller(
        venue: PollerVenue,
        responses: Vec<Result<serde_json::Value, DataError>>,
    ) -> (DerivativesPoller, mpsc::Receiver<BusEvent>, Arc<ScriptedRest>) {
        let rest = Arc::new(ScriptedRest {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = DerivativesPoller::new(
            venue,
            vec![Symbol::from("BTCUSDT")],
            Arc::clone(&rest) as Arc<dyn RestApi>,
            tx,
            Arc::new(VirtualClock::new(1_700_000_000_000)),
            PollerConfig::default(),
            shutdown_rx,
        );
        (poller, rx, rest)
    }

    #[tokio::test]
    async fn test_binance_poll_emits_oi_ticker_and_funding() {
        let (poller, _rx, rest) = poller(
            PollerVenue::BinanceFuturesUsd,
            vec![
                Ok(serde_json::json!({"openInterest": "50000.5", "time": 1700000000000i64})),
                Ok(serde_json::json!({
                    "markPrice": "43001.0",
                    "indexPrice": "43000.5",
                    "lastFundingRate": "0.0001",
                    "nextFundingTime": 1700028800000i64,
                    "time": 1700000000000i64
                })),
            ],
        );

        let events = poller
            .poll_symbol(&Symbol::from("BTCUSDT"), 1_700_000_000_100)
            .await
            .unwrap();
        // oi raw+canonical, ticker raw+canonical, funding raw+canonical
        assert_eq!(events.len(), 6);
        let (_, BusPayload::OpenInterest(oi)) = &events[1] else {
            panic!("expected oi payload");
        };
        assert_eq!(oi.open_interest, 50_000.5);
        assert_eq!(oi.unit, OiUnit::Base);

        let requests = rest.requests.lock();
        assert!(requests[0].contains("/fapi/v1/openInterest?symbol=BTCUSDT"));
        assert!(requests[1].contains("/fapi/v1/premiumIndex?symbol=BTCUSDT"));
    }

    #[tokio::test]
    async fn test_okx_poll_maps_units_and_funding() {
        let (poller, _rx, rest) = poller(
            PollerVenue::OkxSwap,
            vec![
                Ok(serde_json::json!({
                    "code": "0",
                    "data": [{
                        "instId": "BTC-USDT-SWAP",
                        "oi": "250000",
                        "oiCcy": "2500",
                        "oiUsd": "107500000",
                        "ts": "1700000000000"
                    }]
                })),
                Ok(serde_json::json!({
                    "code": "0",
                    "data": [{
                        "instId": "BTC-USDT-SWAP",
                        "fundingRate": "0.00012",
                        "fundingTime": "1700000000000",
                        "nextFundingTime": "1700028800000"
                    }]
                })),
            ],
        );

        let events = poller
            .poll_symbol(&Symbol::from("BTCUSDT"), 1_700_000_000_100)
            .await
            .unwrap();
        assert_eq!(events.len(), 4);

        let (_, BusPayload::OpenInterest(oi)) = &events[1] else {
            panic!("expected oi payload");
        };
        assert_eq!(oi.unit, OiUnit::Contracts);
        assert_eq!(oi.open_interest_usd, Some(107_500_000.0));

        let (_, BusPayload::Funding(funding)) = &events[3] else {
            panic!("expected funding payload");
        };
        assert_eq!(funding.funding_rate, 0.00012);
        assert_eq!(funding.next_funding_ts, Some(1_700_028_800_000));

        let requests = rest.requests.lock();
        assert!(requests[0].contains("instId=BTC-USDT-SWAP"));
    }

    #[tokio::test]
    async fn test_poll_failure_escalates_backoff() {
        let mut backoff = RestBackoff::new(10_000, 0);
        let now = 1_700_000_000_000;

        assert!(backoff.ready("BTCUSDT", now));
        backoff.record_failure("BTCUSDT", now);
        assert!(!backoff.ready("BTCUSDT", now + 1_000));

        // Abort errors are recognised and skipped by the poll loop; they
        // never reach record_failure, so readiness is unchanged by them.
        assert!(DataError::Abort.is_abort());
        assert_eq!(backoff.failures("BTCUSDT"), 1);
    }
}
