//! Production wiring: venue clients, pollers, aggregators, quality monitor
//! and journal around one bus, plus periodic status snapshots.

use quorum_data::{
    EventBus, Symbol, Topic,
    aggregate::{
        AggregatorConfig, CanonicalPriceCache,
        cvd::{CvdAggConfig, CvdAggregator, CvdCalcConfig, CvdCalculator},
        funding::FundingAggregator,
        liquidation::{LiquidationAggConfig, LiquidationAggregator},
        liquidity::{LiquidityAggConfig, LiquidityAggregator},
        open_interest::{OiConversionConfig, OpenInterestAggregator},
        price::{CanonicalPriceAggregator, PriceIndexAggregator},
    },
    bus::spawn_dispatcher,
    client::{ClientConfig, ReqwestRest, TungsteniteConnector, VenueClient},
    config::EnvConfig,
    event::{BusEvent, BusPayload, MarketDataStatus},
    exchange::{Connector, binance::Binance, bybit::Bybit, okx::Okx},
    journal::{Journal, JournalConfig},
    poller::{DerivativesPoller, PollerConfig, PollerVenue},
    quality::{QualityMonitor, QualityPolicy},
    registry::SourceRegistry,
    time::{Clock, SystemClock},
};
use smol_str::SmolStr;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::info;

#[tokio::main]
async fn main() {
    init_logging();
    let env = EnvConfig::from_env();
    info!(journal_dir = %env.journal_dir.display(), "starting quorum-data server");

    let symbols: Vec<Symbol> = std::env::var("QUORUM_SYMBOLS")
        .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
        .split(',')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(Symbol::from)
        .collect();
    let intervals = ["1m"];

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(SourceRegistry::new());
    let cache = CanonicalPriceCache::new();

    // Aggregation + quality + journal are plain bus subscribers
    let _price_index = PriceIndexAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        AggregatorConfig::default(),
    );
    let _price_canonical = CanonicalPriceAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&cache),
        AggregatorConfig::default(),
    );
    let _funding = FundingAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        AggregatorConfig::default(),
    );
    let _open_interest = OpenInterestAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&cache),
        AggregatorConfig::default(),
        OiConversionConfig::default(),
    );
    let _liquidations = LiquidationAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        LiquidationAggConfig::default(),
    );
    let _liquidity = LiquidityAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        LiquidityAggConfig::default(),
    );
    let _cvd_calc = CvdCalculator::attach(
        Arc::clone(&bus),
        CvdCalcConfig {
            debug: env.cvd_debug,
            ..Default::default()
        },
    );
    let _cvd_agg = CvdAggregator::attach(
        Arc::clone(&bus),
        Arc::clone(&registry),
        CvdAggConfig::default(),
        env.cvd_mismatch.clone(),
    );
    let monitor = QualityMonitor::attach(Arc::clone(&bus), QualityPolicy::default());

    let run_id = SmolStr::from(format!("run-{}", clock.now_ms()));
    let (_journal, _journal_task) = Journal::attach(
        &bus,
        JournalConfig {
            base_dir: env.journal_dir.clone(),
            run_id,
            ..Default::default()
        },
    );

    // Venue clients feed the single dispatcher
    let (events_tx, events_rx) = mpsc::channel::<BusEvent>(16_384);
    let _dispatcher = spawn_dispatcher(Arc::clone(&bus), events_rx);

    let ws = Arc::new(TungsteniteConnector);
    let rest = Arc::new(ReqwestRest::new());
    let client_config = ClientConfig {
        okx_resync_min_gap_count: env.okx_resync_min_gap_count,
        okx_resync_pending_max_ms: env.okx_resync_pending_max_ms,
        ..Default::default()
    };

    let connectors: Vec<Arc<dyn Connector>> = vec![
        Arc::new(Binance::spot()),
        Arc::new(Binance::futures_usd()),
        Arc::new(Okx::spot()),
        Arc::new(Okx::swap()),
        Arc::new(Bybit::spot()),
        Arc::new(Bybit::linear()),
    ];

    let mut clients = Vec::new();
    for connector in connectors {
        let is_okx = matches!(connector.venue(), quorum_data::exchange::Venue::Okx);
        let client = VenueClient::new(
            Arc::clone(&connector),
            Arc::clone(&ws) as Arc<dyn quorum_data::client::WsConnector>,
            Arc::clone(&rest) as Arc<dyn quorum_data::client::RestApi>,
            events_tx.clone(),
            Arc::clone(&clock),
            Arc::clone(&registry),
            client_config.clone(),
        );
        for symbol in &symbols {
            client.subscribe_trades(symbol);
            client.subscribe_ticker(symbol);
            client.subscribe_orderbook(symbol);
            client.subscribe_liquidations(symbol);
            if !is_okx || env.okx_enable_klines {
                for interval in intervals {
                    client.subscribe_klines(symbol, interval);
                }
            }
        }
        client.connect();
        clients.push((connector.stream_id(), client));
    }

    // Derivatives pollers: Binance futures + OKX swap
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _binance_poller = DerivativesPoller::new(
        PollerVenue::BinanceFuturesUsd,
        symbols.clone(),
        Arc::clone(&rest) as Arc<dyn quorum_data::client::RestApi>,
        events_tx.clone(),
        Arc::clone(&clock),
        PollerConfig::default(),
        shutdown_rx.clone(),
    )
    .spawn();
    let _okx_poller = DerivativesPoller::new(
        PollerVenue::OkxSwap,
        symbols.clone(),
        Arc::clone(&rest) as Arc<dyn quorum_data::client::RestApi>,
        events_tx.clone(),
        Arc::clone(&clock),
        PollerConfig::default(),
        shutdown_rx,
    )
    .spawn();

    // Quality tick + status snapshots
    let status_bus = Arc::clone(&bus);
    let status_registry = Arc::clone(&registry);
    let status_clock = Arc::clone(&clock);
    let clients_ref: Arc<Vec<(quorum_data::StreamId, VenueClient)>> = Arc::new(clients);
    let status_task = {
        let clients_for_status = Arc::clone(&clients_ref);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(10));
            loop {
                timer.tick().await;
                let now = status_clock.now_ms();
                monitor.on_tick(now);

                let connections: BTreeMap<SmolStr, SmolStr> = clients_for_status
                    .iter()
                    .map(|(stream_id, client)| {
                        (
                            SmolStr::from(stream_id.as_str()),
                            SmolStr::from(format!("{:?}", client.state())),
                        )
                    })
                    .collect();
                status_bus.publish(BusEvent::new(
                    Topic::SystemMarketDataStatus,
                    BusPayload::Status(MarketDataStatus {
                        ts: now,
                        connections,
                        symbols: status_registry.known_symbols(),
                    }),
                ));
            }
        })
    };

    info!(symbols = ?symbols, "pipeline running; ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for (_, client) in clients_ref.iter() {
        client.disconnect();
    }
    status_task.abort();
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
