//! Generic venue client: connection lifecycle, subscription reconciliation,
//! order-book sequencing and resync, with venue specifics delegated to a
//! [`Connector`].
//!
//! The lifecycle FSM (`Idle -> Connecting -> Open -> Closing`) is
//! single-writer: only the run task mutates it. Normalised events flow into
//! a bounded channel drained by the bus dispatcher, so a slow consumer
//! back-pressures the socket read naturally.

use crate::{
    backoff::ReconnectPolicy,
    books::{BookReconciler, ReconcileEvent, ReconcileOutcome, SequenceRule, SnapshotPhase},
    error::DataError,
    event::{
        BusEvent, BusPayload, Disconnected, MarketType, OrderBookL2Snapshot, ResyncReason,
        ResyncRequested, Topic,
    },
    exchange::{Connector, FeedChannel, Inbound},
    registry::{Feed, SourceRegistry},
    subscription::{SubKey, SubscriptionManager},
    symbol::Symbol,
    time::{SharedClock, Ts, bucket_start},
};
use async_trait::async_trait;
use fnv::FnvHashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::sync::{Notify, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Default WebSocket read timeout: silent stream death is treated as a
/// disconnect after this long without any inbound frame.
pub const DEFAULT_WS_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub reconnect: ReconnectPolicy,
    pub read_timeout: Duration,
    /// `OKX_RESYNC_MIN_GAP_COUNT`: consecutive chain breaks tolerated before
    /// a resync (1 disables tolerance).
    pub okx_resync_min_gap_count: u32,
    /// `OKX_RESYNC_PENDING_MAX_MS`: de-duplication window for resync
    /// requests of one symbol.
    pub okx_resync_pending_max_ms: i64,
    /// `OKX_ENABLE_KLINES` gates kline subscriptions on OKX connections;
    /// bootstraps run wherever a REST candle endpoint exists.
    pub enable_kline_bootstrap: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            read_timeout: DEFAULT_WS_READ_TIMEOUT,
            okx_resync_min_gap_count: 1,
            okx_resync_pending_max_ms: 5_000,
            enable_kline_bootstrap: true,
        }
    }
}

// ------------------------------------------------------------------------
// Transport abstraction
// ------------------------------------------------------------------------

/// One live WebSocket connection, text frames only.
#[async_trait]
pub trait WsConnection: Send {
    async fn send_text(&mut self, frame: String) -> Result<(), DataError>;

    /// Next text frame. `None` is a clean close; `Err` carries transport and
    /// close-code classification (1008 maps to a rate-limit error).
    async fn next_text(&mut self) -> Option<Result<String, DataError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsConnection>, DataError>;
}

/// Abort-aware JSON GET.
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, DataError>;
}

/// Production WebSocket transport over `tokio-tungstenite`.
pub struct TungsteniteConnector;

struct TungsteniteConnection {
    inner: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsConnection>, DataError> {
        let url = Url::parse(url).map_err(|err| DataError::Transport(err.to_string()))?;
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|err| DataError::Transport(err.to_string()))?;
        Ok(Box::new(TungsteniteConnection { inner: stream }))
    }
}

#[async_trait]
impl WsConnection for TungsteniteConnection {
    async fn send_text(&mut self, frame: String) -> Result<(), DataError> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|err| DataError::Transport(err.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, DataError>> {
        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Ping(payload)) => {
                    if let Err(err) = self.inner.send(Message::Pong(payload)).await {
                        return Some(Err(DataError::Transport(err.to_string())));
                    }
                }
                Ok(Message::Close(frame)) => {
                    // 1008 indicates rate-limit policing
                    if let Some(frame) = frame {
                        if u16::from(frame.code) == 1008 {
                            return Some(Err(DataError::RateLimited {
                                detail: format!("ws close 1008: {}", frame.reason),
                                retry_after_ms: None,
                            }));
                        }
                    }
                    return None;
                }
                Ok(_) => continue,
                Err(err) => return Some(Err(DataError::Transport(err.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// Production REST transport over `reqwest`.
pub struct ReqwestRest {
    client: reqwest::Client,
}

impl ReqwestRest {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestRest {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RestApi for ReqwestRest {
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, DataError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| DataError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get("Retry-After")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<i64>().ok())
                .map(|secs| secs * 1_000);
            if matches!(status.as_u16(), 418 | 429) {
                return Err(DataError::RateLimited {
                    detail: format!("http {status}"),
                    retry_after_ms,
                });
            }
            return Err(DataError::Http {
                status: status.as_u16(),
                detail: status.to_string(),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| DataError::Protocol(err.to_string()))
    }
}

// ------------------------------------------------------------------------
// VenueClient
// ------------------------------------------------------------------------

struct ClientShared {
    state: ConnState,
    subs: SubscriptionManager,
    pending_requests: FnvHashMap<u64, Vec<SubKey>>,
    next_request_id: u64,
    books: FnvHashMap<Symbol, BookReconciler>,
    book_keys: FnvHashMap<Symbol, Vec<SubKey>>,
    kline_bootstraps: Vec<(Symbol, SmolStr)>,
    gap_streak: FnvHashMap<Symbol, u32>,
    last_resync_ts: FnvHashMap<Symbol, Ts>,
    dropped_frames: u64,
}

impl Default for ClientShared {
    fn default() -> Self {
        Self {
            state: ConnState::Idle,
            subs: SubscriptionManager::new(),
            pending_requests: FnvHashMap::default(),
            next_request_id: 1,
            books: FnvHashMap::default(),
            book_keys: FnvHashMap::default(),
            kline_bootstraps: Vec::new(),
            gap_streak: FnvHashMap::default(),
            last_resync_ts: FnvHashMap::default(),
            dropped_frames: 0,
        }
    }
}

struct ClientInner {
    connector: Arc<dyn Connector>,
    ws: Arc<dyn WsConnector>,
    rest: Arc<dyn RestApi>,
    events: mpsc::Sender<BusEvent>,
    clock: SharedClock,
    registry: Arc<SourceRegistry>,
    config: ClientConfig,
    shared: Mutex<ClientShared>,
    flush_notify: Notify,
    shutdown: watch::Sender<bool>,
}

/// Per venue × connection ingestion state machine.
pub struct VenueClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VenueClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        ws: Arc<dyn WsConnector>,
        rest: Arc<dyn RestApi>,
        events: mpsc::Sender<BusEvent>,
        clock: SharedClock,
        registry: Arc<SourceRegistry>,
        config: ClientConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                connector,
                ws,
                rest,
                events,
                clock,
                registry,
                config,
                shared: Mutex::new(ClientShared::default()),
                flush_notify: Notify::new(),
                shutdown,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the reconcile task. Idempotent.
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let _ = self.inner.shutdown.send(false);
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run_client(inner)));
    }

    /// Abort in-flight work and stop reconnecting. Reconnect timers are
    /// cleared; abort errors never bump backoff.
    pub fn disconnect(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.flush_notify.notify_one();
    }

    pub fn is_alive(&self) -> bool {
        self.inner.shared.lock().state == ConnState::Open
    }

    /// Count of frames dropped as undecodable or irrelevant.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.shared.lock().dropped_frames
    }

    pub fn state(&self) -> ConnState {
        self.inner.shared.lock().state
    }

    pub fn subscribe_trades(&self, symbol: &Symbol) {
        self.subscribe_feed(FeedChannel::Trades, symbol, None);
    }

    pub fn subscribe_ticker(&self, symbol: &Symbol) {
        self.subscribe_feed(FeedChannel::Ticker, symbol, None);
    }

    pub fn subscribe_liquidations(&self, symbol: &Symbol) {
        self.subscribe_feed(FeedChannel::Liquidations, symbol, None);
    }

    pub fn subscribe_klines(&self, symbol: &Symbol, interval: &str) {
        self.subscribe_feed(FeedChannel::Klines, symbol, Some(interval));
        if self.inner.config.enable_kline_bootstrap {
            let mut shared = self.inner.shared.lock();
            shared
                .kline_bootstraps
                .push((symbol.clone(), SmolStr::from(interval)));
        }
    }

    pub fn subscribe_orderbook(&self, symbol: &Symbol) {
        let keys = self
            .inner
            .connector
            .sub_keys(FeedChannel::Orderbook, symbol, None);
        if keys.is_empty() {
            return;
        }
        {
            let mut shared = self.inner.shared.lock();
            let rule = self.inner.connector.book_rule();
            shared
                .books
                .entry(symbol.clone())
                .or_insert_with(|| BookReconciler::new(rule));
            shared.book_keys.insert(symbol.clone(), keys.clone());
            for key in keys {
                shared.subs.add_desired(key);
            }
        }
        self.inner.flush_notify.notify_one();
    }

    fn subscribe_feed(&self, feed: FeedChannel, symbol: &Symbol, interval: Option<&str>) {
        let keys = self.inner.connector.sub_keys(feed, symbol, interval);
        if keys.is_empty() {
            return;
        }
        let mut changed = false;
        {
            let mut shared = self.inner.shared.lock();
            for key in keys {
                changed |= shared.subs.add_desired(key);
            }
        }
        if changed {
            self.inner.flush_notify.notify_one();
        }
    }
}

// ------------------------------------------------------------------------
// Run task
// ------------------------------------------------------------------------

async fn run_client(inner: Arc<ClientInner>) {
    let mut shutdown_rx = inner.shutdown.subscribe();
    let mut attempt: u32 = 0;
    let stream_id = inner.connector.stream_id();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        inner.shared.lock().state = ConnState::Connecting;
        debug!(stream = %stream_id, attempt, "connecting");

        let connected = tokio::select! {
            result = inner.ws.connect(inner.connector.ws_url()) => result,
            _ = shutdown_rx.changed() => break,
        };

        match connected {
            Ok(connection) => {
                let open_since = inner.clock.now_ms();
                {
                    let mut shared = inner.shared.lock();
                    shared.state = ConnState::Open;
                    // Fresh socket: nothing is pending or active any more
                    shared.subs.on_disconnect();
                    shared.pending_requests.clear();
                    for book in shared.books.values_mut() {
                        book.on_disconnect();
                    }
                }
                info!(stream = %stream_id, "connected");
                inner.flush_notify.notify_one();

                let rate_limited =
                    run_connection(&inner, connection, &mut shutdown_rx).await;

                publish_disconnected(&inner).await;
                {
                    let mut shared = inner.shared.lock();
                    shared.subs.on_disconnect();
                    shared.pending_requests.clear();
                    for book in shared.books.values_mut() {
                        book.on_disconnect();
                    }
                    shared.state = if *shutdown_rx.borrow() {
                        ConnState::Closing
                    } else {
                        ConnState::Idle
                    };
                }

                if *shutdown_rx.borrow() {
                    break;
                }

                // Stable uptime resets the attempt counter
                if inner.clock.now_ms() - open_since >= inner.config.reconnect.backoff_reset_ms {
                    attempt = 0;
                }
                attempt += 1;
                let delay = inner.config.reconnect.delay_ms(attempt, rate_limited);
                warn!(stream = %stream_id, attempt, delay_ms = delay, "reconnecting after disconnect");
                if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
            }
            Err(err) => {
                if err.is_abort() || *shutdown_rx.borrow() {
                    break;
                }
                attempt += 1;
                let delay = inner.config.reconnect.delay_ms(attempt, err.is_rate_limit());
                warn!(stream = %stream_id, attempt, delay_ms = delay, %err, "connect failed");
                inner.shared.lock().state = ConnState::Idle;
                if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
            }
        }
    }

    inner.shared.lock().state = ConnState::Idle;
    debug!(stream = %stream_id, "client stopped");
}

/// Sleep `delay_ms`, returning `true` when shutdown fired first.
async fn sleep_or_shutdown(delay_ms: i64, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(delay_ms.max(0) as u64)) => false,
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
    }
}

/// Drive one open connection until it dies. Returns whether the death was
/// rate-limit policing (used to floor the reconnect delay).
async fn run_connection(
    inner: &Arc<ClientInner>,
    mut connection: Box<dyn WsConnection>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let ping = inner.connector.ping();
    let mut ping_timer = tokio::time::interval(
        ping.as_ref()
            .map(|spec| spec.interval)
            .unwrap_or(Duration::from_secs(3600)),
    );
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.reset();

    let (snapshot_tx, mut snapshot_rx) =
        mpsc::unbounded_channel::<(Symbol, Result<OrderBookL2Snapshot, DataError>)>();
    let (bootstrap_tx, mut bootstrap_rx) =
        mpsc::unbounded_channel::<Result<Vec<(Topic, BusPayload)>, DataError>>();

    // Select arms only classify; the connection is acted on afterwards so no
    // arm ever borrows it while the read future holds it.
    enum Action {
        Shutdown,
        Flush,
        Ping,
        Snapshot(Symbol, Result<OrderBookL2Snapshot, DataError>),
        Bootstrap(Result<Vec<(Topic, BusPayload)>, DataError>),
        Frame(String),
        TransportError(DataError),
        ReadTimeout,
        Closed,
        Nothing,
    }

    // Deadline resets only on inbound frames: keepalive sends must not mask
    // a silently dead read side.
    let mut read_deadline = tokio::time::Instant::now() + inner.config.read_timeout;

    loop {
        let action = tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    Action::Shutdown
                } else {
                    Action::Nothing
                }
            }
            _ = inner.flush_notify.notified() => Action::Flush,
            _ = ping_timer.tick() => Action::Ping,
            Some((symbol, result)) = snapshot_rx.recv() => Action::Snapshot(symbol, result),
            Some(result) = bootstrap_rx.recv() => Action::Bootstrap(result),
            _ = tokio::time::sleep_until(read_deadline) => Action::ReadTimeout,
            frame = connection.next_text() => {
                match frame {
                    None => Action::Closed,
                    Some(Err(err)) => Action::TransportError(err),
                    Some(Ok(text)) => Action::Frame(text),
                }
            }
        };

        match action {
            Action::Shutdown => {
                connection.close().await;
                return false;
            }
            Action::Nothing => {}
            Action::Flush => {
                if let Err(err) =
                    flush_subscriptions(inner, connection.as_mut(), &snapshot_tx, &bootstrap_tx)
                        .await
                {
                    warn!(%err, "subscription flush failed");
                    return err.is_rate_limit();
                }
            }
            Action::Ping => {
                if let Some(spec) = &ping {
                    if let Err(err) = connection.send_text(spec.frame.clone()).await {
                        warn!(%err, "ping failed");
                        return err.is_rate_limit();
                    }
                }
            }
            Action::Snapshot(symbol, result) => {
                handle_snapshot_result(inner, symbol, result).await;
            }
            Action::Bootstrap(result) => match result {
                Ok(events) => {
                    for (topic, payload) in events {
                        forward(inner, topic, payload).await;
                    }
                }
                Err(err) if err.is_abort() => {}
                Err(err) => warn!(%err, "kline bootstrap failed"),
            },
            Action::Frame(text) => {
                read_deadline = tokio::time::Instant::now() + inner.config.read_timeout;
                handle_frame(inner, &text, &snapshot_tx, connection.as_mut()).await;
            }
            Action::TransportError(err) => {
                warn!(%err, "transport error");
                return err.is_rate_limit();
            }
            Action::ReadTimeout => {
                warn!(
                    timeout_secs = inner.config.read_timeout.as_secs(),
                    "read timeout - no data received, triggering reconnection"
                );
                connection.close().await;
                return false;
            }
            Action::Closed => {
                debug!("connection closed by venue");
                return false;
            }
        }
    }
}

async fn flush_subscriptions(
    inner: &Arc<ClientInner>,
    connection: &mut dyn WsConnection,
    snapshot_tx: &mpsc::UnboundedSender<(Symbol, Result<OrderBookL2Snapshot, DataError>)>,
    bootstrap_tx: &mpsc::UnboundedSender<Result<Vec<(Topic, BusPayload)>, DataError>>,
) -> Result<(), DataError> {
    // Single-flight: the notify coalesces any re-flush requested while this
    // one runs, and the diff recomputes from scratch each time.
    let (diff, request_id, bootstraps) = {
        let mut shared = inner.shared.lock();
        let diff = shared.subs.flush_diff();
        let needs_snapshot = shared
            .books
            .values()
            .any(|book| book.state.snapshot == SnapshotPhase::Absent);
        if diff.is_empty() && shared.kline_bootstraps.is_empty() && !needs_snapshot {
            return Ok(());
        }
        let request_id = shared.next_request_id;
        shared.next_request_id += 1;
        shared.subs.mark_pending(&diff);
        if !diff.is_empty() {
            shared.pending_requests.insert(request_id, diff.clone());
        }
        let bootstraps = std::mem::take(&mut shared.kline_bootstraps);
        (diff, request_id, bootstraps)
    };

    if !diff.is_empty() {
        for frame in inner.connector.subscribe_frames(&diff, request_id) {
            connection.send_text(frame).await?;
        }
        debug!(count = diff.len(), "subscribe frames sent");
    }

    // Book symbols with no snapshot yet: fetch (REST) or await in-band
    let fetches: Vec<(Symbol, String)> = {
        let mut shared = inner.shared.lock();
        let mut fetches = Vec::new();
        let symbols: Vec<Symbol> = shared.books.keys().cloned().collect();
        for symbol in symbols {
            let needs_snapshot = shared
                .books
                .get(&symbol)
                .is_some_and(|book| book.state.snapshot == SnapshotPhase::Absent);
            if !needs_snapshot {
                continue;
            }
            if let Some(url) = inner.connector.book_snapshot_url(&symbol) {
                if let Some(book) = shared.books.get_mut(&symbol) {
                    book.begin_snapshot();
                }
                fetches.push((symbol, url));
            } else if let Some(book) = shared.books.get_mut(&symbol) {
                book.begin_snapshot();
            }
        }
        fetches
    };
    for (symbol, url) in fetches {
        let rest = Arc::clone(&inner.rest);
        let connector = Arc::clone(&inner.connector);
        let clock = Arc::clone(&inner.clock);
        let tx = snapshot_tx.clone();
        tokio::spawn(async move {
            let result = match rest.get_json(&url).await {
                Ok(body) => connector.parse_book_snapshot(&symbol, &body, clock.now_ms()),
                Err(err) => Err(err),
            };
            let _ = tx.send((symbol, result));
        });
    }

    // Current-day kline bootstraps
    for (symbol, interval) in bootstraps {
        let day_start = bucket_start(inner.clock.now_ms(), 86_400_000);
        let Some(url) = inner
            .connector
            .kline_bootstrap_url(&symbol, &interval, day_start)
        else {
            continue;
        };
        let rest = Arc::clone(&inner.rest);
        let connector = Arc::clone(&inner.connector);
        let clock = Arc::clone(&inner.clock);
        let tx = bootstrap_tx.clone();
        tokio::spawn(async move {
            let result = match rest.get_json(&url).await {
                Ok(body) => {
                    connector.parse_kline_bootstrap(&symbol, &interval, &body, clock.now_ms())
                }
                Err(err) => Err(err),
            };
            let _ = tx.send(result);
        });
    }

    Ok(())
}

async fn handle_frame(
    inner: &Arc<ClientInner>,
    text: &str,
    snapshot_tx: &mpsc::UnboundedSender<(Symbol, Result<OrderBookL2Snapshot, DataError>)>,
    connection: &mut dyn WsConnection,
) {
    let now_ms = inner.clock.now_ms();
    for inbound in inner.connector.parse(text, now_ms) {
        match inbound {
            Inbound::Events(events) => {
                for (topic, payload) in events {
                    observe_feed(inner, topic, &payload);
                    forward(inner, topic, payload).await;
                }
            }
            Inbound::BookDelta(delta) => {
                handle_book_delta(inner, delta, snapshot_tx, connection).await;
            }
            Inbound::BookSnapshot(snapshot) => {
                handle_snapshot_result(inner, snapshot.symbol.clone(), Ok(snapshot)).await;
            }
            Inbound::SubAckId(request_id) => {
                let mut shared = inner.shared.lock();
                if let Some(keys) = shared.pending_requests.remove(&request_id) {
                    shared.subs.mark_active(&keys);
                }
            }
            Inbound::SubAckKeys(keys) => {
                inner.shared.lock().subs.mark_active(&keys);
            }
            Inbound::SubError(detail) => {
                warn!(detail, "venue rejected subscription");
            }
            Inbound::Pong => {}
            Inbound::Ignore => {
                // Single bad or irrelevant frame: drop silently, count it
                inner.shared.lock().dropped_frames += 1;
            }
        }
    }
}

async fn handle_book_delta(
    inner: &Arc<ClientInner>,
    delta: crate::event::OrderBookL2Delta,
    snapshot_tx: &mpsc::UnboundedSender<(Symbol, Result<OrderBookL2Snapshot, DataError>)>,
    connection: &mut dyn WsConnection,
) {
    let symbol = delta.symbol.clone();
    inner.registry.observe_feed(
        &symbol,
        delta.market_type,
        Feed::Orderbook,
        &delta.meta.stream_id,
        delta.meta.ts_event,
    );

    let outcome = {
        let mut shared = inner.shared.lock();
        let min_gap = inner.config.okx_resync_min_gap_count;
        let Some(book) = shared.books.get(&symbol) else {
            return;
        };
        let check_gap_tolerance =
            book.rule() == SequenceRule::OkxSeqId && book.snapshot_present();
        let chain_holds = book.chain_would_hold(&delta);

        // OKX gap tolerance: swallow isolated seqId breaks below the
        // configured streak before committing to a resync
        if check_gap_tolerance {
            if chain_holds {
                shared.gap_streak.remove(&symbol);
            } else {
                let streak = shared.gap_streak.entry(symbol.clone()).or_insert(0);
                *streak += 1;
                let tolerated = *streak < min_gap;
                let streak = *streak;
                if tolerated {
                    if let Some(book) = shared.books.get_mut(&symbol) {
                        book.force_apply(&delta);
                    }
                    debug!(symbol = %symbol, streak, "tolerated book gap");
                    drop(shared);
                    forward(inner, Topic::MarketOrderbookL2Delta, BusPayload::OrderBookDelta(delta))
                        .await;
                    return;
                }
            }
        }

        let Some(book) = shared.books.get_mut(&symbol) else {
            return;
        };
        let outcome = book.on_delta(delta);
        if matches!(outcome, ReconcileOutcome::Resync(_)) {
            shared.gap_streak.remove(&symbol);
        }
        outcome
    };

    match outcome {
        ReconcileOutcome::Buffered | ReconcileOutcome::Discarded => {}
        ReconcileOutcome::Emit(events) => publish_book_events(inner, events).await,
        ReconcileOutcome::Resync(reason) => {
            request_resync(inner, &symbol, reason, snapshot_tx, connection).await;
        }
    }
}

async fn handle_snapshot_result(
    inner: &Arc<ClientInner>,
    symbol: Symbol,
    result: Result<OrderBookL2Snapshot, DataError>,
) {
    let snapshot = match result {
        Ok(snapshot) => snapshot,
        Err(err) if err.is_abort() => return,
        Err(err) => {
            warn!(symbol = %symbol, %err, "book snapshot fetch failed");
            return;
        }
    };

    let outcome = {
        let mut shared = inner.shared.lock();
        let Some(book) = shared.books.get_mut(&symbol) else {
            return;
        };
        book.on_snapshot(snapshot)
    };

    match outcome {
        ReconcileOutcome::Emit(events) => publish_book_events(inner, events).await,
        ReconcileOutcome::Resync(reason) => {
            // Snapshot landed inside a gap; publish and let the next flush
            // re-fetch
            publish_resync_event(inner, &symbol, reason).await;
            inner.flush_notify.notify_one();
        }
        _ => {}
    }
}

async fn request_resync(
    inner: &Arc<ClientInner>,
    symbol: &Symbol,
    reason: ResyncReason,
    snapshot_tx: &mpsc::UnboundedSender<(Symbol, Result<OrderBookL2Snapshot, DataError>)>,
    connection: &mut dyn WsConnection,
) {
    let now_ms = inner.clock.now_ms();
    {
        // De-duplicate resync storms for one symbol
        let mut shared = inner.shared.lock();
        if let Some(last) = shared.last_resync_ts.get(symbol) {
            if now_ms - last < inner.config.okx_resync_pending_max_ms {
                return;
            }
        }
        shared.last_resync_ts.insert(symbol.clone(), now_ms);
    }

    publish_resync_event(inner, symbol, reason).await;

    if let Some(url) = inner.connector.book_snapshot_url(symbol) {
        {
            let mut shared = inner.shared.lock();
            if let Some(book) = shared.books.get_mut(symbol) {
                book.begin_snapshot();
            }
        }
        let rest = Arc::clone(&inner.rest);
        let connector = Arc::clone(&inner.connector);
        let clock = Arc::clone(&inner.clock);
        let tx = snapshot_tx.clone();
        let symbol = symbol.clone();
        tokio::spawn(async move {
            let result = match rest.get_json(&url).await {
                Ok(body) => connector.parse_book_snapshot(&symbol, &body, clock.now_ms()),
                Err(err) => Err(err),
            };
            let _ = tx.send((symbol, result));
        });
    } else {
        // In-band snapshot venues: bounce the book subscription
        let keys = {
            let mut shared = inner.shared.lock();
            if let Some(book) = shared.books.get_mut(symbol) {
                book.begin_snapshot();
            }
            shared.book_keys.get(symbol).cloned().unwrap_or_default()
        };
        if !keys.is_empty() {
            let request_id = {
                let mut shared = inner.shared.lock();
                let id = shared.next_request_id;
                shared.next_request_id += 1;
                shared.pending_requests.insert(id, keys.clone());
                id
            };
            for frame in inner.connector.unsubscribe_frames(&keys, request_id) {
                let _ = connection.send_text(frame).await;
            }
            for frame in inner.connector.subscribe_frames(&keys, request_id) {
                let _ = connection.send_text(frame).await;
            }
        }
    }
}

async fn publish_book_events(inner: &Arc<ClientInner>, events: Vec<ReconcileEvent>) {
    for event in events {
        match event {
            ReconcileEvent::Snapshot(snapshot) => {
                forward(
                    inner,
                    Topic::MarketOrderbookL2Snapshot,
                    BusPayload::OrderBookSnapshot(snapshot),
                )
                .await;
            }
            ReconcileEvent::Delta(delta) => {
                forward(
                    inner,
                    Topic::MarketOrderbookL2Delta,
                    BusPayload::OrderBookDelta(delta),
                )
                .await;
            }
        }
    }
}

async fn publish_resync_event(inner: &Arc<ClientInner>, symbol: &Symbol, reason: ResyncReason) {
    let event = ResyncRequested {
        symbol: symbol.clone(),
        market_type: inner.connector.market_type(),
        stream_id: inner.connector.stream_id(),
        reason,
        ts: inner.clock.now_ms(),
    };
    warn!(symbol = %symbol, stream = %event.stream_id, ?reason, "book resync requested");
    forward(
        inner,
        Topic::MarketResyncRequested,
        BusPayload::ResyncRequested(event),
    )
    .await;
}

async fn publish_disconnected(inner: &Arc<ClientInner>) {
    let event = Disconnected {
        stream_id: inner.connector.stream_id(),
        close_code: None,
        ts: inner.clock.now_ms(),
    };
    forward(inner, Topic::MarketDisconnected, BusPayload::Disconnected(event)).await;
}

async fn forward(inner: &Arc<ClientInner>, topic: Topic, payload: BusPayload) {
    if inner.events.send(BusEvent::new(topic, payload)).await.is_err() {
        debug!("event channel closed, dropping outbound event");
    }
}

fn observe_feed(inner: &Arc<ClientInner>, topic: Topic, payload: &BusPayload) {
    let feed = match (topic, payload) {
        (Topic::MarketTradeRaw, _) => Some(Feed::Trades),
        (Topic::MarketOiRaw, _) => Some(Feed::Oi),
        (Topic::MarketFundingRaw, _) => Some(Feed::Funding),
        (Topic::MarketKlineRaw, _) => Some(Feed::Klines),
        (Topic::MarketTickerRaw, BusPayload::TickerRaw(ticker)) => {
            if ticker.mark_price.is_some() {
                Some(Feed::MarkPrice)
            } else if ticker.index_price.is_some() {
                Some(Feed::IndexPrice)
            } else {
                None
            }
        }
        _ => None,
    };
    let (Some(feed), Some(meta), Some(symbol)) = (feed, payload.meta(), payload.symbol()) else {
        return;
    };
    let market_type = match payload {
        BusPayload::TradeRaw(raw) => raw.market_type,
        BusPayload::TickerRaw(raw) => raw.market_type,
        BusPayload::KlineRaw(raw) => raw.market_type,
        BusPayload::OpenInterestRaw(raw) => raw.market_type,
        BusPayload::FundingRaw(raw) => raw.market_type,
        BusPayload::LiquidationRaw(raw) => raw.market_type,
        _ => MarketType::Unknown,
    };
    inner
        .registry
        .observe_feed(symbol, market_type, feed, &meta.stream_id, meta.ts_event);
}
