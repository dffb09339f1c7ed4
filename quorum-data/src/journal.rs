//! Append-only JSON-lines journal.
//!
//! Layout: `<base>/<streamId>/<symbol>/<topic-dir>[/<tf>]/<runId>/<YYYY-MM-DD>.jsonl`
//! with one record per line. `seq` is monotone per file; rotation is purely
//! the date boundary in the path. Durability is fsync-on-batch
//! (`flush_interval_ms` / `max_batch_size`). The inbound queue is bounded:
//! overflow drops are counted and warned about on a throttle, never silent.

use crate::{
    bus::EventBus,
    event::{BusEvent, BusPayload, StreamId, Topic},
    symbol::Symbol,
    time::Ts,
};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Canonical topics the journal records by default.
pub const DEFAULT_JOURNAL_TOPICS: [Topic; 10] = [
    Topic::MarketTrade,
    Topic::MarketTicker,
    Topic::MarketKline,
    Topic::MarketOi,
    Topic::MarketFunding,
    Topic::MarketLiquidation,
    Topic::MarketOrderbookL2Snapshot,
    Topic::MarketOrderbookL2Delta,
    Topic::MarketCvdSpot,
    Topic::MarketCvdFutures,
];

#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// `BOT_JOURNAL_DIR`.
    pub base_dir: PathBuf,
    pub run_id: SmolStr,
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
    pub queue_capacity: usize,
    pub topics: Vec<Topic>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("journal"),
            run_id: SmolStr::from("run-0"),
            flush_interval_ms: 1_000,
            max_batch_size: 256,
            queue_capacity: 8_192,
            topics: DEFAULT_JOURNAL_TOPICS.to_vec(),
        }
    }
}

/// One journal line.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub seq: u64,
    pub stream_id: StreamId,
    pub run_id: SmolStr,
    pub topic: Topic,
    pub symbol: Symbol,
    pub ts_ingest: Ts,
    pub payload: serde_json::Value,
}

/// A record waiting for its per-file sequence number.
#[derive(Clone, Debug)]
struct PendingRecord {
    stream_id: StreamId,
    topic: Topic,
    symbol: Symbol,
    tf: Option<SmolStr>,
    ts_ingest: Ts,
    payload: serde_json::Value,
}

/// Bus observer feeding the single writer task.
pub struct Journal {
    config: JournalConfig,
    sender: mpsc::Sender<PendingRecord>,
}

impl Journal {
    /// Subscribe the journal to its topics and spawn the writer task.
    pub fn attach(bus: &Arc<EventBus>, config: JournalConfig) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let journal = Arc::new(Self {
            config: config.clone(),
            sender,
        });

        let dropped = Arc::new(parking_lot::Mutex::new((0u64, 0i64)));
        for topic in &journal.config.topics {
            let handler = Arc::clone(&journal);
            let dropped = Arc::clone(&dropped);
            bus.subscribe(*topic, format!("journal:{}", topic.as_str()), move |event| {
                handler.observe(event, &dropped);
                Ok(())
            });
        }

        let writer = spawn_writer(config, receiver);
        (journal, writer)
    }

    fn observe(&self, event: &BusEvent, dropped: &parking_lot::Mutex<(u64, Ts)>) {
        let Some(meta) = event.payload.meta() else {
            return;
        };
        let Some(symbol) = event.payload.symbol() else {
            return;
        };
        let tf = match &event.payload {
            BusPayload::Kline(kline) => Some(kline.interval.clone()),
            BusPayload::KlineRaw(kline) => Some(kline.interval.clone()),
            _ => None,
        };
        let payload = match event.payload.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                error!(topic = %event.topic, %err, "journal serialization failed");
                return;
            }
        };

        let record = PendingRecord {
            stream_id: meta.stream_id.clone(),
            topic: event.topic,
            symbol: symbol.clone(),
            tf,
            ts_ingest: meta.ts_ingest,
            payload,
        };

        if self.sender.try_send(record).is_err() {
            // Bounded queue over-full: count and warn on a throttle
            let mut guard = dropped.lock();
            guard.0 += 1;
            let now = meta.ts_ingest;
            if now - guard.1 >= 5_000 {
                guard.1 = now;
                warn!(dropped = guard.0, "journal queue over-full, records dropped");
            }
        }
    }
}

/// Relative file path for a record.
fn record_path(config: &JournalConfig, record: &PendingRecord) -> PathBuf {
    let date = DateTime::from_timestamp_millis(record.ts_ingest)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string());

    let mut path = config.base_dir.clone();
    path.push(record.stream_id.as_str());
    path.push(record.symbol.as_str());
    path.push(record.topic.dir_name());
    if let Some(tf) = &record.tf {
        path.push(tf.as_str());
    }
    path.push(config.run_id.as_str());
    path.push(format!("{date}.jsonl"));
    path
}

struct OpenFile {
    file: std::fs::File,
    next_seq: u64,
    unsynced: usize,
}

fn spawn_writer(
    config: JournalConfig,
    mut receiver: mpsc::Receiver<PendingRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut files: HashMap<PathBuf, OpenFile> = HashMap::new();
        let mut flush_timer =
            tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                record = receiver.recv() => {
                    match record {
                        Some(record) => {
                            if let Err(err) = write_record(&config, &mut files, &record) {
                                error!(%err, "journal write failed");
                            }
                            // fsync on batch size
                            for open in files.values_mut() {
                                if open.unsynced >= config.max_batch_size {
                                    sync_file(open);
                                }
                            }
                        }
                        None => {
                            for open in files.values_mut() {
                                sync_file(open);
                            }
                            debug!("journal writer drained, exiting");
                            return;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    for open in files.values_mut() {
                        if open.unsynced > 0 {
                            sync_file(open);
                        }
                    }
                }
            }
        }
    })
}

fn write_record(
    config: &JournalConfig,
    files: &mut HashMap<PathBuf, OpenFile>,
    record: &PendingRecord,
) -> std::io::Result<()> {
    let path = record_path(config, record);
    if !files.contains_key(&path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        files.insert(
            path.clone(),
            OpenFile {
                file,
                next_seq: 1,
                unsynced: 0,
            },
        );
    }
    let open = files.get_mut(&path).expect("file just inserted");

    let line = JournalRecord {
        seq: open.next_seq,
        stream_id: record.stream_id.clone(),
        run_id: config.run_id.clone(),
        topic: record.topic,
        symbol: record.symbol.clone(),
        ts_ingest: record.ts_ingest,
        payload: record.payload.clone(),
    };
    let mut encoded = serde_json::to_vec(&line)?;
    encoded.push(b'\n');
    open.file.write_all(&encoded)?;
    open.next_seq += 1;
    open.unsynced += 1;
    Ok(())
}

fn sync_file(open: &mut OpenFile) {
    if let Err(err) = open.file.sync_data() {
        error!(%err, "journal fsync failed");
    }
    open.unsynced = 0;
}

/// Expose the path layout for the replay runner's discovery.
pub fn topic_dir_path(
    base_dir: &Path,
    stream_id: &StreamId,
    symbol: &Symbol,
    topic: Topic,
    tf: Option<&str>,
) -> PathBuf {
    let mut path = base_dir.to_path_buf();
    path.push(stream_id.as_str());
    path.push(symbol.as_str());
    path.push(topic.dir_name());
    if let Some(tf) = tf {
        path.push(tf);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_path_layout() {
        let config = JournalConfig {
            base_dir: PathBuf::from("/tmp/journal"),
            run_id: SmolStr::from("run-7"),
            ..Default::default()
        };
        let record = PendingRecord {
            stream_id: StreamId::from("binance.futures.usd"),
            topic: Topic::MarketTrade,
            symbol: Symbol::from("BTCUSDT"),
            tf: None,
            ts_ingest: 1_700_000_000_000, // 2023-11-14 UTC
            payload: serde_json::json!({}),
        };

        assert_eq!(
            record_path(&config, &record),
            PathBuf::from(
                "/tmp/journal/binance.futures.usd/BTCUSDT/market_trade/run-7/2023-11-14.jsonl"
            )
        );

        let kline = PendingRecord {
            topic: Topic::MarketKline,
            tf: Some(SmolStr::from("1m")),
            ..record
        };
        assert_eq!(
            record_path(&config, &kline),
            PathBuf::from(
                "/tmp/journal/binance.futures.usd/BTCUSDT/market_kline/1m/run-7/2023-11-14.jsonl"
            )
        );
    }

    #[test]
    fn test_journal_record_roundtrip() {
        let record = JournalRecord {
            seq: 3,
            stream_id: StreamId::from("okx.public.swap"),
            run_id: SmolStr::from("run-1"),
            topic: Topic::MarketTrade,
            symbol: Symbol::from("BTCUSDT"),
            ts_ingest: 1_700_000_000_123,
            payload: serde_json::json!({"price": 100.0}),
        };

        let line = serde_json::to_string(&record).unwrap();
        assert!(line.starts_with(r#"{"seq":3,"streamId":"okx.public.swap""#));
        assert!(line.contains(r#""topic":"market:trade""#));

        let back: JournalRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, record);
    }
}
