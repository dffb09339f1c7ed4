//! Deterministic journal replay.
//!
//! Reads journal files for one (stream, symbol, topic[, tf]) scope, filters
//! by date, and republishes each record on its canonical topic with
//! `meta.source = "replay"` while preserving `ts_event`, `ts_exchange`,
//! `sequence`, `stream_id` and `correlation_id`. For a given journal and
//! ordering setting the emitted sequence is bit-identical.

use crate::{
    bus::EventBus,
    error::DataError,
    event::{BusEvent, BusPayload, ReplayEvent, StreamId, Topic},
    journal::{JournalRecord, topic_dir_path},
    symbol::Symbol,
    time::Ts,
};
use chrono::NaiveDate;
use itertools::Itertools;
use smol_str::SmolStr;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplayOrdering {
    /// Preserve the journaled (`ts_ingest`) order.
    Ingest,
    /// Sort within each file by `(exchangeTs, sequenceId, streamId)`.
    Exchange,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReplayMode {
    /// No pacing.
    Max,
    /// Sleep `Δ ts_ingest / speed_factor` between records.
    Accelerated { speed_factor: f64 },
    /// Sleep `Δ ts_ingest` between records.
    Realtime,
}

#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub base_dir: PathBuf,
    pub stream_id: StreamId,
    pub symbol: Symbol,
    pub topic: Topic,
    pub tf: Option<SmolStr>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub ordering: ReplayOrdering,
    pub mode: ReplayMode,
    /// Stop on a file error instead of skipping to the next file.
    pub stop_on_file_error: bool,
    /// Emit `replay:progress` every this many records.
    pub progress_every: u64,
}

impl ReplayConfig {
    pub fn new(base_dir: impl Into<PathBuf>, stream_id: StreamId, symbol: Symbol, topic: Topic) -> Self {
        Self {
            base_dir: base_dir.into(),
            stream_id,
            symbol,
            topic,
            tf: None,
            date_from: None,
            date_to: None,
            ordering: ReplayOrdering::Ingest,
            mode: ReplayMode::Max,
            stop_on_file_error: false,
            progress_every: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub emitted: u64,
    pub warnings: u64,
    pub errors: u64,
    pub files: usize,
}

pub struct ReplayRunner {
    bus: Arc<EventBus>,
    config: ReplayConfig,
}

impl ReplayRunner {
    pub fn new(bus: Arc<EventBus>, config: ReplayConfig) -> Self {
        Self { bus, config }
    }

    /// Discover journal files in scope, sorted by run id then date.
    fn discover(&self) -> Result<Vec<PathBuf>, DataError> {
        let topic_dir = topic_dir_path(
            &self.config.base_dir,
            &self.config.stream_id,
            &self.config.symbol,
            self.config.topic,
            self.config.tf.as_deref(),
        );
        if !topic_dir.is_dir() {
            return Ok(vec![]);
        }

        let run_dirs: Vec<PathBuf> = std::fs::read_dir(&topic_dir)
            .map_err(|err| DataError::Replay(format!("read_dir {topic_dir:?}: {err}")))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_dir())
            .sorted()
            .collect();

        let mut files = Vec::new();
        for run_dir in run_dirs {
            let day_files = std::fs::read_dir(&run_dir)
                .map_err(|err| DataError::Replay(format!("read_dir {run_dir:?}: {err}")))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| {
                    path.extension().is_some_and(|ext| ext == "jsonl")
                        && self.date_in_range(path)
                })
                .sorted();
            files.extend(day_files);
        }
        Ok(files)
    }

    fn date_in_range(&self, path: &PathBuf) -> bool {
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            return false;
        };
        let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
            return false;
        };
        if let Some(from) = self.config.date_from {
            if date < from {
                return false;
            }
        }
        if let Some(to) = self.config.date_to {
            if date > to {
                return false;
            }
        }
        true
    }

    /// Drive the replay to completion.
    pub async fn run(&self) -> Result<ReplayStats, DataError> {
        let files = self.discover()?;
        let run_id = SmolStr::from(format!(
            "replay-{}-{}-{}",
            self.config.stream_id,
            self.config.symbol,
            self.config.topic.dir_name()
        ));
        info!(files = files.len(), scope = %run_id, "replay started");
        self.bus.publish(BusEvent::new(
            Topic::ReplayStarted,
            BusPayload::Replay(ReplayEvent::Started {
                run_id,
                files: files.len(),
            }),
        ));

        let mut stats = ReplayStats {
            files: files.len(),
            ..Default::default()
        };
        let mut prev_ts_ingest: Option<Ts> = None;

        for (file_index, path) in files.iter().enumerate() {
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(err) => {
                    stats.errors += 1;
                    self.bus.publish(BusEvent::new(
                        Topic::ReplayError,
                        BusPayload::Replay(ReplayEvent::Error {
                            file: path.display().to_string(),
                            detail: err.to_string(),
                        }),
                    ));
                    if self.config.stop_on_file_error {
                        break;
                    }
                    continue;
                }
            };

            let mut records: Vec<(u64, JournalRecord)> = Vec::new();
            for (line_number, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalRecord>(line) {
                    Ok(record) => records.push((line_number as u64 + 1, record)),
                    Err(err) => {
                        stats.warnings += 1;
                        self.bus.publish(BusEvent::new(
                            Topic::ReplayWarning,
                            BusPayload::Replay(ReplayEvent::Warning {
                                file: path.display().to_string(),
                                line: line_number as u64 + 1,
                                detail: err.to_string(),
                            }),
                        ));
                    }
                }
            }

            if self.config.ordering == ReplayOrdering::Exchange {
                records.sort_by(|(_, a), (_, b)| {
                    let key = |record: &JournalRecord| {
                        let exchange_ts = record
                            .payload
                            .pointer("/meta/tsExchange")
                            .and_then(serde_json::Value::as_i64)
                            .unwrap_or(record.ts_ingest);
                        let sequence = record
                            .payload
                            .pointer("/meta/sequence")
                            .and_then(serde_json::Value::as_u64)
                            .unwrap_or(0);
                        (exchange_ts, sequence, record.stream_id.clone())
                    };
                    key(a).cmp(&key(b))
                });
            }

            for (line_number, record) in records {
                let payload = match BusPayload::from_topic_json(record.topic, record.payload.clone())
                {
                    Ok(mut payload) => {
                        payload.set_source("replay");
                        payload
                    }
                    Err(err) => {
                        stats.warnings += 1;
                        self.bus.publish(BusEvent::new(
                            Topic::ReplayWarning,
                            BusPayload::Replay(ReplayEvent::Warning {
                                file: path.display().to_string(),
                                line: line_number,
                                detail: err.to_string(),
                            }),
                        ));
                        continue;
                    }
                };

                // Pacing between consecutive records
                if let Some(prev) = prev_ts_ingest {
                    let delta = (record.ts_ingest - prev).max(0) as u64;
                    match self.config.mode {
                        ReplayMode::Max => {}
                        ReplayMode::Accelerated { speed_factor } if speed_factor > 0.0 => {
                            let paced = (delta as f64 / speed_factor) as u64;
                            if paced > 0 {
                                tokio::time::sleep(Duration::from_millis(paced)).await;
                            }
                        }
                        ReplayMode::Accelerated { .. } => {}
                        ReplayMode::Realtime => {
                            if delta > 0 {
                                tokio::time::sleep(Duration::from_millis(delta)).await;
                            }
                        }
                    }
                }
                prev_ts_ingest = Some(record.ts_ingest);

                self.bus
                    .publish(BusEvent::new(record.topic.canonical(), payload));
                stats.emitted += 1;

                if self.config.progress_every > 0 && stats.emitted % self.config.progress_every == 0
                {
                    self.bus.publish(BusEvent::new(
                        Topic::ReplayProgress,
                        BusPayload::Replay(ReplayEvent::Progress {
                            emitted: stats.emitted,
                            files_done: file_index,
                            files_total: stats.files,
                        }),
                    ));
                }
            }
            debug!(file = %path.display(), "replay file complete");
        }

        self.bus.publish(BusEvent::new(
            Topic::ReplayFinished,
            BusPayload::Replay(ReplayEvent::Finished {
                emitted: stats.emitted,
                warnings: stats.warnings,
                errors: stats.errors,
                files: stats.files,
            }),
        ));
        info!(
            emitted = stats.emitted,
            warnings = stats.warnings,
            errors = stats.errors,
            "replay finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMeta, MarketType, Trade};
    use parking_lot::Mutex as PMutex;

    fn write_journal_file(
        base: &std::path::Path,
        run_id: &str,
        date: &str,
        records: &[JournalRecord],
    ) {
        let dir = base
            .join("binance.futures.usd")
            .join("BTCUSDT")
            .join("market_trade")
            .join(run_id);
        std::fs::create_dir_all(&dir).unwrap();
        let lines: Vec<String> = records
            .iter()
            .map(|record| serde_json::to_string(record).unwrap())
            .collect();
        std::fs::write(dir.join(format!("{date}.jsonl")), lines.join("\n") + "\n").unwrap();
    }

    fn trade_record(seq: u64, ts_event: i64, ts_ingest: i64, price: f64) -> JournalRecord {
        let mut meta = EventMeta::new(
            ts_event,
            ts_ingest,
            "binance",
            StreamId::from("binance.futures.usd"),
        );
        meta.ts_exchange = Some(ts_event);
        meta.sequence = Some(seq);
        let trade = Trade {
            symbol: Symbol::from("BTCUSDT"),
            market_type: MarketType::Futures,
            side: None,
            price,
            size: 1.0,
            meta,
        };
        JournalRecord {
            seq,
            stream_id: StreamId::from("binance.futures.usd"),
            run_id: SmolStr::from("run-1"),
            topic: Topic::MarketTrade,
            symbol: Symbol::from("BTCUSDT"),
            ts_ingest,
            payload: serde_json::to_value(&trade).unwrap(),
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("quorum-replay-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_replay_emits_canonical_topic_with_replay_source() {
        let base = temp_dir("emit");
        write_journal_file(
            &base,
            "run-1",
            "2023-11-14",
            &[
                trade_record(1, 1_000, 1_001, 100.0),
                trade_record(2, 2_000, 2_001, 101.0),
            ],
        );

        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(PMutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        bus.subscribe(Topic::MarketTrade, "test:collector", move |event| {
            if let BusPayload::Trade(trade) = &event.payload {
                captured.lock().push(trade.clone());
            }
            Ok(())
        });

        let runner = ReplayRunner::new(
            Arc::clone(&bus),
            ReplayConfig::new(
                &base,
                StreamId::from("binance.futures.usd"),
                Symbol::from("BTCUSDT"),
                Topic::MarketTrade,
            ),
        );
        let stats = runner.run().await.unwrap();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.warnings, 0);
        assert_eq!(stats.files, 1);

        let trades = sink.lock();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].meta.source, "replay");
        // Everything else preserved
        assert_eq!(trades[0].meta.ts_event, 1_000);
        assert_eq!(trades[0].meta.ts_exchange, Some(1_000));
        assert_eq!(trades[0].meta.sequence, Some(1));
        assert_eq!(trades[0].meta.stream_id, "binance.futures.usd");
        assert_eq!(trades[1].price, 101.0);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_replay_invalid_lines_warn_and_continue() {
        let base = temp_dir("warn");
        let dir = base
            .join("binance.futures.usd")
            .join("BTCUSDT")
            .join("market_trade")
            .join("run-1");
        std::fs::create_dir_all(&dir).unwrap();
        let good = serde_json::to_string(&trade_record(1, 1_000, 1_001, 100.0)).unwrap();
        std::fs::write(
            dir.join("2023-11-14.jsonl"),
            format!("not json\n{good}\n"),
        )
        .unwrap();

        let bus = Arc::new(EventBus::new());
        let warnings = Arc::new(PMutex::new(0u64));
        let captured = Arc::clone(&warnings);
        bus.subscribe(Topic::ReplayWarning, "test:warnings", move |_| {
            *captured.lock() += 1;
            Ok(())
        });

        let runner = ReplayRunner::new(
            Arc::clone(&bus),
            ReplayConfig::new(
                &base,
                StreamId::from("binance.futures.usd"),
                Symbol::from("BTCUSDT"),
                Topic::MarketTrade,
            ),
        );
        let stats = runner.run().await.unwrap();
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.warnings, 1);
        assert_eq!(*warnings.lock(), 1);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_replay_exchange_ordering_sorts_within_file() {
        let base = temp_dir("order");
        // Journaled out of exchange order
        write_journal_file(
            &base,
            "run-1",
            "2023-11-14",
            &[
                trade_record(2, 2_000, 1_001, 101.0),
                trade_record(1, 1_000, 1_002, 100.0),
            ],
        );

        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(PMutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        bus.subscribe(Topic::MarketTrade, "test:collector", move |event| {
            if let BusPayload::Trade(trade) = &event.payload {
                captured.lock().push(trade.meta.ts_event);
            }
            Ok(())
        });

        let mut config = ReplayConfig::new(
            &base,
            StreamId::from("binance.futures.usd"),
            Symbol::from("BTCUSDT"),
            Topic::MarketTrade,
        );
        config.ordering = ReplayOrdering::Exchange;
        let runner = ReplayRunner::new(Arc::clone(&bus), config);
        runner.run().await.unwrap();

        assert_eq!(sink.lock().clone(), vec![1_000, 2_000]);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_replay_date_filter() {
        let base = temp_dir("dates");
        write_journal_file(&base, "run-1", "2023-11-13", &[trade_record(1, 1_000, 1_001, 99.0)]);
        write_journal_file(&base, "run-1", "2023-11-14", &[trade_record(1, 2_000, 2_001, 100.0)]);

        let bus = Arc::new(EventBus::new());
        let mut config = ReplayConfig::new(
            &base,
            StreamId::from("binance.futures.usd"),
            Symbol::from("BTCUSDT"),
            Topic::MarketTrade,
        );
        config.date_from = NaiveDate::from_ymd_opt(2023, 11, 14);
        let runner = ReplayRunner::new(Arc::clone(&bus), config);
        let stats = runner.run().await.unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.emitted, 1);

        let _ = std::fs::remove_dir_all(&base);
    }
}
