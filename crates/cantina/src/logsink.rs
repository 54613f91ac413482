//! Logging/telemetry sink: ring buffer, session file, dedup, and the hard
//! filter that breaks the bridge's log → broadcast → log loop.
//!
//! Capture path: tracing layer → bounded channel → this service → ring
//! buffer + single session-file writer + `/log/entry` fan-out. The ring is
//! the bridge's read-only query path; the file is written only here.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cantinabus::{Service, ServiceContext, ServiceError};
use cantinaproto::{topics, LogLevel, Payload};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

/// One captured log record, before dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub logger: String,
    pub message: String,
}

/// Read-only view of the in-memory ring, shared with the web bridge.
#[derive(Clone, Default)]
pub struct LogRing {
    entries: Arc<RwLock<VecDeque<Payload>>>,
}

impl LogRing {
    pub fn tail(&self, limit: usize) -> Vec<Payload> {
        let entries = self.entries.read().unwrap();
        entries.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    fn push(&self, entry: Payload, capacity: usize) {
        let mut entries = self.entries.write().unwrap();
        if entries.len() >= capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

impl marquee::LogQuery for LogRing {
    fn tail(&self, limit: usize) -> Vec<Payload> {
        LogRing::tail(self, limit)
    }
}

#[derive(Debug, Clone)]
pub struct LogSinkConfig {
    pub ring_capacity: usize,
    pub dedup_window: Duration,
    pub filter_prefixes: Vec<String>,
    pub session_dir: PathBuf,
}

pub struct LogSink {
    receiver: Mutex<Option<mpsc::Receiver<LogRecord>>>,
    ring: LogRing,
    config: LogSinkConfig,
}

impl LogSink {
    pub fn new(receiver: mpsc::Receiver<LogRecord>, config: LogSinkConfig) -> Self {
        Self {
            receiver: Mutex::new(Some(receiver)),
            ring: LogRing::default(),
            config,
        }
    }

    pub fn ring(&self) -> LogRing {
        self.ring.clone()
    }
}

#[async_trait]
impl Service for LogSink {
    fn name(&self) -> &'static str {
        "log_sink"
    }

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        let Some(mut receiver) = self.receiver.lock().unwrap().take() else {
            return Err(ServiceError::startup("log sink already started once"));
        };

        std::fs::create_dir_all(&self.config.session_dir)?;
        let session_path = self.config.session_dir.join(format!(
            "cantina_{}.log",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        let mut file = tokio::fs::File::create(&session_path)
            .await
            .map_err(ServiceError::Io)?;

        let ring = self.ring.clone();
        let config = self.config.clone();
        let mut status_rx = ctx.subscribe(topics::STATUS_REQUEST);
        let ctx = Arc::clone(ctx);
        let cancel = ctx.cancel_token();

        ctx.clone().spawn(async move {
            let mut pending: Option<PendingEntry> = None;
            let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
            flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Some(entry) = pending.take() {
                            write_out(&ctx, &ring, &config, &mut file, entry).await;
                        }
                        let _ = file.flush().await;
                        break;
                    }
                    _ = flush_tick.tick() => {
                        let expired = pending
                            .as_ref()
                            .map(|p| p.first_seen.elapsed() >= config.dedup_window)
                            .unwrap_or(false);
                        if expired {
                            if let Some(entry) = pending.take() {
                                write_out(&ctx, &ring, &config, &mut file, entry).await;
                            }
                        }
                    }
                    Some(record) = receiver.recv() => {
                        if is_filtered(&config.filter_prefixes, &record.logger) {
                            continue;
                        }
                        pending = match pending.take() {
                            Some(mut entry)
                                if entry.matches(&record)
                                    && entry.first_seen.elapsed() < config.dedup_window =>
                            {
                                entry.count += 1;
                                Some(entry)
                            }
                            Some(entry) => {
                                write_out(&ctx, &ring, &config, &mut file, entry).await;
                                Some(PendingEntry::new(record))
                            }
                            None => Some(PendingEntry::new(record)),
                        };
                    }
                    Some(_) = status_rx.recv() => {
                        ctx.emit_status(Some(format!("ring={}", ring.len()))).await;
                    }
                    else => break,
                }
            }
        });
        Ok(())
    }
}

fn is_filtered(prefixes: &[String], logger: &str) -> bool {
    prefixes.iter().any(|prefix| logger.starts_with(prefix))
}

struct PendingEntry {
    record: LogRecord,
    count: u32,
    first_seen: Instant,
}

impl PendingEntry {
    fn new(record: LogRecord) -> Self {
        Self {
            record,
            count: 1,
            first_seen: Instant::now(),
        }
    }

    fn matches(&self, other: &LogRecord) -> bool {
        self.record.logger == other.logger
            && self.record.level == other.level
            && self.record.message == other.message
    }
}

async fn write_out(
    ctx: &Arc<ServiceContext>,
    ring: &LogRing,
    config: &LogSinkConfig,
    file: &mut tokio::fs::File,
    entry: PendingEntry,
) {
    let PendingEntry { record, count, .. } = entry;

    let suffix = if count > 1 {
        format!(" (x{count})")
    } else {
        String::new()
    };
    let line = format!(
        "{} {} [{}] {}{}\n",
        record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3f"),
        record.level,
        record.logger,
        record.message,
        suffix
    );
    if let Err(e) = file.write_all(line.as_bytes()).await {
        warn!(error = %e, "session log write failed");
    }

    let payload = Payload::LogEntry {
        timestamp: record.timestamp,
        level: record.level,
        logger: record.logger,
        message: record.message,
        repeat_count: count,
    };
    ring.push(payload.clone(), config.ring_capacity);
    ctx.emit(topics::LOG_ENTRY, payload).await;
}
