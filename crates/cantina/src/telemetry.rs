//! Tracing setup: console output plus the capture layer feeding the
//! logging sink.

use cantinaconf::LoggingConfig;
use cantinaproto::LogLevel;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::logsink::LogRecord;

const CAPTURE_CHANNEL_DEPTH: usize = 1024;

/// Install the global subscriber and return the capture channel for the
/// log sink service. Safe to call more than once (tests); later calls keep
/// the existing subscriber and still return a working (if unread) channel.
pub fn init(config: &LoggingConfig) -> mpsc::Receiver<LogRecord> {
    let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_DEPTH);

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let capture = CaptureLayer {
        tx,
        filter_prefixes: config.filter_prefixes.clone(),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(capture)
        .try_init();

    rx
}

/// Forwards formatted events into the sink's channel. Applies the filter
/// prefixes early; the sink filters again as the hard guarantee.
struct CaptureLayer {
    tx: mpsc::Sender<LogRecord>,
    filter_prefixes: Vec<String>,
}

impl<S: tracing::Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if self
            .filter_prefixes
            .iter()
            .any(|prefix| target.starts_with(prefix))
        {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: Utc::now(),
            level: map_level(*event.metadata().level()),
            logger: target.to_string(),
            message: visitor.message,
        };
        // Overflow drops: the sink must never backpressure the app.
        let _ = self.tx.try_send(record);
    }
}

fn map_level(level: tracing::Level) -> LogLevel {
    match level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write;
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_one_to_one() {
        assert_eq!(map_level(tracing::Level::TRACE), LogLevel::Trace);
        assert_eq!(map_level(tracing::Level::ERROR), LogLevel::Error);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let config = cantinaconf::LoggingConfig::default();
        let _rx1 = init(&config);
        let _rx2 = init(&config);
    }
}
