//! cantinaproto - Event payloads and wire schemas for the CantinaOS bus
//!
//! This crate defines the typed payloads exchanged between CantinaOS services
//! over the in-process event bus, plus the JSON wire protocol spoken to
//! dashboard clients by the web bridge. Every bus event is wrapped in an
//! [`Event`] envelope carrying its topic, origin, and wall-clock timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod commands;
pub mod error;
pub mod payload;
pub mod topics;

pub use commands::{
    validate, Ack, ClientMessage, CommandVerb, DjCommandPayload, ErrorCode, EventFrame,
    MusicCommandPayload, SystemCommandPayload, ValidatedCommand, VoiceCommandPayload,
};
pub use error::CommandError;
pub use payload::{
    DjCommand, DjSettings, LedCommand, LedPattern, LogLevel, Mode, MusicCommand, Payload,
    ServiceState, Track, TrackRef, TransitionStatus, VoiceStage,
};

/// Well-known event origins, used for self-loop prevention at the web bridge.
pub mod sources {
    pub const CLI: &str = "cli";
    pub const WEB_DASHBOARD: &str = "web_dashboard";
    pub const INTERNAL: &str = "internal";
}

/// Envelope wrapping every payload published on the bus.
///
/// Events are immutable after publish; subscribers receive clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event ID for correlation
    pub id: Uuid,
    /// Hierarchical topic string, e.g. `/music/playback_started`
    pub topic: String,
    /// Origin: a service name, or one of [`sources`]
    pub source: String,
    /// Wall-clock publish time (log/display only; never used for scheduling)
    pub timestamp: DateTime<Utc>,
    /// The typed payload
    pub payload: Payload,
}

impl Event {
    pub fn new(topic: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Current wall-clock time as seconds since the Unix epoch, millisecond
/// precision. This is the `start_wall_clock` anchor format shared with
/// dashboard clients.
pub fn wall_clock_secs() -> f64 {
    let now = Utc::now();
    (now.timestamp_millis() as f64) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn event_roundtrip() {
        let event = Event::new(
            topics::MODE_CHANGE,
            "mode_manager",
            Payload::ModeChange {
                old: Mode::Idle,
                new: Mode::Interactive,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.payload, parsed.payload);
        assert_eq!(event.topic, parsed.topic);
    }

    #[test]
    fn wall_clock_is_epoch_seconds() {
        let t = wall_clock_secs();
        // Sanity: after 2020, before 2100.
        assert!(t > 1_577_836_800.0);
        assert!(t < 4_102_444_800.0);
    }
}
