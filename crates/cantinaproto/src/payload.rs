//! Typed payloads for every bus topic family.
//!
//! One tagged enum covers the whole system so handlers match exhaustively;
//! an unknown discriminator is a validation error at the boundary, never a
//! silent pass-through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global operational mode. Owned solely by the mode manager; everyone else
/// learns about it from `/system/mode_change`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Idle,
    Ambient,
    Interactive,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Idle => write!(f, "IDLE"),
            Mode::Ambient => write!(f, "AMBIENT"),
            Mode::Interactive => write!(f, "INTERACTIVE"),
        }
    }
}

/// Service lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Init,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Init => "init",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Degraded => "degraded",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Phase marker on `/system/mode_transition`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStatus {
    Started,
    Completed,
    Failed,
}

/// Which stage of the voice pipeline an error came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoiceStage {
    Stt,
    Llm,
    Tts,
}

/// One track in the music library.
///
/// `duration_seconds` is authoritative once the decoder sets it; `None`
/// means the probe failed and the track is excluded from DJ selection but
/// stays playable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    pub track_id: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration_seconds: Option<f64>,
    pub filepath: PathBuf,
}

/// How a command names a track: 1-based index into the library listing,
/// case-insensitive substring of the title, or exact track id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum TrackRef {
    Index { index: usize },
    Name { name: String },
    Id { id: String },
}

/// Canonical music engine command, the single event emitted for each
/// recognized music verb.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MusicCommand {
    Play { track_ref: TrackRef },
    Pause,
    Resume,
    Stop,
    Next,
    Queue { track_ref: TrackRef },
    /// Sets the un-ducked baseline volume in [0, 1].
    Volume { level: f64 },
    /// Rebuild the library index from disk.
    Rescan,
    /// Start ambient playback if nothing is playing. Emitted by the mode
    /// manager on entering AMBIENT; not reachable from the web surface.
    Ambient,
    /// DJ-initiated crossfade into the referenced track. Internal.
    Crossfade { track_ref: TrackRef, duration_ms: u64 },
}

/// DJ session settings carried on start/update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DjSettings {
    pub auto_transition: bool,
    /// Crossfade overlap between outgoing and incoming track.
    pub crossfade_sec: f64,
    /// How long before the transition commentary generation is requested.
    pub commentary_lead_sec: f64,
    /// Optional cap on per-track play time; when set, the transition fires
    /// at the earlier of track end and `start + interval`.
    pub interval_sec: Option<f64>,
}

impl Default for DjSettings {
    fn default() -> Self {
        Self {
            auto_transition: true,
            crossfade_sec: 5.0,
            commentary_lead_sec: 10.0,
            interval_sec: None,
        }
    }
}

/// Canonical DJ sequencer command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DjCommand {
    Start {
        #[serde(default)]
        settings: DjSettings,
    },
    Stop,
    /// Force an immediate crossfade, cancelling any pending commentary.
    Next,
    UpdateSettings {
        auto_transition: Option<bool>,
        crossfade_sec: Option<f64>,
        commentary_lead_sec: Option<f64>,
    },
}

/// Eye-light pattern mnemonics, one serial byte each.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedPattern {
    Idle,
    Speaking,
    Thinking,
    Listening,
    Engaged,
    Happy,
    Sad,
    Angry,
}

impl LedPattern {
    /// The wire byte for this pattern.
    pub fn wire_byte(self) -> u8 {
        match self {
            LedPattern::Idle => b'I',
            LedPattern::Speaking => b'S',
            LedPattern::Thinking => b'T',
            LedPattern::Listening => b'L',
            LedPattern::Engaged => b'E',
            LedPattern::Happy => b'H',
            LedPattern::Sad => b'D',
            LedPattern::Angry => b'A',
        }
    }
}

/// Eye-light controller command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LedCommand {
    Pattern { pattern: LedPattern },
    /// Intensity 0..=9, mapped to 0..=15 on the wire.
    Brightness { level: u8 },
    Reset,
}

/// Log levels carried on `/log/entry`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// All payload types in the CantinaOS system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    // === System / mode ===
    SetModeRequest {
        target: Mode,
    },
    ModeTransition {
        old: Mode,
        new: Mode,
        status: TransitionStatus,
        error: Option<String>,
    },
    ModeChange {
        old: Mode,
        new: Mode,
    },
    ShutdownRequested,
    SystemError {
        source: String,
        message: String,
        severity: LogLevel,
    },
    StatusRequest,
    ServiceStatus {
        service: String,
        state: ServiceState,
        uptime_ms: u64,
        detail: Option<String>,
        /// Events dropped across this service's subscriptions since start.
        dropped_events: u64,
    },

    // === Microphone / voice ===
    MicStartRequest,
    MicStopRequest,
    ListeningStarted,
    ListeningStopped,
    Transcription {
        text: String,
        is_final: bool,
        confidence: f64,
    },
    /// Mic input level in [0, 1], published by the vendor capture client
    /// while a listening span is open. Dashboard meters only.
    AudioLevel {
        level: f64,
    },
    ResponseText {
        text: String,
    },
    SpeechStarted {
        duration_ms: Option<u64>,
    },
    /// Internal handoff of rendered speech audio to the music engine.
    SpeechPlay {
        audio_ref: PathBuf,
    },
    SpeechSynthesisEnded,
    SpeechSynthesisCompleted,
    SpeechEnded,
    VoiceError {
        stage: VoiceStage,
        message: String,
    },

    // === Music engine ===
    MusicCommand(MusicCommand),
    LibraryUpdated {
        tracks: Vec<Track>,
    },
    PlaybackStarted {
        track: Track,
        /// Seconds since epoch, ms precision. Position = now - anchor.
        start_wall_clock: f64,
        duration_sec: Option<f64>,
    },
    PlaybackPaused {
        paused_at_position_sec: f64,
    },
    PlaybackResumed {
        resume_position_sec: f64,
        start_wall_clock: f64,
    },
    PlaybackStopped,
    Progress {
        position_sec: f64,
        duration_sec: Option<f64>,
        progress_pct: Option<f64>,
    },
    QueueUpdated {
        length: usize,
        next_track: Option<Track>,
    },
    CrossfadeStarted {
        from: Track,
        to: Track,
        duration_ms: u64,
    },
    Duck,
    Unduck,

    // === DJ sequencer ===
    DjCommand(DjCommand),
    DjQueueUpdate {
        next_track: Track,
    },
    CommentaryRequest {
        prev_track: Track,
        next_track: Track,
    },
    CommentaryReady {
        audio_ref: PathBuf,
        duration_ms: u64,
    },
    CommentaryFailed {
        reason: String,
    },
    DjTransition {
        prev: Track,
        next: Track,
        with_commentary: bool,
    },

    // === Eye lights ===
    LedCommand(LedCommand),

    // === Logging ===
    LogEntry {
        timestamp: DateTime<Utc>,
        level: LogLevel,
        logger: String,
        message: String,
        /// >1 when the sink collapsed identical records within its window.
        repeat_count: u32,
    },
}
