//! Bus topic constants.
//!
//! Topics are literal hierarchical strings; the bus does no wildcard
//! matching. Services subscribe to the exact constants below. Per-service
//! status topics are derived with [`service_status`].

// === System ===
pub const SET_MODE_REQUEST: &str = "/system/set_mode_request";
pub const MODE_TRANSITION: &str = "/system/mode_transition";
pub const MODE_CHANGE: &str = "/system/mode_change";
pub const SHUTDOWN_REQUESTED: &str = "/system/shutdown_requested";
pub const SYSTEM_ERROR: &str = "/system/error";
pub const STATUS_REQUEST: &str = "/system/status_request";

// === Microphone / voice pipeline ===
pub const MIC_START_REQUEST: &str = "/mic/start_request";
pub const MIC_STOP_REQUEST: &str = "/mic/stop_request";
pub const LISTENING_STARTED: &str = "/voice/listening_started";
pub const LISTENING_STOPPED: &str = "/voice/listening_stopped";
pub const TRANSCRIPTION: &str = "/voice/transcription";
/// Mic input level stream for dashboard meters. Published by the vendor
/// capture client while listening; the core only fans it out.
pub const VOICE_AUDIO_LEVEL: &str = "/voice/audio_level";
pub const RESPONSE_TEXT: &str = "/voice/response_text";
pub const SPEECH_STARTED: &str = "/voice/speech_started";
/// Internal: hands rendered speech audio to the music engine's privileged
/// playback path. Never bridged to clients.
pub const SPEECH_PLAY: &str = "/voice/speech_play";
pub const SPEECH_SYNTHESIS_ENDED: &str = "/voice/speech_synthesis_ended";
pub const SPEECH_SYNTHESIS_COMPLETED: &str = "/voice/speech_synthesis_completed";
pub const SPEECH_ENDED: &str = "/voice/speech_ended";
pub const VOICE_ERROR: &str = "/voice/error";

// === Music engine ===
pub const MUSIC_COMMAND: &str = "/music/command";
pub const LIBRARY_UPDATED: &str = "/music/library_updated";
pub const PLAYBACK_STARTED: &str = "/music/playback_started";
pub const PLAYBACK_PAUSED: &str = "/music/playback_paused";
pub const PLAYBACK_RESUMED: &str = "/music/playback_resumed";
pub const PLAYBACK_STOPPED: &str = "/music/playback_stopped";
pub const MUSIC_PROGRESS: &str = "/music/progress";
pub const QUEUE_UPDATED: &str = "/music/queue_updated";
pub const CROSSFADE_STARTED: &str = "/music/crossfade_started";
pub const MUSIC_DUCK: &str = "/music/duck";
pub const MUSIC_UNDUCK: &str = "/music/unduck";

// === DJ auto-sequencer ===
pub const DJ_COMMAND: &str = "/dj/command";
pub const DJ_QUEUE_UPDATE: &str = "/dj/queue_update";
pub const COMMENTARY_REQUEST: &str = "/dj/commentary_request";
pub const COMMENTARY_READY: &str = "/dj/commentary_ready";
pub const COMMENTARY_FAILED: &str = "/dj/commentary_failed";
pub const DJ_TRANSITION: &str = "/dj/transition";

// === Eye lights ===
pub const LEDS_COMMAND: &str = "/leds/command";

// === Logging sink ===
pub const LOG_ENTRY: &str = "/log/entry";

/// Status topic for a named service: `/status/{service}`.
pub fn service_status(service: &str) -> String {
    format!("/status/{service}")
}

/// True for topics whose subscribers prefer freshness over completeness.
/// These get drop-oldest mailbox overflow instead of block-then-drop.
pub fn is_lossy(topic: &str) -> bool {
    topic.starts_with("/status/")
        || topic.ends_with("/progress")
        || topic.ends_with("/audio_level")
}
