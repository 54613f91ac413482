//! Configuration sections with serde defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for CantinaOS state and media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the music library scan.
    /// Default: ~/Music/cantina
    #[serde(default = "PathsConfig::default_music_dir")]
    pub music_dir: PathBuf,

    /// Base directory for runtime state (session logs, speech wavs,
    /// library cache). Default: ~/.local/share/cantina
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl PathsConfig {
    fn default_music_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join("Music/cantina"))
            .unwrap_or_else(|| PathBuf::from("Music/cantina"))
    }

    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/cantina"))
            .unwrap_or_else(|| PathBuf::from(".local/share/cantina"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            music_dir: Self::default_music_dir(),
            state_dir: Self::default_state_dir(),
        }
    }
}

/// Network bind settings for the web bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// Address the dashboard HTTP/WebSocket server binds.
    /// Default: 127.0.0.1
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// Dashboard port. Default: 8642
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_http_port() -> u16 {
        8642
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
        }
    }
}

/// Audio output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Output backend: "rodio" for a real device, "null" for headless runs.
    #[serde(default = "AudioConfig::default_backend")]
    pub backend: String,

    /// Un-ducked baseline volume at startup, [0, 1].
    #[serde(default = "AudioConfig::default_baseline_volume")]
    pub baseline_volume: f64,

    /// Multiplicative factor applied to the baseline while speech plays.
    #[serde(default = "AudioConfig::default_duck_factor")]
    pub duck_factor: f64,
}

impl AudioConfig {
    fn default_backend() -> String {
        "rodio".to_string()
    }

    fn default_baseline_volume() -> f64 {
        0.8
    }

    fn default_duck_factor() -> f64 {
        0.2
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: Self::default_backend(),
            baseline_volume: Self::default_baseline_volume(),
            duck_factor: Self::default_duck_factor(),
        }
    }
}

/// Music library scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Persist a filepath → duration cache to skip re-probing on boot.
    #[serde(default = "LibraryConfig::default_use_cache")]
    pub use_cache: bool,

    /// Upper bound on a single track's duration probe.
    #[serde(default = "LibraryConfig::default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl LibraryConfig {
    fn default_use_cache() -> bool {
        true
    }

    fn default_probe_timeout_ms() -> u64 {
        5_000
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            use_cache: Self::default_use_cache(),
            probe_timeout_ms: Self::default_probe_timeout_ms(),
        }
    }
}

/// Eye-light serial link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Whether to open the serial device at all. Off lets the rest of the
    /// system run on hosts without the microcontroller attached.
    #[serde(default = "SerialConfig::default_enabled")]
    pub enabled: bool,

    /// Serial device path. Default: /dev/ttyACM0
    #[serde(default = "SerialConfig::default_device")]
    pub device: String,

    /// Baud rate, 8N1 framing. Default: 115200
    #[serde(default = "SerialConfig::default_baud")]
    pub baud: u32,

    /// How long to wait for a `+`/`-` reply before counting a timeout.
    #[serde(default = "SerialConfig::default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Commands arriving within this window coalesce to the most recent.
    #[serde(default = "SerialConfig::default_coalesce_ms")]
    pub coalesce_ms: u64,
}

impl SerialConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_device() -> String {
        "/dev/ttyACM0".to_string()
    }

    fn default_baud() -> u32 {
        115_200
    }

    fn default_response_timeout_ms() -> u64 {
        500
    }

    fn default_coalesce_ms() -> u64 {
        30
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            device: Self::default_device(),
            baud: Self::default_baud(),
            response_timeout_ms: Self::default_response_timeout_ms(),
            coalesce_ms: Self::default_coalesce_ms(),
        }
    }
}

/// Voice pipeline timeouts and fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Hard bound on one LLM turn.
    #[serde(default = "VoiceConfig::default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    /// Hard bound on one TTS render.
    #[serde(default = "VoiceConfig::default_tts_timeout_ms")]
    pub tts_timeout_ms: u64,

    /// STT stream idle-close.
    #[serde(default = "VoiceConfig::default_stt_idle_close_ms")]
    pub stt_idle_close_ms: u64,

    /// Spoken when the LLM turn times out but TTS still works.
    #[serde(default = "VoiceConfig::default_apology")]
    pub canned_apology: String,
}

impl VoiceConfig {
    fn default_llm_timeout_ms() -> u64 {
        20_000
    }

    fn default_tts_timeout_ms() -> u64 {
        15_000
    }

    fn default_stt_idle_close_ms() -> u64 {
        3_000
    }

    fn default_apology() -> String {
        "Whoa, my circuits got crossed there. Ask me again?".to_string()
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            llm_timeout_ms: Self::default_llm_timeout_ms(),
            tts_timeout_ms: Self::default_tts_timeout_ms(),
            stt_idle_close_ms: Self::default_stt_idle_close_ms(),
            canned_apology: Self::default_apology(),
        }
    }
}

/// DJ session defaults (overridable per-session via `dj start` args).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DjConfig {
    #[serde(default = "DjConfig::default_crossfade_sec")]
    pub crossfade_sec: f64,

    #[serde(default = "DjConfig::default_commentary_lead_sec")]
    pub commentary_lead_sec: f64,
}

impl DjConfig {
    fn default_crossfade_sec() -> f64 {
        5.0
    }

    fn default_commentary_lead_sec() -> f64 {
        10.0
    }
}

impl Default for DjConfig {
    fn default() -> Self {
        Self {
            crossfade_sec: Self::default_crossfade_sec(),
            commentary_lead_sec: Self::default_commentary_lead_sec(),
        }
    }
}

/// Logging sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (tracing env-filter syntax).
    #[serde(default = "LoggingConfig::default_log_level")]
    pub log_level: String,

    /// In-memory ring buffer capacity.
    #[serde(default = "LoggingConfig::default_ring_capacity")]
    pub ring_capacity: usize,

    /// Identical (logger, level, message) records within this window
    /// collapse to one with a repeat count.
    #[serde(default = "LoggingConfig::default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Logger-name prefixes the sink drops outright. These break the
    /// bridge's log → broadcast → log amplification loop.
    #[serde(default = "LoggingConfig::default_filter_prefixes")]
    pub filter_prefixes: Vec<String>,
}

impl LoggingConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_ring_capacity() -> usize {
        2000
    }

    fn default_dedup_window_ms() -> u64 {
        1_000
    }

    fn default_filter_prefixes() -> Vec<String> {
        ["marquee", "tungstenite", "tower_http", "hyper", "axum"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            ring_capacity: Self::default_ring_capacity(),
            dedup_window_ms: Self::default_dedup_window_ms(),
            filter_prefixes: Self::default_filter_prefixes(),
        }
    }
}
