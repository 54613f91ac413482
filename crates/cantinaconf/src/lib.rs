//! Minimal configuration loading for CantinaOS.
//!
//! Every crate in the workspace reads its knobs from here, so dependencies
//! stay deliberately small: serde, toml, directories.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/cantina/config.toml` (system)
//! 2. `~/.config/cantina/config.toml` (user)
//! 3. `./cantina.toml` (local override, or the `--config` path)
//! 4. Environment variables (`CANTINA_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! music_dir = "~/Music/cantina"
//! state_dir = "~/.local/share/cantina"
//!
//! [bind]
//! http_port = 8642
//!
//! [audio]
//! backend = "rodio"
//! duck_factor = 0.2
//!
//! [serial]
//! device = "/dev/ttyACM0"
//! baud = 115200
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files, expand_path, ConfigSources};
pub use sections::{
    AudioConfig, BindConfig, DjConfig, LibraryConfig, LoggingConfig, PathsConfig, SerialConfig,
    VoiceConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete CantinaOS configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CantinaConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub dj: DjConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CantinaConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided it takes precedence over the local
    /// `./cantina.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config: CantinaConfig =
            toml::Value::Table(merged)
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: PathBuf::from("<merged>"),
                    message: e.to_string(),
                })?;

        config.expand_paths();
        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string (for `--show-config`).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_else(|e| format!("# serialization error: {e}"))
    }

    fn expand_paths(&mut self) {
        self.paths.music_dir = expand_path(&self.paths.music_dir.to_string_lossy());
        self.paths.state_dir = expand_path(&self.paths.state_dir.to_string_lossy());
    }

    /// Directory for session log files.
    pub fn log_dir(&self) -> PathBuf {
        self.paths.state_dir.join("logs")
    }

    /// Directory for rendered speech/commentary wavs.
    pub fn speech_dir(&self) -> PathBuf {
        self.paths.state_dir.join("speech")
    }

    /// Path of the library duration cache.
    pub fn library_cache_path(&self) -> PathBuf {
        self.paths.state_dir.join(".library_cache.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CantinaConfig::default();
        assert_eq!(config.bind.http_port, 8642);
        assert_eq!(config.audio.duck_factor, 0.2);
        assert_eq!(config.serial.baud, 115_200);
        assert_eq!(config.logging.ring_capacity, 2000);
    }

    #[test]
    fn to_toml_roundtrips() {
        let config = CantinaConfig::default();
        let toml_str = config.to_toml();
        let parsed: CantinaConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.bind.http_port, config.bind.http_port);
        assert_eq!(parsed.dj.crossfade_sec, config.dj.crossfade_sec);
    }
}
