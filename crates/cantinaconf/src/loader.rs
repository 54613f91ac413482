//! Config file discovery, table merging, and environment variable overlay.

use crate::{CantinaConfig, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/cantina/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("cantina/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("cantina.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load one config file as a raw TOML table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`; overlay wins, tables merge recursively.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge_tables(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut CantinaConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("CANTINA_MUSIC_DIR") {
        config.paths.music_dir = expand_path(&v);
        sources.env_overrides.push("CANTINA_MUSIC_DIR".to_string());
    }
    if let Ok(v) = env::var("CANTINA_STATE_DIR") {
        config.paths.state_dir = expand_path(&v);
        sources.env_overrides.push("CANTINA_STATE_DIR".to_string());
    }
    if let Ok(v) = env::var("CANTINA_HTTP_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.http_port = port;
            sources.env_overrides.push("CANTINA_HTTP_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("CANTINA_AUDIO_BACKEND") {
        config.audio.backend = v;
        sources.env_overrides.push("CANTINA_AUDIO_BACKEND".to_string());
    }
    if let Ok(v) = env::var("CANTINA_SERIAL_DEVICE") {
        config.serial.device = v;
        sources.env_overrides.push("CANTINA_SERIAL_DEVICE".to_string());
    }
    if let Ok(v) = env::var("CANTINA_LOG_LEVEL") {
        config.logging.log_level = v;
        sources.env_overrides.push("CANTINA_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.logging.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand `~/` and leading `$VAR` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }

    if let Some(stripped) = path.strip_prefix('$') {
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                return PathBuf::from(var_value).join(&stripped[slash_pos + 1..]);
            }
        } else if let Ok(var_value) = env::var(stripped) {
            return PathBuf::from(var_value);
        }
        return PathBuf::from(path);
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn expand_path_absolute() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn merge_overlay_wins() {
        let mut base: toml::Table = r#"
[bind]
http_port = 8642
host = "127.0.0.1"
"#
        .parse()
        .unwrap();
        let overlay: toml::Table = r#"
[bind]
http_port = 9000
"#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);
        let bind = base["bind"].as_table().unwrap();
        assert_eq!(bind["http_port"].as_integer(), Some(9000));
        assert_eq!(bind["host"].as_str(), Some("127.0.0.1"));
    }

    #[test]
    fn load_from_file_applies_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[audio]
backend = "null"
duck_factor = 0.3

[dj]
crossfade_sec = 8.0
"#
        )
        .unwrap();

        let (config, sources) =
            CantinaConfig::load_with_sources_from(Some(file.path())).unwrap();
        assert_eq!(config.audio.backend, "null");
        assert_eq!(config.audio.duck_factor, 0.3);
        assert_eq!(config.dj.crossfade_sec, 8.0);
        // Untouched sections keep defaults
        assert_eq!(config.serial.baud, 115_200);
        assert!(sources.files.iter().any(|p| p == file.path()));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not toml [").unwrap();
        let result = CantinaConfig::load_with_sources_from(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
