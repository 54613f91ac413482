//! Music library: directory scan, duration probing, and the on-disk
//! duration cache.
//!
//! Scanning is asynchronous; the engine announces a finished index with
//! `/music/library_updated`. Durations come from the decoder with a bounded
//! wait per track; tracks whose duration can't be determined keep
//! `duration_seconds = None` and are excluded from DJ selection but remain
//! playable.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use cantinaproto::{Track, TrackRef};
use serde::{Deserialize, Serialize};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};
use walkdir::WalkDir;

const SUPPORTED_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "flac"];

/// One cached probe result, invalidated on size or mtime mismatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub size: u64,
    pub mtime_secs: u64,
    pub duration_seconds: Option<f64>,
}

/// `filepath → duration` cache persisted as `.library_cache.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LibraryCache {
    pub entries: HashMap<PathBuf, CacheEntry>,
}

impl LibraryCache {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn store(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), error = %e, "failed to write library cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize library cache"),
        }
    }

    /// Cached duration for a file, if size and mtime still match.
    fn lookup(&self, path: &Path, size: u64, mtime_secs: u64) -> Option<Option<f64>> {
        self.entries.get(path).and_then(|entry| {
            if entry.size == size && entry.mtime_secs == mtime_secs {
                Some(entry.duration_seconds)
            } else {
                None
            }
        })
    }
}

/// Scan settings handed to [`scan`].
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub music_dir: PathBuf,
    pub cache_path: Option<PathBuf>,
    pub probe_timeout: Duration,
}

/// Walk the music directory and build the track index.
///
/// Runs the filesystem walk and per-track probes on the blocking pool; each
/// probe is bounded by `probe_timeout`.
pub async fn scan(config: ScanConfig) -> Vec<Track> {
    let files = {
        let music_dir = config.music_dir.clone();
        tokio::task::spawn_blocking(move || collect_audio_files(&music_dir))
            .await
            .unwrap_or_default()
    };

    let mut cache = match &config.cache_path {
        Some(path) => LibraryCache::load(path),
        None => LibraryCache::default(),
    };

    let mut tracks = Vec::with_capacity(files.len());
    for path in files {
        let (size, mtime_secs) = match file_identity(&path) {
            Some(id) => id,
            None => continue,
        };

        let duration_seconds = match cache.lookup(&path, size, mtime_secs) {
            Some(cached) => cached,
            None => {
                let probed = probe_with_timeout(path.clone(), config.probe_timeout).await;
                cache.entries.insert(
                    path.clone(),
                    CacheEntry {
                        size,
                        mtime_secs,
                        duration_seconds: probed,
                    },
                );
                probed
            }
        };

        tracks.push(make_track(&path, duration_seconds));
    }

    tracks.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));

    if let Some(path) = &config.cache_path {
        cache.store(path);
    }

    debug!(count = tracks.len(), "library scan complete");
    tracks
}

fn collect_audio_files(music_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(music_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}

fn file_identity(path: &Path) -> Option<(u64, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Some((meta.len(), mtime))
}

async fn probe_with_timeout(path: PathBuf, timeout: Duration) -> Option<f64> {
    let probe = tokio::task::spawn_blocking(move || probe_duration(&path));
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(duration)) => duration,
        Ok(Err(_)) | Err(_) => None,
    }
}

/// Decode the container headers and compute the track duration.
fn probe_duration(path: &Path) -> Option<f64> {
    let file = File::open(path).ok()?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .ok()?;

    let track = probed.format.default_track()?;
    let params = &track.codec_params;

    let n_frames = params.n_frames?;
    if let Some(time_base) = params.time_base {
        let time = time_base.calc_time(n_frames);
        return Some(time.seconds as f64 + time.frac);
    }
    let sample_rate = params.sample_rate? as f64;
    Some(n_frames as f64 / sample_rate)
}

fn make_track(path: &Path, duration_seconds: Option<f64>) -> Track {
    let title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .replace('_', " ");

    Track {
        track_id: track_id_for(path),
        title,
        artist: None,
        duration_seconds,
        filepath: path.to_path_buf(),
    }
}

/// Stable id derived from the filepath, so ids survive rescans.
pub fn track_id_for(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("trk_{:016x}", hasher.finish())
}

/// Resolve a track reference against a library listing.
///
/// Indexes are 1-based into the current listing. Names match by
/// case-insensitive substring against the title; ambiguity picks the
/// lexicographically first title.
pub fn resolve<'a>(tracks: &'a [Track], track_ref: &TrackRef) -> Option<&'a Track> {
    match track_ref {
        TrackRef::Index { index } => {
            if *index == 0 {
                return None;
            }
            tracks.get(index - 1)
        }
        TrackRef::Id { id } => tracks.iter().find(|t| &t.track_id == id),
        TrackRef::Name { name } => {
            let needle = name.to_lowercase();
            tracks
                .iter()
                .filter(|t| t.title.to_lowercase().contains(&needle))
                .min_by(|a, b| a.title.cmp(&b.title))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn track(title: &str) -> Track {
        Track {
            track_id: format!("trk_{title}"),
            title: title.to_string(),
            artist: None,
            duration_seconds: Some(100.0),
            filepath: PathBuf::from(format!("/music/{title}.mp3")),
        }
    }

    #[test]
    fn resolve_by_index_is_one_based() {
        let tracks = vec![track("alpha"), track("beta")];
        assert_eq!(resolve(&tracks, &TrackRef::Index { index: 1 }).unwrap().title, "alpha");
        assert_eq!(resolve(&tracks, &TrackRef::Index { index: 2 }).unwrap().title, "beta");
        assert!(resolve(&tracks, &TrackRef::Index { index: 0 }).is_none());
        assert!(resolve(&tracks, &TrackRef::Index { index: 3 }).is_none());
    }

    #[test]
    fn resolve_by_substring_case_insensitive() {
        let tracks = vec![track("Mad About Me"), track("Doga Cantina Band")];
        let found = resolve(
            &tracks,
            &TrackRef::Name { name: "CANTINA".into() },
        )
        .unwrap();
        assert_eq!(found.title, "Doga Cantina Band");
    }

    #[test]
    fn ambiguous_name_picks_lexicographically_first() {
        let tracks = vec![track("Beta Song"), track("Alpha Song")];
        let found = resolve(&tracks, &TrackRef::Name { name: "song".into() }).unwrap();
        assert_eq!(found.title, "Alpha Song");
    }

    #[test]
    fn resolve_miss_returns_none() {
        let tracks = vec![track("alpha")];
        assert!(resolve(&tracks, &TrackRef::Name { name: "zeta".into() }).is_none());
        assert!(resolve(&[], &TrackRef::Name { name: "a".into() }).is_none());
    }

    #[test]
    fn cache_invalidates_on_size_change() {
        let mut cache = LibraryCache::default();
        let path = PathBuf::from("/music/a.mp3");
        cache.entries.insert(
            path.clone(),
            CacheEntry {
                size: 100,
                mtime_secs: 50,
                duration_seconds: Some(180.0),
            },
        );

        assert_eq!(cache.lookup(&path, 100, 50), Some(Some(180.0)));
        assert_eq!(cache.lookup(&path, 101, 50), None);
        assert_eq!(cache.lookup(&path, 100, 51), None);
    }

    #[test]
    fn cache_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".library_cache.json");

        let mut cache = LibraryCache::default();
        cache.entries.insert(
            PathBuf::from("/music/a.mp3"),
            CacheEntry {
                size: 1,
                mtime_secs: 2,
                duration_seconds: None,
            },
        );
        cache.store(&cache_path);

        let loaded = LibraryCache::load(&cache_path);
        assert_eq!(
            loaded.entries.get(Path::new("/music/a.mp3")),
            cache.entries.get(Path::new("/music/a.mp3"))
        );
    }

    #[tokio::test]
    async fn scan_finds_supported_files(){
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("song_one.mp3"), b"not really audio").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/song_two.flac"), b"still not audio").unwrap();

        let tracks = scan(ScanConfig {
            music_dir: dir.path().to_path_buf(),
            cache_path: None,
            probe_timeout: Duration::from_millis(200),
        })
        .await;

        let titles: Vec<_> = tracks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["song one", "song two"]);
        // Garbage bytes probe to no duration; the tracks stay listed.
        assert!(tracks.iter().all(|t| t.duration_seconds.is_none()));
    }

    #[test]
    fn track_ids_are_stable() {
        let a = track_id_for(Path::new("/music/a.mp3"));
        let b = track_id_for(Path::new("/music/a.mp3"));
        assert_eq!(a, b);
        assert!(a.starts_with("trk_"));
    }
}
