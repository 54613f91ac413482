//! Shared fixtures: a recording audio output and library seeding through
//! the duration cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use cantina::music::library::{CacheEntry, LibraryCache};
use cantina::music::output::{AudioOutput, OutputError};

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    StartMusic(PathBuf, f32),
    StartIncoming(PathBuf),
    Promote,
    Pause,
    Resume,
    Stop,
    MusicVolume(f32),
    IncomingVolume(f32),
    Speech(PathBuf),
}

/// Audio output double that records every call and tracks the applied
/// music volume.
#[derive(Default)]
pub struct RecordingOutput {
    pub events: Mutex<Vec<OutputEvent>>,
    pub music_volume: Mutex<f32>,
    speech_busy: AtomicBool,
}

impl RecordingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn volume(&self) -> f32 {
        *self.music_volume.lock().unwrap()
    }

    fn record(&self, event: OutputEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl AudioOutput for RecordingOutput {
    fn start_music(&self, path: &Path, volume: f32) -> Result<(), OutputError> {
        *self.music_volume.lock().unwrap() = volume;
        self.record(OutputEvent::StartMusic(path.to_path_buf(), volume));
        Ok(())
    }

    fn start_incoming(&self, path: &Path) -> Result<(), OutputError> {
        self.record(OutputEvent::StartIncoming(path.to_path_buf()));
        Ok(())
    }

    fn promote_incoming(&self) {
        self.record(OutputEvent::Promote);
    }

    fn pause_music(&self) {
        self.record(OutputEvent::Pause);
    }

    fn resume_music(&self) {
        self.record(OutputEvent::Resume);
    }

    fn stop_music(&self) {
        self.record(OutputEvent::Stop);
    }

    fn set_music_volume(&self, volume: f32) {
        *self.music_volume.lock().unwrap() = volume;
        self.record(OutputEvent::MusicVolume(volume));
    }

    fn set_incoming_volume(&self, volume: f32) {
        self.record(OutputEvent::IncomingVolume(volume));
    }

    fn start_speech(&self, path: &Path) -> Result<(), OutputError> {
        self.speech_busy.store(false, Ordering::Release);
        self.record(OutputEvent::Speech(path.to_path_buf()));
        Ok(())
    }

    fn speech_finished(&self) -> bool {
        !self.speech_busy.load(Ordering::Acquire)
    }
}

/// Create stub audio files plus a matching duration cache, so the scanner
/// indexes them with known durations without decoding anything.
pub fn seed_library(
    music_dir: &Path,
    cache_path: &Path,
    tracks: &[(&str, f64)],
) -> Vec<PathBuf> {
    std::fs::create_dir_all(music_dir).unwrap();
    let mut cache = LibraryCache::default();
    let mut paths = Vec::new();

    for (name, duration) in tracks {
        let path = music_dir.join(format!("{name}.mp3"));
        std::fs::write(&path, name.as_bytes()).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        let mtime_secs = meta
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        cache.entries.insert(
            path.clone(),
            CacheEntry {
                size: meta.len(),
                mtime_secs,
                duration_seconds: Some(*duration),
            },
        );
        paths.push(path);
    }

    cache.store(cache_path);
    paths
}
