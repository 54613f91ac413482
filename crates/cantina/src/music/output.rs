//! Audio output device seam.
//!
//! The engine owns the audio device exclusively and drives it through the
//! [`AudioOutput`] trait: a primary music slot, an incoming slot for
//! crossfades, and a speech slot for the privileged voice path. The rodio
//! backend runs the device on its own thread (the output stream is not
//! `Send`); the null backend lets tests and headless hosts run the full
//! engine without a device.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("cannot open {path}: {source}")]
    FileOpen {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive handle on the audio output device.
///
/// Volume setters take the final applied value; ducking and crossfade math
/// happen in the engine.
pub trait AudioOutput: Send + Sync {
    /// Replace the primary slot's contents with this file and start playing.
    fn start_music(&self, path: &Path, volume: f32) -> Result<(), OutputError>;

    /// Load the crossfade slot, starting muted.
    fn start_incoming(&self, path: &Path) -> Result<(), OutputError>;

    /// Stop the primary slot and move the incoming slot into its place.
    fn promote_incoming(&self);

    fn pause_music(&self);
    fn resume_music(&self);
    fn stop_music(&self);

    fn set_music_volume(&self, volume: f32);
    fn set_incoming_volume(&self, volume: f32);

    /// Play a rendered speech file on the speech slot.
    fn start_speech(&self, path: &Path) -> Result<(), OutputError>;

    /// True once the speech slot has drained.
    fn speech_finished(&self) -> bool;
}

/// No-device backend: accepts everything, finishes speech instantly.
#[derive(Default)]
pub struct NullOutput {
    speech_active: AtomicBool,
}

impl NullOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl AudioOutput for NullOutput {
    fn start_music(&self, _path: &Path, _volume: f32) -> Result<(), OutputError> {
        Ok(())
    }

    fn start_incoming(&self, _path: &Path) -> Result<(), OutputError> {
        Ok(())
    }

    fn promote_incoming(&self) {}
    fn pause_music(&self) {}
    fn resume_music(&self) {}
    fn stop_music(&self) {}
    fn set_music_volume(&self, _volume: f32) {}
    fn set_incoming_volume(&self, _volume: f32) {}

    fn start_speech(&self, _path: &Path) -> Result<(), OutputError> {
        self.speech_active.store(false, Ordering::Release);
        Ok(())
    }

    fn speech_finished(&self) -> bool {
        !self.speech_active.load(Ordering::Acquire)
    }
}

#[cfg(feature = "rodio-output")]
pub use rodio_backend::RodioOutput;

#[cfg(feature = "rodio-output")]
mod rodio_backend {
    use super::*;
    use std::fs::File;
    use std::io::BufReader;
    use std::sync::mpsc;
    use std::time::Duration;
    use tracing::{info, warn};

    enum Cmd {
        StartMusic(PathBuf, f32),
        StartIncoming(PathBuf),
        Promote,
        Pause,
        Resume,
        StopMusic,
        MusicVolume(f32),
        IncomingVolume(f32),
        StartSpeech(PathBuf),
        Shutdown,
    }

    /// Rodio-backed output. All device interaction happens on a dedicated
    /// thread owning the output stream; trait calls enqueue commands.
    pub struct RodioOutput {
        tx: mpsc::Sender<Cmd>,
        speech_idle: Arc<AtomicBool>,
    }

    impl RodioOutput {
        /// Open the default output device.
        pub fn open() -> Result<Arc<Self>, OutputError> {
            let (tx, rx) = mpsc::channel();
            let speech_idle = Arc::new(AtomicBool::new(true));
            let idle = Arc::clone(&speech_idle);

            let (ready_tx, ready_rx) = mpsc::channel();
            std::thread::Builder::new()
                .name("cantina-audio".into())
                .spawn(move || device_thread(rx, idle, ready_tx))
                .map_err(|e| OutputError::DeviceUnavailable(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Arc::new(Self { tx, speech_idle })),
                Ok(Err(message)) => Err(OutputError::DeviceUnavailable(message)),
                Err(_) => Err(OutputError::DeviceUnavailable(
                    "audio thread exited during init".into(),
                )),
            }
        }

        fn send(&self, cmd: Cmd) {
            // A dead audio thread means the device is gone; the engine
            // learns about it from the supervisor's status view.
            let _ = self.tx.send(cmd);
        }

        fn check_readable(path: &Path) -> Result<(), OutputError> {
            File::open(path)
                .map(|_| ())
                .map_err(|source| OutputError::FileOpen {
                    path: path.to_path_buf(),
                    source,
                })
        }
    }

    impl Drop for RodioOutput {
        fn drop(&mut self) {
            let _ = self.tx.send(Cmd::Shutdown);
        }
    }

    impl AudioOutput for RodioOutput {
        fn start_music(&self, path: &Path, volume: f32) -> Result<(), OutputError> {
            Self::check_readable(path)?;
            self.send(Cmd::StartMusic(path.to_path_buf(), volume));
            Ok(())
        }

        fn start_incoming(&self, path: &Path) -> Result<(), OutputError> {
            Self::check_readable(path)?;
            self.send(Cmd::StartIncoming(path.to_path_buf()));
            Ok(())
        }

        fn promote_incoming(&self) {
            self.send(Cmd::Promote);
        }

        fn pause_music(&self) {
            self.send(Cmd::Pause);
        }

        fn resume_music(&self) {
            self.send(Cmd::Resume);
        }

        fn stop_music(&self) {
            self.send(Cmd::StopMusic);
        }

        fn set_music_volume(&self, volume: f32) {
            self.send(Cmd::MusicVolume(volume));
        }

        fn set_incoming_volume(&self, volume: f32) {
            self.send(Cmd::IncomingVolume(volume));
        }

        fn start_speech(&self, path: &Path) -> Result<(), OutputError> {
            Self::check_readable(path)?;
            self.speech_idle.store(false, Ordering::Release);
            self.send(Cmd::StartSpeech(path.to_path_buf()));
            Ok(())
        }

        fn speech_finished(&self) -> bool {
            self.speech_idle.load(Ordering::Acquire)
        }
    }

    fn open_sink(stream: &rodio::OutputStream, path: &Path) -> Option<rodio::Sink> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open audio file");
                return None;
            }
        };
        let source = match rodio::Decoder::new(BufReader::new(file)) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot decode audio file");
                return None;
            }
        };
        let sink = rodio::Sink::connect_new(stream.mixer());
        sink.append(source);
        Some(sink)
    }

    fn device_thread(
        rx: mpsc::Receiver<Cmd>,
        speech_idle: Arc<AtomicBool>,
        ready_tx: mpsc::Sender<Result<(), String>>,
    ) {
        let stream = match rodio::OutputStreamBuilder::open_default_stream() {
            Ok(s) => {
                let _ = ready_tx.send(Ok(()));
                s
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
        };
        info!("audio output stream open");

        let mut music: Option<rodio::Sink> = None;
        let mut incoming: Option<rodio::Sink> = None;
        let mut speech: Option<rodio::Sink> = None;

        loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(Cmd::StartMusic(path, volume)) => {
                    if let Some(old) = music.take() {
                        old.stop();
                    }
                    if let Some(sink) = open_sink(&stream, &path) {
                        sink.set_volume(volume);
                        music = Some(sink);
                    }
                }
                Ok(Cmd::StartIncoming(path)) => {
                    if let Some(old) = incoming.take() {
                        old.stop();
                    }
                    if let Some(sink) = open_sink(&stream, &path) {
                        sink.set_volume(0.0);
                        incoming = Some(sink);
                    }
                }
                Ok(Cmd::Promote) => {
                    if let Some(old) = music.take() {
                        old.stop();
                    }
                    music = incoming.take();
                }
                Ok(Cmd::Pause) => {
                    if let Some(sink) = &music {
                        sink.pause();
                    }
                }
                Ok(Cmd::Resume) => {
                    if let Some(sink) = &music {
                        sink.play();
                    }
                }
                Ok(Cmd::StopMusic) => {
                    if let Some(sink) = music.take() {
                        sink.stop();
                    }
                    if let Some(sink) = incoming.take() {
                        sink.stop();
                    }
                }
                Ok(Cmd::MusicVolume(v)) => {
                    if let Some(sink) = &music {
                        sink.set_volume(v);
                    }
                }
                Ok(Cmd::IncomingVolume(v)) => {
                    if let Some(sink) = &incoming {
                        sink.set_volume(v);
                    }
                }
                Ok(Cmd::StartSpeech(path)) => {
                    if let Some(old) = speech.take() {
                        old.stop();
                    }
                    match open_sink(&stream, &path) {
                        Some(sink) => speech = Some(sink),
                        None => speech_idle.store(true, Ordering::Release),
                    }
                }
                Ok(Cmd::Shutdown) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            if let Some(sink) = &speech {
                if sink.empty() {
                    speech = None;
                    speech_idle.store(true, Ordering::Release);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_output_accepts_everything() {
        let out = NullOutput::new();
        out.start_music(Path::new("/nope.mp3"), 0.8).unwrap();
        out.start_incoming(Path::new("/nope2.mp3")).unwrap();
        out.promote_incoming();
        out.set_music_volume(0.2);
        out.start_speech(Path::new("/speech.wav")).unwrap();
        assert!(out.speech_finished());
    }
}
