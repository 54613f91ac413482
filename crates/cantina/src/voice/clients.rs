//! Narrow interface contracts for the external STT / LLM / TTS clients.
//!
//! Vendor integrations live behind these traits; CantinaOS itself ships
//! null implementations (run without vendors) and scripted fakes for tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceClientError {
    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },

    #[error("{service} stream error: {message}")]
    Stream { service: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One transcription chunk from a live STT stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub confidence: f64,
}

/// A live speech-to-text stream.
///
/// The coordinator pulls transcripts until `None` (end of utterance) or it
/// closes the session.
#[async_trait]
pub trait SttSession: Send {
    async fn next_transcript(&mut self) -> Result<Option<Transcript>, VoiceClientError>;
    async fn close(&mut self) -> Result<(), VoiceClientError>;
}

#[async_trait]
pub trait SttClient: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn SttSession>, VoiceClientError>;
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One dialog turn. The coordinator bounds this with its own timeout.
    async fn complete(&self, prompt: &str) -> Result<String, VoiceClientError>;
}

/// A rendered speech clip on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSpeech {
    pub audio_ref: PathBuf,
    pub duration_ms: u64,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Render `text` to a wav at `out_path`.
    async fn render(&self, text: &str, out_path: &Path) -> Result<RenderedSpeech, VoiceClientError>;
}

/// Write a silent wav of the given length; the placeholder render used by
/// the null TTS and the test fakes.
pub fn write_silent_wav(path: &Path, duration_ms: u64) -> Result<(), VoiceClientError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 22_050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(|e| {
        VoiceClientError::Stream {
            service: "tts".to_string(),
            message: e.to_string(),
        }
    })?;
    let samples = (spec.sample_rate as u64 * duration_ms / 1000) as usize;
    for _ in 0..samples {
        writer.write_sample(0i16).map_err(|e| VoiceClientError::Stream {
            service: "tts".to_string(),
            message: e.to_string(),
        })?;
    }
    writer.finalize().map_err(|e| VoiceClientError::Stream {
        service: "tts".to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

/// STT that never hears anything: sessions end immediately.
pub struct NullStt;

struct NullSttSession;

#[async_trait]
impl SttSession for NullSttSession {
    async fn next_transcript(&mut self) -> Result<Option<Transcript>, VoiceClientError> {
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), VoiceClientError> {
        Ok(())
    }
}

#[async_trait]
impl SttClient for NullStt {
    async fn open_session(&self) -> Result<Box<dyn SttSession>, VoiceClientError> {
        Ok(Box::new(NullSttSession))
    }
}

/// LLM that answers every prompt with one canned line.
pub struct NullLlm {
    pub reply: String,
}

impl Default for NullLlm {
    fn default() -> Self {
        Self {
            reply: "I'm between sets right now, but I'm listening!".to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for NullLlm {
    async fn complete(&self, _prompt: &str) -> Result<String, VoiceClientError> {
        Ok(self.reply.clone())
    }
}

/// TTS that renders silence sized to the text length.
pub struct NullTts;

#[async_trait]
impl TtsClient for NullTts {
    async fn render(&self, text: &str, out_path: &Path) -> Result<RenderedSpeech, VoiceClientError> {
        // Rough reading-speed estimate so spans have believable length.
        let duration_ms = (text.len() as u64 * 60).clamp(500, 15_000);
        write_silent_wav(out_path, duration_ms)?;
        Ok(RenderedSpeech {
            audio_ref: out_path.to_path_buf(),
            duration_ms,
        })
    }
}

/// Test fakes with scriptable behavior.
pub mod fakes {
    use super::*;

    /// STT session fed from a fixed transcript list.
    pub struct ScriptedStt {
        transcripts: Arc<Mutex<Vec<Transcript>>>,
        pub opened: Arc<Mutex<u32>>,
    }

    impl ScriptedStt {
        pub fn new(transcripts: Vec<Transcript>) -> Self {
            Self {
                transcripts: Arc::new(Mutex::new(transcripts)),
                opened: Arc::new(Mutex::new(0)),
            }
        }

        pub fn hearing(text: &str) -> Self {
            Self::new(vec![
                Transcript {
                    text: text.to_string(),
                    is_final: false,
                    confidence: 0.5,
                },
                Transcript {
                    text: text.to_string(),
                    is_final: true,
                    confidence: 0.95,
                },
            ])
        }

        pub fn sessions_opened(&self) -> u32 {
            *self.opened.lock().unwrap()
        }
    }

    struct ScriptedSession {
        remaining: Vec<Transcript>,
    }

    #[async_trait]
    impl SttSession for ScriptedSession {
        async fn next_transcript(&mut self) -> Result<Option<Transcript>, VoiceClientError> {
            if self.remaining.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.remaining.remove(0)))
            }
        }

        async fn close(&mut self) -> Result<(), VoiceClientError> {
            self.remaining.clear();
            Ok(())
        }
    }

    #[async_trait]
    impl SttClient for ScriptedStt {
        async fn open_session(&self) -> Result<Box<dyn SttSession>, VoiceClientError> {
            *self.opened.lock().unwrap() += 1;
            let remaining = self.transcripts.lock().unwrap().clone();
            Ok(Box::new(ScriptedSession { remaining }))
        }
    }

    /// LLM with a fixed reply and an optional artificial delay.
    pub struct ScriptedLlm {
        pub reply: String,
        pub delay: Duration,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedLlm {
        pub fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                delay: Duration::ZERO,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn slow(reply: &str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::replying(reply)
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, prompt: &str) -> Result<String, VoiceClientError> {
            self.calls.lock().unwrap().push(prompt.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.reply.clone())
        }
    }

    /// LLM that always fails.
    pub struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn complete(&self, _prompt: &str) -> Result<String, VoiceClientError> {
            Err(VoiceClientError::Unavailable {
                service: "llm".to_string(),
                message: "scripted failure".to_string(),
            })
        }
    }

    /// TTS writing short silent wavs, with call recording.
    pub struct ScriptedTts {
        pub duration_ms: u64,
        pub rendered: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTts {
        pub fn new(duration_ms: u64) -> Self {
            Self {
                duration_ms,
                rendered: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl TtsClient for ScriptedTts {
        async fn render(
            &self,
            text: &str,
            out_path: &Path,
        ) -> Result<RenderedSpeech, VoiceClientError> {
            self.rendered.lock().unwrap().push(text.to_string());
            write_silent_wav(out_path, self.duration_ms)?;
            Ok(RenderedSpeech {
                audio_ref: out_path.to_path_buf(),
                duration_ms: self.duration_ms,
            })
        }
    }

    /// TTS that always fails.
    pub struct FailingTts;

    #[async_trait]
    impl TtsClient for FailingTts {
        async fn render(
            &self,
            _text: &str,
            _out_path: &Path,
        ) -> Result<RenderedSpeech, VoiceClientError> {
            Err(VoiceClientError::Unavailable {
                service: "tts".to_string(),
                message: "scripted failure".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_stt_replays_and_ends() {
        let stt = fakes::ScriptedStt::hearing("hello there");
        let mut session = stt.open_session().await.unwrap();

        let partial = session.next_transcript().await.unwrap().unwrap();
        assert!(!partial.is_final);
        let fin = session.next_transcript().await.unwrap().unwrap();
        assert!(fin.is_final);
        assert_eq!(fin.text, "hello there");
        assert!(session.next_transcript().await.unwrap().is_none());
        assert_eq!(stt.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn null_tts_writes_a_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech/clip.wav");
        let rendered = NullTts.render("well hello", &path).await.unwrap();
        assert!(rendered.duration_ms >= 500);
        assert!(path.exists());

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
    }
}
