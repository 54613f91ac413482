//! Voice pipeline coordinator: mic gating, STT stream lifecycle, the LLM
//! turn, TTS playback, and the ducking handshake.
//!
//! Capture is click-to-talk and gated by INTERACTIVE mode; start requests
//! outside it are rejected. Only final transcripts feed the LLM turn. The
//! speech span events (`speech_started` / `speech_ended`) drive music
//! ducking; the engine plays the rendered audio through its privileged
//! speech path and reports back with `speech_synthesis_ended`.

pub mod clients;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cantinabus::{BusReceiver, Service, ServiceContext, ServiceError};
use cantinaproto::error::CommandError;
use cantinaproto::{topics, LogLevel, Mode, Payload, Track, VoiceStage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clients::{LlmClient, RenderedSpeech, SttClient, Transcript, TtsClient};

fn new_clip_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

const EXTERNAL_RETRY_BACKOFF: Duration = Duration::from_millis(250);
const SYNTHESIS_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct VoicePipelineConfig {
    pub llm_timeout: Duration,
    pub tts_timeout: Duration,
    pub stt_idle_close: Duration,
    pub canned_apology: String,
    pub speech_dir: PathBuf,
}

pub struct VoiceCoordinator {
    stt: Arc<dyn SttClient>,
    llm: Arc<dyn LlmClient>,
    tts: Arc<dyn TtsClient>,
    config: VoicePipelineConfig,
}

impl VoiceCoordinator {
    pub fn new(
        stt: Arc<dyn SttClient>,
        llm: Arc<dyn LlmClient>,
        tts: Arc<dyn TtsClient>,
        config: VoicePipelineConfig,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            config,
        }
    }
}

#[async_trait]
impl Service for VoiceCoordinator {
    fn name(&self) -> &'static str {
        "voice_coordinator"
    }

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        let mut pipeline = Pipeline {
            stt: Arc::clone(&self.stt),
            llm: Arc::clone(&self.llm),
            tts: Arc::clone(&self.tts),
            config: self.config.clone(),
            mode: Mode::Idle,
            listening: None,
        };

        let mut mode_rx = ctx.subscribe(topics::MODE_CHANGE);
        let mut mic_start_rx = ctx.subscribe(topics::MIC_START_REQUEST);
        let mut mic_stop_rx = ctx.subscribe(topics::MIC_STOP_REQUEST);
        let mut commentary_rx = ctx.subscribe(topics::COMMENTARY_REQUEST);
        let mut synth_rx = ctx.subscribe(topics::SPEECH_SYNTHESIS_ENDED);
        let mut status_rx = ctx.subscribe(topics::STATUS_REQUEST);
        let (utterance_tx, mut utterance_rx) = mpsc::channel::<Option<Transcript>>(4);

        let ctx = Arc::clone(ctx);
        let cancel = ctx.cancel_token();

        ctx.clone().spawn(async move {
            loop {
                // Biased: mode updates outrank capture requests, so gating
                // decisions never race a queued mode change.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        pipeline.stop_listening();
                        break;
                    }
                    Some(event) = mode_rx.recv() => {
                        if let Payload::ModeChange { new, .. } = event.payload {
                            pipeline.mode = new;
                            if new != Mode::Interactive {
                                pipeline.stop_listening();
                            }
                        }
                    }
                    Some(_) = mic_start_rx.recv() => {
                        pipeline.handle_mic_start(&ctx, &utterance_tx).await;
                    }
                    Some(_) = mic_stop_rx.recv() => {
                        pipeline.stop_listening();
                    }
                    Some(final_transcript) = utterance_rx.recv() => {
                        pipeline.listening = None;
                        ctx.emit(topics::LISTENING_STOPPED, Payload::ListeningStopped).await;
                        if let Some(transcript) = final_transcript {
                            ctx.emit(topics::TRANSCRIPTION, Payload::Transcription {
                                text: transcript.text.clone(),
                                is_final: true,
                                confidence: transcript.confidence,
                            }).await;
                            pipeline.run_turn(&ctx, &mut synth_rx, &transcript.text).await;
                        }
                    }
                    Some(event) = commentary_rx.recv() => {
                        if let Payload::CommentaryRequest { prev_track, next_track } = event.payload {
                            pipeline.generate_commentary(&ctx, prev_track, next_track).await;
                        }
                    }
                    Some(_) = status_rx.recv() => {
                        ctx.emit_status(None).await;
                    }
                    else => break,
                }
            }
        });
        Ok(())
    }
}

struct Pipeline {
    stt: Arc<dyn SttClient>,
    llm: Arc<dyn LlmClient>,
    tts: Arc<dyn TtsClient>,
    config: VoicePipelineConfig,
    mode: Mode,
    listening: Option<CancellationToken>,
}

impl Pipeline {
    fn stop_listening(&mut self) {
        if let Some(token) = self.listening.take() {
            token.cancel();
        }
    }

    /// Open an STT session and start the reader, or reject outside
    /// INTERACTIVE.
    async fn handle_mic_start(
        &mut self,
        ctx: &Arc<ServiceContext>,
        utterance_tx: &mpsc::Sender<Option<Transcript>>,
    ) {
        if self.mode != Mode::Interactive {
            let err = CommandError::wrong_mode(self.mode, Mode::Interactive);
            warn!(mode = %self.mode, "mic start rejected");
            ctx.emit(
                topics::SYSTEM_ERROR,
                Payload::SystemError {
                    source: "voice_coordinator".to_string(),
                    message: err.to_string(),
                    severity: LogLevel::Warn,
                },
            )
            .await;
            return;
        }
        if self.listening.is_some() {
            debug!("already listening, start request ignored");
            return;
        }

        // One retry with a short backoff before giving up on the stream.
        let session = match self.stt.open_session().await {
            Ok(session) => Ok(session),
            Err(first) => {
                warn!(error = %first, "stt open failed, retrying");
                tokio::time::sleep(EXTERNAL_RETRY_BACKOFF).await;
                self.stt.open_session().await
            }
        };

        let mut session = match session {
            Ok(session) => session,
            Err(e) => {
                ctx.emit(
                    topics::VOICE_ERROR,
                    Payload::VoiceError {
                        stage: VoiceStage::Stt,
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let token = ctx.cancel_token().child_token();
        self.listening = Some(token.clone());
        ctx.emit(topics::LISTENING_STARTED, Payload::ListeningStarted)
            .await;
        info!("listening started");

        let idle_close = self.config.stt_idle_close;
        let utterance_tx = utterance_tx.clone();
        let reader_ctx = Arc::clone(ctx);
        ctx.spawn(async move {
            let mut final_transcript = None;
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = tokio::time::timeout(idle_close, session.next_transcript()) => next,
                };
                match next {
                    Ok(Ok(Some(transcript))) => {
                        if transcript.is_final {
                            final_transcript = Some(transcript);
                            break;
                        }
                        reader_ctx
                            .emit(
                                topics::TRANSCRIPTION,
                                Payload::Transcription {
                                    text: transcript.text,
                                    is_final: false,
                                    confidence: transcript.confidence,
                                },
                            )
                            .await;
                    }
                    // End of utterance, stream error, or idle timeout all
                    // close the capture span.
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        warn!(error = %e, "stt stream error");
                        reader_ctx
                            .emit(
                                topics::VOICE_ERROR,
                                Payload::VoiceError {
                                    stage: VoiceStage::Stt,
                                    message: e.to_string(),
                                },
                            )
                            .await;
                        break;
                    }
                    Err(_) => {
                        debug!("stt idle timeout, closing stream");
                        break;
                    }
                }
            }
            if let Err(e) = session.close().await {
                debug!(error = %e, "stt close failed");
            }
            let _ = utterance_tx.send(final_transcript).await;
        });
    }

    /// One dialog turn: LLM with a hard timeout, then speech playback.
    async fn run_turn(
        &mut self,
        ctx: &Arc<ServiceContext>,
        synth_rx: &mut BusReceiver,
        transcript: &str,
    ) {
        let reply =
            match tokio::time::timeout(self.config.llm_timeout, self.llm.complete(transcript))
                .await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    warn!(error = %e, "llm turn failed");
                    ctx.emit(
                        topics::VOICE_ERROR,
                        Payload::VoiceError {
                            stage: VoiceStage::Llm,
                            message: e.to_string(),
                        },
                    )
                    .await;
                    return;
                }
                Err(_) => {
                    // Timed out: apologize in character if TTS still works.
                    warn!("llm turn timed out, speaking canned apology");
                    ctx.emit(
                        topics::VOICE_ERROR,
                        Payload::VoiceError {
                            stage: VoiceStage::Llm,
                            message: format!(
                                "turn exceeded {} ms",
                                self.config.llm_timeout.as_millis()
                            ),
                        },
                    )
                    .await;
                    self.config.canned_apology.clone()
                }
            };

        ctx.emit(
            topics::RESPONSE_TEXT,
            Payload::ResponseText { text: reply.clone() },
        )
        .await;

        let out_path = self
            .config
            .speech_dir
            .join(format!("tts_{}.wav", new_clip_id()));
        let rendered = match self.render_with_retry(&reply, &out_path).await {
            Ok(rendered) => rendered,
            Err(e) => {
                // Skip playback entirely; music was never ducked.
                warn!(error = %e, "tts render failed, skipping playback");
                ctx.emit(
                    topics::VOICE_ERROR,
                    Payload::VoiceError {
                        stage: VoiceStage::Tts,
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        self.speak(ctx, synth_rx, rendered).await;
    }

    /// Play a rendered clip through the engine's speech path, bracketed by
    /// the ducking handshake events.
    async fn speak(
        &self,
        ctx: &Arc<ServiceContext>,
        synth_rx: &mut BusReceiver,
        rendered: RenderedSpeech,
    ) {
        // Discard synthesis signals from spans we didn't initiate (DJ
        // commentary clips also drain through the engine's speech slot).
        while synth_rx.try_recv().is_some() {}

        ctx.emit(
            topics::SPEECH_STARTED,
            Payload::SpeechStarted {
                duration_ms: Some(rendered.duration_ms),
            },
        )
        .await;
        ctx.emit(
            topics::SPEECH_PLAY,
            Payload::SpeechPlay {
                audio_ref: rendered.audio_ref,
            },
        )
        .await;

        let wait = Duration::from_millis(rendered.duration_ms) + SYNTHESIS_GRACE;
        if tokio::time::timeout(wait, synth_rx.recv()).await.is_err() {
            warn!("no synthesis-ended signal, releasing speech span anyway");
        }

        ctx.emit(
            topics::SPEECH_SYNTHESIS_COMPLETED,
            Payload::SpeechSynthesisCompleted,
        )
        .await;
        ctx.emit(topics::SPEECH_ENDED, Payload::SpeechEnded).await;
    }

    async fn render_with_retry(
        &self,
        text: &str,
        out_path: &std::path::Path,
    ) -> Result<RenderedSpeech, clients::VoiceClientError> {
        let render = tokio::time::timeout(self.config.tts_timeout, self.tts.render(text, out_path));
        match render.await {
            Ok(Ok(rendered)) => return Ok(rendered),
            Ok(Err(e)) => warn!(error = %e, "tts render failed, retrying"),
            Err(_) => warn!("tts render timed out, retrying"),
        }

        tokio::time::sleep(EXTERNAL_RETRY_BACKOFF).await;
        match tokio::time::timeout(self.config.tts_timeout, self.tts.render(text, out_path)).await
        {
            Ok(result) => result,
            Err(_) => Err(clients::VoiceClientError::Unavailable {
                service: "tts".to_string(),
                message: format!("render exceeded {} ms", self.config.tts_timeout.as_millis()),
            }),
        }
    }

    /// Render DJ commentary between two tracks. One retry on transient
    /// failure; a miss is reported so the sequencer can fall back to a
    /// plain crossfade.
    async fn generate_commentary(
        &self,
        ctx: &Arc<ServiceContext>,
        prev_track: Track,
        next_track: Track,
    ) {
        let prompt = format!(
            "You're the cantina DJ. Give a one-sentence outro for \"{}\" and intro for \"{}\".",
            prev_track.title, next_track.title
        );

        let line = match tokio::time::timeout(self.config.llm_timeout, async {
            match self.llm.complete(&prompt).await {
                Ok(line) => Ok(line),
                Err(e) => {
                    warn!(error = %e, "commentary llm failed, retrying");
                    tokio::time::sleep(EXTERNAL_RETRY_BACKOFF).await;
                    self.llm.complete(&prompt).await
                }
            }
        })
        .await
        {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                ctx.emit(
                    topics::COMMENTARY_FAILED,
                    Payload::CommentaryFailed { reason: e.to_string() },
                )
                .await;
                return;
            }
            Err(_) => {
                ctx.emit(
                    topics::COMMENTARY_FAILED,
                    Payload::CommentaryFailed {
                        reason: "generation timed out".to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let out_path = self
            .config
            .speech_dir
            .join(format!("commentary_{}.wav", new_clip_id()));
        match self.render_with_retry(&line, &out_path).await {
            Ok(rendered) => {
                ctx.emit(
                    topics::COMMENTARY_READY,
                    Payload::CommentaryReady {
                        audio_ref: rendered.audio_ref,
                        duration_ms: rendered.duration_ms,
                    },
                )
                .await;
            }
            Err(e) => {
                ctx.emit(
                    topics::COMMENTARY_FAILED,
                    Payload::CommentaryFailed { reason: e.to_string() },
                )
                .await;
            }
        }
    }
}
