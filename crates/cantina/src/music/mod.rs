//! Music engine: library index, playback, ducking, crossfade, progress.
//!
//! Single writer of playback state. Everyone else reads via events: the
//! started/paused/resumed events carry a `start_wall_clock` anchor so
//! consumers interpolate position locally, with `/music/progress` as the
//! authoritative correction stream.

pub mod clock;
pub mod library;
pub mod output;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cantinabus::{Service, ServiceContext, ServiceError};
use cantinaproto::{topics, LogLevel, MusicCommand, Payload, Track};
use tracing::{debug, info, warn};

use clock::PlaybackClock;
use library::ScanConfig;
use output::AudioOutput;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const CROSSFADE_STEPS: u32 = 25;
const SPEECH_DRAIN_POLL: Duration = Duration::from_millis(50);
/// Guard against a wedged speech sink, not a duration bound.
const SPEECH_DRAIN_CAP: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackStatus {
    Stopped,
    Playing,
    Paused,
}

struct EngineState {
    library: Vec<Track>,
    current: Option<Track>,
    status: PlaybackStatus,
    clock: PlaybackClock,
    /// Un-ducked baseline volume.
    baseline: f64,
    /// Nested duck refcount; >=1 means ducked.
    duck_refs: u32,
    queue: VecDeque<Track>,
    crossfading: bool,
}

impl EngineState {
    fn applied_volume(&self, duck_factor: f64) -> f32 {
        let factor = if self.duck_refs > 0 { duck_factor } else { 1.0 };
        (self.baseline * factor) as f32
    }
}

/// Configuration for constructing the engine.
pub struct MusicEngineConfig {
    pub scan: ScanConfig,
    pub duck_factor: f64,
    pub baseline_volume: f64,
}

/// The music engine service.
pub struct MusicEngine {
    output: Arc<dyn AudioOutput>,
    config: MusicEngineConfig,
    state: Arc<Mutex<EngineState>>,
}

impl MusicEngine {
    pub fn new(output: Arc<dyn AudioOutput>, config: MusicEngineConfig) -> Self {
        let state = Arc::new(Mutex::new(EngineState {
            library: Vec::new(),
            current: None,
            status: PlaybackStatus::Stopped,
            clock: PlaybackClock::new(),
            baseline: config.baseline_volume.clamp(0.0, 1.0),
            duck_refs: 0,
            queue: VecDeque::new(),
            crossfading: false,
        }));
        Self {
            output,
            config,
            state,
        }
    }

    fn spawn_scan(&self, ctx: &Arc<ServiceContext>) {
        let scan_config = self.config.scan.clone();
        let state = Arc::clone(&self.state);
        let ctx = Arc::clone(ctx);
        ctx.clone().spawn(async move {
            let tracks = library::scan(scan_config).await;
            info!(count = tracks.len(), "music library indexed");
            state.lock().unwrap().library = tracks.clone();
            ctx.emit(topics::LIBRARY_UPDATED, Payload::LibraryUpdated { tracks })
                .await;
        });
    }

    fn spawn_progress_ticker(&self, ctx: &Arc<ServiceContext>) {
        let state = Arc::clone(&self.state);
        let output = Arc::clone(&self.output);
        let duck_factor = self.config.duck_factor;
        let ctx = Arc::clone(ctx);
        let cancel = ctx.cancel_token();
        ctx.clone().spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let mut emits = Vec::new();
                {
                    let mut state = state.lock().unwrap();
                    if state.status != PlaybackStatus::Playing {
                        continue;
                    }
                    let position = state.clock.position().as_secs_f64();
                    let duration = state.current.as_ref().and_then(|t| t.duration_seconds);

                    emits.push((
                        topics::MUSIC_PROGRESS,
                        Payload::Progress {
                            position_sec: position,
                            duration_sec: duration,
                            progress_pct: duration.map(|d| (position / d * 100.0).min(100.0)),
                        },
                    ));

                    // Natural end: the DJ sequencer usually transitions
                    // before this fires; outside DJ mode the queue advances
                    // or playback stops.
                    if let Some(duration) = duration {
                        if position >= duration && !state.crossfading {
                            emits.extend(advance_after_end(
                                &mut state,
                                output.as_ref(),
                                duck_factor,
                            ));
                        }
                    }
                }
                for (topic, payload) in emits {
                    ctx.emit(topic, payload).await;
                }
            }
        });
    }

    fn spawn_main_loop(&self, ctx: &Arc<ServiceContext>) {
        let mut command_rx = ctx.subscribe(topics::MUSIC_COMMAND);
        let mut duck_rx = ctx.subscribe(topics::MUSIC_DUCK);
        let mut unduck_rx = ctx.subscribe(topics::MUSIC_UNDUCK);
        let mut speech_started_rx = ctx.subscribe(topics::SPEECH_STARTED);
        let mut speech_ended_rx = ctx.subscribe(topics::SPEECH_ENDED);
        let mut speech_play_rx = ctx.subscribe(topics::SPEECH_PLAY);
        let mut status_rx = ctx.subscribe(topics::STATUS_REQUEST);

        let state = Arc::clone(&self.state);
        let output = Arc::clone(&self.output);
        let duck_factor = self.config.duck_factor;
        let scan_config = self.config.scan.clone();
        let ctx = Arc::clone(ctx);
        let cancel = ctx.cancel_token();

        ctx.clone().spawn(async move {
            loop {
                let emits: Vec<(&'static str, Payload)> = tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = command_rx.recv() => {
                        if let Payload::MusicCommand(command) = event.payload {
                            if matches!(command, MusicCommand::Rescan) {
                                let tracks = library::scan(scan_config.clone()).await;
                                state.lock().unwrap().library = tracks.clone();
                                vec![(topics::LIBRARY_UPDATED, Payload::LibraryUpdated { tracks })]
                            } else {
                                handle_command(&state, &output, duck_factor, command, &ctx)
                            }
                        } else {
                            Vec::new()
                        }
                    }
                    Some(_) = duck_rx.recv() => duck(&state, output.as_ref(), duck_factor, true),
                    Some(_) = unduck_rx.recv() => duck(&state, output.as_ref(), duck_factor, false),
                    Some(_) = speech_started_rx.recv() => duck(&state, output.as_ref(), duck_factor, true),
                    Some(_) = speech_ended_rx.recv() => duck(&state, output.as_ref(), duck_factor, false),
                    Some(event) = speech_play_rx.recv() => {
                        if let Payload::SpeechPlay { audio_ref } = event.payload {
                            play_speech(&ctx, &output, audio_ref);
                        }
                        Vec::new()
                    }
                    Some(_) = status_rx.recv() => {
                        ctx.emit_status(None).await;
                        Vec::new()
                    }
                    else => break,
                };
                for (topic, payload) in emits {
                    ctx.emit(topic, payload).await;
                }
            }
        });
    }
}

#[async_trait]
impl Service for MusicEngine {
    fn name(&self) -> &'static str {
        "music_engine"
    }

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        self.spawn_scan(ctx);
        self.spawn_progress_ticker(ctx);
        self.spawn_main_loop(ctx);
        Ok(())
    }

    async fn stop(&self, _ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        self.output.stop_music();
        Ok(())
    }
}

/// Apply one playback command. Returns the events to emit once the state
/// lock is released.
fn handle_command(
    state: &Arc<Mutex<EngineState>>,
    output: &Arc<dyn AudioOutput>,
    duck_factor: f64,
    command: MusicCommand,
    ctx: &Arc<ServiceContext>,
) -> Vec<(&'static str, Payload)> {
    let mut emits = Vec::new();
    let mut failure: Option<String> = None;

    // Crossfades spawn a ramp task, so they're handled outside the lock.
    let command = match command {
        MusicCommand::Crossfade { track_ref, duration_ms } => {
            return begin_crossfade(state, output, duck_factor, track_ref, duration_ms, ctx);
        }
        other => other,
    };

    {
        let mut state = state.lock().unwrap();
        match command {
            MusicCommand::Play { track_ref } => {
                match library::resolve(&state.library, &track_ref).cloned() {
                    Some(track) => emits.extend(start_track(
                        &mut state,
                        output.as_ref(),
                        duck_factor,
                        track,
                    )),
                    None => failure = Some(format!("no track matches {track_ref:?}")),
                }
            }
            MusicCommand::Pause => {
                if state.status == PlaybackStatus::Playing {
                    let offset = state.clock.pause();
                    output.pause_music();
                    state.status = PlaybackStatus::Paused;
                    emits.push((
                        topics::PLAYBACK_PAUSED,
                        Payload::PlaybackPaused {
                            paused_at_position_sec: offset.as_secs_f64(),
                        },
                    ));
                }
            }
            MusicCommand::Resume => {
                if state.status == PlaybackStatus::Paused {
                    let offset = state.clock.position();
                    state.clock.start_at(offset);
                    output.resume_music();
                    state.status = PlaybackStatus::Playing;
                    emits.push((
                        topics::PLAYBACK_RESUMED,
                        Payload::PlaybackResumed {
                            resume_position_sec: offset.as_secs_f64(),
                            start_wall_clock: state.clock.wall_anchor(),
                        },
                    ));
                }
            }
            MusicCommand::Stop => {
                emits.extend(stop_playback(&mut state, output.as_ref()));
            }
            MusicCommand::Next => {
                if let Some(next) = state.queue.pop_front() {
                    emits.push(queue_updated(&state));
                    emits.extend(start_track(
                        &mut state,
                        output.as_ref(),
                        duck_factor,
                        next,
                    ));
                }
                // Empty queue: the DJ sequencer reacts to this command when a
                // session is active; otherwise a no-op.
            }
            MusicCommand::Queue { track_ref } => {
                match library::resolve(&state.library, &track_ref).cloned() {
                    Some(track) => {
                        state.queue.push_back(track);
                        emits.push(queue_updated(&state));
                    }
                    None => failure = Some(format!("no track matches {track_ref:?}")),
                }
            }
            MusicCommand::Volume { level } => {
                state.baseline = level.clamp(0.0, 1.0);
                output.set_music_volume(state.applied_volume(duck_factor));
            }
            MusicCommand::Ambient => {
                if state.status == PlaybackStatus::Stopped && !state.library.is_empty() {
                    let pick = rand::Rng::gen_range(
                        &mut rand::thread_rng(),
                        0..state.library.len(),
                    );
                    let track = state.library[pick].clone();
                    emits.extend(start_track(
                        &mut state,
                        output.as_ref(),
                        duck_factor,
                        track,
                    ));
                }
            }
            MusicCommand::Crossfade { .. } | MusicCommand::Rescan => {
                unreachable!("handled by the caller")
            }
        }
    }

    if let Some(message) = failure {
        warn!(%message, "music command failed");
        emits.push((
            topics::SYSTEM_ERROR,
            Payload::SystemError {
                source: "music_engine".to_string(),
                message,
                severity: LogLevel::Warn,
            },
        ));
    }

    emits
}

fn start_track(
    state: &mut EngineState,
    output: &dyn AudioOutput,
    duck_factor: f64,
    track: Track,
) -> Vec<(&'static str, Payload)> {
    let volume = state.applied_volume(duck_factor);
    if let Err(e) = output.start_music(&track.filepath, volume) {
        return vec![(
            topics::SYSTEM_ERROR,
            Payload::SystemError {
                source: "music_engine".to_string(),
                message: e.to_string(),
                severity: LogLevel::Error,
            },
        )];
    }

    state.clock.start();
    state.status = PlaybackStatus::Playing;
    state.crossfading = false;
    state.current = Some(track.clone());

    vec![(
        topics::PLAYBACK_STARTED,
        Payload::PlaybackStarted {
            start_wall_clock: state.clock.wall_anchor(),
            duration_sec: track.duration_seconds,
            track,
        },
    )]
}

fn stop_playback(
    state: &mut EngineState,
    output: &dyn AudioOutput,
) -> Vec<(&'static str, Payload)> {
    if state.current.is_none() {
        return Vec::new();
    }
    output.stop_music();
    state.clock.stop();
    state.current = None;
    state.status = PlaybackStatus::Stopped;
    state.crossfading = false;
    vec![(topics::PLAYBACK_STOPPED, Payload::PlaybackStopped)]
}

fn queue_updated(state: &EngineState) -> (&'static str, Payload) {
    (
        topics::QUEUE_UPDATED,
        Payload::QueueUpdated {
            length: state.queue.len(),
            next_track: state.queue.front().cloned(),
        },
    )
}

/// Natural track end: advance the queue or stop.
fn advance_after_end(
    state: &mut EngineState,
    output: &dyn AudioOutput,
    duck_factor: f64,
) -> Vec<(&'static str, Payload)> {
    debug!("track reached its end");
    if let Some(next) = state.queue.pop_front() {
        let mut emits = vec![queue_updated(state)];
        emits.extend(start_track(state, output, duck_factor, next));
        emits
    } else {
        stop_playback(state, output)
    }
}

fn duck(
    state: &Arc<Mutex<EngineState>>,
    output: &dyn AudioOutput,
    duck_factor: f64,
    down: bool,
) -> Vec<(&'static str, Payload)> {
    let mut state = state.lock().unwrap();
    if down {
        state.duck_refs += 1;
    } else {
        state.duck_refs = state.duck_refs.saturating_sub(1);
    }
    output.set_music_volume(state.applied_volume(duck_factor));
    Vec::new()
}

/// Crossfade to the referenced track: the incoming track starts muted but
/// audible at t0, so its playback clock and wall anchor start now; volumes
/// ramp linearly and the outgoing sink stops at the end.
fn begin_crossfade(
    state_arc: &Arc<Mutex<EngineState>>,
    output: &Arc<dyn AudioOutput>,
    duck_factor: f64,
    track_ref: cantinaproto::TrackRef,
    duration_ms: u64,
    ctx: &Arc<ServiceContext>,
) -> Vec<(&'static str, Payload)> {
    let emits = {
        let mut state = state_arc.lock().unwrap();

        let Some(next) = library::resolve(&state.library, &track_ref).cloned() else {
            return vec![(
                topics::SYSTEM_ERROR,
                Payload::SystemError {
                    source: "music_engine".to_string(),
                    message: format!("no track matches {track_ref:?}"),
                    severity: LogLevel::Warn,
                },
            )];
        };

        let Some(from) = state.current.clone() else {
            // Nothing playing: a crossfade degenerates to a plain play.
            return start_track(&mut state, output.as_ref(), duck_factor, next);
        };

        // A crossfade into the queued head consumes it.
        let mut queue_emit = None;
        if state.queue.front().map(|t| &t.track_id) == Some(&next.track_id) {
            state.queue.pop_front();
            queue_emit = Some(queue_updated(&state));
        }

        if let Err(e) = output.start_incoming(&next.filepath) {
            return vec![(
                topics::SYSTEM_ERROR,
                Payload::SystemError {
                    source: "music_engine".to_string(),
                    message: e.to_string(),
                    severity: LogLevel::Error,
                },
            )];
        }

        state.clock.start();
        state.status = PlaybackStatus::Playing;
        state.crossfading = true;
        state.current = Some(next.clone());

        let mut emits = Vec::new();
        if let Some(emit) = queue_emit {
            emits.push(emit);
        }
        emits.extend([
            (
                topics::CROSSFADE_STARTED,
                Payload::CrossfadeStarted {
                    from,
                    to: next.clone(),
                    duration_ms,
                },
            ),
            (
                topics::PLAYBACK_STARTED,
                Payload::PlaybackStarted {
                    start_wall_clock: state.clock.wall_anchor(),
                    duration_sec: next.duration_seconds,
                    track: next,
                },
            ),
        ]);
        emits
    };

    spawn_crossfade_ramp(ctx, state_arc, output, duration_ms, duck_factor);
    emits
}

fn spawn_crossfade_ramp(
    ctx: &Arc<ServiceContext>,
    state: &Arc<Mutex<EngineState>>,
    output: &Arc<dyn AudioOutput>,
    duration_ms: u64,
    duck_factor: f64,
) {
    let state = Arc::clone(state);
    let output = Arc::clone(output);
    let cancel = ctx.cancel_token();
    ctx.spawn(async move {
        let step = Duration::from_millis((duration_ms / CROSSFADE_STEPS as u64).max(10));
        for i in 1..=CROSSFADE_STEPS {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(step) => {}
            }
            let applied = state.lock().unwrap().applied_volume(duck_factor);
            let t = i as f32 / CROSSFADE_STEPS as f32;
            // Outgoing rides the primary slot until promotion.
            output.set_music_volume(applied * (1.0 - t));
            output.set_incoming_volume(applied * t);
        }

        output.promote_incoming();
        let applied = {
            let mut state = state.lock().unwrap();
            state.crossfading = false;
            state.applied_volume(duck_factor)
        };
        output.set_music_volume(applied);
    });
}

fn play_speech(ctx: &Arc<ServiceContext>, output: &Arc<dyn AudioOutput>, audio_ref: PathBuf) {
    let ctx = Arc::clone(ctx);
    let output = Arc::clone(output);
    ctx.clone().spawn(async move {
        if let Err(e) = output.start_speech(&audio_ref) {
            warn!(error = %e, "speech playback failed");
            ctx.emit(topics::SPEECH_SYNTHESIS_ENDED, Payload::SpeechSynthesisEnded)
                .await;
            return;
        }

        let deadline = tokio::time::Instant::now() + SPEECH_DRAIN_CAP;
        loop {
            if output.speech_finished() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("speech drain cap reached");
                break;
            }
            tokio::time::sleep(SPEECH_DRAIN_POLL).await;
        }

        ctx.emit(topics::SPEECH_SYNTHESIS_ENDED, Payload::SpeechSynthesisEnded)
            .await;
    });
}
