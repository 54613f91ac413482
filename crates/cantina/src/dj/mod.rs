//! DJ auto-sequencer: track picking, commentary scheduling, and timeline
//! execution.
//!
//! One session at a time, at most one pending transition. The sequencer
//! plans from every `playback_started` it sees, which also makes it yield
//! to user-initiated plays: an unexpected started event simply replaces the
//! plan. Commentary that misses its window forfeits; music never stalls on
//! the LLM.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cantinabus::{Service, ServiceContext, ServiceError};
use cantinaproto::{
    topics, DjCommand, DjSettings, MusicCommand, Payload, Track, TrackRef,
};
use futures::future::Either;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How many recent plays the pick excludes: min(this cap, library/2).
const HISTORY_EXCLUDE_CAP: usize = 8;
/// History ring bound; only the exclusion window of it is consulted.
const HISTORY_LEN: usize = 16;
/// Failsafe slack when waiting out commentary playback.
const COMMENTARY_PLAYBACK_GRACE: Duration = Duration::from_secs(2);

pub struct DjSequencer {
    defaults: DjSettings,
}

impl DjSequencer {
    pub fn new(defaults: DjSettings) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl Service for DjSequencer {
    fn name(&self) -> &'static str {
        "dj_sequencer"
    }

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        let mut command_rx = ctx.subscribe(topics::DJ_COMMAND);
        let mut started_rx = ctx.subscribe(topics::PLAYBACK_STARTED);
        let mut stopped_rx = ctx.subscribe(topics::PLAYBACK_STOPPED);
        let mut paused_rx = ctx.subscribe(topics::PLAYBACK_PAUSED);
        let mut resumed_rx = ctx.subscribe(topics::PLAYBACK_RESUMED);
        let mut ready_rx = ctx.subscribe(topics::COMMENTARY_READY);
        let mut failed_rx = ctx.subscribe(topics::COMMENTARY_FAILED);
        let mut library_rx = ctx.subscribe(topics::LIBRARY_UPDATED);
        let mut queue_rx = ctx.subscribe(topics::QUEUE_UPDATED);
        let mut music_cmd_rx = ctx.subscribe(topics::MUSIC_COMMAND);
        let mut synth_rx = ctx.subscribe(topics::SPEECH_SYNTHESIS_ENDED);
        let mut status_rx = ctx.subscribe(topics::STATUS_REQUEST);

        let defaults = self.defaults.clone();
        let ctx = Arc::clone(ctx);
        let cancel = ctx.cancel_token();

        ctx.clone().spawn(async move {
            let mut seq = Sequencer::new(defaults);
            loop {
                let commentary_timer = maybe_sleep(seq.commentary_deadline);
                let transition_timer = maybe_sleep(seq.transition_deadline);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = commentary_timer => seq.request_commentary(&ctx).await,
                    _ = transition_timer => seq.deadline_fired(&ctx).await,
                    Some(event) = command_rx.recv() => {
                        if let Payload::DjCommand(command) = event.payload {
                            seq.handle_command(&ctx, command).await;
                        }
                    }
                    Some(event) = started_rx.recv() => {
                        if let Payload::PlaybackStarted { track, start_wall_clock, duration_sec } = event.payload {
                            seq.playback_started(&ctx, track, start_wall_clock, duration_sec).await;
                        }
                    }
                    Some(_) = stopped_rx.recv() => seq.playback_stopped(&ctx).await,
                    Some(event) = paused_rx.recv() => {
                        if let Payload::PlaybackPaused { .. } = event.payload {
                            seq.playback_paused();
                        }
                    }
                    Some(event) = resumed_rx.recv() => {
                        if let Payload::PlaybackResumed { resume_position_sec, .. } = event.payload {
                            seq.playback_resumed(resume_position_sec);
                        }
                    }
                    Some(event) = ready_rx.recv() => {
                        if let Payload::CommentaryReady { audio_ref, duration_ms } = event.payload {
                            seq.commentary_ready(audio_ref, duration_ms);
                        }
                    }
                    Some(_) = failed_rx.recv() => seq.commentary_failed(),
                    Some(event) = library_rx.recv() => {
                        if let Payload::LibraryUpdated { tracks } = event.payload {
                            seq.library_updated(&ctx, tracks).await;
                        }
                    }
                    Some(event) = queue_rx.recv() => {
                        if let Payload::QueueUpdated { next_track, .. } = event.payload {
                            seq.queue_head = next_track;
                        }
                    }
                    Some(event) = music_cmd_rx.recv() => {
                        if let Payload::MusicCommand(MusicCommand::Next) = event.payload {
                            seq.user_next(&ctx).await;
                        }
                    }
                    Some(_) = synth_rx.recv() => seq.synthesis_ended(&ctx).await,
                    Some(_) = status_rx.recv() => {
                        let detail = seq.session.as_ref().map(|_| "session active".to_string());
                        ctx.emit_status(detail).await;
                    }
                    else => break,
                }
            }
        });
        Ok(())
    }
}

fn maybe_sleep(
    deadline: Option<Instant>,
) -> Either<tokio::time::Sleep, futures::future::Pending<()>> {
    match deadline {
        Some(deadline) => Either::Left(tokio::time::sleep_until(deadline)),
        None => Either::Right(futures::future::pending()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CommentaryState {
    Idle,
    Requested,
    Ready {
        audio_ref: std::path::PathBuf,
        duration_ms: u64,
    },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the transition deadline (or manual next).
    Scheduled,
    /// Commentary clip is playing; crossfade follows its end.
    PlayingCommentary,
}

struct Session {
    settings: DjSettings,
    current: Option<Track>,
    planned_next: Option<Track>,
    commentary: CommentaryState,
    phase: Phase,
    history: VecDeque<String>,
}

struct Sequencer {
    defaults: DjSettings,
    session: Option<Session>,
    library: Vec<Track>,
    queue_head: Option<Track>,
    commentary_deadline: Option<Instant>,
    transition_deadline: Option<Instant>,
    rescan_requested: bool,
}

impl Sequencer {
    fn new(defaults: DjSettings) -> Self {
        Self {
            defaults,
            session: None,
            library: Vec::new(),
            queue_head: None,
            commentary_deadline: None,
            transition_deadline: None,
            rescan_requested: false,
        }
    }

    fn clear_deadlines(&mut self) {
        self.commentary_deadline = None;
        self.transition_deadline = None;
    }

    async fn handle_command(&mut self, ctx: &Arc<ServiceContext>, command: DjCommand) {
        match command {
            DjCommand::Start { settings } => {
                if self.session.is_some() {
                    debug!("dj session already active");
                    return;
                }
                info!(?settings, "dj session started");
                self.rescan_requested = false;
                self.session = Some(Session {
                    settings,
                    current: None,
                    planned_next: None,
                    commentary: CommentaryState::Idle,
                    phase: Phase::Scheduled,
                    history: VecDeque::new(),
                });
                // Open with a fresh pick; an already-playing track is
                // replaced and the session plans from the resulting
                // playback_started.
                self.kickoff(ctx).await;
            }
            DjCommand::Stop => {
                if self.session.take().is_some() {
                    info!("dj session stopped");
                }
                self.clear_deadlines();
            }
            DjCommand::Next => self.force_next(ctx).await,
            DjCommand::UpdateSettings {
                auto_transition,
                crossfade_sec,
                commentary_lead_sec,
            } => {
                let targets: Vec<&mut DjSettings> = match &mut self.session {
                    Some(session) => vec![&mut session.settings, &mut self.defaults],
                    None => vec![&mut self.defaults],
                };
                for settings in targets {
                    if let Some(auto) = auto_transition {
                        settings.auto_transition = auto;
                    }
                    if let Some(secs) = crossfade_sec {
                        settings.crossfade_sec = secs;
                    }
                    if let Some(secs) = commentary_lead_sec {
                        settings.commentary_lead_sec = secs;
                    }
                }
            }
        }
    }

    /// Start playback for a fresh session when nothing is playing.
    async fn kickoff(&mut self, ctx: &Arc<ServiceContext>) {
        let Some(session) = &self.session else { return };
        if session.current.is_some() {
            return;
        }
        if self.library.is_empty() {
            // The index may have been announced before this service
            // subscribed; ask for a fresh one (once) and plan when it lands.
            if !self.rescan_requested {
                self.rescan_requested = true;
                ctx.emit(
                    topics::MUSIC_COMMAND,
                    Payload::MusicCommand(MusicCommand::Rescan),
                )
                .await;
            }
            return;
        }
        if let Some(track) = self.pick_next(None) {
            ctx.emit(
                topics::MUSIC_COMMAND,
                Payload::MusicCommand(MusicCommand::Play {
                    track_ref: TrackRef::Id { id: track.track_id.clone() },
                }),
            )
            .await;
        } else {
            debug!("dj session idling until the library has playable tracks");
        }
    }

    /// Every started track (ours or user-initiated) replaces the plan:
    /// cancel pending work, record history, pick the follow-up, schedule.
    async fn playback_started(
        &mut self,
        ctx: &Arc<ServiceContext>,
        track: Track,
        start_wall_clock: f64,
        duration_sec: Option<f64>,
    ) {
        if self.session.is_none() {
            return;
        }
        self.clear_deadlines();

        let Some(session) = self.session.as_mut() else { return };
        session.phase = Phase::Scheduled;
        session.commentary = CommentaryState::Idle;
        session.current = Some(track.clone());
        session.history.push_back(track.track_id.clone());
        while session.history.len() > HISTORY_LEN {
            session.history.pop_front();
        }

        let next = self.pick_next(Some(&track));
        let Some(session) = &mut self.session else { return };
        session.planned_next = next.clone();
        if let Some(next) = &next {
            ctx.emit(
                topics::DJ_QUEUE_UPDATE,
                Payload::DjQueueUpdate { next_track: next.clone() },
            )
            .await;
        }

        if !session.settings.auto_transition {
            return;
        }

        // Transition at the earlier of track end and the optional interval
        // cap, minus the crossfade overlap.
        let play_span = match (duration_sec, session.settings.interval_sec) {
            (Some(duration), Some(interval)) => Some(duration.min(interval)),
            (Some(duration), None) => Some(duration),
            (None, Some(interval)) => Some(interval),
            (None, None) => {
                debug!(title = %track.title, "unknown duration, no transition scheduled");
                None
            }
        };
        let Some(play_span) = play_span else { return };

        let elapsed = (cantinaproto::wall_clock_secs() - start_wall_clock).max(0.0);
        let until_transition =
            (play_span - session.settings.crossfade_sec - elapsed).max(0.0);
        let transition_at = Instant::now() + Duration::from_secs_f64(until_transition);
        self.transition_deadline = Some(transition_at);

        let lead = Duration::from_secs_f64(session.settings.commentary_lead_sec.max(0.0));
        self.commentary_deadline = Some(transition_at.checked_sub(lead).unwrap_or_else(Instant::now));

        debug!(
            title = %track.title,
            in_secs = until_transition,
            "transition scheduled"
        );
    }

    fn playback_paused(&mut self) {
        if self.session.is_some() {
            self.clear_deadlines();
        }
    }

    fn playback_resumed(&mut self, resume_position_sec: f64) {
        let Some(session) = &self.session else { return };
        if !session.settings.auto_transition {
            return;
        }
        let Some(current) = &session.current else { return };

        let play_span = match (current.duration_seconds, session.settings.interval_sec) {
            (Some(duration), Some(interval)) => duration.min(interval),
            (Some(duration), None) => duration,
            (None, Some(interval)) => interval,
            (None, None) => return,
        };
        let remaining =
            (play_span - session.settings.crossfade_sec - resume_position_sec).max(0.0);
        let transition_at = Instant::now() + Duration::from_secs_f64(remaining);
        self.transition_deadline = Some(transition_at);
        let lead = Duration::from_secs_f64(session.settings.commentary_lead_sec.max(0.0));
        self.commentary_deadline = Some(transition_at.checked_sub(lead).unwrap_or_else(Instant::now));
    }

    /// Unexpected stop while a session is active: restart with a fresh pick.
    async fn playback_stopped(&mut self, ctx: &Arc<ServiceContext>) {
        if self.session.is_none() {
            return;
        }
        warn!("playback stopped during dj session, restarting with a fresh pick");
        self.clear_deadlines();
        if let Some(session) = &mut self.session {
            session.current = None;
            session.commentary = CommentaryState::Idle;
            session.phase = Phase::Scheduled;
        }
        self.kickoff(ctx).await;
    }

    async fn library_updated(&mut self, ctx: &Arc<ServiceContext>, tracks: Vec<Track>) {
        self.library = tracks;
        // A session started against an empty library idles until now.
        self.kickoff(ctx).await;
    }

    async fn request_commentary(&mut self, ctx: &Arc<ServiceContext>) {
        self.commentary_deadline = None;
        let Some(session) = &mut self.session else { return };
        let (Some(prev), Some(next)) = (session.current.clone(), session.planned_next.clone())
        else {
            return;
        };
        session.commentary = CommentaryState::Requested;
        ctx.emit(
            topics::COMMENTARY_REQUEST,
            Payload::CommentaryRequest { prev_track: prev, next_track: next },
        )
        .await;
    }

    fn commentary_ready(&mut self, audio_ref: std::path::PathBuf, duration_ms: u64) {
        if let Some(session) = &mut self.session {
            if session.commentary == CommentaryState::Requested {
                session.commentary = CommentaryState::Ready { audio_ref, duration_ms };
            }
        }
    }

    fn commentary_failed(&mut self) {
        if let Some(session) = &mut self.session {
            if session.commentary == CommentaryState::Requested {
                session.commentary = CommentaryState::Failed;
            }
        }
    }

    /// A deadline fired: either the scheduled transition, or the failsafe
    /// on commentary playback.
    async fn deadline_fired(&mut self, ctx: &Arc<ServiceContext>) {
        self.transition_deadline = None;
        let Some(session) = &mut self.session else { return };

        match session.phase {
            Phase::Scheduled => {
                // Commentary ready in time plays first; a miss forfeits.
                if let CommentaryState::Ready { audio_ref, duration_ms } =
                    session.commentary.clone()
                {
                    session.phase = Phase::PlayingCommentary;
                    self.transition_deadline = Some(
                        Instant::now()
                            + Duration::from_millis(duration_ms)
                            + COMMENTARY_PLAYBACK_GRACE,
                    );
                    ctx.emit(topics::MUSIC_DUCK, Payload::Duck).await;
                    ctx.emit(
                        topics::SPEECH_PLAY,
                        Payload::SpeechPlay { audio_ref },
                    )
                    .await;
                } else {
                    if session.commentary == CommentaryState::Requested {
                        debug!("commentary missed the window, transitioning without it");
                    }
                    self.crossfade(ctx, false).await;
                }
            }
            Phase::PlayingCommentary => {
                warn!("commentary playback overran, forcing the crossfade");
                ctx.emit(topics::MUSIC_UNDUCK, Payload::Unduck).await;
                self.crossfade(ctx, true).await;
            }
        }
    }

    /// Commentary clip finished on the speech slot.
    async fn synthesis_ended(&mut self, ctx: &Arc<ServiceContext>) {
        let Some(session) = &self.session else { return };
        if session.phase != Phase::PlayingCommentary {
            return;
        }
        self.transition_deadline = None;
        ctx.emit(topics::MUSIC_UNDUCK, Payload::Unduck).await;
        self.crossfade(ctx, true).await;
    }

    /// Forced `dj next`: cancel any pending commentary and go now.
    async fn force_next(&mut self, ctx: &Arc<ServiceContext>) {
        let Some(session) = &mut self.session else { return };
        if session.phase == Phase::PlayingCommentary {
            ctx.emit(topics::MUSIC_UNDUCK, Payload::Unduck).await;
        }
        session.commentary = CommentaryState::Idle;
        session.phase = Phase::Scheduled;
        self.clear_deadlines();
        self.crossfade(ctx, false).await;
    }

    /// A user `next` with an empty queue acts as `dj next` while a session
    /// is active; with a queued track the engine already handled it.
    async fn user_next(&mut self, ctx: &Arc<ServiceContext>) {
        if self.session.is_some() && self.queue_head.is_none() {
            self.force_next(ctx).await;
        }
    }

    async fn crossfade(&mut self, ctx: &Arc<ServiceContext>, with_commentary: bool) {
        let Some(session) = &mut self.session else { return };
        let Some(prev) = session.current.clone() else { return };

        let next = match session.planned_next.take() {
            Some(next) => next,
            None => match self.pick_next(Some(&prev)) {
                Some(next) => next,
                None => {
                    warn!("no playable next track, staying on the current one");
                    return;
                }
            },
        };
        // Re-borrow: pick_next needed &self.
        let Some(session) = &mut self.session else { return };
        session.phase = Phase::Scheduled;
        session.commentary = CommentaryState::Idle;

        let crossfade_ms = (session.settings.crossfade_sec * 1000.0) as u64;
        ctx.emit(
            topics::MUSIC_COMMAND,
            Payload::MusicCommand(MusicCommand::Crossfade {
                track_ref: TrackRef::Id { id: next.track_id.clone() },
                duration_ms: crossfade_ms,
            }),
        )
        .await;
        ctx.emit(
            topics::DJ_TRANSITION,
            Payload::DjTransition {
                prev,
                next,
                with_commentary,
            },
        )
        .await;
    }

    /// Prefer the queued head; otherwise uniform-random over the library
    /// excluding recent plays and tracks without a known duration.
    fn pick_next(&self, current: Option<&Track>) -> Option<Track> {
        if let Some(queued) = &self.queue_head {
            return Some(queued.clone());
        }

        let exclude_n = HISTORY_EXCLUDE_CAP.min(self.library.len() / 2);
        let recent: Vec<&String> = self
            .session
            .as_ref()
            .map(|s| s.history.iter().rev().take(exclude_n).collect())
            .unwrap_or_default();

        let eligible: Vec<&Track> = self
            .library
            .iter()
            .filter(|t| t.duration_seconds.is_some())
            .filter(|t| !recent.iter().any(|id| **id == t.track_id))
            .filter(|t| current.map(|c| c.track_id != t.track_id).unwrap_or(true))
            .collect();

        let pool: Vec<&Track> = if eligible.is_empty() {
            // Small libraries: relax the history exclusion rather than stall.
            self.library
                .iter()
                .filter(|t| t.duration_seconds.is_some())
                .filter(|t| current.map(|c| c.track_id != t.track_id).unwrap_or(true))
                .collect()
        } else {
            eligible
        };

        pool.choose(&mut rand::thread_rng()).map(|t| (*t).clone())
    }
}
