//! DJ session scenarios: transition timing, commentary fallback, forced
//! next, yield-to-user, and the one-pending-transition invariant.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cantina::dj::DjSequencer;
use cantina::music::library::ScanConfig;
use cantina::music::{MusicEngine, MusicEngineConfig};
use cantina::voice::clients::fakes::{FailingLlm, ScriptedLlm, ScriptedStt, ScriptedTts};
use cantina::voice::{VoiceCoordinator, VoicePipelineConfig};
use cantinabus::testing::BusSpy;
use cantinabus::{EventBus, ServiceHandle};
use cantinaproto::{topics, DjCommand, DjSettings, MusicCommand, Payload, TrackRef};
use common::RecordingOutput;
use pretty_assertions::assert_eq;

struct Rig {
    bus: Arc<EventBus>,
    handles: Vec<ServiceHandle>,
    _dir: tempfile::TempDir,
}

impl Rig {
    async fn stop(self) {
        for handle in self.handles.iter().rev() {
            handle.stop().await;
        }
    }
}

fn dj_settings() -> DjSettings {
    DjSettings {
        auto_transition: true,
        crossfade_sec: 5.0,
        commentary_lead_sec: 10.0,
        interval_sec: None,
    }
}

/// Engine + sequencer + voice coordinator over a seeded library of 30 s
/// tracks. `llm_fails` controls whether commentary generation can succeed.
async fn rig(llm_fails: bool) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let music_dir = dir.path().join("music");
    let cache_path = dir.path().join(".library_cache.json");
    common::seed_library(
        &music_dir,
        &cache_path,
        &[("alpha", 30.0), ("beta", 30.0), ("gamma", 30.0), ("delta", 30.0)],
    );

    let bus = Arc::new(EventBus::new());
    let library_spy = BusSpy::watch(&bus, &[topics::LIBRARY_UPDATED]);

    let engine = MusicEngine::new(
        { let o: Arc<dyn cantina::music::output::AudioOutput> = RecordingOutput::new(); o },
        MusicEngineConfig {
            scan: ScanConfig {
                music_dir,
                cache_path: Some(cache_path),
                probe_timeout: Duration::from_millis(100),
            },
            duck_factor: 0.2,
            baseline_volume: 0.8,
        },
    );
    let engine_handle = ServiceHandle::new(Arc::new(engine), Arc::clone(&bus));
    engine_handle.start().await.unwrap();
    library_spy.wait_for_topic(topics::LIBRARY_UPDATED).await;

    let llm: Arc<dyn cantina::voice::clients::LlmClient> = if llm_fails {
        Arc::new(FailingLlm)
    } else {
        Arc::new(ScriptedLlm::replying("That was alpha, up next beta!"))
    };
    let voice = VoiceCoordinator::new(
        Arc::new(ScriptedStt::new(vec![])),
        llm,
        Arc::new(ScriptedTts::new(800)),
        VoicePipelineConfig {
            llm_timeout: Duration::from_secs(20),
            tts_timeout: Duration::from_secs(15),
            stt_idle_close: Duration::from_secs(3),
            canned_apology: "oops".to_string(),
            speech_dir: dir.path().join("speech"),
        },
    );
    let voice_handle = ServiceHandle::new(Arc::new(voice), Arc::clone(&bus));
    voice_handle.start().await.unwrap();

    let dj = DjSequencer::new(dj_settings());
    let dj_handle = ServiceHandle::new(Arc::new(dj), Arc::clone(&bus));
    dj_handle.start().await.unwrap();

    Rig {
        bus,
        handles: vec![engine_handle, voice_handle, dj_handle],
        _dir: dir,
    }
}

async fn start_session(rig: &Rig) {
    rig.bus
        .emit(
            topics::DJ_COMMAND,
            "test",
            Payload::DjCommand(DjCommand::Start { settings: dj_settings() }),
        )
        .await;
}

#[tokio::test(start_paused = true)]
async fn failed_commentary_still_transitions_on_time() {
    let rig = rig(true).await;
    let spy = BusSpy::watch(
        &rig.bus,
        &[
            topics::PLAYBACK_STARTED,
            topics::DJ_QUEUE_UPDATE,
            topics::COMMENTARY_REQUEST,
            topics::COMMENTARY_FAILED,
            topics::COMMENTARY_READY,
            topics::CROSSFADE_STARTED,
            topics::DJ_TRANSITION,
        ],
    );

    start_session(&rig).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;
    spy.wait_for_topic(topics::DJ_QUEUE_UPDATE).await;

    // Commentary requested at lead time, fails, and the transition fires
    // at track_end - crossfade anyway (30 - 5 = 25 s in).
    spy.wait_for_topic(topics::COMMENTARY_REQUEST).await;
    spy.wait_for_topic(topics::COMMENTARY_FAILED).await;

    spy.wait_for_topic(topics::CROSSFADE_STARTED).await;
    let transition = spy.wait_for_topic(topics::DJ_TRANSITION).await;
    match transition.payload {
        Payload::DjTransition { with_commentary, .. } => assert!(!with_commentary),
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(spy.count(topics::COMMENTARY_READY), 0);

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ready_commentary_plays_before_the_crossfade() {
    let rig = rig(false).await;
    let spy = BusSpy::watch(
        &rig.bus,
        &[
            topics::PLAYBACK_STARTED,
            topics::COMMENTARY_READY,
            topics::MUSIC_DUCK,
            topics::MUSIC_UNDUCK,
            topics::SPEECH_PLAY,
            topics::CROSSFADE_STARTED,
            topics::DJ_TRANSITION,
        ],
    );

    start_session(&rig).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;
    spy.wait_for_topic(topics::COMMENTARY_READY).await;

    let transition = spy.wait_for_topic(topics::DJ_TRANSITION).await;
    match transition.payload {
        Payload::DjTransition { with_commentary, .. } => assert!(with_commentary),
        other => panic!("unexpected payload {other:?}"),
    }

    // Duck → clip → unduck → crossfade, in that order.
    let events = spy.events();
    let index_of = |topic: &str| events.iter().position(|e| e.topic == topic).unwrap();
    assert!(index_of(topics::MUSIC_DUCK) < index_of(topics::SPEECH_PLAY));
    assert!(index_of(topics::SPEECH_PLAY) < index_of(topics::MUSIC_UNDUCK));
    assert!(index_of(topics::MUSIC_UNDUCK) < index_of(topics::CROSSFADE_STARTED));

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn at_most_one_pending_transition_per_track() {
    let rig = rig(true).await;
    let spy = BusSpy::watch(&rig.bus, &[topics::PLAYBACK_STARTED, topics::DJ_TRANSITION]);

    start_session(&rig).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;

    // Run across two full track spans.
    tokio::time::sleep(Duration::from_secs(55)).await;

    let transitions = spy.count(topics::DJ_TRANSITION);
    let starts = spy.count(topics::PLAYBACK_STARTED);
    assert!(
        transitions <= starts,
        "each transition needs a distinct started track ({transitions} vs {starts})"
    );
    assert!(transitions >= 1, "the session does transition");

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dj_next_forces_an_immediate_crossfade() {
    let rig = rig(true).await;
    let spy = BusSpy::watch(
        &rig.bus,
        &[topics::PLAYBACK_STARTED, topics::CROSSFADE_STARTED, topics::DJ_TRANSITION],
    );

    start_session(&rig).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;

    // Force well before the scheduled 25 s point.
    tokio::time::sleep(Duration::from_secs(2)).await;
    rig.bus
        .emit(topics::DJ_COMMAND, "test", Payload::DjCommand(DjCommand::Next))
        .await;

    spy.wait_for_topic(topics::CROSSFADE_STARTED).await;
    spy.wait_for_topic(topics::DJ_TRANSITION).await;

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn user_play_yields_and_replans() {
    let rig = rig(true).await;
    let spy = BusSpy::watch(
        &rig.bus,
        &[topics::PLAYBACK_STARTED, topics::DJ_QUEUE_UPDATE, topics::LIBRARY_UPDATED],
    );

    start_session(&rig).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;

    // The user cuts in with an explicit play of a specific track.
    spy.clear();
    rig.bus
        .emit(
            topics::MUSIC_COMMAND,
            "cli",
            Payload::MusicCommand(MusicCommand::Play {
                track_ref: TrackRef::Name { name: "delta".into() },
            }),
        )
        .await;

    let started = spy.wait_for_topic(topics::PLAYBACK_STARTED).await;
    match started.payload {
        Payload::PlaybackStarted { track, .. } => assert_eq!(track.title, "delta"),
        other => panic!("unexpected payload {other:?}"),
    }
    // The sequencer adopts the user's track and plans its follow-up.
    spy.wait_for_topic(topics::DJ_QUEUE_UPDATE).await;

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stopping_the_session_stops_transitions() {
    let rig = rig(true).await;
    let spy = BusSpy::watch(&rig.bus, &[topics::PLAYBACK_STARTED, topics::DJ_TRANSITION]);

    start_session(&rig).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;

    rig.bus
        .emit(topics::DJ_COMMAND, "test", Payload::DjCommand(DjCommand::Stop))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    spy.clear();

    // Well past where the transition would have fired.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(spy.count(topics::DJ_TRANSITION), 0);

    rig.stop().await;
}
