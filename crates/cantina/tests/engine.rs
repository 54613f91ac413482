//! Music engine behavior against the real bus: playback lifecycle, the
//! progress clock, ducking, queueing, and crossfades.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cantina::music::library::ScanConfig;
use cantina::music::{MusicEngine, MusicEngineConfig};
use cantinabus::testing::BusSpy;
use cantinabus::{EventBus, ServiceHandle};
use cantinaproto::{topics, MusicCommand, Payload, Track, TrackRef};
use common::{OutputEvent, RecordingOutput};
use pretty_assertions::assert_eq;

struct Rig {
    bus: Arc<EventBus>,
    output: Arc<RecordingOutput>,
    handle: ServiceHandle,
    tracks: Vec<Track>,
    _dir: tempfile::TempDir,
}

/// Start an engine over a seeded library and wait for the index.
async fn rig(tracks: &[(&str, f64)]) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let music_dir = dir.path().join("music");
    let cache_path = dir.path().join(".library_cache.json");
    common::seed_library(&music_dir, &cache_path, tracks);

    let bus = Arc::new(EventBus::new());
    let spy = BusSpy::watch(&bus, &[topics::LIBRARY_UPDATED]);

    let output = RecordingOutput::new();
    let engine = MusicEngine::new(
        { let o: Arc<dyn cantina::music::output::AudioOutput> = output.clone(); o },
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
    let handle = ServiceHandle::new(Arc::new(engine), Arc::clone(&bus));
    handle.start().await.unwrap();

    let event = spy.wait_for_topic(topics::LIBRARY_UPDATED).await;
    let tracks = match event.payload {
        Payload::LibraryUpdated { tracks } => tracks,
        other => panic!("unexpected payload {other:?}"),
    };

    Rig {
        bus,
        output,
        handle,
        tracks,
        _dir: dir,
    }
}

async fn send(rig: &Rig, command: MusicCommand) {
    rig.bus
        .emit(topics::MUSIC_COMMAND, "test", Payload::MusicCommand(command))
        .await;
}

fn by_id(track: &Track) -> TrackRef {
    TrackRef::Id {
        id: track.track_id.clone(),
    }
}

#[tokio::test]
async fn library_scan_reads_cached_durations() {
    let rig = rig(&[("alpha", 120.0), ("beta", 95.5)]).await;
    assert_eq!(rig.tracks.len(), 2);
    assert_eq!(rig.tracks[0].title, "alpha");
    assert_eq!(rig.tracks[0].duration_seconds, Some(120.0));
    assert_eq!(rig.tracks[1].duration_seconds, Some(95.5));
    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn pause_resume_keeps_the_position_math() {
    let rig = rig(&[("longtrack", 180.0)]).await;
    let spy = BusSpy::watch(
        &rig.bus,
        &[
            topics::PLAYBACK_STARTED,
            topics::PLAYBACK_PAUSED,
            topics::PLAYBACK_RESUMED,
            topics::MUSIC_PROGRESS,
        ],
    );

    send(&rig, MusicCommand::Play { track_ref: by_id(&rig.tracks[0]) }).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    send(&rig, MusicCommand::Pause).await;
    let paused = spy.wait_for_topic(topics::PLAYBACK_PAUSED).await;
    match paused.payload {
        Payload::PlaybackPaused { paused_at_position_sec } => {
            assert!((paused_at_position_sec - 30.0).abs() < 1.1);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    send(&rig, MusicCommand::Resume).await;
    let resumed = spy.wait_for_topic(topics::PLAYBACK_RESUMED).await;
    let resume_position = match resumed.payload {
        Payload::PlaybackResumed { resume_position_sec, .. } => resume_position_sec,
        other => panic!("unexpected payload {other:?}"),
    };
    assert!((resume_position - 30.0).abs() < 1.1);

    spy.clear();
    tokio::time::sleep(Duration::from_secs(20)).await;

    // The newest progress correction lands on resume_position + 20.
    let progress = spy.payloads(topics::MUSIC_PROGRESS);
    let last = progress.last().expect("progress while playing");
    match last {
        Payload::Progress { position_sec, duration_sec, .. } => {
            assert!(
                (position_sec - (resume_position + 20.0)).abs() < 1.5,
                "position {position_sec} after resume"
            );
            assert_eq!(*duration_sec, Some(180.0));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    rig.handle.stop().await;
}

#[tokio::test]
async fn duplicate_pause_is_a_noop() {
    let rig = rig(&[("alpha", 100.0)]).await;
    let spy = BusSpy::watch(&rig.bus, &[topics::PLAYBACK_STARTED, topics::PLAYBACK_PAUSED]);

    send(&rig, MusicCommand::Play { track_ref: by_id(&rig.tracks[0]) }).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;

    send(&rig, MusicCommand::Pause).await;
    spy.wait_for_topic(topics::PLAYBACK_PAUSED).await;
    send(&rig, MusicCommand::Pause).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(spy.count(topics::PLAYBACK_PAUSED), 1);
    rig.handle.stop().await;
}

#[tokio::test]
async fn ducking_is_refcounted_over_the_baseline() {
    let rig = rig(&[("alpha", 100.0)]).await;
    let spy = BusSpy::watch(&rig.bus, &[topics::PLAYBACK_STARTED]);

    send(&rig, MusicCommand::Play { track_ref: by_id(&rig.tracks[0]) }).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;
    assert_eq!(rig.output.volume(), 0.8);

    // Speech span plus an explicit duck: nested, one level of reduction.
    rig.bus
        .emit(topics::SPEECH_STARTED, "test", Payload::SpeechStarted { duration_ms: None })
        .await;
    rig.bus.emit(topics::MUSIC_DUCK, "test", Payload::Duck).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ducked = rig.output.volume();
    assert!((ducked - 0.16).abs() < 1e-6, "0.8 × 0.2 while ducked");

    // One release keeps it ducked, the second restores the baseline.
    rig.bus.emit(topics::SPEECH_ENDED, "test", Payload::SpeechEnded).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!((rig.output.volume() - 0.16).abs() < 1e-6);

    rig.bus.emit(topics::MUSIC_UNDUCK, "test", Payload::Unduck).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!((rig.output.volume() - 0.8).abs() < 1e-6);

    rig.handle.stop().await;
}

#[tokio::test]
async fn volume_sets_baseline_even_while_ducked() {
    let rig = rig(&[("alpha", 100.0)]).await;
    let spy = BusSpy::watch(&rig.bus, &[topics::PLAYBACK_STARTED]);

    send(&rig, MusicCommand::Play { track_ref: by_id(&rig.tracks[0]) }).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;

    rig.bus.emit(topics::MUSIC_DUCK, "test", Payload::Duck).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&rig, MusicCommand::Volume { level: 0.5 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!((rig.output.volume() - 0.1).abs() < 1e-6, "new baseline × duck factor");

    rig.bus.emit(topics::MUSIC_UNDUCK, "test", Payload::Unduck).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!((rig.output.volume() - 0.5).abs() < 1e-6);

    rig.handle.stop().await;
}

#[tokio::test]
async fn playback_cycle_leaves_queue_unchanged_and_next_pops_head() {
    let rig = rig(&[("alpha", 100.0), ("beta", 100.0), ("gamma", 100.0)]).await;
    let spy = BusSpy::watch(
        &rig.bus,
        &[
            topics::PLAYBACK_STARTED,
            topics::PLAYBACK_STOPPED,
            topics::QUEUE_UPDATED,
        ],
    );

    send(&rig, MusicCommand::Queue { track_ref: by_id(&rig.tracks[1]) }).await;
    send(&rig, MusicCommand::Queue { track_ref: by_id(&rig.tracks[2]) }).await;
    spy.wait_for(|e| matches!(e.payload, Payload::QueueUpdated { length: 2, .. }))
        .await;

    // Full cycle: queue untouched.
    send(&rig, MusicCommand::Play { track_ref: by_id(&rig.tracks[0]) }).await;
    send(&rig, MusicCommand::Pause).await;
    send(&rig, MusicCommand::Resume).await;
    send(&rig, MusicCommand::Stop).await;
    spy.wait_for_topic(topics::PLAYBACK_STOPPED).await;
    assert_eq!(spy.count(topics::QUEUE_UPDATED), 2, "cycle emitted no queue updates");

    // Next pops beta.
    spy.clear();
    send(&rig, MusicCommand::Next).await;
    let started = spy.wait_for_topic(topics::PLAYBACK_STARTED).await;
    match started.payload {
        Payload::PlaybackStarted { track, .. } => assert_eq!(track.title, "beta"),
        other => panic!("unexpected payload {other:?}"),
    }
    spy.wait_for(|e| matches!(e.payload, Payload::QueueUpdated { length: 1, .. }))
        .await;

    // Drain the queue, then Next must be a no-op.
    send(&rig, MusicCommand::Next).await;
    spy.wait_for(|e| matches!(e.payload, Payload::QueueUpdated { length: 0, .. }))
        .await;
    spy.clear();
    send(&rig, MusicCommand::Next).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(spy.count(topics::PLAYBACK_STARTED), 0);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn crossfade_ramps_and_promotes() {
    let rig = rig(&[("alpha", 100.0), ("beta", 100.0)]).await;
    let spy = BusSpy::watch(
        &rig.bus,
        &[topics::PLAYBACK_STARTED, topics::CROSSFADE_STARTED],
    );

    send(&rig, MusicCommand::Play { track_ref: by_id(&rig.tracks[0]) }).await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;
    spy.clear();

    send(
        &rig,
        MusicCommand::Crossfade {
            track_ref: by_id(&rig.tracks[1]),
            duration_ms: 1000,
        },
    )
    .await;

    let crossfade = spy.wait_for_topic(topics::CROSSFADE_STARTED).await;
    match crossfade.payload {
        Payload::CrossfadeStarted { from, to, duration_ms } => {
            assert_eq!(from.title, "alpha");
            assert_eq!(to.title, "beta");
            assert_eq!(duration_ms, 1000);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // The incoming track is the current one immediately.
    let started = spy.wait_for_topic(topics::PLAYBACK_STARTED).await;
    match started.payload {
        Payload::PlaybackStarted { track, .. } => assert_eq!(track.title, "beta"),
        other => panic!("unexpected payload {other:?}"),
    }

    // After the ramp, the incoming sink takes over at the applied volume.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let events = rig.output.events();
    assert!(events.contains(&OutputEvent::StartIncoming(rig.tracks[1].filepath.clone())));
    assert!(events.contains(&OutputEvent::Promote));
    assert_eq!(rig.output.volume(), 0.8);

    rig.handle.stop().await;
}

#[tokio::test]
async fn unknown_track_reports_system_error() {
    let rig = rig(&[("alpha", 100.0)]).await;
    let spy = BusSpy::watch(&rig.bus, &[topics::SYSTEM_ERROR, topics::PLAYBACK_STARTED]);

    send(
        &rig,
        MusicCommand::Play {
            track_ref: TrackRef::Name { name: "nonexistent".into() },
        },
    )
    .await;

    spy.wait_for_topic(topics::SYSTEM_ERROR).await;
    assert_eq!(spy.count(topics::PLAYBACK_STARTED), 0);
    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_duration_track_reports_null_progress() {
    // No cache seeding: the stub bytes fail to probe, so duration is None.
    let dir = tempfile::tempdir().unwrap();
    let music_dir = dir.path().join("music");
    std::fs::create_dir_all(&music_dir).unwrap();
    std::fs::write(music_dir.join("mystery.mp3"), b"not audio").unwrap();

    let bus = Arc::new(EventBus::new());
    let spy = BusSpy::watch(
        &bus,
        &[topics::LIBRARY_UPDATED, topics::MUSIC_PROGRESS, topics::PLAYBACK_STARTED],
    );
    let output = RecordingOutput::new();
    let engine = MusicEngine::new(
        { let o: Arc<dyn cantina::music::output::AudioOutput> = output.clone(); o },
        MusicEngineConfig {
            scan: ScanConfig {
                music_dir,
                cache_path: None,
                probe_timeout: Duration::from_millis(100),
            },
            duck_factor: 0.2,
            baseline_volume: 0.8,
        },
    );
    let handle = ServiceHandle::new(Arc::new(engine), Arc::clone(&bus));
    handle.start().await.unwrap();

    let event = spy.wait_for_topic(topics::LIBRARY_UPDATED).await;
    let track = match event.payload {
        Payload::LibraryUpdated { tracks } => tracks[0].clone(),
        other => panic!("unexpected payload {other:?}"),
    };
    assert_eq!(track.duration_seconds, None);

    bus.emit(
        topics::MUSIC_COMMAND,
        "test",
        Payload::MusicCommand(MusicCommand::Play {
            track_ref: TrackRef::Id { id: track.track_id },
        }),
    )
    .await;
    spy.wait_for_topic(topics::PLAYBACK_STARTED).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let progress = spy.payloads(topics::MUSIC_PROGRESS);
    match progress.last().expect("progress for unknown duration") {
        Payload::Progress { duration_sec, progress_pct, .. } => {
            assert_eq!(*duration_sec, None);
            assert_eq!(*progress_pct, None);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    handle.stop().await;
}
