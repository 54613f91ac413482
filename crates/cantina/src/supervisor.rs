//! Supervisor: builds the service set, starts it in dependency order,
//! monitors health, and tears everything down in reverse.
//!
//! A service sitting in ERROR for more than thirty seconds gets exactly one
//! restart attempt. Shutdown grants each service its drain budget before
//! abandoning stragglers.

use std::sync::Arc;
use std::time::Duration;

use cantinabus::{EventBus, Service, ServiceError, ServiceHandle};
use cantinaconf::CantinaConfig;
use cantinaproto::{sources, topics, DjSettings, MusicCommand, Payload, ServiceState};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::dispatch::CommandDispatcher;
use crate::dj::DjSequencer;
use crate::eyelights::{EyeLightConfig, EyeLightController, LinkFactory, SerialFactory};
use crate::logsink::{LogRecord, LogSink, LogSinkConfig};
use crate::mode::ModeManager;
use crate::music::library::ScanConfig;
use crate::music::output::AudioOutput;
use crate::music::{MusicEngine, MusicEngineConfig};
use crate::voice::clients::{LlmClient, SttClient, TtsClient};
use crate::voice::{VoiceCoordinator, VoicePipelineConfig};
use marquee::{BridgeConfig, WebBridge};

const ERROR_RESTART_AFTER: Duration = Duration::from_secs(30);
const MONITOR_TICK: Duration = Duration::from_secs(1);

/// External collaborators injected at build time.
pub struct Collaborators {
    pub output: Arc<dyn AudioOutput>,
    pub stt: Arc<dyn SttClient>,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    /// `None` disables the eye-light controller entirely.
    pub link_factory: Option<Arc<dyn LinkFactory>>,
    pub log_rx: tokio::sync::mpsc::Receiver<LogRecord>,
}

struct Entry {
    service: Arc<dyn Service>,
    handle: ServiceHandle,
    error_since: Option<Instant>,
    restarted: bool,
}

pub struct Supervisor {
    bus: Arc<EventBus>,
    entries: Vec<Entry>,
}

impl Supervisor {
    /// Wire up every service in dependency order. Returns the dispatcher
    /// for the CLI surface.
    pub fn build(
        config: &CantinaConfig,
        collaborators: Collaborators,
    ) -> (Self, Arc<CommandDispatcher>) {
        let bus = Arc::new(EventBus::new());

        let dj_defaults = DjSettings {
            auto_transition: true,
            crossfade_sec: config.dj.crossfade_sec,
            commentary_lead_sec: config.dj.commentary_lead_sec,
            interval_sec: None,
        };

        let log_sink = Arc::new(LogSink::new(
            collaborators.log_rx,
            LogSinkConfig {
                ring_capacity: config.logging.ring_capacity,
                dedup_window: Duration::from_millis(config.logging.dedup_window_ms),
                filter_prefixes: config.logging.filter_prefixes.clone(),
                session_dir: config.log_dir(),
            },
        ));
        let log_ring = log_sink.ring();

        let dispatcher = CommandDispatcher::new(Arc::clone(&bus), dj_defaults.clone());

        let music_engine = Arc::new(MusicEngine::new(
            collaborators.output,
            MusicEngineConfig {
                scan: ScanConfig {
                    music_dir: config.paths.music_dir.clone(),
                    cache_path: config
                        .library
                        .use_cache
                        .then(|| config.library_cache_path()),
                    probe_timeout: Duration::from_millis(config.library.probe_timeout_ms),
                },
                duck_factor: config.audio.duck_factor,
                baseline_volume: config.audio.baseline_volume,
            },
        ));

        let voice = Arc::new(VoiceCoordinator::new(
            collaborators.stt,
            collaborators.llm,
            collaborators.tts,
            VoicePipelineConfig {
                llm_timeout: Duration::from_millis(config.voice.llm_timeout_ms),
                tts_timeout: Duration::from_millis(config.voice.tts_timeout_ms),
                stt_idle_close: Duration::from_millis(config.voice.stt_idle_close_ms),
                canned_apology: config.voice.canned_apology.clone(),
                speech_dir: config.speech_dir(),
            },
        ));

        let dj = Arc::new(DjSequencer::new(dj_defaults));

        let mut services: Vec<Arc<dyn Service>> = vec![
            log_sink,
            Arc::new(ModeManager),
            dispatcher.clone(),
            music_engine,
        ];

        if let Some(factory) = collaborators.link_factory {
            services.push(Arc::new(EyeLightController::new(
                factory,
                EyeLightConfig {
                    response_timeout: Duration::from_millis(config.serial.response_timeout_ms),
                    coalesce_window: Duration::from_millis(config.serial.coalesce_ms),
                },
            )));
        }

        services.push(voice);
        services.push(dj);

        let service_names: Vec<String> = services
            .iter()
            .map(|s| s.name().to_string())
            .chain(std::iter::once("web_bridge".to_string()))
            .collect();

        services.push(Arc::new(WebBridge::new(
            BridgeConfig {
                host: config.bind.host.clone(),
                http_port: config.bind.http_port,
                service_names,
            },
            Arc::new(log_ring),
        )));

        let entries = services
            .into_iter()
            .map(|service| Entry {
                handle: ServiceHandle::new(Arc::clone(&service), Arc::clone(&bus)),
                service,
                error_since: None,
                restarted: false,
            })
            .collect();

        (Self { bus, entries }, dispatcher)
    }

    /// Serial factory from config, honoring `serial.enabled`.
    pub fn link_factory_from(config: &CantinaConfig) -> Option<Arc<dyn LinkFactory>> {
        config.serial.enabled.then(|| {
            Arc::new(SerialFactory {
                device: config.serial.device.clone(),
                baud: config.serial.baud,
            }) as Arc<dyn LinkFactory>
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Start everything in dependency order. On failure, already-started
    /// services stop in reverse and the error propagates (exit 1).
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        for (i, entry) in self.entries.iter().enumerate() {
            info!(service = entry.handle.name(), "starting");
            if let Err(e) = entry.handle.start().await {
                error!(service = entry.handle.name(), error = %e, "startup failed");
                for started in self.entries[..i].iter().rev() {
                    started.handle.stop().await;
                }
                return Err(e);
            }
        }
        // Re-announce the library now that every subscriber is listening;
        // the first scan may have finished before late services came up.
        self.bus
            .emit(
                topics::MUSIC_COMMAND,
                sources::INTERNAL,
                Payload::MusicCommand(MusicCommand::Rescan),
            )
            .await;

        info!("all services running");
        Ok(())
    }

    /// Run until shutdown is requested, restarting dead services along the
    /// way.
    pub async fn run_until_shutdown(&mut self) {
        let mut shutdown_rx = self.bus.subscribe(topics::SHUTDOWN_REQUESTED, "supervisor");
        let mut tick = tokio::time::interval(MONITOR_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(_) = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    break;
                }
                _ = tick.tick() => self.check_health().await,
            }
        }

        self.stop_all().await;
    }

    async fn check_health(&mut self) {
        for entry in &mut self.entries {
            match entry.handle.state() {
                ServiceState::Error => {
                    let since = entry.error_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= ERROR_RESTART_AFTER && !entry.restarted {
                        warn!(service = entry.handle.name(), "restarting failed service");
                        entry.restarted = true;
                        entry.error_since = None;
                        entry.handle =
                            ServiceHandle::new(Arc::clone(&entry.service), Arc::clone(&self.bus));
                        if let Err(e) = entry.handle.start().await {
                            error!(
                                service = entry.handle.name(),
                                error = %e,
                                "restart failed, leaving service down"
                            );
                        }
                    }
                }
                _ => entry.error_since = None,
            }
        }
    }

    pub async fn stop_all(&self) {
        for entry in self.entries.iter().rev() {
            info!(service = entry.handle.name(), "stopping");
            entry.handle.stop().await;
        }
        info!("shutdown complete");
    }
}
