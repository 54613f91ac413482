//! Command dispatcher: parses the CLI surface into canonical bus events.
//!
//! Compound verbs tolerate partial matches: a non-numeric token matches
//! track titles by case-insensitive substring (ambiguity picks the
//! lexicographically first), numeric tokens are 1-based indices into the
//! current listing. Every recognized verb emits exactly one canonical
//! event; unknown commands emit `/system/error` and fail back to the
//! caller.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cantinabus::{EventBus, Service, ServiceContext, ServiceError};
use cantinaproto::error::CommandError;
use cantinaproto::{
    topics, DjCommand, DjSettings, LogLevel, Mode, MusicCommand, Payload, Track, TrackRef,
};
use tracing::debug;

use crate::music::library;

pub struct CommandDispatcher {
    bus: Arc<EventBus>,
    dj_defaults: DjSettings,
    library: Arc<RwLock<Vec<Track>>>,
}

impl CommandDispatcher {
    pub fn new(bus: Arc<EventBus>, dj_defaults: DjSettings) -> Arc<Self> {
        Arc::new(Self {
            bus,
            dj_defaults,
            library: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Parse and dispatch one input line. `Ok(Some(text))` carries output
    /// for the caller to print (e.g. the library listing).
    pub async fn handle_line(
        &self,
        line: &str,
        source: &str,
    ) -> Result<Option<String>, CommandError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        debug!(line = trimmed, source, "dispatching command");

        let lowered = trimmed.to_lowercase();
        let result = match lowered.as_str() {
            "engage" => {
                self.emit(source, topics::SET_MODE_REQUEST, Payload::SetModeRequest {
                    target: Mode::Interactive,
                })
                .await;
                Ok(None)
            }
            "disengage" => {
                self.emit(source, topics::SET_MODE_REQUEST, Payload::SetModeRequest {
                    target: Mode::Ambient,
                })
                .await;
                Ok(None)
            }
            "dj start" => {
                self.emit(
                    source,
                    topics::DJ_COMMAND,
                    Payload::DjCommand(DjCommand::Start {
                        settings: self.dj_defaults.clone(),
                    }),
                )
                .await;
                Ok(None)
            }
            "dj stop" => {
                self.emit(source, topics::DJ_COMMAND, Payload::DjCommand(DjCommand::Stop))
                    .await;
                Ok(None)
            }
            "dj next" => {
                self.emit(source, topics::DJ_COMMAND, Payload::DjCommand(DjCommand::Next))
                    .await;
                Ok(None)
            }
            "list music" => Ok(Some(self.listing())),
            "stop music" => {
                self.emit(
                    source,
                    topics::MUSIC_COMMAND,
                    Payload::MusicCommand(MusicCommand::Stop),
                )
                .await;
                Ok(None)
            }
            "quit" => {
                self.emit(source, topics::SHUTDOWN_REQUESTED, Payload::ShutdownRequested)
                    .await;
                Ok(None)
            }
            _ => self.compound(trimmed, source).await,
        };

        if let Err(e) = &result {
            self.emit(
                source,
                topics::SYSTEM_ERROR,
                Payload::SystemError {
                    source: "command_dispatcher".to_string(),
                    message: e.to_string(),
                    severity: LogLevel::Warn,
                },
            )
            .await;
        }
        result
    }

    async fn compound(&self, line: &str, source: &str) -> Result<Option<String>, CommandError> {
        let lowered = line.to_lowercase();

        if let Some(token) = lowered.strip_prefix("play music ") {
            let token = token.trim();
            if token.is_empty() {
                return Err(CommandError::validation("play music needs a track"));
            }
            let track_ref = match token.parse::<usize>() {
                Ok(index) => TrackRef::Index { index },
                Err(_) => TrackRef::Name { name: token.to_string() },
            };
            let resolved = {
                let library = self.library.read().unwrap();
                library::resolve(&library, &track_ref).cloned()
            };
            let track = resolved.ok_or_else(|| CommandError::unknown(line))?;
            self.emit(
                source,
                topics::MUSIC_COMMAND,
                Payload::MusicCommand(MusicCommand::Play {
                    track_ref: TrackRef::Id { id: track.track_id },
                }),
            )
            .await;
            return Ok(None);
        }

        if let Some(token) = lowered.strip_prefix("volume ") {
            let level: u32 = token
                .trim()
                .parse()
                .map_err(|_| CommandError::validation("volume takes a number 0..100"))?;
            if level > 100 {
                return Err(CommandError::validation("volume takes a number 0..100"));
            }
            self.emit(
                source,
                topics::MUSIC_COMMAND,
                Payload::MusicCommand(MusicCommand::Volume {
                    level: level as f64 / 100.0,
                }),
            )
            .await;
            return Ok(None);
        }

        Err(CommandError::unknown(line))
    }

    async fn emit(&self, source: &str, topic: &str, payload: Payload) {
        // Commands carry the requesting surface, not the dispatcher's name.
        let event = cantinaproto::Event::new(topic, source, payload);
        self.bus.emit_event(event).await;
    }

    fn listing(&self) -> String {
        let library = self.library.read().unwrap();
        if library.is_empty() {
            return "library is empty".to_string();
        }
        library
            .iter()
            .enumerate()
            .map(|(i, track)| {
                let duration = match track.duration_seconds {
                    Some(secs) => {
                        format!(" ({}:{:02})", secs as u64 / 60, secs as u64 % 60)
                    }
                    None => String::new(),
                };
                format!("{}. {}{}", i + 1, track.title, duration)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Service for CommandDispatcher {
    fn name(&self) -> &'static str {
        "command_dispatcher"
    }

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        let mut library_rx = ctx.subscribe(topics::LIBRARY_UPDATED);
        let mut status_rx = ctx.subscribe(topics::STATUS_REQUEST);
        let library = Arc::clone(&self.library);
        let ctx = Arc::clone(ctx);
        let cancel = ctx.cancel_token();

        ctx.clone().spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = library_rx.recv() => {
                        if let Payload::LibraryUpdated { tracks } = event.payload {
                            *library.write().unwrap() = tracks;
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
