//! marquee - Web bridge for CantinaOS.
//!
//! Adapts browser dashboards to the internal bus: validated command
//! ingress over WebSocket, wrapped event egress with per-topic rate limits,
//! a status cache replayed on connect, and a small HTTP surface for the
//! library, logs, and health.
//!
//! Self-loop prevention is structural: events originated here carry
//! `source = web_dashboard` and are never re-broadcast, and the logging
//! sink drops this crate's logger namespace outright.

pub mod http;
pub mod state;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cantinabus::{Service, ServiceContext, ServiceError};
use cantinaproto::{topics, Payload};
use tracing::info;

pub use state::{BridgeConfig, BridgeState};

/// Read access to the logging sink's in-memory ring. Implemented by the
/// sink; the bridge only ever reads.
pub trait LogQuery: Send + Sync {
    fn tail(&self, limit: usize) -> Vec<Payload>;
}

/// A bridge with no log store attached (tests, minimal deployments).
pub struct NoLogs;

impl LogQuery for NoLogs {
    fn tail(&self, _limit: usize) -> Vec<Payload> {
        Vec::new()
    }
}

/// The topics broadcast to dashboard clients.
pub fn bridged_topics(service_names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = [
        topics::MODE_CHANGE,
        topics::MODE_TRANSITION,
        topics::SYSTEM_ERROR,
        topics::LISTENING_STARTED,
        topics::LISTENING_STOPPED,
        topics::TRANSCRIPTION,
        topics::VOICE_AUDIO_LEVEL,
        topics::RESPONSE_TEXT,
        topics::SPEECH_STARTED,
        topics::SPEECH_ENDED,
        topics::LIBRARY_UPDATED,
        topics::PLAYBACK_STARTED,
        topics::PLAYBACK_PAUSED,
        topics::PLAYBACK_RESUMED,
        topics::PLAYBACK_STOPPED,
        topics::MUSIC_PROGRESS,
        topics::QUEUE_UPDATED,
        topics::CROSSFADE_STARTED,
        topics::DJ_QUEUE_UPDATE,
        topics::DJ_TRANSITION,
        topics::COMMENTARY_READY,
        topics::COMMENTARY_FAILED,
        topics::LOG_ENTRY,
    ]
    .iter()
    .map(|t| t.to_string())
    .collect();

    for name in service_names {
        out.push(topics::service_status(name));
    }
    out
}

/// The web bridge service: binds the HTTP/WebSocket listener and fans
/// internal events out to connected dashboards.
pub struct WebBridge {
    config: BridgeConfig,
    logs: Arc<dyn LogQuery>,
}

impl WebBridge {
    pub fn new(config: BridgeConfig, logs: Arc<dyn LogQuery>) -> Self {
        Self { config, logs }
    }
}

#[async_trait]
impl Service for WebBridge {
    fn name(&self) -> &'static str {
        "web_bridge"
    }

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        let state = Arc::new(BridgeState::new(
            Arc::clone(ctx.bus()),
            Arc::clone(&self.logs),
        ));

        // One forwarder per bridged topic: update caches, then fan out.
        for topic in bridged_topics(&self.config.service_names) {
            let mut rx = ctx.subscribe(topic);
            let state = Arc::clone(&state);
            let cancel = ctx.cancel_token();
            ctx.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => {
                            let Some(event) = event else { break };
                            state.ingest(event);
                        }
                    }
                }
            });
        }

        let mut status_rx = ctx.subscribe(topics::STATUS_REQUEST);
        {
            let ctx = Arc::clone(ctx);
            let cancel = ctx.cancel_token();
            ctx.clone().spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = status_rx.recv() => {
                            if event.is_none() { break }
                            ctx.emit_status(None).await;
                        }
                    }
                }
            });
        }

        // The bridge comes up last and missed everyone's startup status;
        // ask for a fresh round now that the forwarders are listening.
        ctx.emit(topics::STATUS_REQUEST, Payload::StatusRequest).await;

        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.http_port)
            .parse()
            .map_err(|e| ServiceError::startup(format!("bad bind address: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::startup(format!("cannot bind {addr}: {e}")))?;
        info!(%addr, "dashboard listening");

        let router = http::router(Arc::clone(&state));
        let cancel = ctx.cancel_token();
        ctx.spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "dashboard server exited");
            }
        });

        Ok(())
    }
}
