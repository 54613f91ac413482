//! Shared bridge state: status cache, library cache, and the client
//! fan-out channel.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cantinabus::EventBus;
use cantinaproto::{sources, topics, Event, Payload, ServiceState, Track};
use tokio::sync::broadcast;

use crate::LogQuery;

/// Fan-out channel depth. Slow clients fall behind their own per-client
/// queues, not this channel.
const FANOUT_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub http_port: u16,
    /// Services whose `/status/*` topics the bridge mirrors.
    pub service_names: Vec<String>,
}

pub struct BridgeState {
    pub bus: Arc<EventBus>,
    pub logs: Arc<dyn LogQuery>,
    fanout: broadcast::Sender<Event>,
    status_cache: RwLock<HashMap<String, Payload>>,
    library: RwLock<Vec<Track>>,
}

impl BridgeState {
    pub fn new(bus: Arc<EventBus>, logs: Arc<dyn LogQuery>) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_DEPTH);
        Self {
            bus,
            logs,
            fanout,
            status_cache: RwLock::new(HashMap::new()),
            library: RwLock::new(Vec::new()),
        }
    }

    /// Feed one internal event through the bridge: cache updates plus
    /// client fan-out. Events the bridge itself originated are dropped.
    pub fn ingest(&self, event: Event) {
        if event.source == sources::WEB_DASHBOARD {
            return;
        }

        match &event.payload {
            Payload::ServiceStatus { service, .. } => {
                self.status_cache
                    .write()
                    .unwrap()
                    .insert(service.clone(), event.payload.clone());
            }
            Payload::LibraryUpdated { tracks } => {
                *self.library.write().unwrap() = tracks.clone();
            }
            _ => {}
        }

        // No receivers just means no dashboards are connected.
        let _ = self.fanout.send(event);
    }

    pub fn subscribe_fanout(&self) -> broadcast::Receiver<Event> {
        self.fanout.subscribe()
    }

    /// Snapshot of the last-known status payloads, for connect-time replay.
    pub fn status_snapshot(&self) -> Vec<(String, Payload)> {
        self.status_cache
            .read()
            .unwrap()
            .iter()
            .map(|(service, payload)| (topics::service_status(service), payload.clone()))
            .collect()
    }

    pub fn library_snapshot(&self) -> Vec<Track> {
        self.library.read().unwrap().clone()
    }

    /// Service states for `/healthz`.
    pub fn service_states(&self) -> HashMap<String, ServiceState> {
        self.status_cache
            .read()
            .unwrap()
            .iter()
            .filter_map(|(service, payload)| match payload {
                Payload::ServiceStatus { state, .. } => Some((service.clone(), *state)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state() -> BridgeState {
        BridgeState::new(Arc::new(EventBus::new()), Arc::new(crate::NoLogs))
    }

    fn status_event(service: &str, state_val: ServiceState) -> Event {
        Event::new(
            topics::service_status(service),
            service,
            Payload::ServiceStatus {
                service: service.to_string(),
                state: state_val,
                uptime_ms: 10,
                detail: None,
                dropped_events: 0,
            },
        )
    }

    #[tokio::test]
    async fn status_cache_keeps_last_known() {
        let state = state();
        state.ingest(status_event("music_engine", ServiceState::Starting));
        state.ingest(status_event("music_engine", ServiceState::Running));

        let snapshot = state.status_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "/status/music_engine");
        match &snapshot[0].1 {
            Payload::ServiceStatus { state, .. } => assert_eq!(*state, ServiceState::Running),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn self_originated_events_are_dropped() {
        let state = state();
        let mut rx = state.subscribe_fanout();

        state.ingest(Event::new(
            topics::MODE_CHANGE,
            sources::WEB_DASHBOARD,
            Payload::ShutdownRequested,
        ));
        state.ingest(Event::new(
            topics::MODE_CHANGE,
            "mode_manager",
            Payload::ShutdownRequested,
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.source, "mode_manager");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn library_cache_updates() {
        let state = state();
        state.ingest(Event::new(
            topics::LIBRARY_UPDATED,
            "music_engine",
            Payload::LibraryUpdated {
                tracks: vec![Track {
                    track_id: "trk_1".into(),
                    title: "Mad About Me".into(),
                    artist: None,
                    duration_seconds: Some(180.0),
                    filepath: "/m/mad.mp3".into(),
                }],
            },
        ));
        assert_eq!(state.library_snapshot().len(), 1);
    }
}
