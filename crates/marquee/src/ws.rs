//! WebSocket client sessions: command ingress with validation acks, and
//! rate-limited event egress through a bounded per-client queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use cantinaproto::commands::{validate, Ack, ClientMessage, ErrorCode, EventFrame, ValidatedCommand};
use cantinaproto::{sources, topics, Event, Payload};
use futures::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::state::BridgeState;

/// Per-client send queue bound.
const CLIENT_QUEUE_DEPTH: usize = 64;
/// Progress stream ceiling: 10 Hz.
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(100);
/// Audio level stream ceiling: 20 Hz.
const AUDIO_LEVEL_MIN_INTERVAL: Duration = Duration::from_millis(50);

/// Drive one connected dashboard until it disconnects.
pub async fn client_session(socket: WebSocket, state: Arc<BridgeState>) {
    let (mut sender, mut receiver) = socket.split();
    let queue = SendQueue::new(CLIENT_QUEUE_DEPTH);
    let mut limiter = RateLimiter::default();
    let mut fanout = state.subscribe_fanout();

    // Hydrate the dashboard before any live traffic: replay the status
    // snapshot, then ask services for fresh numbers.
    for (topic, payload) in state.status_snapshot() {
        queue.push(frame_for(&topic, &payload), true);
    }
    state
        .bus
        .emit(topics::STATUS_REQUEST, sources::WEB_DASHBOARD, Payload::StatusRequest)
        .await;

    loop {
        tokio::select! {
            event = fanout.recv() => {
                match event {
                    Ok(event) => {
                        if let Some((frame, is_status)) = egress_frame(&event, &mut limiter) {
                            queue.push(frame, is_status);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        queue.add_dropped(n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = queue.ready() => {
                while let Some(mut frame) = queue.pop() {
                    // Drop counts ride on status frames.
                    let dropped = queue.take_dropped_if_status(&frame);
                    if let (Some(n), serde_json::Value::Object(map)) = (dropped, &mut frame.data) {
                        map.insert("client_dropped_events".to_string(), n.into());
                    }
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "frame serialization failed");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
            }
            incoming = receiver.next() => {
                let Some(Ok(message)) = incoming else { break };
                if let Message::Text(text) = message {
                    if let Some(ack) = handle_client_text(&state, &text).await {
                        if sender
                            .send(Message::Text(ack_json(&ack).to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("dashboard client disconnected");
}

/// Wire form of a command reply: the ack fields plus `type: "ack"`.
fn ack_json(ack: &Ack) -> serde_json::Value {
    let mut value = serde_json::to_value(ack).unwrap_or_default();
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("type".to_string(), "ack".into());
    }
    value
}

/// Validate and translate one client message. Returns the ack to send;
/// invalid commands never touch the bus.
pub async fn handle_client_text(state: &Arc<BridgeState>, text: &str) -> Option<Ack> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            return Some(Ack::failure(
                String::new(),
                ErrorCode::ValidationError,
                vec![e.to_string()],
            ));
        }
    };

    let ClientMessage::Command { verb, command_id, payload } = message;

    match validate(verb, &payload) {
        Ok(ValidatedCommand::Publish { topic, payload }) => {
            state
                .bus
                .emit_event(Event::new(topic, sources::WEB_DASHBOARD, payload))
                .await;
            Some(Ack::ok(command_id))
        }
        Ok(ValidatedCommand::RefreshStatus) => {
            state
                .bus
                .emit(topics::STATUS_REQUEST, sources::WEB_DASHBOARD, Payload::StatusRequest)
                .await;
            Some(Ack::ok(command_id))
        }
        Err(errors) => Some(Ack::failure(command_id, ErrorCode::ValidationError, errors)),
    }
}

fn frame_for(topic: &str, payload: &Payload) -> EventFrame {
    EventFrame {
        topic: topic.to_string(),
        data: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        timestamp: chrono::Utc::now(),
    }
}

/// Wrap an event for egress, applying per-topic rate limits. Status topics
/// pass unthrottled.
fn egress_frame(event: &Event, limiter: &mut RateLimiter) -> Option<(EventFrame, bool)> {
    let is_status = event.topic.starts_with("/status/");
    if !is_status && !limiter.allow(&event.topic) {
        return None;
    }
    Some((
        EventFrame {
            topic: event.topic.clone(),
            data: serde_json::to_value(&event.payload).unwrap_or(serde_json::Value::Null),
            timestamp: event.timestamp,
        },
        is_status,
    ))
}

#[derive(Default)]
struct RateLimiter {
    last_sent: HashMap<String, Instant>,
}

impl RateLimiter {
    fn allow(&mut self, topic: &str) -> bool {
        let min_interval = match topic {
            t if t == topics::MUSIC_PROGRESS => PROGRESS_MIN_INTERVAL,
            t if t == topics::VOICE_AUDIO_LEVEL => AUDIO_LEVEL_MIN_INTERVAL,
            _ => return true,
        };

        let now = Instant::now();
        match self.last_sent.get(topic) {
            Some(last) if now.duration_since(*last) < min_interval => false,
            _ => {
                self.last_sent.insert(topic.to_string(), now);
                true
            }
        }
    }
}

/// Bounded per-client queue: overflow evicts the oldest non-status frame
/// and counts the drop; the counter is delivered on the next status frame.
struct SendQueue {
    frames: Mutex<VecDeque<(bool, EventFrame)>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, frame: EventFrame, is_status: bool) {
        let mut frames = self.frames.lock().unwrap();
        if frames.len() >= self.capacity {
            let victim = frames
                .iter()
                .position(|(is_status, _)| !is_status)
                .unwrap_or(0);
            frames.remove(victim);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back((is_status, frame));
        drop(frames);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<EventFrame> {
        self.frames.lock().unwrap().pop_front().map(|(_, frame)| frame)
    }

    async fn ready(&self) {
        if !self.frames.lock().unwrap().is_empty() {
            return;
        }
        self.notify.notified().await;
    }

    fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    fn take_dropped_if_status(&self, frame: &EventFrame) -> Option<u64> {
        if !frame.topic.starts_with("/status/") {
            return None;
        }
        let n = self.dropped.swap(0, Ordering::Relaxed);
        (n > 0).then_some(n)
    }
}
