//! Mode state machine: IDLE / AMBIENT / INTERACTIVE.
//!
//! Sole writer of the global mode. Transition requests arrive on
//! `/system/set_mode_request` and are serialized through this service's one
//! dispatch loop; a request landing mid-transition queues (depth 1) and any
//! further request is rejected.
//!
//! Protocol per transition: `mode_transition{status=started}` → side-effects
//! → `mode_change{old,new}` → `mode_transition{status=completed}`. A failed
//! side-effect emits `status=failed` and leaves the old mode in place.

use std::sync::Arc;

use async_trait::async_trait;
use cantinabus::{Service, ServiceContext, ServiceError};
use cantinaproto::{topics, DjCommand, LogLevel, Mode, MusicCommand, Payload, TransitionStatus};
use tracing::{info, warn};

pub struct ModeManager;

#[async_trait]
impl Service for ModeManager {
    fn name(&self) -> &'static str {
        "mode_manager"
    }

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        let mut request_rx = ctx.subscribe(topics::SET_MODE_REQUEST);
        let mut status_rx = ctx.subscribe(topics::STATUS_REQUEST);
        let ctx = Arc::clone(ctx);
        let cancel = ctx.cancel_token();

        ctx.clone().spawn(async move {
            let mut machine = ModeMachine::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = request_rx.recv() => {
                        if let Payload::SetModeRequest { target } = event.payload {
                            machine.run_transition(&ctx, target).await;
                            machine.drain_backlog(&ctx, &mut request_rx).await;
                        }
                    }
                    Some(_) = status_rx.recv() => {
                        ctx.emit_status(Some(machine.current.to_string())).await;
                    }
                    else => break,
                }
            }
        });
        Ok(())
    }
}

struct ModeMachine {
    current: Mode,
}

impl ModeMachine {
    fn new() -> Self {
        Self { current: Mode::Idle }
    }

    /// Requests that arrived while a transition was in progress sit in the
    /// mailbox. One is queued and honored; anything beyond that is rejected
    /// with an error (queue depth 1).
    async fn drain_backlog(
        &mut self,
        ctx: &Arc<ServiceContext>,
        request_rx: &mut cantinabus::BusReceiver,
    ) {
        let mut queued: Option<Mode> = None;
        while let Some(event) = request_rx.try_recv() {
            if let Payload::SetModeRequest { target } = event.payload {
                if queued.is_none() {
                    queued = Some(target);
                } else {
                    warn!(%target, "mode transition queue full, request rejected");
                    ctx.emit(
                        topics::SYSTEM_ERROR,
                        Payload::SystemError {
                            source: "mode_manager".to_string(),
                            message: format!(
                                "transition queue full, request for {target} rejected"
                            ),
                            severity: LogLevel::Warn,
                        },
                    )
                    .await;
                }
            }
        }
        if let Some(target) = queued {
            self.run_transition(ctx, target).await;
        }
    }

    async fn run_transition(&mut self, ctx: &Arc<ServiceContext>, target: Mode) {
        let old = self.current;
        if target == old {
            return;
        }

        ctx.emit(
            topics::MODE_TRANSITION,
            Payload::ModeTransition {
                old,
                new: target,
                status: TransitionStatus::Started,
                error: None,
            },
        )
        .await;

        match self.side_effects(ctx, old, target).await {
            Ok(()) => {
                self.current = target;
                info!(%old, new = %target, "mode change");
                ctx.emit(topics::MODE_CHANGE, Payload::ModeChange { old, new: target })
                    .await;
                ctx.emit(
                    topics::MODE_TRANSITION,
                    Payload::ModeTransition {
                        old,
                        new: target,
                        status: TransitionStatus::Completed,
                        error: None,
                    },
                )
                .await;
            }
            Err(message) => {
                warn!(%old, new = %target, %message, "mode transition failed");
                ctx.emit(
                    topics::MODE_TRANSITION,
                    Payload::ModeTransition {
                        old,
                        new: target,
                        status: TransitionStatus::Failed,
                        error: Some(message.clone()),
                    },
                )
                .await;
                ctx.emit(
                    topics::SYSTEM_ERROR,
                    Payload::SystemError {
                        source: "mode_manager".to_string(),
                        message,
                        severity: LogLevel::Error,
                    },
                )
                .await;
            }
        }
    }

    /// Side-effects between `started` and `completed`: capture teardown,
    /// ambient music, DJ session cleanup. The eye-light controller follows
    /// `/system/mode_change` on its own.
    async fn side_effects(
        &self,
        ctx: &Arc<ServiceContext>,
        old: Mode,
        target: Mode,
    ) -> Result<(), String> {
        if old == Mode::Interactive {
            // Stop capture before anything else.
            ctx.emit(topics::MIC_STOP_REQUEST, Payload::MicStopRequest)
                .await;
        }

        match target {
            Mode::Idle => {
                ctx.emit(
                    topics::DJ_COMMAND,
                    Payload::DjCommand(DjCommand::Stop),
                )
                .await;
                ctx.emit(
                    topics::MUSIC_COMMAND,
                    Payload::MusicCommand(MusicCommand::Stop),
                )
                .await;
            }
            Mode::Ambient => {
                ctx.emit(
                    topics::MUSIC_COMMAND,
                    Payload::MusicCommand(MusicCommand::Ambient),
                )
                .await;
            }
            Mode::Interactive => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantinabus::testing::BusSpy;
    use cantinabus::{EventBus, ServiceHandle};
    use pretty_assertions::assert_eq;

    async fn started_manager(bus: &Arc<EventBus>) -> ServiceHandle {
        let handle = ServiceHandle::new(Arc::new(ModeManager), Arc::clone(bus));
        handle.start().await.unwrap();
        handle
    }

    #[tokio::test]
    async fn transition_protocol_ordering() {
        let bus = Arc::new(EventBus::new());
        let spy = BusSpy::watch(&bus, &[topics::MODE_CHANGE, topics::MODE_TRANSITION]);
        let _handle = started_manager(&bus).await;

        bus.emit(
            topics::SET_MODE_REQUEST,
            "test",
            Payload::SetModeRequest { target: Mode::Interactive },
        )
        .await;

        spy.wait_for(|e| {
            matches!(
                e.payload,
                Payload::ModeTransition { status: TransitionStatus::Completed, .. }
            )
        })
        .await;

        let events = spy.events();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match &e.payload {
                Payload::ModeTransition { status: TransitionStatus::Started, .. } => "started",
                Payload::ModeChange { .. } => "change",
                Payload::ModeTransition { status: TransitionStatus::Completed, .. } => "completed",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["started", "change", "completed"]);

        let change = events
            .iter()
            .find(|e| matches!(e.payload, Payload::ModeChange { .. }))
            .unwrap();
        assert_eq!(
            change.payload,
            Payload::ModeChange { old: Mode::Idle, new: Mode::Interactive }
        );
    }

    #[tokio::test]
    async fn same_mode_request_is_a_noop() {
        let bus = Arc::new(EventBus::new());
        let spy = BusSpy::watch(&bus, &[topics::MODE_CHANGE, topics::MODE_TRANSITION]);
        let _handle = started_manager(&bus).await;

        bus.emit(
            topics::SET_MODE_REQUEST,
            "test",
            Payload::SetModeRequest { target: Mode::Interactive },
        )
        .await;
        spy.wait_for(|e| matches!(e.payload, Payload::ModeChange { .. })).await;
        spy.clear();

        bus.emit(
            topics::SET_MODE_REQUEST,
            "test",
            Payload::SetModeRequest { target: Mode::Interactive },
        )
        .await;
        // Give the no-op a beat to (not) produce events.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(spy.count(topics::MODE_CHANGE), 0);
        assert_eq!(spy.count(topics::MODE_TRANSITION), 0);
    }

    #[tokio::test]
    async fn leaving_interactive_stops_capture_first() {
        let bus = Arc::new(EventBus::new());
        let spy = BusSpy::watch(
            &bus,
            &[topics::MIC_STOP_REQUEST, topics::MODE_CHANGE],
        );
        let _handle = started_manager(&bus).await;

        bus.emit(
            topics::SET_MODE_REQUEST,
            "test",
            Payload::SetModeRequest { target: Mode::Interactive },
        )
        .await;
        spy.wait_for(|e| matches!(e.payload, Payload::ModeChange { new: Mode::Interactive, .. }))
            .await;

        bus.emit(
            topics::SET_MODE_REQUEST,
            "test",
            Payload::SetModeRequest { target: Mode::Ambient },
        )
        .await;
        spy.wait_for(|e| matches!(e.payload, Payload::ModeChange { new: Mode::Ambient, .. }))
            .await;

        let events = spy.events();
        let stop_idx = events
            .iter()
            .position(|e| e.topic == topics::MIC_STOP_REQUEST)
            .expect("capture stop requested");
        let change_idx = events
            .iter()
            .position(|e| {
                matches!(e.payload, Payload::ModeChange { new: Mode::Ambient, .. })
            })
            .unwrap();
        assert!(stop_idx < change_idx, "capture stops before the mode flips");
    }

    #[tokio::test]
    async fn entering_idle_stops_music_and_dj() {
        let bus = Arc::new(EventBus::new());
        let spy = BusSpy::watch(&bus, &[topics::MUSIC_COMMAND, topics::DJ_COMMAND]);
        let _handle = started_manager(&bus).await;

        bus.emit(
            topics::SET_MODE_REQUEST,
            "test",
            Payload::SetModeRequest { target: Mode::Ambient },
        )
        .await;
        spy.wait_for(|e| {
            e.payload == Payload::MusicCommand(MusicCommand::Ambient)
        })
        .await;

        bus.emit(
            topics::SET_MODE_REQUEST,
            "test",
            Payload::SetModeRequest { target: Mode::Idle },
        )
        .await;
        spy.wait_for(|e| e.payload == Payload::MusicCommand(MusicCommand::Stop))
            .await;
        spy.wait_for(|e| e.payload == Payload::DjCommand(DjCommand::Stop))
            .await;
    }
}
