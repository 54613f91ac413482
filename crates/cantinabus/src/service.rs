//! Service lifecycle: the `Service` trait, per-service context, and the
//! handle the supervisor drives.
//!
//! State emissions are monotone per service: STARTING → RUNNING →
//! (DEGRADED ↔ RUNNING) → STOPPING → STOPPED, with ERROR as the escalation
//! terminal. Every change lands on `/status/{name}`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cantinaproto::{topics, Payload, ServiceState};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::bus::{BusReceiver, EventBus};

/// Repeated handler failures inside this window escalate DEGRADED → ERROR.
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const FAILURE_LIMIT: usize = 3;

/// How long a stopping service gets to drain its tasks.
pub const DRAIN_BUDGET: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Startup(String),

    #[error("{service} dependency unavailable: {message}")]
    Dependency { service: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn startup(message: impl Into<String>) -> Self {
        Self::Startup(message.into())
    }
}

/// A long-lived CantinaOS component.
///
/// `start` spawns the service's loops on the context and returns once the
/// service is operational; it must not block for the service's lifetime.
/// Cancellation arrives through `ctx.cancel`; `stop` runs after
/// cancellation, before the drain wait, for anything tasks can't release
/// themselves.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError>;

    async fn stop(&self, _ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Per-service runtime state: bus access, owned-task registry, lifecycle
/// state, failure accounting.
pub struct ServiceContext {
    name: &'static str,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started_at: Instant,
    state: Mutex<ServiceState>,
    drop_counters: Mutex<Vec<Arc<AtomicU64>>>,
    failures: Mutex<VecDeque<Instant>>,
}

impl ServiceContext {
    pub fn new(name: &'static str, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            name,
            bus,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started_at: Instant::now(),
            state: Mutex::new(ServiceState::Init),
            drop_counters: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Cancellation token covering every task this service owns.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Subscribe on behalf of this service; the subscription's drop counter
    /// feeds the service's status detail.
    pub fn subscribe(&self, topic: impl Into<String>) -> BusReceiver {
        let rx = self.bus.subscribe(topic, self.name);
        self.drop_counters.lock().unwrap().push(rx.drop_counter());
        rx
    }

    /// Spawn a task owned by this service. Owned tasks are awaited (with a
    /// drain budget) at shutdown; they should exit when `cancel_token()`
    /// fires.
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(fut);
    }

    /// Publish with this service as the source.
    pub async fn emit(&self, topic: &str, payload: Payload) {
        self.bus.emit(topic, self.name, payload).await;
    }

    pub fn current_state(&self) -> ServiceState {
        *self.state.lock().unwrap()
    }

    /// Total events dropped across this service's subscriptions.
    pub fn dropped_events(&self) -> u64 {
        self.drop_counters
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Transition to `state` and emit on `/status/{name}`.
    pub async fn set_state(&self, state: ServiceState, detail: Option<String>) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        info!(service = self.name, state = %state, "service state change");
        self.emit_status(detail).await;
    }

    /// Emit the current status without a state change (answers
    /// `/system/status_request`).
    pub async fn emit_status(&self, detail: Option<String>) {
        let payload = Payload::ServiceStatus {
            service: self.name.to_string(),
            state: self.current_state(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            detail,
            dropped_events: self.dropped_events(),
        };
        let topic = topics::service_status(self.name);
        self.bus.emit(&topic, self.name, payload).await;
    }

    /// Report an unhandled failure in one of this service's handlers.
    ///
    /// The service goes DEGRADED and `/system/error` fires. At the third
    /// failure inside sixty seconds the service escalates to ERROR and its
    /// tasks are cancelled.
    pub async fn handler_failed(&self, message: impl Into<String>) {
        let message = message.into();
        let now = Instant::now();
        let escalate = {
            let mut failures = self.failures.lock().unwrap();
            failures.push_back(now);
            while let Some(first) = failures.front() {
                if now.duration_since(*first) > FAILURE_WINDOW {
                    failures.pop_front();
                } else {
                    break;
                }
            }
            failures.len() >= FAILURE_LIMIT
        };

        error!(service = self.name, %message, "handler failure");
        self.emit(
            topics::SYSTEM_ERROR,
            Payload::SystemError {
                source: self.name.to_string(),
                message: message.clone(),
                severity: cantinaproto::LogLevel::Error,
            },
        )
        .await;

        if escalate {
            warn!(service = self.name, "repeated failures, stopping service");
            self.set_state(ServiceState::Error, Some(message)).await;
            self.cancel.cancel();
        } else {
            self.set_state(ServiceState::Degraded, Some(message)).await;
        }
    }

    /// Clear DEGRADED back to RUNNING after a successful recovery.
    pub async fn recovered(&self, detail: Option<String>) {
        if self.current_state() == ServiceState::Degraded {
            self.set_state(ServiceState::Running, detail).await;
        }
    }
}

/// A service paired with its context; what the supervisor holds.
pub struct ServiceHandle {
    service: Arc<dyn Service>,
    ctx: Arc<ServiceContext>,
}

impl ServiceHandle {
    pub fn new(service: Arc<dyn Service>, bus: Arc<EventBus>) -> Self {
        let ctx = ServiceContext::new(service.name(), bus);
        Self { service, ctx }
    }

    pub fn name(&self) -> &'static str {
        self.service.name()
    }

    pub fn ctx(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub fn state(&self) -> ServiceState {
        self.ctx.current_state()
    }

    /// Drive INIT → STARTING → RUNNING, or → ERROR on a failed start.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.ctx.set_state(ServiceState::Starting, None).await;
        match self.service.start(&self.ctx).await {
            Ok(()) => {
                self.ctx.set_state(ServiceState::Running, None).await;
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .set_state(ServiceState::Error, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Drive → STOPPING → STOPPED: cancel owned tasks, run `stop`, then
    /// wait out the drain budget.
    pub async fn stop(&self) {
        self.ctx.set_state(ServiceState::Stopping, None).await;
        self.ctx.cancel.cancel();

        if let Err(e) = self.service.stop(&self.ctx).await {
            warn!(service = self.name(), error = %e, "stop hook failed");
        }

        self.ctx.tracker.close();
        if tokio::time::timeout(DRAIN_BUDGET, self.ctx.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                service = self.name(),
                "tasks did not drain within budget, abandoning"
            );
        }

        self.ctx.set_state(ServiceState::Stopped, None).await;
    }
}
