//! cantinabus - In-process event bus and service lifecycle substrate.
//!
//! Every CantinaOS service talks to the others exclusively through the
//! [`EventBus`]: topic-addressed publish/subscribe with a bounded mailbox
//! per subscription. Publishers never observe a failed publish; overflow is
//! resolved per subscription by its [`OverflowPolicy`] and counted.
//!
//! [`Service`] plus [`ServiceContext`] give every component the same
//! lifecycle: INIT → STARTING → RUNNING → (DEGRADED) → STOPPING → STOPPED,
//! with ERROR as the escalation terminal. State changes emit on the
//! service's `/status/{name}` topic.

pub mod bus;
pub mod service;
pub mod testing;

pub use bus::{BusReceiver, EventBus, OverflowPolicy, DEFAULT_MAILBOX_CAPACITY};
pub use service::{Service, ServiceContext, ServiceError, ServiceHandle};
