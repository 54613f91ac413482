//! Topic-addressed pub/sub with bounded per-subscription mailboxes.
//!
//! Delivery guarantees: events from a single publisher reach each subscriber
//! in publish order; across publishers no order is promised. Handlers run in
//! their owning service's dispatch loop, never in the publisher's call stack.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cantinaproto::{topics, Event, Payload};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Default mailbox depth per subscription.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// How long a block-policy publish waits for mailbox space before dropping.
const BLOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// What happens when a subscription's mailbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued event. Used for status/progress topics where
    /// freshness beats completeness.
    DropOldest,
    /// Give the publisher up to 50 ms to find space, then drop the new
    /// event. Used everywhere else.
    BlockThenDrop,
}

impl OverflowPolicy {
    /// Policy for a topic per the lossy classification in `cantinaproto`.
    pub fn for_topic(topic: &str) -> Self {
        if topics::is_lossy(topic) {
            OverflowPolicy::DropOldest
        } else {
            OverflowPolicy::BlockThenDrop
        }
    }
}

struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Signalled when the consumer pops (space available).
    space: Notify,
    /// Signalled when a producer pushes (event available).
    ready: Notify,
}

struct SubscriptionInner {
    id: u64,
    topic: String,
    subscriber: String,
    mailbox: Mailbox,
    dropped: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl SubscriptionInner {
    /// Push respecting the overflow policy. Returns false if the event was
    /// dropped.
    async fn push(&self, event: Event) -> bool {
        match self.mailbox.policy {
            OverflowPolicy::DropOldest => {
                let mut queue = self.mailbox.queue.lock().unwrap();
                if queue.len() >= self.mailbox.capacity {
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(event);
                drop(queue);
                self.mailbox.ready.notify_one();
                true
            }
            OverflowPolicy::BlockThenDrop => {
                let deadline = Instant::now() + BLOCK_TIMEOUT;
                loop {
                    let space = self.mailbox.space.notified();
                    {
                        let mut queue = self.mailbox.queue.lock().unwrap();
                        if queue.len() < self.mailbox.capacity {
                            queue.push_back(event);
                            drop(queue);
                            self.mailbox.ready.notify_one();
                            return true;
                        }
                    }
                    if self.closed.load(Ordering::Acquire) {
                        return false;
                    }
                    if tokio::time::timeout_at(deadline, space).await.is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            topic = %self.topic,
                            subscriber = %self.subscriber,
                            "mailbox full, event dropped"
                        );
                        return false;
                    }
                }
            }
        }
    }

    /// Push unconditionally, ignoring capacity. Startup-coordination only.
    fn push_unbounded(&self, event: Event) {
        let mut queue = self.mailbox.queue.lock().unwrap();
        queue.push_back(event);
        drop(queue);
        self.mailbox.ready.notify_one();
    }
}

/// Receiving half of a subscription. Dropping it closes the subscription;
/// the bus prunes closed entries lazily on the next emit.
pub struct BusReceiver {
    inner: Arc<SubscriptionInner>,
}

impl BusReceiver {
    /// Await the next event. Returns `None` once the subscription is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let ready = self.inner.mailbox.ready.notified();
            {
                let mut queue = self.inner.mailbox.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    drop(queue);
                    self.inner.mailbox.space.notify_one();
                    return Some(event);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            ready.await;
        }
    }

    /// Non-blocking pop, for tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        let mut queue = self.inner.mailbox.queue.lock().unwrap();
        let event = queue.pop_front();
        if event.is_some() {
            self.inner.mailbox.space.notify_one();
        }
        event
    }

    /// The topic this subscription is bound to.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Shared counter of events dropped on this subscription.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.inner.dropped)
    }
}

impl Drop for BusReceiver {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        // Wake any publisher parked on a full mailbox.
        self.inner.mailbox.space.notify_waiters();
    }
}

/// The in-process event bus.
pub struct EventBus {
    subscriptions: RwLock<HashMap<String, Vec<Arc<SubscriptionInner>>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a topic with the default capacity and the topic's
    /// standard overflow policy.
    pub fn subscribe(&self, topic: impl Into<String>, subscriber: impl Into<String>) -> BusReceiver {
        let topic = topic.into();
        let policy = OverflowPolicy::for_topic(&topic);
        self.subscribe_with(topic, subscriber, DEFAULT_MAILBOX_CAPACITY, policy)
    }

    /// Subscribe with explicit capacity and policy.
    pub fn subscribe_with(
        &self,
        topic: impl Into<String>,
        subscriber: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> BusReceiver {
        let topic = topic.into();
        let inner = Arc::new(SubscriptionInner {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            topic: topic.clone(),
            subscriber: subscriber.into(),
            mailbox: Mailbox {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                capacity,
                policy,
                space: Notify::new(),
                ready: Notify::new(),
            },
            dropped: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        });

        self.subscriptions
            .write()
            .unwrap()
            .entry(topic)
            .or_default()
            .push(Arc::clone(&inner));

        BusReceiver { inner }
    }

    /// Publish an event. Never fails; overflow is resolved per subscription
    /// by its policy. A block-policy subscriber may suspend the publisher up
    /// to 50 ms.
    pub async fn emit(&self, topic: &str, source: &str, payload: Payload) {
        let targets = self.targets(topic);
        if targets.is_empty() {
            return;
        }
        let event = Event::new(topic, source, payload);
        for sub in targets {
            sub.push(event.clone()).await;
        }
    }

    /// Publish without ever waiting or dropping, bypassing mailbox bounds.
    /// For startup-time coordination only; steady-state code uses [`emit`].
    ///
    /// [`emit`]: EventBus::emit
    pub fn emit_sync(&self, topic: &str, source: &str, payload: Payload) {
        let targets = self.targets(topic);
        if targets.is_empty() {
            return;
        }
        let event = Event::new(topic, source, payload);
        for sub in targets {
            sub.push_unbounded(event.clone());
        }
    }

    /// Publish a prebuilt event (preserves id/source/timestamp). Used by the
    /// bridge when relaying validated client commands.
    pub async fn emit_event(&self, event: Event) {
        let targets = self.targets(&event.topic);
        for sub in targets {
            sub.push(event.clone()).await;
        }
    }

    /// Live subscription count for a topic, pruning closed entries.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.targets(topic).len()
    }

    /// Snapshot the live subscriptions for a topic, lazily pruning closed
    /// ones. The lock is held only for the snapshot, never across a push.
    fn targets(&self, topic: &str) -> Vec<Arc<SubscriptionInner>> {
        let needs_prune = {
            let map = self.subscriptions.read().unwrap();
            match map.get(topic) {
                Some(subs) => subs.iter().any(|s| s.closed.load(Ordering::Acquire)),
                None => return Vec::new(),
            }
        };

        if needs_prune {
            let mut map = self.subscriptions.write().unwrap();
            if let Some(subs) = map.get_mut(topic) {
                subs.retain(|s| !s.closed.load(Ordering::Acquire));
            }
        }

        let map = self.subscriptions.read().unwrap();
        map.get(topic).map(|subs| subs.to_vec()).unwrap_or_default()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.subscriptions.read().unwrap();
        let total: usize = map.values().map(|v| v.len()).sum();
        f.debug_struct("EventBus")
            .field("topics", &map.len())
            .field("subscriptions", &total)
            .finish()
    }
}

impl std::fmt::Debug for SubscriptionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("subscriber", &self.subscriber)
            .finish()
    }
}
