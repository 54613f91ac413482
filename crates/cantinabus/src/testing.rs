//! Test fixtures: a bus spy that records everything published on chosen
//! topics, with await-until helpers for ordering assertions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cantinaproto::{Event, Payload};
use tokio::sync::Notify;

use crate::bus::{EventBus, OverflowPolicy};

/// Records every event published on the topics it watches.
///
/// Spies subscribe with large unbounded-ish mailboxes so they never distort
/// the drop behavior under test.
pub struct BusSpy {
    events: Arc<Mutex<Vec<Event>>>,
    notify: Arc<Notify>,
    _tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl BusSpy {
    /// Watch the given topics on `bus`.
    pub fn watch(bus: &Arc<EventBus>, topics: &[&str]) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        for topic in topics {
            let mut rx =
                bus.subscribe_with(*topic, "bus_spy", 4096, OverflowPolicy::DropOldest);
            let events = Arc::clone(&events);
            let notify = Arc::clone(&notify);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    events.lock().unwrap().push(event);
                    notify.notify_waiters();
                }
            }));
        }

        Self {
            events,
            notify,
            _tasks: tasks,
        }
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Recorded payloads for one topic, in arrival order.
    pub fn payloads(&self, topic: &str) -> Vec<Payload> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| e.payload.clone())
            .collect()
    }

    /// How many events arrived on `topic`.
    pub fn count(&self, topic: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.topic == topic)
            .count()
    }

    /// Wait until some recorded event satisfies `predicate`, returning it.
    ///
    /// Panics after sixty seconds; spies are for tests where the event is
    /// expected, and the generous bound keeps paused-clock tests (which
    /// auto-advance through scheduled deadlines) from tripping it.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        loop {
            if let Some(event) = self
                .events
                .lock()
                .unwrap()
                .iter()
                .find(|e| predicate(e))
                .cloned()
            {
                return event;
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!(
                    "spy timed out; recorded topics: {:?}",
                    self.events
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|e| e.topic.clone())
                        .collect::<Vec<_>>()
                );
            }
        }
    }

    /// Wait for the next event on a topic.
    pub async fn wait_for_topic(&self, topic: &str) -> Event {
        self.wait_for(|e| e.topic == topic).await
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantinaproto::topics;

    #[tokio::test]
    async fn spy_records_in_order() {
        let bus = Arc::new(EventBus::new());
        let spy = BusSpy::watch(&bus, &[topics::MODE_CHANGE, topics::MIC_START_REQUEST]);

        bus.emit(topics::MIC_START_REQUEST, "test", Payload::MicStartRequest)
            .await;
        spy.wait_for_topic(topics::MIC_START_REQUEST).await;

        assert_eq!(spy.count(topics::MIC_START_REQUEST), 1);
        assert_eq!(spy.count(topics::MODE_CHANGE), 0);
    }

    #[tokio::test]
    async fn clear_resets() {
        let bus = Arc::new(EventBus::new());
        let spy = BusSpy::watch(&bus, &[topics::MIC_START_REQUEST]);

        bus.emit(topics::MIC_START_REQUEST, "test", Payload::MicStartRequest)
            .await;
        spy.wait_for_topic(topics::MIC_START_REQUEST).await;
        spy.clear();
        assert!(spy.events().is_empty());
    }
}
