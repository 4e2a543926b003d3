//! In-process lossy fan-out of lifecycle events.
//!
//! Publishers never block: each subscriber gets a bounded channel and events
//! that do not fit are dropped for that subscriber only. There is no replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Buffered events per subscriber before drops start.
pub const SUBSCRIBER_BUFFER: usize = 32;

/// A realtime event pushed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic within the broker's lifetime, assigned on publish.
    pub id: u64,
    /// Event kind, e.g. `run.started`, `run.completed`, `job.changed`.
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: 0,
            event_type: event_type.into(),
            job_name: None,
            run_id: None,
            action: None,
            status: None,
            trigger: None,
            at: Utc::now(),
        }
    }

    pub fn run_started(job_name: &str, run_id: &str, trigger: &str) -> Self {
        let mut event = Self::new("run.started");
        event.job_name = Some(job_name.to_string());
        event.run_id = Some(run_id.to_string());
        event.status = Some("running".to_string());
        event.trigger = Some(trigger.to_string());
        event
    }

    pub fn run_completed(job_name: &str, run_id: &str, status: &str, trigger: &str) -> Self {
        let mut event = Self::new("run.completed");
        event.job_name = Some(job_name.to_string());
        event.run_id = Some(run_id.to_string());
        event.status = Some(status.to_string());
        event.trigger = Some(trigger.to_string());
        event
    }

    pub fn job_changed(job_name: &str, action: &str) -> Self {
        let mut event = Self::new("job.changed");
        event.job_name = Some(job_name.to_string());
        event.action = Some(action.to_string());
        event
    }
}

struct BrokerInner {
    next_event_id: AtomicU64,
    next_subscriber_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Event>>>,
}

/// Fan-out event bus.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                next_event_id: AtomicU64::new(0),
                next_subscriber_id: AtomicU64::new(0),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Broadcast an event to every subscriber. Slow subscribers drop events
    /// instead of blocking the publisher.
    pub fn publish(&self, mut event: Event) {
        event.id = self.inner.next_event_id.fetch_add(1, Ordering::Relaxed) + 1;
        if event.at.timestamp_millis() == 0 {
            event.at = Utc::now();
        }

        let subscribers = self.inner.subscribers.read();
        for sender in subscribers.values() {
            let _ = sender.try_send(event.clone());
        }
    }

    /// Register a subscriber. Dropping or cancelling the returned
    /// [`Subscription`] closes the channel.
    pub fn subscribe(&self) -> (mpsc::Receiver<Event>, Subscription) {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscribers.write().insert(id, tx);
        (
            rx,
            Subscription {
                id,
                inner: Arc::clone(&self.inner),
            },
        )
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle owning a subscriber registration.
pub struct Subscription {
    id: u64,
    inner: Arc<BrokerInner>,
}

impl Subscription {
    /// Deregister the subscriber. Safe to call more than once; publishes
    /// after cancellation are discarded for this subscriber.
    pub fn cancel(&self) {
        self.inner.subscribers.write().remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonic_from_one() {
        let broker = EventBroker::new();
        let (mut rx, _sub) = broker.subscribe();

        broker.publish(Event::new("job.changed"));
        broker.publish(Event::new("job.changed"));

        assert_eq!(rx.recv().await.unwrap().id, 1);
        assert_eq!(rx.recv().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn subscriber_sees_publish_order() {
        let broker = EventBroker::new();
        let (mut rx, _sub) = broker.subscribe();

        for run in ["01A", "01B", "01C"] {
            broker.publish(Event::run_started("job", run, "schedule"));
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().run_id.unwrap());
        }
        assert_eq!(seen, ["01A", "01B", "01C"]);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let broker = EventBroker::new();
        let (mut rx, _sub) = broker.subscribe();

        // Never read while 10k events are published; the publisher must not
        // block and the subscriber keeps at most its buffer.
        for _ in 0..10_000 {
            broker.publish(Event::new("run.started"));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn drops_affect_only_the_full_subscriber() {
        let broker = EventBroker::new();
        let (mut slow_rx, _slow) = broker.subscribe();
        let (mut fast_rx, _fast) = broker.subscribe();

        // The fast subscriber keeps up; the slow one never reads.
        let mut fast_seen = 0;
        for _ in 0..SUBSCRIBER_BUFFER + 5 {
            broker.publish(Event::new("run.completed"));
            assert!(fast_rx.recv().await.is_some());
            fast_seen += 1;
        }
        assert_eq!(fast_seen, SUBSCRIBER_BUFFER + 5);

        let mut slow_seen = 0;
        while slow_rx.try_recv().is_ok() {
            slow_seen += 1;
        }
        assert_eq!(slow_seen, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_closes_channel() {
        let broker = EventBroker::new();
        let (mut rx, sub) = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 1);

        sub.cancel();
        sub.cancel();
        assert_eq!(broker.subscriber_count(), 0);

        broker.publish(Event::new("run.started"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let broker = EventBroker::new();
        {
            let (_rx, _sub) = broker.subscribe();
            assert_eq!(broker.subscriber_count(), 1);
        }
        assert_eq!(broker.subscriber_count(), 0);
    }
}
