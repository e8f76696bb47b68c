//! Typed notifications for search subscribers
//!
//! The search publishes from its own task; each subscriber receives on a
//! channel of its own, so subscriber code never runs on provider or search
//! tasks. Callback subscribers are driven from the configured delivery
//! runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use dashmap::DashMap;
use shared::types::ServiceRecord;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// What a subscriber can listen for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Started,
    Stopped,
    ServiceFound,
    ServiceLost,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::Started,
        Topic::Stopped,
        Topic::ServiceFound,
        Topic::ServiceLost,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEvent {
    Started,
    Stopped,
    ServiceFound(ServiceRecord),
    ServiceLost(ServiceRecord),
}

impl SearchEvent {
    pub fn topic(&self) -> Topic {
        match self {
            SearchEvent::Started => Topic::Started,
            SearchEvent::Stopped => Topic::Stopped,
            SearchEvent::ServiceFound(_) => Topic::ServiceFound,
            SearchEvent::ServiceLost(_) => Topic::ServiceLost,
        }
    }
}

/// Opaque handle used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscriber {
    topics: Vec<Topic>,
    tx: mpsc::UnboundedSender<SearchEvent>,
}

/// A channel-backed subscription; drain it on whatever task suits the caller.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<SearchEvent>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<SearchEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SearchEvent> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out of search notifications to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: Arc<AtomicU64>,
    delivery: Handle,
}

impl EventBus {
    /// `delivery` is the runtime that callback subscribers run on.
    pub fn new(delivery: Handle) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            delivery,
        }
    }

    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            Subscriber {
                topics: topics.to_vec(),
                tx,
            },
        );
        Subscription {
            handle: SubscriptionHandle(id),
            rx,
        }
    }

    /// Runs `callback` on the delivery runtime for every event on `topic`.
    pub fn on<F>(&self, topic: Topic, mut callback: F) -> SubscriptionHandle
    where
        F: FnMut(SearchEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(&[topic]);
        let handle = subscription.handle();
        self.delivery.spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
        handle
    }

    /// Returns false if the handle was not subscribed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscribers.remove(&handle.0).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn publish(&self, event: SearchEvent) {
        let topic = event.topic();
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.topics.contains(&topic) {
                continue;
            }
            if subscriber.tx.send(event.clone()).is_err() {
                closed.push(*entry.key());
            }
        }

        for id in closed {
            tracing::debug!(subscription = id, "Dropping closed subscriber");
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::types::DiscoveryKind;
    use std::time::Duration;

    fn record(id: &str) -> ServiceRecord {
        ServiceRecord {
            id: id.to_string(),
            uri: format!("http://{}/", id),
            name: "TV".to_string(),
            version: "2.0".to_string(),
            device_type: "TV".to_string(),
            kind: DiscoveryKind::Lan,
            discovered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let bus = EventBus::new(Handle::current());
        let mut found_only = bus.subscribe(&[Topic::ServiceFound]);
        let mut all = bus.subscribe(&Topic::ALL);

        bus.publish(SearchEvent::Started);
        bus.publish(SearchEvent::ServiceFound(record("a")));

        assert_eq!(found_only.recv().await, Some(SearchEvent::ServiceFound(record("a"))));
        assert_eq!(found_only.try_recv(), None);
        assert_eq!(all.recv().await, Some(SearchEvent::Started));
        assert_eq!(all.recv().await, Some(SearchEvent::ServiceFound(record("a"))));
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_subscription() {
        let bus = EventBus::new(Handle::current());
        let mut sub = bus.subscribe(&Topic::ALL);

        assert!(bus.unsubscribe(sub.handle()));
        assert!(!bus.unsubscribe(sub.handle()));

        bus.publish(SearchEvent::Stopped);
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new(Handle::current());
        drop(bus.subscribe(&Topic::ALL));

        bus.publish(SearchEvent::Started);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_runs_on_delivery_runtime() {
        let bus = EventBus::new(Handle::current());
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.on(Topic::ServiceLost, move |event| {
            let _ = tx.send(event);
        });

        bus.publish(SearchEvent::ServiceFound(record("a")));
        bus.publish(SearchEvent::ServiceLost(record("b")));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(SearchEvent::ServiceLost(record("b"))));
    }
}
