//! Per-worker topic registry.
//!
//! Maps filter strings to subscriber lists. Subscribers are held as weak
//! references so a topic never keeps a dead connection alive; expired
//! entries are skipped on publish and spliced out on connection teardown.
//!
//! Lock order: registry map, then a topic's subscriber list. Connection
//! delivery below that point touches only atomics.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::error;

use crate::backplane::PublishedEvent;
use crate::connection::Connection;
use crate::topic::is_filter_matched;

struct Subscriber {
    conn: Weak<Connection>,
    conn_id: u64,
    request_id: Value,
}

/// One registered filter and its subscribers in insertion order.
pub struct Topic {
    filter: String,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Topic {
    fn new(filter: &str) -> Self {
        Self {
            filter: filter.to_string(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    fn add_subscriber(&self, conn: &Arc<Connection>, request_id: Value) {
        self.subscribers.lock().push(Subscriber {
            conn: Arc::downgrade(conn),
            conn_id: conn.id(),
            request_id,
        });
    }

    /// Delivers an event to every live subscriber, in insertion order.
    fn publish(&self, event: &PublishedEvent) -> usize {
        let mut delivered = 0;

        for sub in self.subscribers.lock().iter() {
            if let Some(conn) = sub.conn.upgrade() {
                if conn.deliver(event, &sub.request_id) {
                    delivered += 1;
                }
            }
        }

        delivered
    }

    fn remove_subscriber(&self, conn_id: u64) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| s.conn_id != conn_id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Registry of topics for one worker.
#[derive(Default)]
pub struct TopicRegistry {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a connection to `filter`, creating the topic on first use.
    pub fn subscribe_connection(&self, conn: &Arc<Connection>, filter: &str, request_id: Value) {
        let topic = self
            .topics
            .lock()
            .entry(filter.to_string())
            .or_insert_with(|| Arc::new(Topic::new(filter)))
            .clone();

        topic.add_subscriber(conn, request_id);
    }

    /// Removes one connection's subscription from `filter`. The last
    /// unsubscriber deletes the topic.
    pub fn unsubscribe_connection(&self, conn_id: u64, filter: &str) -> bool {
        let topic = match self.topics.lock().get(filter) {
            Some(t) => t.clone(),
            None => {
                error!(filter, "unsubscribe from unknown topic");
                return false;
            }
        };

        let removed = topic.remove_subscriber(conn_id);

        if topic.subscriber_count() == 0 {
            self.delete_topic(filter);
        }

        removed
    }

    /// Deletes a topic entry outright.
    pub fn delete_topic(&self, filter: &str) {
        self.topics.lock().remove(filter);
    }

    /// Fans an event out to the subscribers of every matching filter.
    /// Returns the number of deliveries.
    pub fn publish(&self, event: &PublishedEvent) -> usize {
        let matching: Vec<Arc<Topic>> = self
            .topics
            .lock()
            .iter()
            .filter(|(filter, _)| is_filter_matched(filter, &event.topic))
            .map(|(_, t)| t.clone())
            .collect();

        matching.iter().map(|t| t.publish(event)).sum()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessController;
    use crate::connection::{ConnectionKind, Outbound};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn conn() -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
        let (c, rx) = Connection::channel(
            ConnectionKind::WebSocket,
            "127.0.0.1:9999".parse().unwrap(),
            AccessController::new(true),
            0,
        );
        (Arc::new(c), rx)
    }

    fn event(topic: &str, message: &str) -> PublishedEvent {
        PublishedEvent {
            topic: topic.to_string(),
            id: "0000000000001-0000".to_string(),
            message: message.to_string(),
            origin: String::new(),
        }
    }

    #[test]
    fn publish_reaches_matching_subscribers_only() {
        let registry = TopicRegistry::new();
        let (a, mut a_rx) = conn();
        let (b, mut b_rx) = conn();

        registry.subscribe_connection(&a, "room1/+/sensor1", Value::from(1));
        registry.subscribe_connection(&b, "other/#", Value::from(2));

        let delivered = registry.publish(&event("room1/kitchen/sensor1", "23.5"));
        assert_eq!(delivered, 1);
        assert!(matches!(a_rx.try_recv().unwrap(), Outbound::Message(_)));
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn filter_does_not_match_sibling_topic() {
        let registry = TopicRegistry::new();
        let (a, mut a_rx) = conn();

        registry.subscribe_connection(&a, "topic1/#", Value::from(1));
        assert_eq!(registry.publish(&event("topic2", "nope")), 0);
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn subscribers_receive_in_insertion_order() {
        let registry = TopicRegistry::new();
        let (a, mut a_rx) = conn();
        let (b, mut b_rx) = conn();

        registry.subscribe_connection(&a, "t/#", Value::from(10));
        registry.subscribe_connection(&b, "t/#", Value::from(20));

        registry.publish(&event("t/x", "m"));

        // Both get the frame; each carries its own request id.
        let a_frame = match a_rx.try_recv().unwrap() {
            Outbound::Message(p) => p,
            other => panic!("unexpected: {other:?}"),
        };
        let b_frame = match b_rx.try_recv().unwrap() {
            Outbound::Message(p) => p,
            other => panic!("unexpected: {other:?}"),
        };

        let a_v: Value = serde_json::from_str(&a_frame).unwrap();
        let b_v: Value = serde_json::from_str(&b_frame).unwrap();
        assert_eq!(a_v["id"], 10);
        assert_eq!(b_v["id"], 20);
    }

    #[test]
    fn dropped_connections_are_skipped() {
        let registry = TopicRegistry::new();
        let (a, a_rx) = conn();
        registry.subscribe_connection(&a, "t/#", Value::from(1));

        drop(a_rx);
        drop(a);

        assert_eq!(registry.publish(&event("t/x", "m")), 0);
    }

    #[test]
    fn last_unsubscriber_deletes_topic() {
        let registry = TopicRegistry::new();
        let (a, _a_rx) = conn();
        let (b, _b_rx) = conn();

        registry.subscribe_connection(&a, "t/#", Value::from(1));
        registry.subscribe_connection(&b, "t/#", Value::from(2));
        assert_eq!(registry.topic_count(), 1);

        assert!(registry.unsubscribe_connection(a.id(), "t/#"));
        assert_eq!(registry.topic_count(), 1);

        assert!(registry.unsubscribe_connection(b.id(), "t/#"));
        assert_eq!(registry.topic_count(), 0);
    }
}
