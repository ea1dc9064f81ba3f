//! Per-peer connection state.
//!
//! Each peer session (WebSocket or SSE) owns one `Connection` and one
//! mailbox receiver. Fan-out producers enqueue outbound frames through the
//! `Connection`; the session task drains the mailbox and writes to the
//! socket. The mailbox is bounded by bytes: a connection that would queue
//! more than 8 MiB is closed rather than buffered further.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::access::AccessController;
use crate::backplane::PublishedEvent;
use crate::rpc;

/// Cap on bytes queued for one connection. Exceeding it closes the
/// connection; backpressure is disconnect, not stall.
pub const MAX_WRITE_BUFFER_BYTES: usize = 8 * 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    WebSocket,
    Sse,
}

/// One outbound frame queued for a session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text payload for a WebSocket session.
    Message(String),
    /// Event for an SSE session.
    Event { id: String, data: String },
    /// Flush queued frames, send a close frame, stop the session.
    Close,
}

impl Outbound {
    fn queued_len(&self) -> usize {
        match self {
            Outbound::Message(payload) => payload.len(),
            Outbound::Event { id, data } => id.len() + data.len(),
            Outbound::Close => 0,
        }
    }
}

pub struct Connection {
    id: u64,
    pub remote_addr: SocketAddr,
    pub kind: ConnectionKind,
    pub access: AccessController,
    worker_index: usize,
    tx: mpsc::UnboundedSender<Outbound>,
    queued_bytes: AtomicUsize,
    closed: AtomicBool,
    subscriptions: Mutex<HashMap<String, Value>>,
}

impl Connection {
    /// Creates a connection and the mailbox receiver for its session task.
    pub fn channel(
        kind: ConnectionKind,
        remote_addr: SocketAddr,
        access: AccessController,
        worker_index: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let conn = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            kind,
            access,
            worker_index,
            tx,
            queued_bytes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
        };

        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Index of the worker this connection is pinned to. A connection never
    /// migrates between workers.
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the connection closed; returns true for the caller that did
    /// the transition, so teardown runs exactly once.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Enqueues an outbound frame, enforcing the write-buffer byte cap.
    fn enqueue(&self, frame: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }

        let len = frame.queued_len();
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if queued + len > MAX_WRITE_BUFFER_BYTES {
            // The overflowing frame is dropped whole; nothing partial is
            // ever queued past the cap.
            self.shutdown();
            return false;
        }

        self.queued_bytes.fetch_add(len, Ordering::AcqRel);
        self.tx.send(frame).is_ok()
    }

    /// Queues a text frame for a WebSocket session.
    pub fn send_text(&self, payload: String) -> bool {
        self.enqueue(Outbound::Message(payload))
    }

    /// Queues an event for an SSE session.
    pub fn send_event(&self, id: String, data: String) -> bool {
        self.enqueue(Outbound::Event { id, data })
    }

    /// Called by the session task after writing a frame to the socket.
    pub fn note_flushed(&self, frame: &Outbound) {
        self.queued_bytes
            .fetch_sub(frame.queued_len(), Ordering::AcqRel);
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Requests an orderly close: queued frames flush first, then the
    /// session sends a close frame and stops.
    pub fn shutdown(&self) {
        if self.mark_closed() {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    /// Formats and queues a published event for this connection, using the
    /// request id of the subscription that matched.
    pub fn deliver(&self, event: &PublishedEvent, request_id: &Value) -> bool {
        match self.kind {
            ConnectionKind::WebSocket => {
                self.send_text(rpc::notification(request_id, event))
            }
            ConnectionKind::Sse => self.send_event(event.id.clone(), event.message.clone()),
        }
    }

    /// Records a subscription; returns false (a no-op) if the filter is
    /// already subscribed.
    pub fn add_subscription(&self, filter: &str, request_id: Value) -> bool {
        let mut subs = self.subscriptions.lock();
        if subs.contains_key(filter) {
            return false;
        }

        subs.insert(filter.to_string(), request_id);
        true
    }

    pub fn remove_subscription(&self, filter: &str) -> bool {
        self.subscriptions.lock().remove(filter).is_some()
    }

    pub fn list_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// Removes and returns all subscribed filters, for teardown and
    /// `unsubscribeAll`.
    pub fn take_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().drain().map(|(f, _)| f).collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(kind: ConnectionKind) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        Connection::channel(
            kind,
            "127.0.0.1:12345".parse().unwrap(),
            AccessController::new(true),
            0,
        )
    }

    #[test]
    fn send_text_queues_and_flush_releases_budget() {
        let (conn, mut rx) = test_conn(ConnectionKind::WebSocket);

        assert!(conn.send_text("hello".to_string()));
        assert_eq!(conn.queued_bytes(), 5);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, Outbound::Message("hello".to_string()));
        conn.note_flushed(&frame);
        assert_eq!(conn.queued_bytes(), 0);
    }

    #[test]
    fn exceeding_write_budget_closes_connection() {
        let (conn, mut rx) = test_conn(ConnectionKind::WebSocket);

        let big = "x".repeat(MAX_WRITE_BUFFER_BYTES - 1);
        assert!(conn.send_text(big));

        // The next frame would cross the cap: dropped, connection closed.
        assert!(!conn.send_text("xx".to_string()));
        assert!(conn.is_closed());

        // First frame is still intact, followed by the close request.
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Message(_)));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn sends_after_shutdown_are_dropped() {
        let (conn, mut rx) = test_conn(ConnectionKind::WebSocket);
        conn.shutdown();
        assert!(!conn.send_text("late".to_string()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (conn, mut rx) = test_conn(ConnectionKind::WebSocket);
        conn.shutdown();
        conn.shutdown();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duplicate_subscription_is_a_noop() {
        let (conn, _rx) = test_conn(ConnectionKind::WebSocket);
        assert!(conn.add_subscription("a/#", Value::from(1)));
        assert!(!conn.add_subscription("a/#", Value::from(2)));
        assert_eq!(conn.subscription_count(), 1);
    }

    #[test]
    fn deliver_formats_per_kind() {
        let event = PublishedEvent {
            topic: "room/a".to_string(),
            id: "0000000001000-0000".to_string(),
            message: "23.5".to_string(),
            origin: String::new(),
        };

        let (ws, mut ws_rx) = test_conn(ConnectionKind::WebSocket);
        assert!(ws.deliver(&event, &Value::from(1)));
        match ws_rx.try_recv().unwrap() {
            Outbound::Message(payload) => {
                let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
                assert_eq!(v["id"], 1);
                assert_eq!(v["result"]["topic"], "room/a");
                assert_eq!(v["result"]["message"], "23.5");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let (sse, mut sse_rx) = test_conn(ConnectionKind::Sse);
        assert!(sse.deliver(&event, &Value::Null));
        assert_eq!(
            sse_rx.try_recv().unwrap(),
            Outbound::Event {
                id: "0000000001000-0000".to_string(),
                data: "23.5".to_string(),
            }
        );
    }
}
