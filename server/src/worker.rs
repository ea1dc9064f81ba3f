//! Fan-out workers.
//!
//! Each worker owns a topic registry and a FIFO job queue drained by a
//! dedicated task, so all fan-out for one worker is serialized: two
//! backplane messages are never interleaved within a worker, and matching
//! subscribers see them in arrival order. New connections are assigned to
//! workers round-robin and stay on their worker for life.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant};
use tracing::debug;

use crate::backplane::PublishedEvent;
use crate::connection::Connection;
use crate::metrics::WorkerMetrics;
use crate::registry::TopicRegistry;

const EVENTLOOP_DELAY_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// A deferred action for a worker's next turn.
pub enum Job {
    Publish(Arc<PublishedEvent>),
}

/// Handle to one worker task.
pub struct Worker {
    index: usize,
    registry: Arc<TopicRegistry>,
    jobs: mpsc::UnboundedSender<Job>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    fn spawn(index: usize) -> Self {
        let registry = Arc::new(TopicRegistry::new());
        let metrics = Arc::new(WorkerMetrics::default());
        let (jobs, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_worker(index, registry.clone(), rx, metrics.clone()));

        Self {
            index,
            registry,
            jobs,
            metrics,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Enqueues a publish job on this worker's queue.
    pub fn publish(&self, event: Arc<PublishedEvent>) {
        let _ = self.jobs.send(Job::Publish(event));
    }
}

async fn run_worker(
    index: usize,
    registry: Arc<TopicRegistry>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    metrics: Arc<WorkerMetrics>,
) {
    debug!(worker = index, "worker started");

    let started = Instant::now();
    let mut ticks: u32 = 0;
    let mut delay_probe = interval(EVENTLOOP_DELAY_SAMPLE_INTERVAL);
    // The first tick of a tokio interval fires immediately.
    delay_probe.tick().await;

    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(Job::Publish(event)) => {
                    registry.publish(&event);
                }
                None => break,
            },
            _ = delay_probe.tick() => {
                ticks += 1;
                let expected = started + EVENTLOOP_DELAY_SAMPLE_INTERVAL * ticks;
                let late = Instant::now().saturating_duration_since(expected);
                metrics
                    .eventloop_delay_ms
                    .store(late.as_millis() as i64, Ordering::Relaxed);
            }
        }
    }

    debug!(worker = index, "worker stopped");
}

/// The pool of workers plus the round-robin assignment cursor.
pub struct WorkerPool {
    workers: Vec<Worker>,
    cursor: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `count` workers (at least one).
    pub fn spawn(count: usize) -> Arc<Self> {
        let count = count.max(1);
        let workers = (0..count).map(Worker::spawn).collect();

        Arc::new(Self {
            workers,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Next worker for a new connection, round-robin.
    pub fn next_worker(&self) -> &Worker {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[idx]
    }

    pub fn worker(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    /// Enqueues a publish job on every worker, preserving per-message
    /// ordering within each worker.
    pub fn publish_all(&self, event: PublishedEvent) {
        let event = Arc::new(event);
        for worker in &self.workers {
            worker.publish(event.clone());
        }
    }

    pub fn worker_metrics(&self) -> Vec<Arc<WorkerMetrics>> {
        self.workers.iter().map(|w| w.metrics().clone()).collect()
    }

    /// Unlinks a connection from its worker: splices it out of every topic
    /// it subscribed. Idempotent; the subscription set drains on first call.
    pub fn teardown_connection(&self, conn: &Arc<Connection>) {
        conn.mark_closed();

        let worker = self.worker(conn.worker_index());
        for filter in conn.take_subscriptions() {
            worker.registry().unsubscribe_connection(conn.id(), &filter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessController;
    use crate::connection::{ConnectionKind, Outbound};
    use serde_json::Value;

    fn event(topic: &str, message: &str) -> PublishedEvent {
        PublishedEvent {
            topic: topic.to_string(),
            id: "0000000000001-0000".to_string(),
            message: message.to_string(),
            origin: String::new(),
        }
    }

    #[tokio::test]
    async fn round_robin_wraps() {
        let pool = WorkerPool::spawn(3);
        let a = pool.next_worker().index();
        let b = pool.next_worker().index();
        let c = pool.next_worker().index();
        let d = pool.next_worker().index();
        assert_eq!([a, b, c], [0, 1, 2]);
        assert_eq!(d, 0);
    }

    #[tokio::test]
    async fn publish_all_reaches_subscribers_on_every_worker() {
        let pool = WorkerPool::spawn(2);

        let mut receivers = Vec::new();
        for i in 0..2 {
            let (c, rx) = Connection::channel(
                ConnectionKind::WebSocket,
                "127.0.0.1:1000".parse().unwrap(),
                AccessController::new(true),
                i,
            );
            let conn = Arc::new(c);
            pool.worker(i)
                .registry()
                .subscribe_connection(&conn, "t/#", Value::from(1));
            receivers.push((conn, rx));
        }

        pool.publish_all(event("t/x", "hello"));

        for (_conn, rx) in &mut receivers {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            assert!(matches!(frame, Outbound::Message(_)));
        }
    }

    #[tokio::test]
    async fn per_worker_ordering_is_preserved() {
        let pool = WorkerPool::spawn(1);
        let (c, mut rx) = Connection::channel(
            ConnectionKind::WebSocket,
            "127.0.0.1:1000".parse().unwrap(),
            AccessController::new(true),
            0,
        );
        let conn = Arc::new(c);
        pool.worker(0)
            .registry()
            .subscribe_connection(&conn, "t/#", Value::from(1));

        for i in 0..10 {
            pool.publish_all(event("t/x", &format!("m{i}")));
        }

        for i in 0..10 {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            match frame {
                Outbound::Message(p) => {
                    let v: Value = serde_json::from_str(&p).unwrap();
                    assert_eq!(v["result"]["message"], format!("m{i}"));
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn teardown_removes_registry_entries() {
        let pool = WorkerPool::spawn(1);
        let (c, _rx) = Connection::channel(
            ConnectionKind::WebSocket,
            "127.0.0.1:1000".parse().unwrap(),
            AccessController::new(true),
            0,
        );
        let conn = Arc::new(c);
        conn.add_subscription("t/#", Value::from(1));
        pool.worker(0)
            .registry()
            .subscribe_connection(&conn, "t/#", Value::from(1));
        assert_eq!(pool.worker(0).registry().topic_count(), 1);

        pool.teardown_connection(&conn);
        assert_eq!(pool.worker(0).registry().topic_count(), 0);

        // Idempotent.
        pool.teardown_connection(&conn);
    }
}
