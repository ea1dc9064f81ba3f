//! Server and per-worker metrics.
//!
//! Counters are plain atomics updated on the hot paths and aggregated at
//! scrape time. `/metrics` renders the Prometheus exposition format by
//! default, or JSON with `?format=json`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::routes::AppState;

/// Counters owned by the server task.
#[derive(Default)]
pub struct ServerMetrics {
    pub worker_count: AtomicU64,
    pub publish_count: AtomicU64,
    pub redis_connection_fail_count: AtomicU64,
    pub redis_publish_delay_ms: AtomicI64,
    pub server_start_unixtime: AtomicI64,
}

/// Counters owned by one worker.
#[derive(Default)]
pub struct WorkerMetrics {
    pub current_connections_count: AtomicI64,
    pub total_connect_count: AtomicU64,
    pub total_disconnect_count: AtomicU64,
    pub eventloop_delay_ms: AtomicI64,
}

impl WorkerMetrics {
    pub fn connection_opened(&self) {
        self.current_connections_count.fetch_add(1, Ordering::Relaxed);
        self.total_connect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.current_connections_count.fetch_sub(1, Ordering::Relaxed);
        self.total_disconnect_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of all metrics, summed across workers. The eventloop delay is
/// averaged.
#[derive(Debug, Serialize)]
pub struct AggregatedMetrics {
    pub worker_count: u64,
    pub publish_count: u64,
    pub redis_connection_fail_count: u64,
    pub redis_publish_delay_ms: i64,
    pub server_start_unixtime: i64,
    pub current_connections_count: i64,
    pub total_connect_count: u64,
    pub total_disconnect_count: u64,
    pub eventloop_delay_ms: i64,
}

pub fn aggregate(server: &ServerMetrics, workers: &[Arc<WorkerMetrics>]) -> AggregatedMetrics {
    let mut current_connections_count = 0i64;
    let mut total_connect_count = 0u64;
    let mut total_disconnect_count = 0u64;
    let mut eventloop_delay_ms = 0i64;

    for w in workers {
        current_connections_count += w.current_connections_count.load(Ordering::Relaxed);
        total_connect_count += w.total_connect_count.load(Ordering::Relaxed);
        total_disconnect_count += w.total_disconnect_count.load(Ordering::Relaxed);
        eventloop_delay_ms += w.eventloop_delay_ms.load(Ordering::Relaxed);
    }

    if !workers.is_empty() {
        eventloop_delay_ms /= workers.len() as i64;
    }

    AggregatedMetrics {
        worker_count: server.worker_count.load(Ordering::Relaxed),
        publish_count: server.publish_count.load(Ordering::Relaxed),
        redis_connection_fail_count: server.redis_connection_fail_count.load(Ordering::Relaxed),
        redis_publish_delay_ms: server.redis_publish_delay_ms.load(Ordering::Relaxed),
        server_start_unixtime: server.server_start_unixtime.load(Ordering::Relaxed),
        current_connections_count,
        total_connect_count,
        total_disconnect_count,
        eventloop_delay_ms,
    }
}

/// Renders aggregated metrics in the Prometheus exposition format, with the
/// configured name prefix and an `instance="<hostname>:<listen_port>"`
/// label on every series.
pub struct MetricsRenderer {
    registry: Registry,
    worker_count: IntGauge,
    publish_count: IntGauge,
    redis_connection_fail_count: IntGauge,
    redis_publish_delay_ms: IntGauge,
    server_start_unixtime: IntGauge,
    current_connections_count: IntGauge,
    total_connect_count: IntGauge,
    total_disconnect_count: IntGauge,
    eventloop_delay_ms: IntGauge,
}

impl MetricsRenderer {
    pub fn new(prefix: &str, instance: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            IntGauge::with_opts(
                Opts::new(format!("{prefix}_{name}"), help.to_string())
                    .const_label("instance", instance.to_string()),
            )
        };

        let worker_count = gauge("worker_count", "Number of connection workers")?;
        let publish_count = gauge("publish_count", "Messages fanned out from the backplane")?;
        let redis_connection_fail_count = gauge(
            "redis_connection_fail_count",
            "Backplane subscriber reconnects",
        )?;
        let redis_publish_delay_ms =
            gauge("redis_publish_delay_ms", "Backplane publish round-trip delay")?;
        let server_start_unixtime = gauge("server_start_unixtime", "Server start time")?;
        let current_connections_count =
            gauge("current_connections_count", "Currently open connections")?;
        let total_connect_count = gauge("total_connect_count", "Connections accepted")?;
        let total_disconnect_count = gauge("total_disconnect_count", "Connections closed")?;
        let eventloop_delay_ms =
            gauge("eventloop_delay_ms", "Average worker event loop lateness")?;

        for g in [
            &worker_count,
            &publish_count,
            &redis_connection_fail_count,
            &redis_publish_delay_ms,
            &server_start_unixtime,
            &current_connections_count,
            &total_connect_count,
            &total_disconnect_count,
            &eventloop_delay_ms,
        ] {
            registry.register(Box::new(g.clone()))?;
        }

        Ok(Self {
            registry,
            worker_count,
            publish_count,
            redis_connection_fail_count,
            redis_publish_delay_ms,
            server_start_unixtime,
            current_connections_count,
            total_connect_count,
            total_disconnect_count,
            eventloop_delay_ms,
        })
    }

    pub fn render(&self, m: &AggregatedMetrics) -> prometheus::Result<String> {
        self.worker_count.set(m.worker_count as i64);
        self.publish_count.set(m.publish_count as i64);
        self.redis_connection_fail_count
            .set(m.redis_connection_fail_count as i64);
        self.redis_publish_delay_ms.set(m.redis_publish_delay_ms);
        self.server_start_unixtime.set(m.server_start_unixtime);
        self.current_connections_count
            .set(m.current_connections_count);
        self.total_connect_count.set(m.total_connect_count as i64);
        self.total_disconnect_count
            .set(m.total_disconnect_count as i64);
        self.eventloop_delay_ms.set(m.eventloop_delay_ms);

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Instance label value: `<hostname>:<listen_port>`.
pub fn instance_label(listen_port: u16) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{listen_port}")
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub format: Option<String>,
}

/// Handler for `GET /metrics[?format=json]`.
pub async fn metrics_handler(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let snapshot = aggregate(&state.metrics, &state.workers.worker_metrics());

    if query.format.as_deref() == Some("json") {
        return Json(snapshot).into_response();
    }

    match state.renderer.render(&snapshot) {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_workers_and_averages_delay() {
        let server = ServerMetrics::default();
        server.worker_count.store(2, Ordering::Relaxed);
        server.publish_count.store(7, Ordering::Relaxed);

        let w1 = Arc::new(WorkerMetrics::default());
        let w2 = Arc::new(WorkerMetrics::default());
        w1.connection_opened();
        w1.connection_opened();
        w2.connection_opened();
        w2.connection_closed();
        w1.eventloop_delay_ms.store(10, Ordering::Relaxed);
        w2.eventloop_delay_ms.store(30, Ordering::Relaxed);

        let agg = aggregate(&server, &[w1, w2]);
        assert_eq!(agg.worker_count, 2);
        assert_eq!(agg.publish_count, 7);
        assert_eq!(agg.current_connections_count, 2);
        assert_eq!(agg.total_connect_count, 3);
        assert_eq!(agg.total_disconnect_count, 1);
        assert_eq!(agg.eventloop_delay_ms, 20);
    }

    #[test]
    fn prometheus_rendering_includes_prefix_and_instance() {
        let renderer = MetricsRenderer::new("eventhub", "myhost:8080").unwrap();
        let server = ServerMetrics::default();
        server.worker_count.store(4, Ordering::Relaxed);

        let text = renderer.render(&aggregate(&server, &[])).unwrap();
        assert!(text.contains("eventhub_worker_count"));
        assert!(text.contains("instance=\"myhost:8080\""));
        assert!(text.contains("eventhub_worker_count{instance=\"myhost:8080\"} 4"));
    }

    #[test]
    fn json_snapshot_has_all_fields() {
        let server = ServerMetrics::default();
        let agg = aggregate(&server, &[Arc::new(WorkerMetrics::default())]);
        let v = serde_json::to_value(&agg).unwrap();
        for key in [
            "worker_count",
            "publish_count",
            "redis_connection_fail_count",
            "redis_publish_delay_ms",
            "server_start_unixtime",
            "current_connections_count",
            "total_connect_count",
            "total_disconnect_count",
            "eventloop_delay_ms",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
    }
}
