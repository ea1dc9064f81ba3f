//! Server-Sent-Events sessions.
//!
//! A GET on a topic path without a WebSocket upgrade becomes a one-way
//! event stream: the path is subscribed on a worker, requested history is
//! replayed first, then live events follow. Keepalive is a comment line on
//! the configured ping interval.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderMap, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::stream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error};

use crate::access::AccessController;
use crate::connection::{Connection, ConnectionKind, Outbound};
use crate::error::HttpError;
use crate::routes::{AppState, StreamQuery};
use crate::rpc::relative_since;
use crate::topic::{is_valid_topic_filter, is_valid_topic_or_filter};

/// Unlinks the connection when the event stream is dropped.
struct SseSession {
    state: AppState,
    conn: Arc<Connection>,
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.state.workers.teardown_connection(&self.conn);
        self.state
            .workers
            .worker(self.conn.worker_index())
            .metrics()
            .connection_closed();
        debug!(peer = %self.conn.remote_addr, "sse session closed");
    }
}

pub async fn handle_sse(
    state: AppState,
    addr: SocketAddr,
    topic: String,
    access: AccessController,
    query: StreamQuery,
    headers: &HeaderMap,
) -> Response {
    if !state.config.enable_sse {
        return HttpError::NotFound.into_response();
    }

    if !is_valid_topic_or_filter(&topic) {
        return HttpError::InvalidTopic.into_response();
    }

    if !access.allow_subscribe(&topic) {
        return HttpError::TopicForbidden.into_response();
    }

    let worker_index = state.workers.next_worker().index();
    let worker = state.workers.worker(worker_index);

    let (conn, rx) = Connection::channel(ConnectionKind::Sse, addr, access, worker_index);
    let conn = Arc::new(conn);
    conn.add_subscription(&topic, Value::Null);
    worker.metrics().connection_opened();
    worker
        .registry()
        .subscribe_connection(&conn, &topic, Value::Null);
    debug!(peer = %addr, topic = %topic, worker = worker_index, "sse session opened");

    let mut initial: Vec<Event> = vec![Event::default().comment("ok")];
    replay_history(&state, &topic, &query, headers, &mut initial).await;

    let session = SseSession {
        state: state.clone(),
        conn: conn.clone(),
    };

    let live = stream::unfold((rx, conn, session), |(mut rx, conn, session)| async move {
        loop {
            match rx.recv().await {
                Some(frame) => {
                    conn.note_flushed(&frame);
                    match frame {
                        Outbound::Event { id, data } => {
                            let event = Event::default().id(id).data(data);
                            return Some((Ok::<Event, Infallible>(event), (rx, conn, session)));
                        }
                        // WebSocket frames never land on an SSE mailbox.
                        Outbound::Message(_) => {}
                        Outbound::Close => return None,
                    }
                }
                None => return None,
            }
        }
    });

    let events = stream::iter(initial.into_iter().map(Ok::<Event, Infallible>)).chain(live);
    let keepalive =
        KeepAlive::new().interval(Duration::from_secs(state.config.ping_interval.max(1)));

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(keepalive),
    )
        .into_response()
}

/// Appends replayed cache items when the request carried `Last-Event-ID`,
/// `?lastEventId=` or `?since=`.
async fn replay_history(
    state: &AppState,
    topic: &str,
    query: &StreamQuery,
    headers: &HeaderMap,
    out: &mut Vec<Event>,
) {
    if !state.config.enable_cache {
        return;
    }

    let last_event_id = query.last_event_id.clone().or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let since = query.since.unwrap_or(0);
    let has_id = last_event_id.as_deref().is_some_and(|id| !id.is_empty());
    if !has_id && since == 0 {
        return;
    }

    let max = state.config.max_cache_request_limit;
    let limit = query.limit.unwrap_or(max).min(max);
    let is_pattern = is_valid_topic_filter(topic);

    let result = if has_id {
        state
            .backplane
            .get_cache_since_id(topic, last_event_id.as_deref().unwrap_or(""), limit, is_pattern)
            .await
    } else {
        state
            .backplane
            .get_cache_since(topic, relative_since(since), limit, is_pattern)
            .await
    };

    match result {
        Ok(items) => {
            for item in items {
                out.push(Event::default().id(item.meta.id).data(item.message));
            }
        }
        Err(e) => error!(error = %e, "error while looking up cache"),
    }
}
