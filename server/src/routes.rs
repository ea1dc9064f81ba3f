//! HTTP routing and protocol selection.
//!
//! `OPTIONS` gets a CORS preflight reply, `/healthz` and `/metrics` are
//! served directly, and every other GET path is a topic or filter: the
//! request authenticates, then upgrades to WebSocket when requested or
//! falls back to SSE when enabled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Query, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::access::AccessController;
use crate::backplane::Backplane;
use crate::config::Config;
use crate::connection::MAX_WRITE_BUFFER_BYTES;
use crate::error::HttpError;
use crate::kvstore::KvStore;
use crate::metrics::{MetricsRenderer, ServerMetrics};
use crate::worker::WorkerPool;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backplane: Arc<Backplane>,
    pub kvstore: Arc<KvStore>,
    pub workers: Arc<WorkerPool>,
    pub metrics: Arc<ServerMetrics>,
    pub renderer: Arc<MetricsRenderer>,
}

/// Query parameters recognized on the stream path.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub auth: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<u64>,
    #[serde(rename = "lastEventId")]
    pub last_event_id: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let handshake_timeout = Duration::from_secs(state.config.handshake_timeout.max(1));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route("/{*topic}", get(stream_handler).options(preflight))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers(Any),
        )
        // Bounds the time a connection may spend before reaching the
        // WebSocket or SSE state; streaming bodies are not affected.
        .layer(TimeoutLayer::new(handshake_timeout))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// `GET /<topic-or-filter>`: authenticate, then select WebSocket or SSE.
pub async fn stream_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    Query(query): Query<StreamQuery>,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();
    let headers = parts.headers.clone();

    let access = match authenticate_request(&state, &headers, &query) {
        Ok(access) => access,
        Err(e) => return e.into_response(),
    };

    if wants_websocket(&headers) {
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };

        let mut ws = ws
            .max_message_size(MAX_WRITE_BUFFER_BYTES)
            .max_frame_size(MAX_WRITE_BUFFER_BYTES);

        // Echo the requested subprotocol back, as clients expect.
        if let Some(protocol) = headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
        {
            let first = protocol.split(',').next().unwrap_or(protocol).trim();
            ws = ws.protocols([first.to_string()]);
        }

        return ws.on_upgrade(move |socket| crate::ws::serve(socket, state, addr, access));
    }

    crate::sse::handle_sse(state, addr, topic, access, query, &headers).await
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    let upgrade_requested = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    upgrade_requested && headers.contains_key(header::SEC_WEBSOCKET_KEY)
}

fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
    query: &StreamQuery,
) -> Result<AccessController, HttpError> {
    let mut access = AccessController::new(state.config.disable_auth);

    if state.config.disable_auth {
        access.authenticate("", "");
        return Ok(access);
    }

    let token = bearer_token(headers)
        .or_else(|| query.auth.clone())
        .ok_or(HttpError::MissingToken)?;

    if !access.authenticate(&token, &state.config.jwt_secret) {
        return Err(HttpError::InvalidToken);
    }

    Ok(access)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn healthz_replies_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn preflight_replies_no_content() {
        assert_eq!(preflight().await, StatusCode::NO_CONTENT);
    }

    #[test]
    fn bearer_token_strips_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("rawtoken"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("rawtoken"));

        assert!(bearer_token(&HeaderMap::new()).is_none());
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        assert!(wants_websocket(&headers));

        // Missing key: not an upgrade request.
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!wants_websocket(&headers));

        assert!(!wants_websocket(&HeaderMap::new()));
    }

    #[test]
    fn stream_query_renames_last_event_id() {
        let q: StreamQuery =
            serde_json::from_str(r#"{"lastEventId":"0000000001000-0000","since":-1000}"#).unwrap();
        assert_eq!(q.last_event_id.as_deref(), Some("0000000001000-0000"));
        assert_eq!(q.since, Some(-1000));
    }
}
