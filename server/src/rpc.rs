//! JSON-RPC 2.0 dispatcher for WebSocket sessions.
//!
//! Every complete text frame is parsed as a JSON-RPC request and routed by
//! lowercased method name. Handlers queue their replies on the connection
//! mailbox, so a subscribe that triggers a replay can emit its success
//! envelope followed by one response per cached item.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, trace};

use crate::backplane::{now_ms, CacheItem, PublishedEvent};
use crate::connection::Connection;
use crate::routes::AppState;
use crate::topic::{is_valid_topic, is_valid_topic_filter, is_valid_topic_or_filter};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub fn success(id: &Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

pub fn error_reply(id: &Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}

/// Formats a published event as a response to the subscription's original
/// request id.
pub fn notification(request_id: &Value, event: &PublishedEvent) -> String {
    let mut result = json!({
        "topic": event.topic,
        "id": event.id,
        "message": event.message,
    });
    if !event.origin.is_empty() {
        result["origin"] = json!(event.origin);
    }

    success(request_id, result)
}

fn cache_item_result(item: &CacheItem) -> Value {
    let mut v = json!({
        "topic": item.topic,
        "id": item.meta.id,
        "message": item.message,
    });
    if !item.origin.is_empty() {
        v["origin"] = json!(item.origin);
    }

    v
}

/// A negative `since` means "this many milliseconds ago".
pub(crate) fn relative_since(since: i64) -> i64 {
    if since >= 0 {
        since
    } else {
        now_ms() - since.abs()
    }
}

fn parse_params<T: DeserializeOwned + Default>(params: &Value) -> Option<T> {
    if params.is_null() {
        return Some(T::default());
    }

    serde_json::from_value(params.clone()).ok()
}

fn send_invalid_params(conn: &Connection, id: &Value, message: &str) {
    conn.send_text(error_reply(id, INVALID_PARAMS, message));
}

/// Parses and dispatches one request frame.
pub async fn dispatch(state: &AppState, conn: &Arc<Connection>, raw: &str) {
    let req: RpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(_) => {
            conn.send_text(error_reply(&Value::Null, PARSE_ERROR, "Parse error"));
            return;
        }
    };

    match req.method.to_ascii_lowercase().as_str() {
        "subscribe" => handle_subscribe(state, conn, &req).await,
        "unsubscribe" => handle_unsubscribe(state, conn, &req),
        "unsubscribeall" => handle_unsubscribe_all(state, conn, &req),
        "publish" => handle_publish(state, conn, &req).await,
        "list" => handle_list(conn, &req),
        "eventlog" => handle_eventlog(state, conn, &req).await,
        "get" => handle_get(state, conn, &req).await,
        "set" => handle_set(state, conn, &req).await,
        "del" => handle_del(state, conn, &req).await,
        "ping" => handle_ping(conn, &req),
        "disconnect" => handle_disconnect(conn),
        _ => {
            conn.send_text(error_reply(&req.id, METHOD_NOT_FOUND, "Method not found"));
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeParams {
    #[serde(default)]
    topic: String,
    since: Option<i64>,
    #[serde(rename = "sinceEventId")]
    since_event_id: Option<String>,
    limit: Option<u64>,
}

async fn handle_subscribe(state: &AppState, conn: &Arc<Connection>, req: &RpcRequest) {
    let Some(params) = parse_params::<SubscribeParams>(&req.params) else {
        send_invalid_params(conn, &req.id, "Invalid parameters.");
        return;
    };

    if params.topic.is_empty() {
        send_invalid_params(conn, &req.id, "You must specify 'topic' to subscribe to.");
        return;
    }

    if !is_valid_topic_or_filter(&params.topic) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("Invalid topic in request: {}", params.topic),
        );
        return;
    }

    if !conn.access.allow_subscribe(&params.topic) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("You are not allowed to subscribe to topic: {}", params.topic),
        );
        return;
    }

    // Subscribing twice to the same filter is a no-op; only the first call
    // registers with the worker.
    if conn.add_subscription(&params.topic, req.id.clone()) {
        state
            .workers
            .worker(conn.worker_index())
            .registry()
            .subscribe_connection(conn, &params.topic, req.id.clone());
    }

    debug!(peer = %conn.remote_addr, topic = %params.topic, "SUBSCRIBE");

    conn.send_text(success(
        &req.id,
        json!({ "action": "subscribe", "topic": params.topic, "status": "ok" }),
    ));

    send_cached_events(
        state,
        conn,
        &req.id,
        &params.topic,
        params.since,
        params.since_event_id,
        params.limit,
    )
    .await;
}

/// Replays cached items to the client when the request asked for them.
async fn send_cached_events(
    state: &AppState,
    conn: &Arc<Connection>,
    request_id: &Value,
    topic: &str,
    since: Option<i64>,
    since_event_id: Option<String>,
    limit: Option<u64>,
) {
    if !state.config.enable_cache {
        return;
    }

    let since_event_id = since_event_id.unwrap_or_default();
    let since = since.unwrap_or(0);
    if since_event_id.is_empty() && since == 0 {
        return;
    }

    let since = relative_since(since);
    let max = state.config.max_cache_request_limit;
    let limit = limit.unwrap_or(max).min(max);
    let is_pattern = is_valid_topic_filter(topic);

    let result = if !since_event_id.is_empty() {
        state
            .backplane
            .get_cache_since_id(topic, &since_event_id, limit, is_pattern)
            .await
    } else {
        state
            .backplane
            .get_cache_since(topic, since, limit, is_pattern)
            .await
    };

    match result {
        Ok(items) => {
            for item in &items {
                conn.send_text(success(request_id, cache_item_result(item)));
            }
        }
        Err(e) => error!(error = %e, "error while looking up cache"),
    }
}

fn handle_unsubscribe(state: &AppState, conn: &Arc<Connection>, req: &RpcRequest) {
    let Some(topics) = req.params.as_array() else {
        send_invalid_params(
            conn,
            &req.id,
            "Parameter is not array of topics to unsubscribe from.",
        );
        return;
    };

    let registry = state.workers.worker(conn.worker_index()).registry();
    let mut count = 0u64;

    for topic in topics.iter().filter_map(Value::as_str) {
        if !is_valid_topic_or_filter(topic) || !conn.access.allow_subscribe(topic) {
            continue;
        }

        if conn.remove_subscription(topic) {
            registry.unsubscribe_connection(conn.id(), topic);
            count += 1;
        }
    }

    conn.send_text(success(&req.id, json!({ "unsubscribe_count": count })));
}

fn handle_unsubscribe_all(state: &AppState, conn: &Arc<Connection>, req: &RpcRequest) {
    let registry = state.workers.worker(conn.worker_index()).registry();
    let filters = conn.take_subscriptions();

    for filter in &filters {
        registry.unsubscribe_connection(conn.id(), filter);
    }

    conn.send_text(success(
        &req.id,
        json!({ "unsubscribe_count": filters.len() }),
    ));
}

#[derive(Debug, Default, Deserialize)]
struct PublishParams {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    message: String,
    timestamp: Option<i64>,
    ttl: Option<u64>,
}

async fn handle_publish(state: &AppState, conn: &Arc<Connection>, req: &RpcRequest) {
    let Some(params) = parse_params::<PublishParams>(&req.params) else {
        send_invalid_params(conn, &req.id, "Invalid parameters.");
        return;
    };

    if params.topic.is_empty() || params.message.is_empty() {
        send_invalid_params(
            conn,
            &req.id,
            "You need to specify topic and message to publish to.",
        );
        return;
    }

    if !conn.access.allow_publish(&params.topic) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("Insufficient access to topic: {}", params.topic),
        );
        return;
    }

    if !is_valid_topic(&params.topic) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("{} is not a valid topic.", params.topic),
        );
        return;
    }

    let subject = conn.access.subject().to_string();

    if !subject.is_empty() {
        if let Some(rule) = conn
            .access
            .rate_limit_config()
            .rate_limit_for_topic(&params.topic)
        {
            match state
                .backplane
                .hit_rate_limit(&rule.topic, &subject, rule.interval, rule.max)
                .await
            {
                Ok(true) => {
                    trace!(
                        topic = %params.topic,
                        subject = %subject,
                        interval = rule.interval,
                        max = rule.max,
                        rule = %rule.topic,
                        "publish rate limited"
                    );
                    conn.send_text(success(
                        &req.id,
                        json!({
                            "action": "publish",
                            "topic": params.topic,
                            "status": "ERR_RATE_LIMIT_EXCEEDED",
                        }),
                    ));
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "rate limit check failed");
                    send_invalid_params(
                        conn,
                        &req.id,
                        &format!("Error while publishing message: {e}"),
                    );
                    return;
                }
            }
        }
    }

    let id = match state
        .backplane
        .cache_message(
            &params.topic,
            &params.message,
            &subject,
            params.timestamp.unwrap_or(0),
            params.ttl.unwrap_or(0),
        )
        .await
    {
        Ok(id) if !id.is_empty() => id,
        Ok(_) => {
            send_invalid_params(conn, &req.id, "Failed to cache message, discarding.");
            return;
        }
        Err(e) => {
            error!(error = %e, "error while caching message");
            send_invalid_params(conn, &req.id, &format!("Error while publishing message: {e}"));
            return;
        }
    };

    if let Err(e) = state
        .backplane
        .publish_message(&params.topic, &id, &params.message, &subject)
        .await
    {
        error!(error = %e, "error while publishing message");
        send_invalid_params(conn, &req.id, &format!("Error while publishing message: {e}"));
        return;
    }

    debug!(peer = %conn.remote_addr, topic = %params.topic, "PUBLISH");

    conn.send_text(success(
        &req.id,
        json!({
            "action": "publish",
            "topic": params.topic,
            "id": id,
            "status": "ok",
        }),
    ));
}

fn handle_list(conn: &Arc<Connection>, req: &RpcRequest) {
    conn.send_text(success(&req.id, json!(conn.list_subscriptions())));
}

#[derive(Debug, Default, Deserialize)]
struct EventlogParams {
    #[serde(default)]
    topic: String,
    since: Option<i64>,
    #[serde(rename = "sinceEventId")]
    since_event_id: Option<String>,
    limit: Option<u64>,
}

async fn handle_eventlog(state: &AppState, conn: &Arc<Connection>, req: &RpcRequest) {
    if !state.config.enable_cache {
        send_invalid_params(conn, &req.id, "Cache is not enabled in server config");
        return;
    }

    let Some(params) = parse_params::<EventlogParams>(&req.params) else {
        send_invalid_params(conn, &req.id, "Invalid parameters.");
        return;
    };

    let since_event_id = params.since_event_id.unwrap_or_default();
    let since = params.since.unwrap_or(0);

    if since_event_id.is_empty() && since == 0 {
        send_invalid_params(conn, &req.id, "You must specify either 'since' or 'sinceEventId'.");
        return;
    }

    if params.topic.is_empty() {
        send_invalid_params(conn, &req.id, "You must specify topic.");
        return;
    }

    if !is_valid_topic_or_filter(&params.topic) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("Invalid topic in request: {}", params.topic),
        );
        return;
    }

    if !conn.access.allow_subscribe(&params.topic) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("You are not allowed to read from topic: {}", params.topic),
        );
        return;
    }

    let max = state.config.max_cache_request_limit;
    let limit = params.limit.unwrap_or(max).min(max);
    let is_pattern = is_valid_topic_filter(&params.topic);

    debug!(
        peer = %conn.remote_addr,
        topic = %params.topic,
        since,
        since_event_id = %since_event_id,
        limit,
        "EVENTLOG"
    );

    let result = if !since_event_id.is_empty() {
        state
            .backplane
            .get_cache_since_id(&params.topic, &since_event_id, limit, is_pattern)
            .await
    } else {
        state
            .backplane
            .get_cache_since(&params.topic, relative_since(since), limit, is_pattern)
            .await
    };

    let items = match result {
        Ok(items) => items,
        Err(e) => {
            error!(error = %e, "error while looking up cache");
            send_invalid_params(conn, &req.id, &format!("Error while looking up cache: {e}"));
            return;
        }
    };

    let items: Vec<Value> = items.iter().map(cache_item_result).collect();
    conn.send_text(success(
        &req.id,
        json!({
            "action": "eventlog",
            "topic": params.topic,
            "status": "ok",
            "items": items,
        }),
    ));
}

#[derive(Debug, Default, Deserialize)]
struct KvParams {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    ttl: Option<u64>,
}

async fn handle_get(state: &AppState, conn: &Arc<Connection>, req: &RpcRequest) {
    if !state.kvstore.is_enabled() {
        send_invalid_params(conn, &req.id, "KVStore is not enabled.");
        return;
    }

    let Some(params) = parse_params::<KvParams>(&req.params) else {
        send_invalid_params(conn, &req.id, "Invalid parameters.");
        return;
    };

    if params.key.is_empty() {
        send_invalid_params(conn, &req.id, "You must specify key.");
        return;
    }

    if !conn.access.allow_subscribe(&params.key) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("You are not allowed to read key {}", params.key),
        );
        return;
    }

    match state.kvstore.get(&params.key).await {
        Ok(Some(value)) => {
            conn.send_text(success(
                &req.id,
                json!({ "action": "get", "key": params.key, "value": value }),
            ));
        }
        Ok(None) => {
            send_invalid_params(conn, &req.id, &format!("No such key: {}", params.key));
        }
        Err(e) => {
            send_invalid_params(conn, &req.id, &e.to_string());
        }
    }
}

async fn handle_set(state: &AppState, conn: &Arc<Connection>, req: &RpcRequest) {
    if !state.kvstore.is_enabled() {
        send_invalid_params(conn, &req.id, "KVStore is not enabled.");
        return;
    }

    let Some(params) = parse_params::<KvParams>(&req.params) else {
        send_invalid_params(conn, &req.id, "Invalid parameters.");
        return;
    };

    if params.key.is_empty() || params.value.is_empty() {
        send_invalid_params(conn, &req.id, "You must specify key and value.");
        return;
    }

    if !conn.access.allow_publish(&params.key) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("You are not allowed to write key {}", params.key),
        );
        return;
    }

    let success_flag = match state
        .kvstore
        .set(&params.key, &params.value, params.ttl.unwrap_or(0))
        .await
    {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "kv set failed");
            false
        }
    };

    conn.send_text(success(
        &req.id,
        json!({ "action": "set", "key": params.key, "success": success_flag }),
    ));
}

async fn handle_del(state: &AppState, conn: &Arc<Connection>, req: &RpcRequest) {
    if !state.kvstore.is_enabled() {
        send_invalid_params(conn, &req.id, "KVStore is not enabled.");
        return;
    }

    let Some(params) = parse_params::<KvParams>(&req.params) else {
        send_invalid_params(conn, &req.id, "Invalid parameters.");
        return;
    };

    if params.key.is_empty() {
        send_invalid_params(conn, &req.id, "You must specify key.");
        return;
    }

    if !conn.access.allow_publish(&params.key) {
        send_invalid_params(
            conn,
            &req.id,
            &format!("You are not allowed to delete key {}", params.key),
        );
        return;
    }

    let removed = match state.kvstore.del(&params.key).await {
        Ok(n) => n > 0,
        Err(e) => {
            send_invalid_params(conn, &req.id, &e.to_string());
            return;
        }
    };

    conn.send_text(success(
        &req.id,
        json!({ "action": "del", "key": params.key, "success": removed }),
    ));
}

fn handle_ping(conn: &Arc<Connection>, req: &RpcRequest) {
    conn.send_text(success(&req.id, json!({ "pong": now_ms() })));
}

fn handle_disconnect(conn: &Arc<Connection>) {
    conn.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_missing_optionals() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert_eq!(req.id, Value::from(1));
        assert_eq!(req.method, "ping");
        assert!(req.params.is_null());
    }

    #[test]
    fn reply_shapes() {
        let ok: Value = serde_json::from_str(&success(&Value::from(3), json!({"pong": 1}))).unwrap();
        assert_eq!(ok["jsonrpc"], "2.0");
        assert_eq!(ok["id"], 3);
        assert_eq!(ok["result"]["pong"], 1);

        let err: Value =
            serde_json::from_str(&error_reply(&Value::from(4), METHOD_NOT_FOUND, "Method not found"))
                .unwrap();
        assert_eq!(err["error"]["code"], -32601);
        assert_eq!(err["id"], 4);
    }

    #[test]
    fn notification_includes_origin_only_when_set() {
        let mut event = PublishedEvent {
            topic: "room/a".to_string(),
            id: "0000000001000-0000".to_string(),
            message: "23.5".to_string(),
            origin: String::new(),
        };

        let v: Value = serde_json::from_str(&notification(&Value::from(1), &event)).unwrap();
        assert_eq!(v["id"], 1);
        assert_eq!(v["result"]["topic"], "room/a");
        assert!(v["result"].get("origin").is_none());

        event.origin = "user@example.com".to_string();
        let v: Value = serde_json::from_str(&notification(&Value::from(1), &event)).unwrap();
        assert_eq!(v["result"]["origin"], "user@example.com");
    }

    #[test]
    fn relative_since_subtracts_from_now() {
        assert_eq!(relative_since(1234), 1234);

        let before = now_ms();
        let computed = relative_since(-1000);
        let after = now_ms();
        assert!(computed >= before - 1000 && computed <= after - 1000);
    }

    #[test]
    fn params_default_when_null() {
        let p: SubscribeParams = parse_params(&Value::Null).unwrap();
        assert!(p.topic.is_empty());
        assert!(p.since.is_none());

        let p: SubscribeParams = parse_params(&json!({
            "topic": "a/b", "since": -5000, "limit": 10
        }))
        .unwrap();
        assert_eq!(p.topic, "a/b");
        assert_eq!(p.since, Some(-5000));
        assert_eq!(p.limit, Some(10));

        assert!(parse_params::<SubscribeParams>(&json!("not an object")).is_none());
    }
}
