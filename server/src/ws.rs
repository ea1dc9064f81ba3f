//! WebSocket session loop.
//!
//! One task per connection. The loop multiplexes three sources: outbound
//! frames from the mailbox, inbound frames from the peer, and the keepalive
//! ping timer. Inbound text frames go through the JSON-RPC dispatcher;
//! requests on one connection are handled strictly in order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::access::AccessController;
use crate::connection::{Connection, ConnectionKind, Outbound};
use crate::routes::AppState;
use crate::rpc;

pub async fn serve(socket: WebSocket, state: AppState, addr: SocketAddr, access: AccessController) {
    let worker_index = state.workers.next_worker().index();
    let metrics = state.workers.worker(worker_index).metrics().clone();

    let (conn, mut rx) = Connection::channel(ConnectionKind::WebSocket, addr, access, worker_index);
    let conn = Arc::new(conn);
    metrics.connection_opened();
    debug!(peer = %addr, worker = worker_index, "websocket session opened");

    let (mut sink, mut stream) = socket.split();
    let mut keepalive = tokio::time::interval(Duration::from_secs(state.config.ping_interval.max(1)));
    // The first interval tick fires immediately; skip it.
    keepalive.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    conn.note_flushed(&frame);
                    match frame {
                        Outbound::Message(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        // SSE frames never land on a WebSocket mailbox.
                        Outbound::Event { .. } => {}
                        Outbound::Close => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::NORMAL,
                                    reason: "".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    rpc::dispatch(&state, &conn, text.as_str()).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                // JSON-RPC traffic is text; binary frames are ignored.
                Some(Ok(Message::Binary(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.workers.teardown_connection(&conn);
    metrics.connection_closed();
    debug!(peer = %addr, "websocket session closed");
}
