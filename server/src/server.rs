//! Server startup and the backplane consume loop.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::backplane::{now_ms, Backplane, PublishedEvent};
use crate::config::Config;
use crate::error::Error;
use crate::jobs::{self, LATENCY_TOPIC};
use crate::kvstore::KvStore;
use crate::metrics::{instance_label, MetricsRenderer, ServerMetrics};
use crate::routes::{build_router, AppState};
use crate::tls::TlsContext;
use crate::worker::WorkerPool;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Wires everything together and serves until a stop signal arrives.
pub async fn run(config: Config) -> Result<(), Error> {
    if config.disable_unsecure_listener && !config.enable_ssl {
        return Err(Error::NoListener);
    }

    let config = Arc::new(config);
    let backplane = Arc::new(Backplane::connect(&config).await?);
    let kvstore = Arc::new(KvStore::new(&config, &backplane));
    let workers = WorkerPool::spawn(config.worker_count());

    let metrics = Arc::new(ServerMetrics::default());
    metrics
        .worker_count
        .store(workers.len() as u64, Ordering::Relaxed);
    metrics
        .server_start_unixtime
        .store(now_ms(), Ordering::Relaxed);

    let renderer = Arc::new(MetricsRenderer::new(
        &config.prometheus_metric_prefix,
        &instance_label(config.listen_port),
    )?);

    let state = AppState {
        config: config.clone(),
        backplane: backplane.clone(),
        kvstore,
        workers,
        metrics,
        renderer,
    };

    tokio::spawn(run_backplane_consumer(state.clone()));
    tokio::spawn(jobs::run_latency_probe(backplane.clone()));

    if config.enable_cache {
        tokio::spawn(jobs::run_cache_purger(backplane.clone()));
    }

    let tls = if config.enable_ssl {
        let ctx = Arc::new(TlsContext::load(&config)?);
        if config.ssl_cert_auto_reload {
            tokio::spawn(jobs::run_cert_watcher(
                ctx.clone(),
                config.ssl_cert_check_interval,
            ));
        }
        Some(ctx)
    } else {
        None
    };

    let app = build_router(state);
    let handle = axum_server::Handle::new();
    let mut listeners = Vec::new();

    if !config.disable_unsecure_listener {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
        info!(port = config.listen_port, "listening");
        let server = axum_server::bind(addr)
            .handle(handle.clone())
            .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());
        listeners.push(tokio::spawn(server));
    }

    if let Some(tls) = &tls {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.ssl_listen_port));
        info!(port = config.ssl_listen_port, "listening for TLS connections");
        let server = axum_server::bind_rustls(addr, tls.rustls_config())
            .handle(handle.clone())
            .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());
        listeners.push(tokio::spawn(server));
    }

    tokio::spawn(handle_signals(handle, tls));

    for listener in listeners {
        match listener.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(e) => {
                error!(error = %e, "listener task failed");
            }
        }
    }

    Ok(())
}

/// INT/QUIT/TERM stop the server gracefully; HUP reloads TLS material.
async fn handle_signals(handle: axum_server::Handle, tls: Option<Arc<TlsContext>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut interrupt), Ok(mut terminate), Ok(mut quit), Ok(mut hangup)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
        signal(SignalKind::hangup()),
    ) else {
        error!("failed to install signal handlers");
        return;
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
            _ = quit.recv() => break,
            _ = hangup.recv() => {
                info!("reload requested");
                if let Some(tls) = &tls {
                    match tls.force_reload() {
                        Ok(()) => info!("reloaded TLS certificate and private key"),
                        Err(e) => error!(error = %e, "TLS reload failed"),
                    }
                }
            }
        }
    }

    info!("shutting down");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}

/// Consumes the backplane subscription forever. Any error tears the
/// subscriber down, waits five seconds, and resubscribes.
pub async fn run_backplane_consumer(state: AppState) {
    let pattern = state.backplane.channel_pattern();

    loop {
        match consume(&state, &pattern).await {
            Ok(()) => warn!("backplane subscription ended, reconnecting"),
            Err(e) => {
                error!(error = %e, "failed to read from backplane, waiting 5 seconds before reconnect");
            }
        }

        state
            .metrics
            .redis_connection_fail_count
            .fetch_add(1, Ordering::Relaxed);
        sleep(RECONNECT_DELAY).await;
    }
}

async fn consume(state: &AppState, pattern: &str) -> Result<(), Error> {
    let mut pubsub = state.backplane.pubsub().await?;
    pubsub.psubscribe(pattern).await?;
    info!(pattern, "subscribed to backplane");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let channel = msg.get_channel_name().to_string();
        let topic = state.backplane.topic_from_channel(&channel);

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(topic, error = %e, "unreadable backplane payload");
                continue;
            }
        };

        if topic == LATENCY_TOPIC {
            record_publish_delay(state, &payload);
            continue;
        }

        match serde_json::from_str::<PublishedEvent>(&payload) {
            Ok(mut event) => {
                if event.topic.is_empty() {
                    event.topic = topic.to_string();
                }
                state.workers.publish_all(event);
                state.metrics.publish_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(topic, error = %e, "undecodable backplane message");
            }
        }
    }

    Ok(())
}

/// The heartbeat carries the sender's clock; the difference to ours is the
/// publish round-trip delay.
fn record_publish_delay(state: &AppState, payload: &str) {
    let Ok(event) = serde_json::from_str::<PublishedEvent>(payload) else {
        return;
    };

    let Ok(sent_at) = event.message.parse::<i64>() else {
        return;
    };

    let delay = (now_ms() - sent_at).max(0);
    state
        .metrics
        .redis_publish_delay_ms
        .store(delay, Ordering::Relaxed);
}
