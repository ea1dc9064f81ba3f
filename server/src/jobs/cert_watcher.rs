use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::tls::TlsContext;

/// Background worker that reloads TLS material when the files on disk
/// change.
pub async fn run_cert_watcher(tls: Arc<TlsContext>, check_interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(check_interval_secs.max(1)));
    // The first tick fires immediately; the material was just loaded.
    ticker.tick().await;

    info!(
        interval = check_interval_secs,
        "starting TLS certificate watcher"
    );

    loop {
        ticker.tick().await;

        match tls.maybe_reload() {
            Ok(true) => info!("reloaded TLS certificate and private key"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "certificate check failed"),
        }
    }
}
