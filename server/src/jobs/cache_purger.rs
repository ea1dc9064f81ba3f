use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, error, info};

use crate::backplane::Backplane;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker that drops expired cache items from the backplane.
pub async fn run_cache_purger(backplane: Arc<Backplane>) {
    let mut ticker = interval(PURGE_INTERVAL);

    info!("starting cache purger (runs every 60 seconds)");

    loop {
        ticker.tick().await;

        match backplane.purge_expired_cache_items().await {
            Ok(purged) if purged > 0 => {
                debug!(purged, "cache purge complete");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "cache purge failed");
            }
        }
    }
}
