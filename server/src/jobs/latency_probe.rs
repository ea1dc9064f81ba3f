use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::backplane::{now_ms, Backplane};

/// Reserved topic for the publish-delay heartbeat. Every instance publishes
/// its clock here and measures the round-trip on receipt.
pub const LATENCY_TOPIC: &str = "$metrics$/system_unixtime";

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Background worker sampling backplane publish delay.
pub async fn run_latency_probe(backplane: Arc<Backplane>) {
    let mut ticker = interval(SAMPLE_INTERVAL);

    info!("starting backplane latency probe (runs every 5 seconds)");

    loop {
        ticker.tick().await;

        let now = now_ms().to_string();
        if let Err(e) = backplane
            .publish_message(LATENCY_TOPIC, "0", &now, "$system$")
            .await
        {
            warn!(error = %e, "latency probe publish failed");
        }
    }
}
