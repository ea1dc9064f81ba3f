//! Background tasks spawned at startup.

mod cache_purger;
mod cert_watcher;
mod latency_probe;

pub use cache_purger::run_cache_purger;
pub use cert_watcher::run_cert_watcher;
pub use latency_probe::{run_latency_probe, LATENCY_TOPIC};
