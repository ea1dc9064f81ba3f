use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eventhub_server::{config::Config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    tracing::info!(
        listen_port = config.listen_port,
        workers = config.worker_count(),
        cache = config.enable_cache,
        sse = config.enable_sse,
        ssl = config.enable_ssl,
        "starting eventhub"
    );

    if config.disable_auth {
        tracing::warn!("server is running with disable_auth=true; everything is allowed by any client");
    }

    server::run(config).await?;

    Ok(())
}
