//! # Courier Server
//!
//! Realtime direct-messaging server with presence.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (picks up ./courier.toml when present)
//! courier
//!
//! # Run with environment variables
//! COURIER_PORT=4000 COURIER_HOST=0.0.0.0 courier
//! ```

use anyhow::Result;
use courier_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
