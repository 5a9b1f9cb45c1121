//! # Tether Server
//!
//! Realtime location sharing for small family groups.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tether
//!
//! # Run with a config file
//! TETHER_CONFIG=/path/to/tether.toml tether
//!
//! # Run with environment variables
//! PORT=8080 TETHER_HOST=0.0.0.0 TETHER_GROUPS__MAX_AGE_SECS=43200 tether
//! ```

mod api;
mod config;
mod handlers;
mod metrics;
mod sweeper;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tether_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Tether server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
