//! Event Bus Service - Main Entry Point
//!
//! Runs the event bus with its health and subscriber endpoints.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eventbus::messaging::{MessageBus, RetryStatusLogger};
use eventbus::service::Service;
use eventbus::types::BusConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "eventbus=info,tower_http=debug".into()),
    );
    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Load configuration
    let config_file = std::env::var("EVENTBUS_CONFIG").ok();
    let config = BusConfig::load(config_file.as_deref().map(std::path::Path::new))?;

    info!("Starting Event Bus Service v{}", env!("CARGO_PKG_VERSION"));
    info!(
        service = %config.group_id,
        provider = %config.provider,
        mode = ?config.server_mode,
        "Configuration loaded"
    );

    // Missing identity or brokers stop the process here
    let bus = Arc::new(MessageBus::initialize(&config).await?);

    let service = Service::new(config, Some(bus));
    service.add_subscriber(Arc::new(RetryStatusLogger::new()));

    service.run().await
}
