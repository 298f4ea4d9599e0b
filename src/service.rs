//! Service shell: HTTP server, subscriber wiring and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing::{debug, error, info, warn};

use crate::api::{self, AppState};
use crate::messaging::{EventSubscriber, MessageBus, SubscriberMeta};
use crate::types::{AppEnvironment, BusConfig};

/// A running service: the bus handle plus its HTTP surface.
pub struct Service {
    config: BusConfig,
    bus: Option<Arc<MessageBus>>,
}

impl Service {
    pub fn new(config: BusConfig, bus: Option<Arc<MessageBus>>) -> Self {
        Self { config, bus }
    }

    pub fn bus(&self) -> Option<&Arc<MessageBus>> {
        self.bus.as_ref()
    }

    /// Add a subscriber if this server mode runs workers. Test
    /// environments never start consumers.
    pub fn add_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) -> Option<SubscriberMeta> {
        if self.config.environment == AppEnvironment::Test {
            debug!(subscriber = subscriber.name(), "Workers disabled in test environment");
            return None;
        }

        if !self.config.server_mode.runs_workers() {
            debug!(subscriber = subscriber.name(), "Worker disabled for this server mode");
            return None;
        }

        let Some(bus) = self.bus.as_ref() else {
            warn!("event bus must be enabled to register {}", subscriber.name());
            return None;
        };

        Some(bus.add_subscriber(subscriber))
    }

    /// HTTP routes bound to this service's state.
    pub fn router(&self) -> Router {
        api::router(Arc::new(AppState {
            bus: self.bus.clone(),
            config: self.config.clone(),
        }))
    }

    /// Serve HTTP until SIGINT/SIGTERM, then shut the bus down.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on http://{}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal(self.config.shutdown_grace_period))
            .await?;

        self.stop().await;
        Ok(())
    }

    /// Disconnect the bus, bounded by the shutdown timeout.
    pub async fn stop(&self) {
        let Some(bus) = self.bus.as_ref() else {
            return;
        };

        match tokio::time::timeout(self.config.shutdown_timeout, bus.shutdown()).await {
            Ok(Ok(())) => info!("Event bus stopped"),
            Ok(Err(e)) => error!(error = %e, "Event bus shutdown failed"),
            Err(_) => error!(
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                "Event bus shutdown timed out"
            ),
        }
    }
}

async fn shutdown_signal(grace_period: Duration) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(
        grace_ms = grace_period.as_millis() as u64,
        "Shutdown signal received, draining"
    );
    tokio::time::sleep(grace_period).await;
}
