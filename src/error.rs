//! Error taxonomy for the event bus.
//!
//! | Variant               | Raised by                        | Fatal at startup |
//! |-----------------------|----------------------------------|------------------|
//! | Configuration         | config loading, bus initialize   | yes              |
//! | UnsupportedProvider   | bus initialize                   | yes              |
//! | Transport             | publish, register, shutdown      | no               |
//! | Serialization         | publish (payload encoding)       | no               |
//! | NotInitialized        | service shell without a bus      | no               |
//! | Shutdown              | bus shutdown                     | no               |
//! | Task                  | producer connect, consumer stop  | no               |
//!
//! Subscriber handler failures are not represented here: they are caught per
//! message and routed into the retry protocol.

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors surfaced by the event bus to its callers.
#[derive(Debug, Error)]
pub enum BusError {
    /// Missing or invalid configuration (group identity, connection string, auth).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provider kind that is recognized but not implemented, or unknown.
    #[error("event bus provider not supported: {0}")]
    UnsupportedProvider(String),

    /// Broker unreachable or send rejected. Never retried inside the bus.
    #[error("transport error: {0}")]
    Transport(#[from] KafkaError),

    /// Payload could not be encoded as JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The bus was used before it was initialized.
    #[error("event bus is not initialized")]
    NotInitialized,

    /// Disconnecting producers or consumers failed or timed out.
    #[error("shutdown error: {0}")]
    Shutdown(String),

    /// A background task of the bus panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BusError {
    /// Whether the process must stop instead of serving.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnsupportedProvider(_)
        )
    }
}

impl From<config::ConfigError> for BusError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BusError>;
