//! Event Bus Library
//!
//! A Kafka-backed event bus for microservices: JSON messages with
//! propagated request context, one consumer group per subscriber, and a
//! cross-service retry protocol for failed handlers.

pub mod api;
pub mod error;
pub mod messaging;
pub mod service;
pub mod types;

pub use error::{BusError, Result};
pub use messaging::{
    EventBusProvider, EventSubscriber, MessageBus, PublishOptions, SubscriberOptions,
    SubscriberType,
};
pub use service::Service;
pub use types::{BusConfig, Context, EventMetadata, ProviderKind};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{BusError, Result};
    pub use crate::messaging::{
        EventSubscriber, MessageBus, PublishOptions, RetryStatusLogger, SubscriberOptions,
        SubscriberType,
    };
    pub use crate::types::*;
}

/// Default heartbeat interval while a handler runs
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3000;

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8080;

/// Default upper bound for disconnecting the bus
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// Default wait between a shutdown signal and cleanup
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_MS: u64 = 10_000;
