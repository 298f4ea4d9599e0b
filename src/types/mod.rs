//! Core types for the event bus.

mod config;
mod context;
mod metadata;

pub use config::{AppEnvironment, BusConfig, ProviderKind, SaslAuth, SaslMechanism, ServerMode};
pub use context::{new_request_id, Context, ANONYMOUS_USER_ID};
pub use metadata::{headers, EventMetadata, UNKNOWN_ORIGIN};
