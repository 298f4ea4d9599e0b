//! Broker provider abstraction.
//!
//! The bus talks to its broker only through [`EventBusProvider`]. Kafka is
//! the production implementation; the in-memory provider backs tests and
//! local runs. Adding a backend means adding an implementation and a
//! [`ProviderKind`] arm, nothing at the call sites.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::session::SessionSnapshot;
use super::subscriber::EventSubscriber;
use crate::error::Result;
use crate::types::{Context, ProviderKind};

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Context to propagate; the bus synthesizes one when absent
    pub context: Option<Context>,

    /// Broker message key, for partition affinity
    pub key: Option<String>,

    /// Service a replay is addressed to (`retry_destination` header)
    pub destination: Option<String>,
}

impl PublishOptions {
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Anything that can put one message on a topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a single payload. Transport failures are returned, never retried.
    async fn publish(&self, topic: &str, payload: &Value, opts: &PublishOptions) -> Result<()>;
}

/// A broker backend: connection lifecycle, publishing and consumer groups.
#[async_trait]
pub trait EventBusProvider: MessagePublisher {
    fn kind(&self) -> ProviderKind;

    /// Connect the producer side. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Publish every payload with the same options, all sends in flight at once.
    async fn publish_batch(
        &self,
        topic: &str,
        payloads: &[Value],
        opts: &PublishOptions,
    ) -> Result<()> {
        let sends = payloads
            .iter()
            .map(|payload| self.publish(topic, payload, opts));
        futures::future::try_join_all(sends).await?;
        Ok(())
    }

    /// Create and start the consumer group for a subscriber.
    async fn register(&self, subscriber: Arc<dyn EventSubscriber>) -> Result<()>;

    /// Disconnect the producer and every consumer group.
    async fn shutdown(&self) -> Result<()>;

    /// Liveness records of the registered consumer groups.
    fn sessions(&self) -> Vec<SessionSnapshot>;
}

/// Consumer group id for a subscriber of `topic` in service `group_id`.
pub fn consumer_group_id(group_id: &str, topic: &str) -> String {
    format!("{}-{}", group_id, topic)
}
