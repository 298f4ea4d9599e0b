//! # Messaging Module
//!
//! The event bus proper.
//!
//! ## Features
//! - `MessageBus` facade: publish, batch publish, subscriber registration
//! - Kafka provider: gzip producer, one consumer group per subscriber
//! - In-memory provider for tests and single-process runs
//! - Cross-service retry protocol on `retry-message` / `retry-message-status`
//! - Heartbeat timer keeping long handlers visible as alive

pub mod bus;
pub mod codec;
pub mod heartbeat;
pub mod in_memory;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod kafka_provider;
pub mod processor;
pub mod provider;
pub mod retry;
pub mod session;
pub mod subscriber;

pub use bus::MessageBus;
pub use codec::Headers;
pub use heartbeat::{heartbeat_action, HeartbeatAction, HeartbeatTimer};
pub use in_memory::{InMemoryBroker, InMemoryProvider, StoredMessage};
pub use kafka_provider::KafkaProvider;
pub use processor::{InboundMessage, MessageProcessor, ProcessOutcome};
pub use provider::{EventBusProvider, MessagePublisher, PublishOptions};
pub use retry::{
    RetryEnvelope, RetryStatus, RetryStatusLogger, RETRY_MESSAGE_STATUS_TOPIC, RETRY_MESSAGE_TOPIC,
};
pub use session::SessionSnapshot;
pub use subscriber::{EventSubscriber, RetryConfig, SubscriberMeta, SubscriberOptions, SubscriberType};
