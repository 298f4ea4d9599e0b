//! Kafka producer for the event bus.
//!
//! One producer connection per process, shared by every publish call.
//! Payloads are JSON, compressed with gzip by the client on every send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use super::codec::{self, Headers};
use super::provider::{MessagePublisher, PublishOptions};
use crate::error::Result;
use crate::types::Context;

/// Configuration for the Kafka producer
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub acks: String,
    pub compression_type: String,
    pub linger_ms: u32,
    pub message_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: "all".to_string(),
            compression_type: "gzip".to_string(),
            linger_ms: 5,
            message_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Kafka producer publishing on behalf of one service
pub struct KafkaProducer {
    producer: FutureProducer,
    config: ProducerConfig,
    origin: String,
    connected: AtomicBool,
}

impl KafkaProducer {
    /// Create a new Kafka producer. `origin` is stamped on every message.
    pub fn new(
        client: &ClientConfig,
        config: ProducerConfig,
        origin: impl Into<String>,
    ) -> Result<Self> {
        let producer: FutureProducer = client
            .clone()
            .set("acks", &config.acks)
            .set("compression.type", &config.compression_type)
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.message_timeout.as_millis().to_string())
            .set("enable.idempotence", "true")
            .create()?;

        let origin = origin.into();
        info!(origin = %origin, compression = %config.compression_type, "Kafka producer created");

        Ok(Self {
            producer,
            config,
            origin,
            connected: AtomicBool::new(false),
        })
    }

    /// Verify the brokers are reachable. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let producer = self.producer.clone();
        let timeout = self.config.connect_timeout;
        let brokers = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await??;

        self.connected.store(true, Ordering::Release);
        info!(brokers, "Kafka producer connected");
        Ok(())
    }

    /// Publish one payload.
    #[instrument(skip(self, payload, opts), fields(origin = %self.origin))]
    pub async fn send(&self, topic: &str, payload: &Value, opts: &PublishOptions) -> Result<()> {
        let context = opts.context.clone().unwrap_or_else(Context::generate);
        let headers = codec::build_headers(&context, &self.origin, opts.destination.as_deref());
        let bytes = codec::encode_payload(payload)?;

        let mut record = FutureRecord::<str, [u8]>::to(topic)
            .payload(bytes.as_slice())
            .headers(to_kafka_headers(&headers));
        if let Some(key) = opts.key.as_deref() {
            record = record.key(key);
        }

        match self.producer.send(record, self.config.message_timeout).await {
            Ok(delivery) => {
                debug!(
                    topic = %topic,
                    request_id = %context.request_id,
                    delivery = ?delivery,
                    "Message published"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(
                    topic = %topic,
                    request_id = %context.request_id,
                    error = %e,
                    "Failed to publish message"
                );
                Err(e.into())
            }
        }
    }

    /// Flush all pending messages
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout)).await??;
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for KafkaProducer {
    async fn publish(&self, topic: &str, payload: &Value, opts: &PublishOptions) -> Result<()> {
        self.send(topic, payload, opts).await
    }
}

/// Convert bus headers into Kafka record headers.
pub fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}
