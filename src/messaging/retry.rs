//! Cross-service retry protocol.
//!
//! A retryable subscriber whose handler fails republishes the original
//! message, together with its retry policy, onto [`RETRY_MESSAGE_TOPIC`].
//! The replay comes back on the original topic tagged with a `retry_id` and a
//! `retry_destination`; only the destination service handles it, and it
//! reports the outcome on [`RETRY_MESSAGE_STATUS_TOPIC`] instead of enqueuing
//! the message again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::codec::Headers;
use super::subscriber::{EventSubscriber, RetryConfig, SubscriberOptions};
use crate::types::{headers, Context, EventMetadata};

/// Shared topic receiving failed messages from every service.
pub const RETRY_MESSAGE_TOPIC: &str = "retry-message";

/// Shared topic receiving the outcome of every replay.
pub const RETRY_MESSAGE_STATUS_TOPIC: &str = "retry-message-status";

/// The failed message as it was consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMessage {
    pub value: Value,
    pub headers: Headers,
}

/// Body published to [`RETRY_MESSAGE_TOPIC`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEnvelope {
    pub message: RetryMessage,
    pub subscriber: RetryConfig,
}

impl RetryEnvelope {
    /// Wrap a failed message. Headers are carried over with `origin`
    /// rewritten to the service that failed to handle it.
    pub fn new(value: Value, consumed: &Headers, service: &str, policy: RetryConfig) -> Self {
        let mut headers = consumed.clone();
        headers.insert(headers::ORIGIN.to_string(), service.to_string());

        Self {
            message: RetryMessage { value, headers },
            subscriber: policy,
        }
    }
}

/// Body published to [`RETRY_MESSAGE_STATUS_TOPIC`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStatus {
    pub is_success: bool,
    pub id: Option<String>,
}

/// Logs replay outcomes reported by any service on the cluster.
pub struct RetryStatusLogger {
    options: SubscriberOptions,
}

impl RetryStatusLogger {
    pub fn new() -> Self {
        Self {
            options: SubscriberOptions::new(RETRY_MESSAGE_STATUS_TOPIC).with_retryable(false),
        }
    }
}

impl Default for RetryStatusLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSubscriber for RetryStatusLogger {
    fn name(&self) -> &'static str {
        "RetryStatusLogger"
    }

    fn options(&self) -> &SubscriberOptions {
        &self.options
    }

    async fn handle(
        &self,
        payload: Value,
        context: &Context,
        metadata: Option<&EventMetadata>,
    ) -> anyhow::Result<()> {
        let status: RetryStatus = serde_json::from_value(payload)?;
        let origin = metadata.map(|m| m.origin.as_str()).unwrap_or("manual");

        if status.is_success {
            info!(
                retry_id = ?status.id,
                origin = %origin,
                request_id = %context.request_id,
                "Retried message succeeded"
            );
        } else {
            warn!(
                retry_id = ?status.id,
                origin = %origin,
                request_id = %context.request_id,
                "Retried message failed again"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::subscriber::SubscriberOptions;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_envelope_rewrites_origin_only() {
        let mut consumed = Headers::new();
        consumed.insert("origin".into(), "svc-b".into());
        consumed.insert("request_id".into(), "req-1".into());

        let policy = SubscriberOptions::new("send-email").retry_config();
        let envelope = RetryEnvelope::new(json!({ "user_id": "abc" }), &consumed, "svc-a", policy);

        assert_eq!(envelope.message.headers["origin"], "svc-a");
        assert_eq!(envelope.message.headers["request_id"], "req-1");
        assert_eq!(envelope.subscriber.topic, "send-email");
    }

    #[test]
    fn test_envelope_wire_shape() {
        let policy = SubscriberOptions::new("send-email").retry_config();
        let envelope = RetryEnvelope::new(json!({ "a": 1 }), &Headers::new(), "svc-a", policy);

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["message"]["value"], json!({ "a": 1 }));
        assert_eq!(value["message"]["headers"]["origin"], "svc-a");
        assert_eq!(value["subscriber"]["partitionConsumed"], 3);
        assert_eq!(value["subscriber"]["retryable"], true);
    }

    #[test]
    fn test_status_wire_shape() {
        let status = RetryStatus {
            is_success: false,
            id: Some("r-1".into()),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({ "is_success": false, "id": "r-1" })
        );
    }

    #[tokio::test]
    async fn test_status_logger_rejects_malformed_status() {
        let logger = RetryStatusLogger::new();
        assert!(!logger.options().is_retryable());

        let ctx = Context::generate();
        assert!(logger
            .handle(json!({ "is_success": true, "id": "r-1" }), &ctx, None)
            .await
            .is_ok());
        assert!(logger.handle(json!({}), &ctx, None).await.is_err());
    }
}
