//! Subscriber configuration and handler contract.

use std::fmt;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Context, EventMetadata};

/// Default cap on in-flight work per consumer group.
pub const DEFAULT_MAX_IN_PROGRESS: usize = 10;
/// Default broker-level retry count.
pub const DEFAULT_RETRIES: u32 = 10;
/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_RETRY: u32 = 5;
/// Default number of partitions consumed concurrently.
pub const DEFAULT_PARTITION_CONCURRENCY: usize = 3;

/// How a subscriber receives messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberType {
    /// Consumes from the broker through a consumer group
    Pull,
    /// Invoked over HTTP by an external pusher
    Push,
}

impl fmt::Display for SubscriberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pull => f.write_str("pull"),
            Self::Push => f.write_str("push"),
        }
    }
}

/// Consumption policy of one subscriber. Built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberOptions {
    topic: String,
    subscriber_type: SubscriberType,
    max_in_progress: usize,
    retries: u32,
    backoff_retry: u32,
    retryable: bool,
    partition_concurrency: usize,
}

impl SubscriberOptions {
    /// Options for `topic` with every other setting at its default.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscriber_type: SubscriberType::Pull,
            max_in_progress: DEFAULT_MAX_IN_PROGRESS,
            retries: DEFAULT_RETRIES,
            backoff_retry: DEFAULT_BACKOFF_RETRY,
            retryable: true,
            partition_concurrency: DEFAULT_PARTITION_CONCURRENCY,
        }
    }

    pub fn with_type(mut self, subscriber_type: SubscriberType) -> Self {
        self.subscriber_type = subscriber_type;
        self
    }

    pub fn with_max_in_progress(mut self, max_in_progress: usize) -> Self {
        self.max_in_progress = max_in_progress.max(1);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff_retry(mut self, multiplier: u32) -> Self {
        self.backoff_retry = multiplier;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_partition_concurrency(mut self, concurrency: usize) -> Self {
        self.partition_concurrency = concurrency.max(1);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber_type(&self) -> SubscriberType {
        self.subscriber_type
    }

    pub fn max_in_progress(&self) -> usize {
        self.max_in_progress
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn backoff_retry(&self) -> u32 {
        self.backoff_retry
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn partition_concurrency(&self) -> usize {
        self.partition_concurrency
    }

    /// Snapshot embedded into every retry envelope.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            topic: self.topic.clone(),
            retries: self.retries,
            backoff_retry: self.backoff_retry,
            retryable: self.retryable,
            partition_consumed: self.partition_concurrency,
        }
    }
}

/// Retry policy travelling with a failed message, so whichever instance
/// replays it applies the same policy as the original delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub topic: String,
    pub retries: u32,
    pub backoff_retry: u32,
    pub retryable: bool,
    #[serde(rename = "partitionConsumed")]
    pub partition_consumed: usize,
}

/// A topic consumer: immutable options plus the message handler.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Type-style name of the subscriber, e.g. `SendEmailSubscriber`.
    fn name(&self) -> &'static str;

    /// Consumption policy.
    fn options(&self) -> &SubscriberOptions;

    /// Handle one message.
    ///
    /// `metadata` is `None` when the handler is invoked manually over HTTP.
    /// Any error marks the delivery as failed and feeds the retry protocol.
    async fn handle(
        &self,
        payload: Value,
        context: &Context,
        metadata: Option<&EventMetadata>,
    ) -> anyhow::Result<()>;

    fn topic(&self) -> &str {
        self.options().topic()
    }

    /// Manual invocation endpoint: `/subscribers/{kebab-case name}`.
    fn path(&self) -> String {
        subscriber_path(self.name())
    }

    fn retry_config(&self) -> RetryConfig {
        self.options().retry_config()
    }
}

/// Descriptor recorded for every subscriber added to a bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberMeta {
    pub topic_name: String,
    pub handler_name: String,
    pub endpoint: String,
    #[serde(rename = "type")]
    pub subscriber_type: SubscriberType,
}

impl SubscriberMeta {
    pub fn of(subscriber: &dyn EventSubscriber) -> Self {
        Self {
            topic_name: subscriber.topic().to_string(),
            handler_name: subscriber.name().to_string(),
            endpoint: subscriber.path(),
            subscriber_type: subscriber.options().subscriber_type(),
        }
    }
}

/// Endpoint path for a subscriber name.
pub fn subscriber_path(name: &str) -> String {
    format!("/subscribers/{}", to_kebab_case(name))
}

/// `SendEmailSubscriber` -> `send-email-subscriber`.
pub fn to_kebab_case(name: &str) -> String {
    lazy_static! {
        static ref UPPER: Regex = Regex::new(r"[A-Z]").expect("valid regex");
    }

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let rest: String = chars.collect();
    let rest = UPPER.replace_all(&rest, |caps: &Captures| format!("-{}", caps[0].to_lowercase()));

    format!("{}{}", first.to_lowercase(), rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct SendEmailSubscriber {
        options: SubscriberOptions,
    }

    #[async_trait]
    impl EventSubscriber for SendEmailSubscriber {
        fn name(&self) -> &'static str {
            "SendEmailSubscriber"
        }

        fn options(&self) -> &SubscriberOptions {
            &self.options
        }

        async fn handle(
            &self,
            _payload: Value,
            _context: &Context,
            _metadata: Option<&EventMetadata>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_defaults() {
        let options = SubscriberOptions::new("send-email");
        assert_eq!(options.subscriber_type(), SubscriberType::Pull);
        assert_eq!(options.max_in_progress(), 10);
        assert_eq!(options.retries(), 10);
        assert_eq!(options.backoff_retry(), 5);
        assert!(options.is_retryable());
        assert_eq!(options.partition_concurrency(), 3);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let options = SubscriberOptions::new("t")
            .with_max_in_progress(0)
            .with_partition_concurrency(0);
        assert_eq!(options.max_in_progress(), 1);
        assert_eq!(options.partition_concurrency(), 1);
    }

    #[test]
    fn test_retry_config_wire_shape() {
        let config = SubscriberOptions::new("send-email")
            .with_retries(4)
            .with_backoff_retry(2)
            .with_retryable(false)
            .retry_config();

        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({
                "topic": "send-email",
                "retries": 4,
                "backoff_retry": 2,
                "retryable": false,
                "partitionConsumed": 3
            })
        );
    }

    #[test]
    fn test_kebab_case() {
        assert_eq!(to_kebab_case("SendEmailSubscriber"), "send-email-subscriber");
        assert_eq!(to_kebab_case("Audit"), "audit");
        assert_eq!(to_kebab_case(""), "");
    }

    #[test]
    fn test_path_and_meta() {
        let subscriber = SendEmailSubscriber {
            options: SubscriberOptions::new("send-email").with_type(SubscriberType::Push),
        };
        assert_eq!(subscriber.path(), "/subscribers/send-email-subscriber");

        let meta = SubscriberMeta::of(&subscriber);
        assert_eq!(meta.topic_name, "send-email");
        assert_eq!(meta.handler_name, "SendEmailSubscriber");
        assert_eq!(meta.subscriber_type, SubscriberType::Push);
    }
}
