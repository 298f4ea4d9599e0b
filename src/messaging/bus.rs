//! The event bus facade.
//!
//! [`MessageBus::initialize`] validates the configuration, builds the
//! configured provider and connects it. The returned handle is what every
//! publish and subscribe call goes through; share it behind an `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use super::in_memory::{InMemoryBroker, InMemoryProvider};
use super::kafka_provider::KafkaProvider;
use super::provider::{EventBusProvider, PublishOptions};
use super::session::SessionSnapshot;
use super::subscriber::{EventSubscriber, SubscriberMeta, SubscriberType};
use crate::error::{BusError, Result};
use crate::types::{BusConfig, Context, ProviderKind};

/// Handle to an initialized event bus.
pub struct MessageBus {
    config: BusConfig,
    provider: Arc<dyn EventBusProvider>,
    exposed: RwLock<HashMap<String, Arc<dyn EventSubscriber>>>,
    subscribers: RwLock<Vec<SubscriberMeta>>,
}

impl MessageBus {
    /// Build and connect the configured provider.
    ///
    /// Fails with a fatal error when the group identity is missing, the
    /// provider is not supported or Kafka has no brokers.
    pub async fn initialize(config: &BusConfig) -> Result<Self> {
        config.validate()?;

        let provider: Arc<dyn EventBusProvider> = match config.provider {
            ProviderKind::Kafka => Arc::new(KafkaProvider::new(config)?),
            ProviderKind::Memory => Arc::new(InMemoryProvider::new(config, InMemoryBroker::new())),
            other => return Err(BusError::UnsupportedProvider(other.to_string())),
        };

        Self::with_provider(config, provider).await
    }

    /// Wrap an already built provider, e.g. an in-memory provider sharing
    /// a broker with other buses.
    pub async fn with_provider(config: &BusConfig, provider: Arc<dyn EventBusProvider>) -> Result<Self> {
        if config.group_id.trim().is_empty() {
            return Err(BusError::Configuration(
                "group id is not found for event bus".to_string(),
            ));
        }

        info!(
            "initializing {} as event bus provider for {}",
            provider.kind(),
            config.group_id
        );
        provider.initialize().await?;

        Ok(Self {
            config: config.clone(),
            provider,
            exposed: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Publish one payload. A context is synthesized when none is given.
    #[instrument(skip(self, payload, opts), fields(group = %self.config.group_id))]
    pub async fn publish<P>(&self, topic: &str, payload: &P, opts: PublishOptions) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        self.provider
            .publish(topic, &payload, &ensure_context(opts))
            .await
    }

    /// Publish several payloads with the same options, all at once.
    #[instrument(skip(self, payloads, opts), fields(group = %self.config.group_id, count = payloads.len()))]
    pub async fn publish_batch<P>(&self, topic: &str, payloads: &[P], opts: PublishOptions) -> Result<()>
    where
        P: Serialize,
    {
        let payloads = to_values(payloads)?;
        self.provider
            .publish_batch(topic, &payloads, &ensure_context(opts))
            .await
    }

    /// Publish `payloads` as successive batches of at most `per_batch`,
    /// waiting `per_batch_wait` between batches. Returns the batch count.
    pub async fn publish_in_batches<P>(
        &self,
        topic: &str,
        payloads: &[P],
        per_batch: usize,
        per_batch_wait: Duration,
        opts: PublishOptions,
    ) -> Result<usize>
    where
        P: Serialize,
    {
        let opts = ensure_context(opts);
        let mut batches = 0;

        for chunk in payloads.chunks(per_batch.max(1)) {
            if batches > 0 && !per_batch_wait.is_zero() {
                tokio::time::sleep(per_batch_wait).await;
            }
            let values = to_values(chunk)?;
            self.provider.publish_batch(topic, &values, &opts).await?;
            batches += 1;
            info!(topic = %topic, batch = batches, size = values.len(), "Batch published");
        }

        Ok(batches)
    }

    /// Add a subscriber.
    ///
    /// Pull subscribers get their consumer group registered in the
    /// background, so startup never waits on the broker. Push subscribers,
    /// and every subscriber in a development environment, are exposed for
    /// manual invocation.
    pub fn add_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberMeta {
        if subscriber.options().subscriber_type() == SubscriberType::Pull {
            let provider = self.provider.clone();
            let background = subscriber.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.register(background.clone()).await {
                    error!(
                        subscriber = background.name(),
                        topic = %background.topic(),
                        error = %e,
                        "Failed to register subscriber"
                    );
                }
            });
        }

        self.record(subscriber)
    }

    /// Like [`add_subscriber`](Self::add_subscriber), but waits until a
    /// pull subscriber's consumer group is running.
    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> Result<SubscriberMeta> {
        if subscriber.options().subscriber_type() == SubscriberType::Pull {
            self.provider.register(subscriber.clone()).await?;
        }
        Ok(self.record(subscriber))
    }

    fn record(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberMeta {
        let meta = SubscriberMeta::of(subscriber.as_ref());

        if meta.subscriber_type == SubscriberType::Push || self.config.environment.is_development() {
            self.exposed
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(meta.endpoint.clone(), subscriber);
            info!(endpoint = %meta.endpoint, "Subscriber exposed for manual invocation");
        }

        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(meta.clone());
        meta
    }

    /// Subscriber exposed under `path`, if any.
    pub fn exposed_subscriber(&self, path: &str) -> Option<Arc<dyn EventSubscriber>> {
        self.exposed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn subscribers_meta(&self) -> Vec<SubscriberMeta> {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.provider.sessions()
    }

    /// Disconnect the producer and every consumer group. Running handlers
    /// are not interrupted.
    pub async fn shutdown(&self) -> Result<()> {
        info!(group = %self.config.group_id, "shutting down event bus");
        let result = self.provider.shutdown().await;
        if let Err(e) = &result {
            warn!(error = %e, "Event bus shutdown incomplete");
        }
        result
    }
}

fn ensure_context(mut opts: PublishOptions) -> PublishOptions {
    if opts.context.is_none() {
        opts.context = Some(Context::generate());
    }
    opts
}

fn to_values<P: Serialize>(payloads: &[P]) -> Result<Vec<Value>> {
    payloads
        .iter()
        .map(|p| serde_json::to_value(p).map_err(BusError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::retry::{RETRY_MESSAGE_STATUS_TOPIC, RETRY_MESSAGE_TOPIC};
    use crate::messaging::subscriber::SubscriberOptions;
    use crate::types::{AppEnvironment, EventMetadata, ANONYMOUS_USER_ID};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(2);

    struct TestSubscriber {
        name: &'static str,
        options: SubscriberOptions,
        fail: bool,
        calls: AtomicUsize,
        last_payload: std::sync::Mutex<Option<Value>>,
    }

    impl TestSubscriber {
        fn new(name: &'static str, options: SubscriberOptions, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                options,
                fail,
                calls: AtomicUsize::new(0),
                last_payload: std::sync::Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSubscriber for TestSubscriber {
        fn name(&self) -> &'static str {
            self.name
        }

        fn options(&self) -> &SubscriberOptions {
            &self.options
        }

        async fn handle(
            &self,
            payload: Value,
            _context: &Context,
            _metadata: Option<&EventMetadata>,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock().unwrap() = Some(payload);
            if self.fail {
                anyhow::bail!("handler failed");
            }
            Ok(())
        }
    }

    fn memory_config(service: &str) -> BusConfig {
        BusConfig::new(ProviderKind::Memory, service)
            .with_environment(AppEnvironment::Production)
            .with_heartbeat_interval(Duration::from_millis(10))
    }

    async fn bus_on(broker: &InMemoryBroker, service: &str) -> MessageBus {
        let config = memory_config(service);
        let provider = Arc::new(InMemoryProvider::new(&config, broker.clone()));
        MessageBus::with_provider(&config, provider).await.unwrap()
    }

    async fn wait_processed(bus: &MessageBus, group: &str, count: u64) {
        tokio::time::timeout(WAIT, async {
            loop {
                let done = bus
                    .sessions()
                    .iter()
                    .any(|s| s.group_id == group && s.processed >= count);
                if done {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message not processed in time");
    }

    #[tokio::test]
    async fn test_initialize_requires_group_id() {
        let err = MessageBus::initialize(&BusConfig::new(ProviderKind::Memory, ""))
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_initialize_rejects_unsupported_provider() {
        let err = MessageBus::initialize(&BusConfig::new(ProviderKind::CloudPubsub, "svc-a"))
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_initialize_kafka_without_brokers_is_fatal() {
        let err = MessageBus::initialize(&BusConfig::new(ProviderKind::Kafka, "svc-a"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BusError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_publish_without_context_is_traceable() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "svc-a").await;

        bus.publish("send-email", &json!({ "user_id": "abc" }), PublishOptions::default())
            .await
            .unwrap();

        let messages = broker.messages("send-email");
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].header("request_id").unwrap_or_default().is_empty());
        assert_eq!(messages[0].header("user_id"), Some(ANONYMOUS_USER_ID));
        assert_eq!(messages[0].header("origin"), Some("svc-a"));
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_payload() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "svc-a").await;
        let subscriber = TestSubscriber::new(
            "SendEmailSubscriber",
            SubscriberOptions::new("send-email"),
            false,
        );
        bus.subscribe(subscriber.clone()).await.unwrap();

        let payload = json!({ "user_id": "abc", "tags": ["a", "b"], "n": 1.5, "nested": { "ok": true } });
        bus.publish("send-email", &payload, PublishOptions::default())
            .await
            .unwrap();
        wait_processed(&bus, "svc-a-send-email", 1).await;

        assert_eq!(subscriber.last_payload.lock().unwrap().clone(), Some(payload));
        assert!(broker.messages(RETRY_MESSAGE_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_failed_retryable_message_lands_on_retry_topic() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "svc-a").await;
        bus.subscribe(TestSubscriber::new(
            "SendEmailSubscriber",
            SubscriberOptions::new("send-email"),
            true,
        ))
        .await
        .unwrap();

        bus.publish("send-email", &json!({ "user_id": "abc" }), PublishOptions::default())
            .await
            .unwrap();

        let sent = broker.messages("send-email");
        assert_eq!(sent[0].header("origin"), Some("svc-a"));

        let retries = broker.wait_for(RETRY_MESSAGE_TOPIC, 1, WAIT).await;
        assert_eq!(retries.len(), 1);
        let envelope = retries[0].value();
        assert_eq!(envelope["subscriber"]["topic"], "send-email");
        assert_eq!(envelope["subscriber"]["retries"], 10);
        assert_eq!(envelope["subscriber"]["partitionConsumed"], 3);
        assert_eq!(envelope["message"]["value"], json!({ "user_id": "abc" }));

        let sessions = bus.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].group_id, "svc-a-send-email");
    }

    #[tokio::test]
    async fn test_failed_non_retryable_message_is_dropped() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "svc-a").await;
        let subscriber = TestSubscriber::new(
            "AuditSubscriber",
            SubscriberOptions::new("audit").with_retryable(false),
            true,
        );
        bus.subscribe(subscriber.clone()).await.unwrap();

        bus.publish("audit", &json!({ "action": "login" }), PublishOptions::default())
            .await
            .unwrap();
        wait_processed(&bus, "svc-a-audit", 1).await;

        assert_eq!(subscriber.calls(), 1);
        assert!(broker.messages(RETRY_MESSAGE_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_retry_is_routed_to_its_destination_only() {
        let broker = InMemoryBroker::new();
        let bus_a = bus_on(&broker, "svc-a").await;
        let bus_b = bus_on(&broker, "svc-b").await;

        let replay_a = TestSubscriber::new("ReplaySubscriber", SubscriberOptions::new(RETRY_MESSAGE_TOPIC), false);
        let replay_b = TestSubscriber::new("ReplaySubscriber", SubscriberOptions::new(RETRY_MESSAGE_TOPIC), false);
        bus_a.subscribe(replay_a.clone()).await.unwrap();
        bus_b.subscribe(replay_b.clone()).await.unwrap();

        let context = Context::new("req-1", "u-1").with_field("retry_id", "r-1");
        bus_a
            .publish(
                RETRY_MESSAGE_TOPIC,
                &json!({ "message": { "value": {}, "headers": {} } }),
                PublishOptions::default()
                    .with_context(context)
                    .with_destination("svc-b"),
            )
            .await
            .unwrap();

        let statuses = broker.wait_for(RETRY_MESSAGE_STATUS_TOPIC, 1, WAIT).await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].value(), json!({ "is_success": true, "id": "r-1" }));
        assert_eq!(statuses[0].header("origin"), Some("svc-b"));
        assert_eq!(statuses[0].header("request_id"), Some("req-1"));

        wait_processed(&bus_a, "svc-a-retry-message", 1).await;
        assert_eq!(replay_a.calls(), 0);
        assert_eq!(replay_b.calls(), 1);
    }

    #[tokio::test]
    async fn test_add_subscriber_registers_in_background() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "svc-a").await;
        let subscriber = TestSubscriber::new(
            "SendEmailSubscriber",
            SubscriberOptions::new("send-email"),
            false,
        );

        let meta = bus.add_subscriber(subscriber);
        assert_eq!(meta.endpoint, "/subscribers/send-email-subscriber");
        assert_eq!(meta.topic_name, "send-email");
        assert!(bus.exposed_subscriber(&meta.endpoint).is_none());

        tokio::time::timeout(WAIT, async {
            while bus.sessions().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(bus.subscribers_meta(), vec![meta]);
    }

    #[tokio::test]
    async fn test_push_subscriber_is_exposed_not_registered() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "svc-a").await;
        let subscriber = TestSubscriber::new(
            "WebhookSubscriber",
            SubscriberOptions::new("webhook").with_type(SubscriberType::Push),
            false,
        );

        let meta = bus.subscribe(subscriber).await.unwrap();
        assert!(bus.exposed_subscriber("/subscribers/webhook-subscriber").is_some());
        assert_eq!(meta.subscriber_type, SubscriberType::Push);
        assert!(bus.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_development_exposes_pull_subscribers() {
        let broker = InMemoryBroker::new();
        let config = memory_config("svc-a").with_environment(AppEnvironment::Local);
        let provider = Arc::new(InMemoryProvider::new(&config, broker.clone()));
        let bus = MessageBus::with_provider(&config, provider).await.unwrap();

        bus.subscribe(TestSubscriber::new(
            "SendEmailSubscriber",
            SubscriberOptions::new("send-email"),
            false,
        ))
        .await
        .unwrap();

        assert!(bus
            .exposed_subscriber("/subscribers/send-email-subscriber")
            .is_some());
    }

    #[tokio::test]
    async fn test_publish_in_batches() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "svc-a").await;
        let payloads: Vec<Value> = (0..5).map(|n| json!({ "n": n })).collect();

        let batches = bus
            .publish_in_batches("numbers", &payloads, 2, Duration::from_millis(1), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(batches, 3);
        let messages = broker.messages("numbers");
        assert_eq!(messages.len(), 5);

        let request_ids: std::collections::HashSet<_> = messages
            .iter()
            .filter_map(|m| m.header("request_id").map(str::to_string))
            .collect();
        assert_eq!(request_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumers() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "svc-a").await;
        let subscriber = TestSubscriber::new(
            "SendEmailSubscriber",
            SubscriberOptions::new("send-email"),
            false,
        );
        bus.subscribe(subscriber.clone()).await.unwrap();
        tokio_test::assert_ok!(bus.shutdown().await);

        let err = bus
            .publish("send-email", &json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Shutdown(_)));

        // the stopped group no longer receives messages from other services
        let other = bus_on(&broker, "svc-b").await;
        other
            .publish("send-email", &json!({}), PublishOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(subscriber.calls(), 0);
    }
}
