//! Kafka implementation of [`EventBusProvider`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::kafka_consumer::{ConsumerGroup, ConsumerGroupConfig};
use super::kafka_producer::{KafkaProducer, ProducerConfig};
use super::processor::MessageProcessor;
use super::provider::{consumer_group_id, EventBusProvider, MessagePublisher, PublishOptions};
use super::session::{GroupSession, SessionSnapshot};
use super::subscriber::EventSubscriber;
use crate::error::{BusError, Result};
use crate::types::{BusConfig, ProviderKind};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared librdkafka settings for producer and consumers.
pub(crate) fn client_config(config: &BusConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers().join(","))
        .set("client.id", &config.group_id);

    let protocol = match (config.sasl.is_some(), config.use_ssl) {
        (false, false) => "PLAINTEXT",
        (false, true) => "SSL",
        (true, false) => "SASL_PLAINTEXT",
        (true, true) => "SASL_SSL",
    };
    client.set("security.protocol", protocol);

    if let Some(sasl) = &config.sasl {
        client
            .set("sasl.mechanisms", sasl.mechanism.as_librdkafka())
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }

    client
}

/// Event bus backed by a Kafka cluster.
pub struct KafkaProvider {
    group_id: String,
    heartbeat_interval: Duration,
    client: ClientConfig,
    producer: Arc<KafkaProducer>,
    processor: Arc<MessageProcessor>,
    consumers: Mutex<HashMap<String, ConsumerGroup>>,
    sessions: RwLock<Vec<Arc<GroupSession>>>,
    closed: AtomicBool,
}

impl KafkaProvider {
    pub fn new(config: &BusConfig) -> Result<Self> {
        if config.brokers().is_empty() {
            return Err(BusError::Configuration(
                "no connection string found for kafka event bus provider".to_string(),
            ));
        }

        let client = client_config(config);
        let producer = Arc::new(KafkaProducer::new(
            &client,
            ProducerConfig::default(),
            &config.group_id,
        )?);
        let processor = Arc::new(MessageProcessor::new(
            &config.group_id,
            producer.clone(),
            config.heartbeat_interval,
        ));

        Ok(Self {
            group_id: config.group_id.clone(),
            heartbeat_interval: config.heartbeat_interval,
            client,
            producer,
            processor,
            consumers: Mutex::new(HashMap::new()),
            sessions: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MessagePublisher for KafkaProvider {
    async fn publish(&self, topic: &str, payload: &Value, opts: &PublishOptions) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Shutdown("event bus is shut down".to_string()));
        }
        self.producer.send(topic, payload, opts).await
    }
}

#[async_trait]
impl EventBusProvider for KafkaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kafka
    }

    async fn initialize(&self) -> Result<()> {
        self.producer.connect().await
    }

    async fn register(&self, subscriber: Arc<dyn EventSubscriber>) -> Result<()> {
        let group_id = consumer_group_id(&self.group_id, subscriber.topic());

        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(&group_id) {
            warn!(group = %group_id, "Consumer group already registered, ignoring");
            return Ok(());
        }

        let config = ConsumerGroupConfig::for_subscriber(
            &group_id,
            subscriber.options(),
            self.heartbeat_interval,
        );
        let mut group = ConsumerGroup::create(config, &self.client)?;
        group.subscribe()?;
        group.start(subscriber.clone(), self.processor.clone());

        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(group.session());
        consumers.insert(group_id.clone(), group);

        info!(
            group = %group_id,
            subscriber = subscriber.name(),
            "Subscriber registered"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);

        // lanes still publish outcomes through the producer while groups stop
        let groups: Vec<ConsumerGroup> = self.consumers.lock().await.drain().map(|(_, g)| g).collect();
        let (flushed, results) = tokio::join!(
            self.producer.flush(FLUSH_TIMEOUT),
            futures::future::join_all(groups.into_iter().map(ConsumerGroup::shutdown)),
        );

        flushed?;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();
        if !failures.is_empty() {
            return Err(BusError::Shutdown(failures.join("; ")));
        }
        Ok(())
    }

    fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.snapshot())
            .collect()
    }
}
