//! In-memory broker and provider for tests and single-process runs.
//!
//! The broker keeps an append-only log per topic and fans every new message
//! out to each consumer group joined on that topic. Groups start at the end
//! of the log, like a Kafka group with `auto.offset.reset=latest`.
//!
//! Several buses can share one [`InMemoryBroker`] to model several services
//! on one cluster:
//!
//! ```no_run
//! use eventbus::messaging::{InMemoryBroker, InMemoryProvider};
//! use eventbus::types::{BusConfig, ProviderKind};
//!
//! let broker = InMemoryBroker::new();
//! let a = InMemoryProvider::new(&BusConfig::new(ProviderKind::Memory, "svc-a"), broker.clone());
//! let b = InMemoryProvider::new(&BusConfig::new(ProviderKind::Memory, "svc-b"), broker.clone());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec::{self, Headers};
use super::processor::{InboundMessage, MessageProcessor};
use super::provider::{consumer_group_id, EventBusProvider, MessagePublisher, PublishOptions};
use super::session::{GroupSession, SessionSnapshot};
use super::subscriber::EventSubscriber;
use crate::error::{BusError, Result};
use crate::types::{BusConfig, Context, ProviderKind};

/// A message as stored in a topic log
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub key: Option<String>,
}

impl StoredMessage {
    /// Decoded payload; corrupt bytes decode to `{}`.
    pub fn value(&self) -> Value {
        codec::decode_payload(Some(&self.payload))
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

struct GroupFeed {
    topic: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<StoredMessage>>,
    groups: HashMap<String, GroupFeed>,
}

/// Shared in-process broker. Clones share the same logs.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    published: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message and deliver it to every group on the topic.
    /// Returns the message offset.
    pub fn append(&self, topic: &str, message: StoredMessage) -> i64 {
        let mut state = self.lock();
        let log = state.topics.entry(topic.to_string()).or_default();
        let offset = log.len() as i64;
        log.push(message.clone());

        state.groups.retain(|group, feed| {
            if feed.topic != topic {
                return true;
            }
            let delivered = feed.sender.send(InboundMessage {
                topic: topic.to_string(),
                partition: 0,
                offset,
                payload: Some(message.payload.clone()),
                headers: message.headers.clone(),
            });
            if delivered.is_err() {
                debug!(group = %group, "Consumer group gone, detaching");
            }
            delivered.is_ok()
        });
        drop(state);

        self.published.notify_waiters();
        offset
    }

    /// Join `group` to `topic`. `None` if the group is already joined.
    pub fn join(
        &self,
        group: &str,
        topic: &str,
    ) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        let mut state = self.lock();
        if state.groups.contains_key(group) {
            return None;
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        state.groups.insert(
            group.to_string(),
            GroupFeed {
                topic: topic.to_string(),
                sender,
            },
        );
        Some(receiver)
    }

    /// Detach a group. Messages already delivered to it are still processed.
    pub fn leave(&self, group: &str) {
        self.lock().groups.remove(group);
    }

    /// Every message ever published on `topic`, in order.
    pub fn messages(&self, topic: &str) -> Vec<StoredMessage> {
        self.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Wait until `topic` holds at least `count` messages or `timeout`
    /// elapses, then return what is there.
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: Duration) -> Vec<StoredMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let published = self.published.notified();
            let messages = self.messages(topic);
            if messages.len() >= count {
                return messages;
            }
            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return self.messages(topic);
            }
        }
    }
}

/// Publishes into an [`InMemoryBroker`] on behalf of one service.
pub struct BrokerPublisher {
    broker: InMemoryBroker,
    origin: String,
}

impl BrokerPublisher {
    pub fn new(broker: InMemoryBroker, origin: impl Into<String>) -> Self {
        Self {
            broker,
            origin: origin.into(),
        }
    }
}

#[async_trait]
impl MessagePublisher for BrokerPublisher {
    async fn publish(&self, topic: &str, payload: &Value, opts: &PublishOptions) -> Result<()> {
        let context = opts.context.clone().unwrap_or_else(Context::generate);
        let message = StoredMessage {
            payload: codec::encode_payload(payload)?,
            headers: codec::build_headers(&context, &self.origin, opts.destination.as_deref()),
            key: opts.key.clone(),
        };
        let offset = self.broker.append(topic, message);
        debug!(topic = %topic, offset, request_id = %context.request_id, "Message published");
        Ok(())
    }
}

struct Consumer {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Event bus backed by an [`InMemoryBroker`].
pub struct InMemoryProvider {
    group_id: String,
    broker: InMemoryBroker,
    publisher: Arc<BrokerPublisher>,
    processor: Arc<MessageProcessor>,
    consumers: tokio::sync::Mutex<HashMap<String, Consumer>>,
    sessions: RwLock<Vec<Arc<GroupSession>>>,
    closed: AtomicBool,
}

impl InMemoryProvider {
    pub fn new(config: &BusConfig, broker: InMemoryBroker) -> Self {
        let publisher = Arc::new(BrokerPublisher::new(broker.clone(), &config.group_id));
        let processor = Arc::new(MessageProcessor::new(
            &config.group_id,
            publisher.clone(),
            config.heartbeat_interval,
        ));
        Self {
            group_id: config.group_id.clone(),
            broker,
            publisher,
            processor,
            consumers: tokio::sync::Mutex::new(HashMap::new()),
            sessions: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl MessagePublisher for InMemoryProvider {
    async fn publish(&self, topic: &str, payload: &Value, opts: &PublishOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Shutdown("event bus is shut down".to_string()));
        }
        self.publisher.publish(topic, payload, opts).await
    }
}

#[async_trait]
impl EventBusProvider for InMemoryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn register(&self, subscriber: Arc<dyn EventSubscriber>) -> Result<()> {
        let group_id = consumer_group_id(&self.group_id, subscriber.topic());
        let mut consumers = self.consumers.lock().await;

        let Some(mut messages) = self.broker.join(&group_id, subscriber.topic()) else {
            warn!(group = %group_id, "Consumer group already registered, ignoring");
            return Ok(());
        };

        let session = Arc::new(GroupSession::new(&group_id, subscriber.topic()));
        let (stop, mut stopped) = watch::channel(false);
        let processor = self.processor.clone();
        let worker_session = session.clone();
        let worker_subscriber = subscriber.clone();

        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = stopped.changed() => break,
                    message = messages.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                match processor
                    .process(
                        worker_subscriber.as_ref(),
                        &message,
                        worker_session.heartbeat_action(),
                    )
                    .await
                {
                    Ok(outcome) => {
                        worker_session.mark_processed();
                        debug!(group = %worker_session.group_id(), ?outcome, "Message processed");
                    }
                    Err(e) => error!(
                        group = %worker_session.group_id(),
                        offset = message.offset,
                        error = %e,
                        "Failed to publish message outcome"
                    ),
                }
            }
        });

        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(session);
        consumers.insert(group_id.clone(), Consumer { stop, task });

        info!(group = %group_id, subscriber = subscriber.name(), "Subscriber registered");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let consumers: Vec<(String, Consumer)> = self.consumers.lock().await.drain().collect();
        for (group_id, consumer) in consumers {
            self.broker.leave(&group_id);
            let _ = consumer.stop.send(true);
            consumer.task.await?;
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
