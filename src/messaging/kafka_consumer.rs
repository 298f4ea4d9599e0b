//! Kafka consumer groups for the event bus.
//!
//! One consumer group per subscriber, named `{group_id}-{topic}`. A single
//! poll loop receives messages and hands each one to a lane chosen by
//! partition, so messages of one partition are processed in order while
//! different partitions run concurrently. The poll loop never waits on a
//! lane: a full lane parks its messages and pauses their partitions until
//! it drains.
//!
//! Offsets are stored only after a message was processed (handled, dropped,
//! skipped or enqueued for retry) and committed by the client in the
//! background. A crash before that point redelivers the message, and a
//! lane keeps retrying a failed outcome publish before it moves on.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Headers as _, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::TopicPartitionList;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::codec::Headers;
use super::processor::{InboundMessage, MessageProcessor, Report};
use super::session::GroupSession;
use super::subscriber::{EventSubscriber, SubscriberOptions};
use crate::error::Result;

/// Broker-side session timeout. Heartbeats must land well within it.
pub const SESSION_TIMEOUT_MS: u64 = 10_000;

/// Longest gap between polls before the broker evicts the member.
pub const MAX_POLL_INTERVAL_MS: u64 = 300_000;

const RETRY_BACKOFF_BASE_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 60_000;

/// How often a parked backlog is offered to its lane again
const BACKLOG_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Consumer settings derived from a subscriber's options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupConfig {
    pub group_id: String,
    pub topic: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub max_in_flight: usize,
    pub retries: u32,
    pub backoff_multiplier: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub lanes: usize,
}

impl ConsumerGroupConfig {
    pub fn for_subscriber(
        group_id: impl Into<String>,
        options: &SubscriberOptions,
        heartbeat_interval: Duration,
    ) -> Self {
        // librdkafka wants the heartbeat at most a third of the session timeout
        let heartbeat_interval_ms =
            (heartbeat_interval.as_millis() as u64).clamp(1, SESSION_TIMEOUT_MS / 3);

        let retry_backoff_ms =
            (RETRY_BACKOFF_BASE_MS * u64::from(options.backoff_retry().max(1))).min(MAX_BACKOFF_MS);
        let max_backoff_ms = (retry_backoff_ms * u64::from(options.retries().max(1)))
            .clamp(1_000.max(retry_backoff_ms), MAX_BACKOFF_MS);

        Self {
            group_id: group_id.into(),
            topic: options.topic().to_string(),
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: SESSION_TIMEOUT_MS,
            heartbeat_interval_ms,
            max_poll_interval_ms: MAX_POLL_INTERVAL_MS,
            max_in_flight: options.max_in_progress(),
            retries: options.retries(),
            backoff_multiplier: options.backoff_retry(),
            retry_backoff_ms,
            max_backoff_ms,
            lanes: options.partition_concurrency(),
        }
    }

    /// Layer the group settings over the shared client settings.
    pub fn client_config(&self, base: &ClientConfig) -> ClientConfig {
        let mut config = base.clone();
        config
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", self.heartbeat_interval_ms.to_string())
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string())
            .set(
                "max.in.flight.requests.per.connection",
                self.max_in_flight.to_string(),
            )
            .set("retry.backoff.ms", self.retry_backoff_ms.to_string())
            .set("retry.backoff.max.ms", self.max_backoff_ms.to_string())
            .set("reconnect.backoff.max.ms", self.max_backoff_ms.to_string())
            .set("allow.auto.create.topics", "true")
            .set_log_level(RDKafkaLogLevel::Info);
        config
    }
}

/// Client context that turns group lifecycle callbacks into log events.
pub struct GroupContext {
    group_id: String,
}

impl GroupContext {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
        }
    }
}

impl ClientContext for GroupContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        if fac.eq_ignore_ascii_case("REQTMOUT") {
            warn!(group = %self.group_id, "Consumer request timeout: {}", log_message);
            return;
        }
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                error!(group = %self.group_id, facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Warning => {
                warn!(group = %self.group_id, facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(group = %self.group_id, facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Debug => {
                debug!(group = %self.group_id, facility = fac, "{}", log_message)
            }
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        if is_disconnect(&error) {
            warn!(group = %self.group_id, reason, "Consumer disconnected");
        } else {
            error!(group = %self.group_id, error = %error, reason, "Consumer crashed");
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => info!(
                group = %self.group_id,
                partitions = partitions.count(),
                "Consumer is rebalancing"
            ),
            Rebalance::Assign(_) => debug!(group = %self.group_id, "Partitions about to be assigned"),
            Rebalance::Error(e) => error!(group = %self.group_id, error = %e, "Rebalance failed"),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => info!(
                group = %self.group_id,
                partitions = partitions.count(),
                "Consumer has joined the group"
            ),
            Rebalance::Revoke(_) => debug!(group = %self.group_id, "Partitions revoked"),
            Rebalance::Error(e) => error!(group = %self.group_id, error = %e, "Rebalance failed"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(group = %self.group_id, partitions = offsets.count(), "Offsets committed"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(group = %self.group_id, error = %e, "Offset commit failed"),
        }
    }
}

fn is_disconnect(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::BrokerTransportFailure) | Some(RDKafkaErrorCode::AllBrokersDown)
    )
}

type GroupConsumer = StreamConsumer<GroupContext>;

/// Partition-level client operations used by the consume loop.
pub trait PartitionControl: Send + Sync + 'static {
    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()>;
    fn pause(&self, topic: &str, partition: i32) -> KafkaResult<()>;
    fn resume(&self, topic: &str, partition: i32) -> KafkaResult<()>;
}

fn single_partition(topic: &str, partition: i32) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    list.add_partition(topic, partition);
    list
}

impl PartitionControl for GroupConsumer {
    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()> {
        Consumer::store_offset(self, topic, partition, offset)
    }

    fn pause(&self, topic: &str, partition: i32) -> KafkaResult<()> {
        Consumer::pause(self, &single_partition(topic, partition))
    }

    fn resume(&self, topic: &str, partition: i32) -> KafkaResult<()> {
        Consumer::resume(self, &single_partition(topic, partition))
    }
}

/// A running consumer group bound to one subscriber
pub struct ConsumerGroup {
    config: ConsumerGroupConfig,
    consumer: Arc<GroupConsumer>,
    session: Arc<GroupSession>,
    stop: watch::Sender<bool>,
    poller: Option<JoinHandle<()>>,
    lanes: Vec<JoinHandle<()>>,
}

impl ConsumerGroup {
    /// Create the consumer. Does not contact the broker yet.
    pub fn create(config: ConsumerGroupConfig, base: &ClientConfig) -> Result<Self> {
        let consumer: GroupConsumer = config
            .client_config(base)
            .create_with_context(GroupContext::new(&config.group_id))?;

        info!(
            group = %config.group_id,
            topic = %config.topic,
            lanes = config.lanes,
            "Kafka consumer created"
        );

        let (stop, _) = watch::channel(false);
        Ok(Self {
            session: Arc::new(GroupSession::new(&config.group_id, &config.topic)),
            config,
            consumer: Arc::new(consumer),
            stop,
            poller: None,
            lanes: Vec::new(),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn session(&self) -> Arc<GroupSession> {
        self.session.clone()
    }

    /// Subscribe to the subscriber's topic
    pub fn subscribe(&self) -> Result<()> {
        self.consumer.subscribe(&[self.config.topic.as_str()])?;
        info!(group = %self.config.group_id, topic = %self.config.topic, "Subscribed to topic");
        Ok(())
    }

    /// Start the poll loop and the processing lanes.
    pub fn start(&mut self, subscriber: Arc<dyn EventSubscriber>, processor: Arc<MessageProcessor>) {
        if self.poller.is_some() {
            warn!(group = %self.config.group_id, "Consumer group already running");
            return;
        }

        let lane_count = self.config.lanes.max(1);
        let backoff = PublishBackoff::for_config(&self.config);
        let mut senders = Vec::with_capacity(lane_count);
        for _ in 0..lane_count {
            let (tx, rx) = mpsc::channel(self.config.max_in_flight.max(1));
            senders.push(tx);
            let lane = Lane {
                control: self.consumer.clone(),
                subscriber: subscriber.clone(),
                processor: processor.clone(),
                session: self.session.clone(),
                backoff,
            };
            self.lanes.push(tokio::spawn(lane.run(rx, self.stop.subscribe())));
        }

        let dispatcher = Dispatcher::new(self.consumer.clone(), senders, &self.config.group_id);
        self.poller = Some(tokio::spawn(poll(
            self.consumer.clone(),
            dispatcher,
            self.stop.subscribe(),
            self.config.group_id.clone(),
        )));
    }

    /// Stop consuming. In-flight handlers finish; queued messages are left
    /// uncommitted and will be redelivered.
    #[instrument(skip(self), fields(group = %self.config.group_id))]
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.stop.send(true);

        if let Some(poller) = self.poller.take() {
            poller.await?;
        }
        for lane in self.lanes.drain(..) {
            lane.await?;
        }

        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(error = %e, "Final offset commit failed"),
        }
        self.consumer.unsubscribe();

        info!("Consumer group stopped");
        Ok(())
    }
}

/// Lane index for a partition
pub fn lane_for(partition: i32, lanes: usize) -> usize {
    partition.rem_euclid(lanes.max(1) as i32) as usize
}

fn inbound_message(message: &BorrowedMessage<'_>) -> InboundMessage {
    let headers: Headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| {
                    h.value
                        .map(|v| (h.key.to_string(), String::from_utf8_lossy(v).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec),
        headers,
    }
}

/// Result of handing one message to its lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    /// The lane was full; the message waits in the backlog and its
    /// partition is paused
    Parked,
    Closed,
}

/// Hands polled messages to lanes without ever waiting on one.
///
/// Each lane has a backlog. Once a lane's backlog is non-empty every
/// further message for that lane joins it, which keeps partition order.
pub struct Dispatcher<C> {
    control: Arc<C>,
    lanes: Vec<mpsc::Sender<InboundMessage>>,
    backlog: Vec<VecDeque<InboundMessage>>,
    paused: Vec<BTreeSet<(String, i32)>>,
    group_id: String,
}

impl<C: PartitionControl> Dispatcher<C> {
    pub fn new(control: Arc<C>, lanes: Vec<mpsc::Sender<InboundMessage>>, group_id: &str) -> Self {
        Self {
            control,
            backlog: lanes.iter().map(|_| VecDeque::new()).collect(),
            paused: lanes.iter().map(|_| BTreeSet::new()).collect(),
            lanes,
            group_id: group_id.to_string(),
        }
    }

    pub fn has_backlog(&self) -> bool {
        self.backlog.iter().any(|queue| !queue.is_empty())
    }

    pub fn dispatch(&mut self, message: InboundMessage) -> Dispatch {
        let lane = lane_for(message.partition, self.lanes.len());
        if !self.backlog[lane].is_empty() {
            self.park(lane, message);
            return Dispatch::Parked;
        }

        match self.lanes[lane].try_send(message) {
            Ok(()) => Dispatch::Queued,
            Err(TrySendError::Full(message)) => {
                self.park(lane, message);
                Dispatch::Parked
            }
            Err(TrySendError::Closed(_)) => Dispatch::Closed,
        }
    }

    /// Move backlogged messages into lanes with room and resume the
    /// partitions of every lane whose backlog emptied. Returns false once
    /// a lane is closed.
    pub fn drain(&mut self) -> bool {
        for lane in 0..self.lanes.len() {
            while let Some(message) = self.backlog[lane].pop_front() {
                match self.lanes[lane].try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        self.backlog[lane].push_front(message);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }

            if self.backlog[lane].is_empty() {
                for (topic, partition) in std::mem::take(&mut self.paused[lane]) {
                    match self.control.resume(&topic, partition) {
                        Ok(()) => debug!(group = %self.group_id, partition, "Partition resumed"),
                        Err(e) => warn!(
                            group = %self.group_id,
                            partition,
                            error = %e,
                            "Failed to resume partition"
                        ),
                    }
                }
            }
        }
        true
    }

    fn park(&mut self, lane: usize, message: InboundMessage) {
        let key = (message.topic.clone(), message.partition);
        if !self.paused[lane].contains(&key) {
            match self.control.pause(&key.0, key.1) {
                Ok(()) => {
                    debug!(group = %self.group_id, partition = key.1, "Lane full, partition paused")
                }
                Err(e) => warn!(
                    group = %self.group_id,
                    partition = key.1,
                    error = %e,
                    "Failed to pause partition"
                ),
            }
            self.paused[lane].insert(key);
        }
        self.backlog[lane].push_back(message);
    }
}

async fn poll(
    consumer: Arc<GroupConsumer>,
    mut dispatcher: Dispatcher<GroupConsumer>,
    mut stop: watch::Receiver<bool>,
    group_id: String,
) {
    debug!(group = %group_id, "Starting Kafka consumer loop");

    loop {
        if !dispatcher.drain() {
            warn!(group = %group_id, "Lane closed, stopping consumer");
            break;
        }
        let backlog = dispatcher.has_backlog();

        let received = tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(BACKLOG_RETRY_INTERVAL), if backlog => continue,
            received = consumer.recv() => received.map(|m| inbound_message(&m)),
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => {
                warn!(group = %group_id, error = %e, "Kafka consumer error");
                continue;
            }
        };

        if dispatcher.dispatch(message) == Dispatch::Closed {
            warn!(group = %group_id, "Lane closed, stopping consumer");
            break;
        }
    }

    debug!(group = %group_id, "Kafka consumer loop stopped");
}

/// Delay between attempts to publish a message outcome.
///
/// Grows by the subscriber's backoff multiplier for `retries` attempts,
/// then stays flat. Always capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishBackoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub retries: u32,
    pub max: Duration,
}

impl PublishBackoff {
    pub fn for_config(config: &ConsumerGroupConfig) -> Self {
        Self {
            initial: Duration::from_millis(RETRY_BACKOFF_BASE_MS),
            multiplier: config.backoff_multiplier.max(1),
            retries: config.retries,
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after the given failed attempt, counting from 1
    pub fn delay(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1).min(self.retries);
        let factor = self.multiplier.max(1).saturating_pow(steps);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Processes one lane's messages in order and stores their offsets.
pub struct Lane<C> {
    control: Arc<C>,
    subscriber: Arc<dyn EventSubscriber>,
    processor: Arc<MessageProcessor>,
    session: Arc<GroupSession>,
    backoff: PublishBackoff,
}

impl<C: PartitionControl> Lane<C> {
    pub async fn run(
        self,
        mut messages: mpsc::Receiver<InboundMessage>,
        mut stop: watch::Receiver<bool>,
    ) {
        while let Some(message) = messages.recv().await {
            if *stop.borrow() {
                break;
            }
            if !self.process(&message, &mut stop).await {
                break;
            }
        }
    }

    /// Returns false when stop arrived before the outcome was published.
    async fn process(&self, message: &InboundMessage, stop: &mut watch::Receiver<bool>) -> bool {
        let evaluation = self
            .processor
            .evaluate(self.subscriber.as_ref(), message, self.session.heartbeat_action())
            .await;

        if let Some(report) = &evaluation.report {
            if !self.publish_report(report, message, stop).await {
                warn!(
                    group = %self.session.group_id(),
                    partition = message.partition,
                    offset = message.offset,
                    "Stopped before the message outcome was published, offset not stored"
                );
                return false;
            }
        }

        // the committed offset is the next one to read
        if let Err(e) = self
            .control
            .store_offset(&message.topic, message.partition, message.offset + 1)
        {
            warn!(group = %self.session.group_id(), error = %e, "Failed to store offset");
        }
        self.session.mark_processed();
        debug!(
            group = %self.session.group_id(),
            outcome = ?evaluation.outcome,
            "Message processed"
        );
        true
    }

    /// Publish until it succeeds or stop is requested.
    async fn publish_report(
        &self,
        report: &Report,
        message: &InboundMessage,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut attempt = 0;
        loop {
            let e = match self.processor.publish_report(report).await {
                Ok(()) => return true,
                Err(e) => e,
            };

            attempt += 1;
            let delay = self.backoff.delay(attempt);
            error!(
                group = %self.session.group_id(),
                partition = message.partition,
                offset = message.offset,
                topic = report.topic(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %e,
                "Failed to publish message outcome"
            );

            if *stop.borrow() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::processor::tests::{
        message, FlakyPublisher, RecordingPublisher, ScriptedSubscriber,
    };
    use crate::messaging::provider::MessagePublisher;
    use crate::messaging::retry::RETRY_MESSAGE_TOPIC;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    /// Records partition operations instead of talking to a broker.
    #[derive(Default)]
    struct RecordingControl {
        stored: Mutex<Vec<(String, i32, i64)>>,
        paused: Mutex<Vec<(String, i32)>>,
        resumed: Mutex<Vec<(String, i32)>>,
    }

    impl RecordingControl {
        fn stored_offsets(&self) -> Vec<i64> {
            self.stored.lock().unwrap().iter().map(|(_, _, o)| *o).collect()
        }
    }

    impl PartitionControl for RecordingControl {
        fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()> {
            self.stored
                .lock()
                .unwrap()
                .push((topic.to_string(), partition, offset));
            Ok(())
        }

        fn pause(&self, topic: &str, partition: i32) -> KafkaResult<()> {
            self.paused.lock().unwrap().push((topic.to_string(), partition));
            Ok(())
        }

        fn resume(&self, topic: &str, partition: i32) -> KafkaResult<()> {
            self.resumed.lock().unwrap().push((topic.to_string(), partition));
            Ok(())
        }
    }

    fn at(partition: i32, offset: i64) -> InboundMessage {
        let mut msg = message(&[]);
        msg.partition = partition;
        msg.offset = offset;
        msg
    }

    fn lane(
        control: &Arc<RecordingControl>,
        subscriber: &Arc<ScriptedSubscriber>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> (Lane<RecordingControl>, Arc<GroupSession>) {
        let session = Arc::new(GroupSession::new("svc-a-send-email", "send-email"));
        let lane = Lane {
            control: control.clone(),
            subscriber: subscriber.clone(),
            processor: Arc::new(MessageProcessor::new(
                "svc-a",
                publisher,
                Duration::from_millis(5),
            )),
            session: session.clone(),
            backoff: PublishBackoff {
                initial: Duration::from_millis(1),
                multiplier: 2,
                retries: 2,
                max: Duration::from_millis(5),
            },
        };
        (lane, session)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    fn base() -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", "localhost:1");
        config
    }

    #[test]
    fn test_config_from_subscriber_defaults() {
        let options = SubscriberOptions::new("send-email");
        let config = ConsumerGroupConfig::for_subscriber(
            "svc-a-send-email",
            &options,
            Duration::from_millis(3000),
        );

        assert_eq!(config.group_id, "svc-a-send-email");
        assert_eq!(config.topic, "send-email");
        assert_eq!(config.heartbeat_interval_ms, 3000);
        assert_eq!(config.max_poll_interval_ms, MAX_POLL_INTERVAL_MS);
        assert_eq!(config.max_in_flight, 10);
        assert_eq!(config.retries, 10);
        assert_eq!(config.backoff_multiplier, 5);
        assert_eq!(config.retry_backoff_ms, 500);
        assert_eq!(config.max_backoff_ms, 5000);
        assert_eq!(config.lanes, 3);
    }

    #[test]
    fn test_heartbeat_clamped_below_session_timeout() {
        let options = SubscriberOptions::new("send-email");
        let config =
            ConsumerGroupConfig::for_subscriber("g", &options, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval_ms, SESSION_TIMEOUT_MS / 3);
    }

    #[test]
    fn test_client_config_disables_auto_offset_store() {
        let options = SubscriberOptions::new("send-email").with_max_in_progress(4);
        let config = ConsumerGroupConfig::for_subscriber("g", &options, Duration::from_secs(3))
            .client_config(&base());

        assert_eq!(config.get("group.id"), Some("g"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("max.in.flight.requests.per.connection"), Some("4"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("300000"));
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:1"));
    }

    #[test]
    fn test_lane_for_keeps_partitions_stable() {
        assert_eq!(lane_for(0, 3), 0);
        assert_eq!(lane_for(4, 3), 1);
        assert_eq!(lane_for(4, 3), lane_for(4, 3));
        assert_eq!(lane_for(7, 0), 0);
    }

    #[tokio::test]
    async fn test_group_creation_does_not_need_a_broker() {
        let options = SubscriberOptions::new("send-email");
        let config = ConsumerGroupConfig::for_subscriber("g", &options, Duration::from_secs(3));
        let group = ConsumerGroup::create(config, &base()).unwrap();
        assert_eq!(group.group_id(), "g");
        assert_eq!(group.session().snapshot().processed, 0);
    }

    #[test]
    fn test_publish_backoff_grows_then_caps() {
        let backoff = PublishBackoff {
            initial: Duration::from_millis(100),
            multiplier: 5,
            retries: 2,
            max: Duration::from_millis(2_000),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(2_000));
        assert_eq!(backoff.delay(50), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_full_lane_parks_and_pauses_only_its_partition() {
        let control = Arc::new(RecordingControl::default());
        let (tx0, mut rx0) = mpsc::channel(1);
        let (tx1, mut rx1) = mpsc::channel(1);
        let mut dispatcher = Dispatcher::new(control.clone(), vec![tx0, tx1], "g");

        assert_eq!(dispatcher.dispatch(at(0, 1)), Dispatch::Queued);
        assert_eq!(dispatcher.dispatch(at(0, 2)), Dispatch::Parked);
        assert_eq!(dispatcher.dispatch(at(0, 3)), Dispatch::Parked);
        // the other lane keeps flowing while lane 0 is full
        assert_eq!(dispatcher.dispatch(at(1, 1)), Dispatch::Queued);
        assert_eq!(rx1.recv().await.unwrap().offset, 1);

        assert_eq!(
            *control.paused.lock().unwrap(),
            vec![("send-email".to_string(), 0)]
        );
        assert!(dispatcher.has_backlog());

        assert_eq!(rx0.recv().await.unwrap().offset, 1);
        assert!(dispatcher.drain());
        assert!(control.resumed.lock().unwrap().is_empty());

        assert_eq!(rx0.recv().await.unwrap().offset, 2);
        assert!(dispatcher.drain());
        assert_eq!(rx0.recv().await.unwrap().offset, 3);

        assert!(!dispatcher.has_backlog());
        assert_eq!(
            *control.resumed.lock().unwrap(),
            vec![("send-email".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_backlog_keeps_partition_order() {
        let control = Arc::new(RecordingControl::default());
        let (tx, mut rx) = mpsc::channel(1);
        let mut dispatcher = Dispatcher::new(control, vec![tx], "g");

        dispatcher.dispatch(at(0, 1));
        dispatcher.dispatch(at(0, 2));
        assert_eq!(rx.recv().await.unwrap().offset, 1);

        // lane has room again, but offset 2 is still parked ahead of 3
        assert_eq!(dispatcher.dispatch(at(0, 3)), Dispatch::Parked);
        assert!(dispatcher.drain());
        assert_eq!(rx.recv().await.unwrap().offset, 2);
        assert!(dispatcher.drain());
        assert_eq!(rx.recv().await.unwrap().offset, 3);
    }

    #[tokio::test]
    async fn test_dispatch_reports_closed_lane() {
        let control = Arc::new(RecordingControl::default());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut dispatcher = Dispatcher::new(control, vec![tx], "g");

        assert_eq!(dispatcher.dispatch(at(0, 1)), Dispatch::Closed);
    }

    #[tokio::test]
    async fn test_lane_stores_next_offset_after_processing() {
        let control = Arc::new(RecordingControl::default());
        let subscriber = Arc::new(ScriptedSubscriber::new(
            SubscriberOptions::new("send-email"),
            false,
        ));
        let (lane, session) = lane(&control, &subscriber, Arc::new(RecordingPublisher::default()));

        let (tx, rx) = mpsc::channel(4);
        tx.send(at(0, 7)).await.unwrap();
        tx.send(at(0, 8)).await.unwrap();
        drop(tx);
        let (_stop, stop_rx) = watch::channel(false);

        lane.run(rx, stop_rx).await;

        assert_eq!(control.stored_offsets(), vec![8, 9]);
        assert_eq!(session.snapshot().processed, 2);
    }

    #[tokio::test]
    async fn test_lane_retries_outcome_publish_before_storing_offset() {
        let control = Arc::new(RecordingControl::default());
        let subscriber = Arc::new(ScriptedSubscriber::new(
            SubscriberOptions::new("send-email"),
            true,
        ));
        let publisher = Arc::new(FlakyPublisher::failing(2));
        let (lane, _) = lane(&control, &subscriber, publisher.clone());

        let (tx, rx) = mpsc::channel(4);
        tx.send(at(0, 7)).await.unwrap();
        tx.send(at(0, 8)).await.unwrap();
        drop(tx);
        let (_stop, stop_rx) = watch::channel(false);

        lane.run(rx, stop_rx).await;

        assert_eq!(control.stored_offsets(), vec![8, 9]);
        assert_eq!(publisher.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(publisher.inner.on(RETRY_MESSAGE_TOPIC).len(), 2);
        // the handler is not run again for a failed publish
        assert_eq!(subscriber.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lane_never_stores_past_an_unpublished_outcome() {
        let control = Arc::new(RecordingControl::default());
        let subscriber = Arc::new(ScriptedSubscriber::new(
            SubscriberOptions::new("send-email"),
            true,
        ));
        let publisher = Arc::new(FlakyPublisher::failing(usize::MAX));
        let (lane, _) = lane(&control, &subscriber, publisher.clone());

        let (tx, rx) = mpsc::channel(4);
        tx.send(at(0, 7)).await.unwrap();
        tx.send(at(0, 8)).await.unwrap();
        let (stop, stop_rx) = watch::channel(false);
        let running = tokio::spawn(lane.run(rx, stop_rx));

        let attempts = publisher.clone();
        wait_until(move || attempts.attempts.load(Ordering::SeqCst) >= 3).await;
        stop.send(true).unwrap();
        running.await.unwrap();

        assert!(control.stored_offsets().is_empty());
        assert_eq!(subscriber.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lane_leaves_queued_messages_unstored_on_stop() {
        let control = Arc::new(RecordingControl::default());
        let mut scripted = ScriptedSubscriber::new(SubscriberOptions::new("send-email"), false);
        scripted.delay = Duration::from_millis(50);
        let subscriber = Arc::new(scripted);
        let (lane, _) = lane(&control, &subscriber, Arc::new(RecordingPublisher::default()));

        let (tx, rx) = mpsc::channel(4);
        for offset in 7..10 {
            tx.send(at(0, offset)).await.unwrap();
        }
        let (stop, stop_rx) = watch::channel(false);
        let running = tokio::spawn(lane.run(rx, stop_rx));

        let calls = subscriber.clone();
        wait_until(move || calls.calls.load(Ordering::SeqCst) == 1).await;
        stop.send(true).unwrap();
        running.await.unwrap();

        // the in-flight message finishes, the rest wait for redelivery
        assert_eq!(control.stored_offsets(), vec![8]);
        assert_eq!(subscriber.calls.load(Ordering::SeqCst), 1);
    }
}
