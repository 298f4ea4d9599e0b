//! Per-message consume algorithm shared by every provider.
//!
//! For each consumed message:
//! 1. extract metadata from the headers
//! 2. skip replays addressed to another service
//! 3. run the handler under a heartbeat timer, catching any failure
//! 4. fire a final heartbeat, stop the timer
//! 5. report a replay's outcome, or enqueue a failed retryable message

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, instrument};

use super::codec::{self, Headers};
use super::heartbeat::{HeartbeatAction, HeartbeatTimer};
use super::provider::{MessagePublisher, PublishOptions};
use super::retry::{RetryEnvelope, RetryStatus, RETRY_MESSAGE_STATUS_TOPIC, RETRY_MESSAGE_TOPIC};
use super::subscriber::EventSubscriber;
use crate::error::Result;
use crate::types::{Context, EventMetadata};

/// A consumed message, detached from the broker client.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
    pub headers: Headers,
}

/// What happened to one consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Replay addressed to another service; the handler was not invoked
    SkippedForeign,
    /// First delivery handled successfully
    Handled,
    /// First delivery failed and the subscriber is not retryable
    Dropped,
    /// First delivery failed and was enqueued on the retry topic
    RetryEnqueued,
    /// Replay handled; its outcome was reported on the status topic
    RetryReported { is_success: bool },
}

/// Follow-up publication owed by a processed message.
#[derive(Debug, Clone)]
pub enum Report {
    /// Outcome of a replay, for the retry service
    Status { status: RetryStatus, context: Context },
    /// Failed first delivery, handed to the retry service
    Retry { envelope: RetryEnvelope, context: Context },
}

impl Report {
    pub fn topic(&self) -> &'static str {
        match self {
            Report::Status { .. } => RETRY_MESSAGE_STATUS_TOPIC,
            Report::Retry { .. } => RETRY_MESSAGE_TOPIC,
        }
    }
}

/// Outcome of running the handler, plus whatever still has to be published.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcome: ProcessOutcome,
    pub report: Option<Report>,
}

impl Evaluation {
    fn settled(outcome: ProcessOutcome) -> Self {
        Self {
            outcome,
            report: None,
        }
    }
}

/// Runs the consume algorithm on behalf of one service.
pub struct MessageProcessor {
    service: String,
    publisher: Arc<dyn MessagePublisher>,
    heartbeat_interval: Duration,
}

impl MessageProcessor {
    pub fn new(
        service: impl Into<String>,
        publisher: Arc<dyn MessagePublisher>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            publisher,
            heartbeat_interval,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Process one message and publish its follow-up, if any.
    ///
    /// Handler failures never surface here. An `Err` means publishing the
    /// retry envelope or the replay status failed.
    pub async fn process(
        &self,
        subscriber: &dyn EventSubscriber,
        message: &InboundMessage,
        heartbeat: HeartbeatAction,
    ) -> Result<ProcessOutcome> {
        let evaluation = self.evaluate(subscriber, message, heartbeat).await;
        if let Some(report) = &evaluation.report {
            self.publish_report(report).await?;
        }
        Ok(evaluation.outcome)
    }

    /// Run the handler and decide the outcome without publishing anything.
    ///
    /// Callers that must not run a handler twice retry [`publish_report`]
    /// on its own.
    ///
    /// [`publish_report`]: MessageProcessor::publish_report
    #[instrument(
        skip(self, subscriber, message, heartbeat),
        fields(topic = %message.topic, partition = message.partition, offset = message.offset)
    )]
    pub async fn evaluate(
        &self,
        subscriber: &dyn EventSubscriber,
        message: &InboundMessage,
        heartbeat: HeartbeatAction,
    ) -> Evaluation {
        let metadata = codec::metadata_from_headers(&message.headers);

        if metadata.is_foreign(&self.service) {
            info!(
                destination = ?metadata.retry_destination,
                retry_id = ?metadata.retry_id,
                "Message is a retry for another service, ignoring"
            );
            return Evaluation::settled(ProcessOutcome::SkippedForeign);
        }

        let is_retry = metadata.is_retry();
        if is_retry {
            info!(
                retry_id = ?metadata.retry_id,
                attempt = metadata.retry_attempt,
                "Retrying {} message",
                subscriber.topic()
            );
        }

        let context = codec::context_from_headers(&message.headers);
        let payload = codec::decode_payload(message.payload.as_deref());

        let is_success = self
            .run_handler(subscriber, payload.clone(), &context, &metadata, heartbeat)
            .await;

        if is_retry {
            let status = RetryStatus {
                is_success,
                id: metadata.retry_id.clone(),
            };
            return Evaluation {
                outcome: ProcessOutcome::RetryReported { is_success },
                report: Some(Report::Status { status, context }),
            };
        }

        if is_success {
            return Evaluation::settled(ProcessOutcome::Handled);
        }

        if !subscriber.options().is_retryable() {
            return Evaluation::settled(ProcessOutcome::Dropped);
        }

        let envelope = RetryEnvelope::new(
            payload,
            &message.headers,
            &self.service,
            subscriber.retry_config(),
        );
        Evaluation {
            outcome: ProcessOutcome::RetryEnqueued,
            report: Some(Report::Retry { envelope, context }),
        }
    }

    /// Publish the follow-up of an evaluated message. Safe to call again
    /// after a failure.
    pub async fn publish_report(&self, report: &Report) -> Result<()> {
        match report {
            Report::Status { status, context } => {
                self.publisher
                    .publish(
                        RETRY_MESSAGE_STATUS_TOPIC,
                        &serde_json::to_value(status)?,
                        &PublishOptions::default().with_context(context.clone()),
                    )
                    .await
            }
            Report::Retry { envelope, context } => {
                self.publisher
                    .publish(
                        RETRY_MESSAGE_TOPIC,
                        &serde_json::to_value(envelope)?,
                        &PublishOptions::default().with_context(context.clone()),
                    )
                    .await?;
                info!(retry_topic = RETRY_MESSAGE_TOPIC, "Failed message enqueued for retry");
                Ok(())
            }
        }
    }

    /// Invoke the handler with the heartbeat running. Returns whether it succeeded.
    async fn run_handler(
        &self,
        subscriber: &dyn EventSubscriber,
        payload: Value,
        context: &Context,
        metadata: &EventMetadata,
        heartbeat: HeartbeatAction,
    ) -> bool {
        let timer = HeartbeatTimer::new(heartbeat, self.heartbeat_interval);
        timer.start();

        let result = subscriber.handle(payload, context, Some(metadata)).await;

        timer.force_execution().await;
        timer.stop();

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(
                    subscriber = subscriber.name(),
                    request_id = %context.request_id,
                    user_id = %context.user_id,
                    context = ?context.extra,
                    error = ?e,
                    "Fail executing {}",
                    subscriber.topic()
                );
                false
            }
        }
    }
}
