//! Broker client abstraction for production and testing.
//!
//! Provides trait-based publish and consume primitives over NATS JetStream,
//! so the job subsystem can swap between a real connection and test doubles.
//! This layer knows nothing about job semantics; it moves named-subject
//! messages with per-message dedup keys and explicit acks.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_nats::jetstream::{self, consumer::pull, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};

/// Name of the JetStream stream carrying all job messages.
pub const JOBS_STREAM: &str = "JOBS";

/// Window within which JetStream deduplicates messages by `Nats-Msg-Id`.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// How long the broker waits for an ack before redelivering.
const ACK_WAIT: Duration = Duration::from_secs(30 * 60);

/// Subject a queue's messages are published on.
pub fn queue_subject(queue: &str) -> String {
    format!("jobs.{queue}")
}

/// Create the jobs stream if it does not exist yet.
pub async fn ensure_jobs_stream(context: &jetstream::Context) -> Result<()> {
    context
        .get_or_create_stream(jetstream::stream::Config {
            name: JOBS_STREAM.to_string(),
            subjects: vec!["jobs.>".to_string()],
            duplicate_window: DUPLICATE_WINDOW,
            ..Default::default()
        })
        .await
        .map_err(|e| anyhow!("failed to ensure jobs stream: {e}"))?;
    Ok(())
}

// ============================================================================
// Publishing
// ============================================================================

/// Trait for broker publish operations.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish a message to a subject, keyed by `msg_id` for broker-side
    /// deduplication.
    async fn publish(&self, subject: &str, msg_id: &str, payload: Bytes) -> Result<()>;
}

/// Real JetStream publisher.
pub struct JetStreamPublisher {
    context: jetstream::Context,
}

impl JetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl BrokerPublisher for JetStreamPublisher {
    async fn publish(&self, subject: &str, msg_id: &str, payload: Bytes) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", msg_id);

        self.context
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| anyhow!("publish to {subject} failed: {e}"))?
            .await
            .map_err(|e| anyhow!("publish to {subject} not acked: {e}"))?;

        Ok(())
    }
}

// ============================================================================
// Consuming
// ============================================================================

/// A message delivered from a queue, with explicit acknowledgement.
pub struct Delivery {
    pub payload: Bytes,
    /// Broker-side delivery count for this message (1 on first delivery).
    pub delivered: i64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Bytes, delivered: i64, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            delivered,
            acker,
        }
    }

    /// Acknowledge successful processing; the broker will not redeliver.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negative-acknowledge; the broker redelivers after `delay`.
    pub async fn nak(self, delay: Option<Duration>) -> Result<()> {
        self.acker.nak(delay).await
    }

    /// Terminate delivery; the broker will never redeliver this message.
    pub async fn term(self) -> Result<()> {
        self.acker.term().await
    }
}

/// Acknowledgement backend for a single delivery.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nak(self: Box<Self>, delay: Option<Duration>) -> Result<()>;
    async fn term(self: Box<Self>) -> Result<()>;
}

/// Source of deliveries for one queue.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Next delivery, or `None` when the consumer is closed.
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.message.ack().await.map_err(|e| anyhow!("ack failed: {e}"))
    }

    async fn nak(self: Box<Self>, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| anyhow!("nak failed: {e}"))
    }

    async fn term(self: Box<Self>) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| anyhow!("term failed: {e}"))
    }
}

type MessageStream =
    Pin<Box<dyn Stream<Item = Result<jetstream::Message, pull::MessagesError>> + Send>>;

/// Durable pull consumer over one queue's subject.
pub struct JetStreamQueueConsumer {
    messages: MessageStream,
}

impl JetStreamQueueConsumer {
    /// Create (or attach to) the durable consumer for a queue.
    ///
    /// `max_deliver` should come from the queue's retry policy so the broker
    /// stops redelivering once attempts are exhausted.
    pub async fn subscribe(
        context: &jetstream::Context,
        queue: &str,
        max_deliver: i64,
    ) -> Result<Self> {
        let stream = context
            .get_stream(JOBS_STREAM)
            .await
            .map_err(|e| anyhow!("jobs stream missing: {e}"))?;

        let durable = format!("worker-{queue}");
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: queue_subject(queue),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow!("failed to create consumer {durable}: {e}"))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| anyhow!("failed to open message stream for {durable}: {e}"))?;

        Ok(Self {
            messages: Box::pin(messages),
        })
    }
}

#[async_trait]
impl QueueConsumer for JetStreamQueueConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.messages.next().await {
            Some(Ok(message)) => {
                let delivered = message
                    .info()
                    .map(|info| info.delivered)
                    .unwrap_or(1);
                let payload = message.payload.clone();
                Ok(Some(Delivery::new(
                    payload,
                    delivered,
                    Box::new(JetStreamAcker { message }),
                )))
            }
            Some(Err(e)) => Err(anyhow!("message stream error: {e}")),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Test double
// ============================================================================

/// A message recorded by [`TestBroker`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub msg_id: String,
    pub payload: Bytes,
}

/// Mock broker that records published messages for assertions.
///
/// Can be switched into a failing mode to simulate a broker outage at
/// publish time.
#[derive(Default)]
pub struct TestBroker {
    published: RwLock<Vec<PublishedMessage>>,
    failing: RwLock<bool>,
}

impl TestBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn messages_for_subject(&self, subject: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    pub fn was_published_to(&self, subject: &str) -> bool {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|m| m.subject == subject)
    }

    pub fn publish_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn clear(&self) {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Deserialize a recorded message payload as JSON.
    pub fn deserialize_message<T: serde::de::DeserializeOwned>(
        &self,
        message: &PublishedMessage,
    ) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&message.payload)
    }
}

#[async_trait]
impl BrokerPublisher for TestBroker {
    async fn publish(&self, subject: &str, msg_id: &str, payload: Bytes) -> Result<()> {
        if *self.failing.read().unwrap_or_else(|e| e.into_inner()) {
            bail!("broker unavailable");
        }

        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                subject: subject.to_string(),
                msg_id: msg_id.to_string(),
                payload,
            });
        Ok(())
    }
}

/// In-memory consumer fed from a fixed list of deliveries.
///
/// Yields each delivery once, then reports the consumer as closed. Useful
/// for driving a worker loop in tests without a broker.
pub struct TestConsumer {
    deliveries: VecDeque<Delivery>,
}

impl TestConsumer {
    pub fn new(deliveries: Vec<Delivery>) -> Self {
        Self {
            deliveries: deliveries.into(),
        }
    }
}

#[async_trait]
impl QueueConsumer for TestConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        Ok(self.deliveries.pop_front())
    }
}
