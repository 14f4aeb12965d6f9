use crate::stream::{ConsumerConfig, StreamConfig};

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

/// Message headers.
pub type Headers = HashMap<String, String>;

/// Future resolving to the broker's acknowledgment of a durable publish.
pub type AckFuture = BoxFuture<'static, Result<PublishAck, BrokerError>>;

/// Backend-neutral errors reported by a broker implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection is closed or draining.
    #[error("connection closed")]
    Closed,

    /// Nobody is listening on the requested subject.
    #[error("no responders")]
    NoResponders,

    /// The broker refused the operation.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// No stream captures the subject, or the named stream does not exist.
    #[error("stream not found")]
    StreamNotFound,

    /// The broker did not answer in time.
    #[error("timed out")]
    Timeout,

    /// Any other transport failure.
    #[error("{0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether the broker reported a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether the broker explicitly refused the operation.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::StreamNotFound | Self::NoResponders
        )
    }
}

/// A raw message as carried by the broker, before or after envelope encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Subject the message is addressed to.
    pub subject: String,
    /// Optional reply subject.
    pub reply: Option<String>,
    /// Message headers.
    pub headers: Headers,
    /// Encoded body.
    pub payload: Bytes,
}

impl RawMessage {
    /// Creates a message with no reply subject and no headers.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }
}

/// Acknowledgment returned by the broker once a durable publish is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishAck {
    /// Name of the stream that stored the message.
    pub stream: String,
    /// Sequence assigned to the message within the stream.
    pub sequence: u64,
    /// Whether the broker recognized the message as a duplicate.
    pub duplicate: bool,
}

/// Summary of a stream as reported by the broker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
    /// Subject filters captured by the stream.
    pub subjects: Vec<String>,
    /// Number of messages currently stored.
    pub messages: u64,
    /// Sequence of the last stored message.
    pub last_sequence: u64,
}

/// A connection to a publish/subscribe broker.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The durable messaging context constructed over this connection.
    type JetStream: JetStream;

    /// Publishes a non-durable message.
    async fn publish(&self, message: RawMessage) -> Result<(), BrokerError>;

    /// Sends a request and waits up to `timeout` for a single reply.
    async fn request(
        &self,
        message: RawMessage,
        timeout: Duration,
    ) -> Result<RawMessage, BrokerError>;

    /// Subscribes to a subject.
    async fn subscribe(
        &self,
        subject: String,
    ) -> Result<BoxStream<'static, RawMessage>, BrokerError>;

    /// Flushes in-flight publishes and stops accepting new work.
    async fn drain(&self) -> Result<(), BrokerError>;

    /// Constructs the durable messaging context.
    async fn jetstream(&self) -> Result<Self::JetStream, BrokerError>;
}

/// Durable messaging operations.
#[async_trait]
pub trait JetStream
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// Durable consumer handle type.
    type Consumer: DurableConsumer;

    /// Publishes and waits for the broker to acknowledge durable receipt.
    async fn publish(&self, message: RawMessage) -> Result<PublishAck, BrokerError>;

    /// Submits a publish and returns a future for the acknowledgment.
    async fn publish_async(&self, message: RawMessage) -> Result<AckFuture, BrokerError>;

    /// Lists all streams known to the broker.
    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BrokerError>;

    /// Creates a stream or updates the existing one with the same name.
    async fn create_or_update_stream(&self, config: StreamConfig)
    -> Result<StreamInfo, BrokerError>;

    /// Creates a durable consumer or updates the existing one with the same name.
    async fn create_or_update_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<Self::Consumer, BrokerError>;
}

/// A named, resumable read cursor over a stream.
#[async_trait]
pub trait DurableConsumer
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// Delivered message type.
    type Delivery: Delivery;

    /// Durable name of the consumer.
    fn name(&self) -> &str;

    /// Name of the stream the consumer reads from.
    fn stream_name(&self) -> &str;

    /// Opens the stream of deliveries.
    async fn messages(
        &self,
    ) -> Result<BoxStream<'static, Result<Self::Delivery, BrokerError>>, BrokerError>;
}

/// A message delivered to a durable consumer.
#[async_trait]
pub trait Delivery
where
    Self: Send + Sync + 'static,
{
    /// Subject the message was published on.
    fn subject(&self) -> &str;

    /// Message headers.
    fn headers(&self) -> &Headers;

    /// Encoded body.
    fn payload(&self) -> &Bytes;

    /// Acknowledges the message and waits for the broker to confirm the ack.
    async fn double_ack(&self) -> Result<(), BrokerError>;
}
