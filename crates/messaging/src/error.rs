use crate::broker::BrokerError;
use crate::router::HandlerError;

use thiserror::Error;

/// Result alias for messaging operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while using the messaging client.
#[derive(Debug, Error)]
pub enum Error {
    /// Acknowledgment from the broker did not arrive before the context was done.
    /// The message may or may not have been stored.
    #[error("waiting for ack exceeded timeout")]
    AckTimeout,

    /// Acknowledging a delivered message failed.
    #[error("failed to double ack message: {0}")]
    Ack(BrokerError),

    /// The broker rejected a request to open a message stream for a consumer.
    #[error("failed to start consuming messages from stream: {0}")]
    Consume(BrokerError),

    /// Creating or updating a durable consumer failed.
    #[error("failed to create jetstream consumer: {0}")]
    CreateConsumer(BrokerError),

    /// Creating or updating a durable stream failed.
    #[error("failed to create stream: {0}")]
    CreateStream(BrokerError),

    /// An inbound envelope could not be decoded.
    #[error("failed to unmarshal envelope: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Pulling the next delivery from a consumer failed.
    #[error("failed to receive message from consumer: {0}")]
    Delivery(BrokerError),

    /// The client is closing and no longer accepts new registrations.
    #[error("client is draining")]
    Draining,

    /// An outbound envelope could not be encoded.
    #[error("failed to marshal envelope: {0}")]
    Encode(#[from] prost::EncodeError),

    /// A registered handler returned an error.
    #[error("handler for subject {subject} returned an error: {source}")]
    Handler {
        /// The subject the message was delivered on.
        subject: String,
        /// The error returned by the handler.
        source: HandlerError,
    },

    /// A subject was rejected before reaching the broker.
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),

    /// Constructing the durable messaging context failed.
    #[error("failed to connect to jetstream: {0}")]
    JetStream(BrokerError),

    /// Durable messaging was used before it was enabled on the client.
    #[error("jetstream is not enabled for this client, use jetstream() to turn it on")]
    JetStreamNotEnabled,

    /// A message that expects a response arrived without a reply subject.
    #[error("message does not have a reply subject")]
    NoReply,

    /// Listing existing streams failed.
    #[error("failed to list existing streams: {0}")]
    ListStreams(BrokerError),

    /// The broker rejected a publish or failed to deliver it.
    #[error("failed to publish: {0}")]
    Publish(BrokerError),

    /// A request failed for a reason other than timing out.
    #[error("failed to request: {0}")]
    Request(BrokerError),

    /// A request did not receive a response in time.
    #[error("request timed out")]
    RequestTimeout,

    /// Subscribing to a subject failed.
    #[error("failed to subscribe to subject {subject}: {source}")]
    Subscribe {
        /// The subject that could not be subscribed to.
        subject: String,
        /// The broker error.
        source: BrokerError,
    },
}

impl Error {
    /// Whether the error means an acknowledgment was not received in time.
    #[must_use]
    pub const fn is_ack_timeout(&self) -> bool {
        matches!(self, Self::AckTimeout)
    }

    /// Whether the error is any kind of timeout, local or broker-reported.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::AckTimeout | Self::RequestTimeout => true,
            Self::Publish(e) | Self::Request(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Whether the broker explicitly refused the operation.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::Publish(e)
            | Self::CreateStream(e)
            | Self::CreateConsumer(e)
            | Self::Request(e) => e.is_rejection(),
            _ => false,
        }
    }
}
