//! Messaging client over a publish/subscribe broker with durable streams.
//!
//! The client owns a single broker connection and layers on top of it: envelope
//! encoding, subject routing, publishing with acknowledgments, stream and consumer
//! declaration, and per-consumer consume loops. Brokers plug in through the traits in
//! [`broker`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Traits implemented by broker backends.
pub mod broker;

/// The messaging client: connection lifecycle and durable messaging state.
pub mod client;

/// Consume loops for durable consumers.
pub mod consume;

/// Per-call cancellation, deadline and carried values.
pub mod context;

/// Wire envelope wrapping every message.
pub mod envelope;

mod error;

/// Publishing, requests and reply subscriptions.
pub mod publish;

/// Subject to handler routing.
pub mod router;

/// Stream and consumer declarations.
pub mod stream;

/// Subject validation and wildcard matching.
pub mod subject;

/// Tracing collaborator.
pub mod tracer;

pub use broker::{Broker, BrokerError, Headers, PublishAck, RawMessage, StreamInfo};
pub use client::{Client, ClientOptions};
pub use consume::{ConsumeHandle, ConsumeState};
pub use context::Context;
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use publish::Subscription;
pub use router::{HandlerError, Message, Router, StreamHandler};
pub use stream::{AckPolicy, Compression, ConsumerConfig, RetentionPolicy, StreamConfig};
pub use tracer::{NoopTracer, Tracer, TracingTracer};
