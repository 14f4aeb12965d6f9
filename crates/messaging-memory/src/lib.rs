//! In-memory implementation of the messaging broker traits.
//!
//! Supports core publish/subscribe, request/reply, durable streams with
//! de-duplication, and durable consumers with a shared cursor. Useful for tests
//! and local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod consumer;
mod jetstream;

pub use consumer::{MemoryConsumer, MemoryDelivery};
pub use jetstream::MemoryJetStream;

use jetstream::StoredStream;

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use relay_messaging::broker::{Broker, BrokerError, RawMessage};
use relay_messaging::subject;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Options for the in-memory broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryBrokerOptions {
    /// Delay before a durable publish is acknowledged.
    pub ack_delay: Duration,

    /// Refuse every durable publish, as a full stream would.
    pub reject_publishes: bool,
}

impl MemoryBrokerOptions {
    /// Delays every durable acknowledgment by `ack_delay`.
    #[must_use]
    pub const fn with_ack_delay(mut self, ack_delay: Duration) -> Self {
        self.ack_delay = ack_delay;
        self
    }

    /// Refuses every durable publish.
    #[must_use]
    pub const fn with_reject_publishes(mut self, reject_publishes: bool) -> Self {
        self.reject_publishes = reject_publishes;
        self
    }
}

struct Subscriber {
    filter: String,
    sender: mpsc::UnboundedSender<RawMessage>,
}

pub(crate) struct Shared {
    pub(crate) ack_delay: Duration,
    pub(crate) closed: CancellationToken,
    pub(crate) reject_publishes: bool,
    pub(crate) streams: Mutex<BTreeMap<String, StoredStream>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Shared {
    pub(crate) fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        Ok(())
    }

    fn add_subscriber(&self, filter: String) -> mpsc::UnboundedReceiver<RawMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { filter, sender });
        receiver
    }

    /// Delivers `message` to every matching subscriber. Returns how many received it.
    pub(crate) fn deliver(&self, message: &RawMessage) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.sender.is_closed());

        subscribers
            .iter()
            .filter(|subscriber| subject::matches(&subscriber.filter, &message.subject))
            .filter(|subscriber| subscriber.sender.send(message.clone()).is_ok())
            .count()
    }
}

/// An in-process broker. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryBroker")
            .field("ack_delay", &self.shared.ack_delay)
            .field("closed", &self.shared.closed.is_cancelled())
            .field("reject_publishes", &self.shared.reject_publishes)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerOptions::default())
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new(
        MemoryBrokerOptions {
            ack_delay,
            reject_publishes,
        }: MemoryBrokerOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                ack_delay,
                closed: CancellationToken::new(),
                reject_publishes,
                streams: Mutex::new(BTreeMap::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether the broker has been drained.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Sequences acknowledged through `consumer` on `stream`, in acknowledgment order.
    #[must_use]
    pub fn acknowledged(&self, stream: &str, consumer: &str) -> Vec<u64> {
        self.shared
            .streams
            .lock()
            .get(stream)
            .and_then(|stored| stored.consumers.get(consumer))
            .map(|state| state.acked.clone())
            .unwrap_or_default()
    }

    /// Messages stored in `stream`, in sequence order.
    #[must_use]
    pub fn stored(&self, stream: &str) -> Vec<RawMessage> {
        self.shared
            .streams
            .lock()
            .get(stream)
            .map(|stored| {
                stored
                    .messages
                    .iter()
                    .map(|stored| stored.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type JetStream = MemoryJetStream;

    async fn publish(&self, message: RawMessage) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;

        let delivered = self.shared.deliver(&message);
        debug!(subject = %message.subject, delivered, "published message");

        // Streams capture core publishes on their subjects too.
        if let Ok(ack) = self.shared.store(message) {
            debug!(stream = %ack.stream, sequence = ack.sequence, "stored core publish");
        }

        Ok(())
    }

    async fn request(
        &self,
        mut message: RawMessage,
        timeout: Duration,
    ) -> Result<RawMessage, BrokerError> {
        self.shared.ensure_open()?;

        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut responses = self.shared.add_subscriber(inbox.clone());
        message.reply = Some(inbox);

        if self.shared.deliver(&message) == 0 {
            return Err(BrokerError::NoResponders);
        }

        tokio::time::timeout(timeout, responses.recv())
            .await
            .map_err(|_| BrokerError::Timeout)?
            .ok_or(BrokerError::Closed)
    }

    async fn subscribe(
        &self,
        subject: String,
    ) -> Result<BoxStream<'static, RawMessage>, BrokerError> {
        self.shared.ensure_open()?;

        let receiver = self.shared.add_subscriber(subject);

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.shared.closed.cancel();
        self.shared.subscribers.lock().clear();

        debug!("memory broker drained");

        Ok(())
    }

    async fn jetstream(&self) -> Result<MemoryJetStream, BrokerError> {
        self.shared.ensure_open()?;

        Ok(MemoryJetStream::new(Arc::clone(&self.shared)))
    }
}
