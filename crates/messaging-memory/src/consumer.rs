use crate::Shared;

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use relay_messaging::broker::{BrokerError, Delivery, DurableConsumer, Headers, RawMessage};

/// A durable consumer on the in-memory broker.
///
/// Every handle with the same name shares one cursor, so concurrent readers split the
/// messages between them.
#[derive(Clone)]
pub struct MemoryConsumer {
    name: String,
    shared: Arc<Shared>,
    stream: String,
}

impl Debug for MemoryConsumer {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryConsumer")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl MemoryConsumer {
    pub(crate) const fn new(shared: Arc<Shared>, name: String, stream: String) -> Self {
        Self {
            name,
            shared,
            stream,
        }
    }
}

#[async_trait]
impl DurableConsumer for MemoryConsumer {
    type Delivery = MemoryDelivery;

    fn name(&self) -> &str {
        &self.name
    }

    fn stream_name(&self) -> &str {
        &self.stream
    }

    async fn messages(
        &self,
    ) -> Result<BoxStream<'static, Result<MemoryDelivery, BrokerError>>, BrokerError> {
        self.shared.ensure_open()?;

        let notify = self.shared.watch(&self.stream)?;

        let deliveries = stream::unfold(
            (self.clone(), notify, false),
            |(consumer, mut notify, failed)| async move {
                if failed {
                    return None;
                }

                loop {
                    if consumer.shared.closed.is_cancelled() {
                        return None;
                    }

                    notify.mark_unchanged();

                    match consumer.shared.next_delivery(&consumer.stream, &consumer.name) {
                        Ok(Some((sequence, message))) => {
                            let delivery = MemoryDelivery::new(&consumer, sequence, message);
                            return Some((Ok(delivery), (consumer, notify, false)));
                        }
                        Ok(None) => {}
                        Err(e) => return Some((Err(e), (consumer, notify, true))),
                    }

                    tokio::select! {
                        biased;
                        () = consumer.shared.closed.cancelled() => return None,
                        changed = notify.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        );

        Ok(deliveries.boxed())
    }
}

/// A message delivered to a `MemoryConsumer`.
pub struct MemoryDelivery {
    consumer: String,
    message: RawMessage,
    sequence: u64,
    shared: Arc<Shared>,
    stream: String,
}

impl Debug for MemoryDelivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryDelivery")
            .field("consumer", &self.consumer)
            .field("sequence", &self.sequence)
            .field("subject", &self.message.subject)
            .finish_non_exhaustive()
    }
}

impl MemoryDelivery {
    fn new(consumer: &MemoryConsumer, sequence: u64, message: RawMessage) -> Self {
        Self {
            consumer: consumer.name.clone(),
            message,
            sequence,
            shared: Arc::clone(&consumer.shared),
            stream: consumer.stream.clone(),
        }
    }

    /// Sequence of the message within its stream.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn subject(&self) -> &str {
        &self.message.subject
    }

    fn headers(&self) -> &Headers {
        &self.message.headers
    }

    fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    async fn double_ack(&self) -> Result<(), BrokerError> {
        self.shared.ack(&self.stream, &self.consumer, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::MemoryBroker;

    use std::time::Duration;

    use relay_messaging::broker::{Broker, JetStream};
    use relay_messaging::stream::{ConsumerConfig, StreamConfig};
    use tokio::time::timeout;

    async fn setup() -> (MemoryBroker, crate::MemoryJetStream) {
        let broker = MemoryBroker::default();
        let jetstream = broker.jetstream().await.unwrap();
        jetstream
            .create_or_update_stream(StreamConfig::new("ORDERS", ["orders.>"]))
            .await
            .unwrap();

        (broker, jetstream)
    }

    #[tokio::test]
    async fn test_deliveries_follow_filters() {
        let (broker, jetstream) = setup().await;
        let consumer = jetstream
            .create_or_update_consumer(
                ConsumerConfig::new("billing", "ORDERS").with_filters(["orders.created"]),
            )
            .await
            .unwrap();

        jetstream.publish(RawMessage::new("orders.deleted", "x")).await.unwrap();
        jetstream.publish(RawMessage::new("orders.created", "a")).await.unwrap();

        let mut messages = consumer.messages().await.unwrap();
        let delivery = timeout(Duration::from_secs(1), messages.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(delivery.subject(), "orders.created");
        assert_eq!(delivery.sequence(), 2);

        delivery.double_ack().await.unwrap();
        assert_eq!(broker.acknowledged("ORDERS", "billing"), [2]);
    }

    #[tokio::test]
    async fn test_waits_for_new_messages() {
        let (_broker, jetstream) = setup().await;
        let consumer = jetstream
            .create_or_update_consumer(ConsumerConfig::new("billing", "ORDERS"))
            .await
            .unwrap();

        let mut messages = consumer.messages().await.unwrap();
        assert!(timeout(Duration::from_millis(20), messages.next()).await.is_err());

        jetstream.publish(RawMessage::new("orders.created", "a")).await.unwrap();

        let delivery = timeout(Duration::from_secs(1), messages.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload(), &Bytes::from("a"));
    }

    #[tokio::test]
    async fn test_cursor_survives_redeclaration() {
        let (_broker, jetstream) = setup().await;
        let config = ConsumerConfig::new("billing", "ORDERS");
        let consumer = jetstream.create_or_update_consumer(config.clone()).await.unwrap();

        jetstream.publish(RawMessage::new("orders.created", "a")).await.unwrap();
        jetstream.publish(RawMessage::new("orders.created", "b")).await.unwrap();

        let mut messages = consumer.messages().await.unwrap();
        let first = messages.next().await.unwrap().unwrap();
        assert_eq!(first.sequence(), 1);
        drop(messages);

        let again = jetstream.create_or_update_consumer(config).await.unwrap();
        let mut messages = again.messages().await.unwrap();
        let second = messages.next().await.unwrap().unwrap();
        assert_eq!(second.sequence(), 2);
    }

    #[tokio::test]
    async fn test_stream_ends_on_drain() {
        let (broker, jetstream) = setup().await;
        let consumer = jetstream
            .create_or_update_consumer(ConsumerConfig::new("billing", "ORDERS"))
            .await
            .unwrap();
        let mut messages = consumer.messages().await.unwrap();

        broker.drain().await.unwrap();

        assert!(timeout(Duration::from_secs(1), messages.next())
            .await
            .unwrap()
            .is_none());
    }
}
