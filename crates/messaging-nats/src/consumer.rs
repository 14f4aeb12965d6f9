use crate::from_header_map;

use std::fmt::{Debug, Formatter, Result as FmtResult};

use async_nats::jetstream::consumer::Consumer;
use async_nats::jetstream::consumer::pull::Config as NatsConsumerConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use relay_messaging::broker::{BrokerError, Delivery, DurableConsumer, Headers};

/// A durable pull consumer on a NATS stream.
#[derive(Clone)]
pub struct NatsConsumer {
    consumer: Consumer<NatsConsumerConfig>,
    name: String,
    stream: String,
}

impl Debug for NatsConsumer {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("NatsConsumer")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl NatsConsumer {
    pub(crate) const fn new(
        consumer: Consumer<NatsConsumerConfig>,
        name: String,
        stream: String,
    ) -> Self {
        Self {
            consumer,
            name,
            stream,
        }
    }
}

#[async_trait]
impl DurableConsumer for NatsConsumer {
    type Delivery = NatsDelivery;

    fn name(&self) -> &str {
        &self.name
    }

    fn stream_name(&self) -> &str {
        &self.stream
    }

    async fn messages(
        &self,
    ) -> Result<BoxStream<'static, Result<NatsDelivery, BrokerError>>, BrokerError> {
        let messages = self
            .consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        Ok(messages
            .map(|message| {
                message
                    .map(NatsDelivery::new)
                    .map_err(|e| BrokerError::Transport(e.to_string()))
            })
            .boxed())
    }
}

/// A message delivered to a `NatsConsumer`.
pub struct NatsDelivery {
    headers: Headers,
    message: async_nats::jetstream::Message,
}

impl Debug for NatsDelivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("NatsDelivery")
            .field("subject", &self.message.subject)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl NatsDelivery {
    fn new(message: async_nats::jetstream::Message) -> Self {
        Self {
            headers: from_header_map(message.headers.as_ref()),
            message,
        }
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    async fn double_ack(&self) -> Result<(), BrokerError> {
        self.message
            .double_ack()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}
