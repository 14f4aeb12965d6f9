//! NATS implementation of the messaging broker traits.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod consumer;
mod error;
mod jetstream;

pub use config::{NatsConfig, NodeConfig};
pub use consumer::{NatsConsumer, NatsDelivery};
pub use error::Error;
pub use jetstream::NatsJetStream;

use std::time::Duration;

use async_nats::client::RequestErrorKind;
use async_nats::{Client as NatsClient, ConnectOptions, HeaderMap, Request};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use relay_messaging::broker::{Broker, BrokerError, Headers, RawMessage};
use relay_messaging::{Client, ClientOptions};
use tracing::{debug, info};

pub(crate) fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

pub(crate) fn from_header_map(headers: Option<&HeaderMap>) -> Headers {
    headers
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(name, values)| {
                    values
                        .first()
                        .map(|value| (name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn from_message(message: async_nats::Message) -> RawMessage {
    RawMessage {
        headers: from_header_map(message.headers.as_ref()),
        subject: message.subject.to_string(),
        reply: message.reply.map(|reply| reply.to_string()),
        payload: message.payload,
    }
}

/// Broker backed by a NATS connection.
#[derive(Clone, Debug)]
pub struct NatsBroker {
    client: NatsClient,
}

impl NatsBroker {
    /// Connects to the nodes in `config`. Fails fast; there is no retry loop.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoNodes` for an empty node list, `Error::InvalidAddress` for
    /// malformed nodes and `Error::Connect` if the connection cannot be established.
    pub async fn connect(config: &NatsConfig) -> Result<Self, Error> {
        let addrs = config.server_addrs()?;

        let mut connect_options =
            ConnectOptions::new().connection_timeout(config.connection_timeout());
        if let Some(name) = &config.name {
            connect_options = connect_options.name(name);
        }

        let client = async_nats::connect_with_options(addrs.as_slice(), connect_options).await?;

        info!(nodes = config.nodes.len(), "connected to nats");

        Ok(Self { client })
    }

    /// Wraps an existing connection.
    #[must_use]
    pub const fn from_client(client: NatsClient) -> Self {
        Self { client }
    }

    /// The underlying connection.
    #[must_use]
    pub const fn client(&self) -> &NatsClient {
        &self.client
    }
}

/// Connects to NATS and wraps the connection in a messaging client.
///
/// # Errors
///
/// See `NatsBroker::connect`; also fails if durable messaging is requested and cannot be
/// enabled.
pub async fn connect(config: &NatsConfig, options: ClientOptions) -> Result<Client<NatsBroker>, Error> {
    let broker = NatsBroker::connect(config).await?;

    Ok(Client::new(broker, options).await?)
}

#[async_trait]
impl Broker for NatsBroker {
    type JetStream = NatsJetStream;

    async fn publish(&self, message: RawMessage) -> Result<(), BrokerError> {
        let headers = to_header_map(&message.headers);

        let result = match message.reply {
            Some(reply) => {
                self.client
                    .publish_with_reply_and_headers(message.subject, reply, headers, message.payload)
                    .await
            }
            None => {
                self.client
                    .publish_with_headers(message.subject, headers, message.payload)
                    .await
            }
        };

        result.map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn request(
        &self,
        message: RawMessage,
        timeout: Duration,
    ) -> Result<RawMessage, BrokerError> {
        let request = Request::new()
            .payload(message.payload)
            .headers(to_header_map(&message.headers))
            .timeout(Some(timeout));

        let response = self
            .client
            .send_request(message.subject, request)
            .await
            .map_err(|e| match e.kind() {
                RequestErrorKind::TimedOut => BrokerError::Timeout,
                RequestErrorKind::NoResponders => BrokerError::NoResponders,
                _ => BrokerError::Transport(e.to_string()),
            })?;

        Ok(from_message(response))
    }

    async fn subscribe(
        &self,
        subject: String,
    ) -> Result<BoxStream<'static, RawMessage>, BrokerError> {
        let subscriber = self
            .client
            .subscribe(subject)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        Ok(subscriber.map(from_message).boxed())
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        debug!("nats connection drained");

        Ok(())
    }

    async fn jetstream(&self) -> Result<NatsJetStream, BrokerError> {
        Ok(NatsJetStream::new(async_nats::jetstream::new(
            self.client.clone(),
        )))
    }
}
