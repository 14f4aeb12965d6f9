use crate::consumer::NatsConsumer;
use crate::to_header_map;

use std::error::Error as StdError;

use async_nats::jetstream::Context;
use async_nats::jetstream::consumer::AckPolicy as NatsAckPolicy;
use async_nats::jetstream::consumer::pull::Config as NatsConsumerConfig;
use async_nats::jetstream::context::{PublishError, PublishErrorKind};
use async_nats::jetstream::stream::{
    Compression as NatsCompression, Config as NatsStreamConfig, Info as NatsStreamInfo,
    RetentionPolicy as NatsRetentionPolicy,
};
use async_trait::async_trait;
use futures::{FutureExt, TryStreamExt};
use relay_messaging::broker::{AckFuture, BrokerError, JetStream, PublishAck, RawMessage, StreamInfo};
use relay_messaging::stream::{AckPolicy, Compression, ConsumerConfig, RetentionPolicy, StreamConfig};
use tracing::debug;

/// Whether the server answered the publish with an error, e.g. a full stream.
fn server_rejected(e: &PublishError) -> bool {
    StdError::source(e).is_some_and(|source| source.is::<async_nats::jetstream::Error>())
}

fn publish_error(e: &PublishError) -> BrokerError {
    match e.kind() {
        PublishErrorKind::TimedOut => BrokerError::Timeout,
        PublishErrorKind::StreamNotFound => BrokerError::StreamNotFound,
        PublishErrorKind::WrongLastMessageId | PublishErrorKind::WrongLastSequence => {
            BrokerError::Rejected(e.to_string())
        }
        PublishErrorKind::Other if server_rejected(e) => BrokerError::Rejected(e.to_string()),
        _ => BrokerError::Transport(e.to_string()),
    }
}

fn publish_ack(ack: async_nats::jetstream::publish::PublishAck) -> PublishAck {
    PublishAck {
        stream: ack.stream,
        sequence: ack.sequence,
        duplicate: ack.duplicate,
    }
}

fn stream_info(info: NatsStreamInfo) -> StreamInfo {
    StreamInfo {
        name: info.config.name,
        subjects: info.config.subjects,
        messages: info.state.messages,
        last_sequence: info.state.last_sequence,
    }
}

const fn retention_policy(policy: RetentionPolicy) -> NatsRetentionPolicy {
    match policy {
        RetentionPolicy::Limits => NatsRetentionPolicy::Limits,
        RetentionPolicy::Interest => NatsRetentionPolicy::Interest,
        RetentionPolicy::WorkQueue => NatsRetentionPolicy::WorkQueue,
    }
}

const fn compression(compression: Compression) -> NatsCompression {
    match compression {
        Compression::None => NatsCompression::None,
        Compression::S2 => NatsCompression::S2,
    }
}

const fn ack_policy(policy: AckPolicy) -> NatsAckPolicy {
    match policy {
        AckPolicy::None => NatsAckPolicy::None,
        AckPolicy::All => NatsAckPolicy::All,
        AckPolicy::Explicit => NatsAckPolicy::Explicit,
    }
}

fn stream_config(config: StreamConfig) -> NatsStreamConfig {
    NatsStreamConfig {
        max_age: config.max_age(),
        name: config.name,
        subjects: config.subjects,
        retention: retention_policy(config.retention_policy),
        num_replicas: config.replicas,
        compression: Some(compression(config.compression)),
        ..Default::default()
    }
}

fn consumer_config(config: &ConsumerConfig) -> NatsConsumerConfig {
    NatsConsumerConfig {
        durable_name: Some(config.consumer_name.clone()),
        name: Some(config.consumer_name.clone()),
        filter_subjects: config.filters.clone(),
        ack_policy: ack_policy(config.ack_policy),
        ..Default::default()
    }
}

/// Durable messaging over a NATS connection.
#[derive(Clone, Debug)]
pub struct NatsJetStream {
    context: Context,
}

impl NatsJetStream {
    pub(crate) const fn new(context: Context) -> Self {
        Self { context }
    }

    /// The underlying `JetStream` context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }
}

#[async_trait]
impl JetStream for NatsJetStream {
    type Consumer = NatsConsumer;

    async fn publish(&self, message: RawMessage) -> Result<PublishAck, BrokerError> {
        let ack = self
            .context
            .publish_with_headers(
                message.subject,
                to_header_map(&message.headers),
                message.payload,
            )
            .await
            .map_err(|e| publish_error(&e))?
            .await
            .map_err(|e| publish_error(&e))?;

        Ok(publish_ack(ack))
    }

    async fn publish_async(&self, message: RawMessage) -> Result<AckFuture, BrokerError> {
        let ack_future = self
            .context
            .publish_with_headers(
                message.subject,
                to_header_map(&message.headers),
                message.payload,
            )
            .await
            .map_err(|e| publish_error(&e))?;

        Ok(async move {
            ack_future
                .await
                .map(publish_ack)
                .map_err(|e| publish_error(&e))
        }
        .boxed())
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BrokerError> {
        self.context
            .streams()
            .map_ok(stream_info)
            .try_collect()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn create_or_update_stream(
        &self,
        config: StreamConfig,
    ) -> Result<StreamInfo, BrokerError> {
        let name = config.name.clone();

        let info = self
            .context
            .create_or_update_stream(stream_config(config))
            .await
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;

        debug!(stream = %name, "stream created or updated");

        Ok(stream_info(info))
    }

    async fn create_or_update_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<NatsConsumer, BrokerError> {
        let consumer = self
            .context
            .create_consumer_on_stream(consumer_config(&config), config.stream.as_str())
            .await
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;

        debug!(
            consumer = %config.consumer_name,
            stream = %config.stream,
            "consumer created or updated"
        );

        Ok(NatsConsumer::new(consumer, config.consumer_name, config.stream))
    }
}
