use crate::Shared;
use crate::consumer::MemoryConsumer;

use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use relay_messaging::broker::{AckFuture, BrokerError, JetStream, PublishAck, RawMessage, StreamInfo};
use relay_messaging::publish::MSG_ID_HEADER;
use relay_messaging::stream::{ConsumerConfig, StreamConfig};
use relay_messaging::subject;
use tokio::sync::watch;
use tracing::debug;

pub(crate) struct StoredMessage {
    pub(crate) sequence: u64,
    pub(crate) message: RawMessage,
}

pub(crate) struct ConsumerState {
    pub(crate) acked: Vec<u64>,
    pub(crate) config: ConsumerConfig,
    pub(crate) next_sequence: u64,
}

impl ConsumerState {
    fn wants(&self, subject: &str) -> bool {
        self.config.filters.is_empty()
            || self
                .config
                .filters
                .iter()
                .any(|filter| subject::matches(filter, subject))
    }
}

pub(crate) struct StoredStream {
    pub(crate) config: StreamConfig,
    pub(crate) consumers: HashMap<String, ConsumerState>,
    pub(crate) messages: Vec<StoredMessage>,
    pub(crate) notify: watch::Sender<u64>,
}

impl StoredStream {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            consumers: HashMap::new(),
            messages: Vec::new(),
            notify: watch::Sender::new(0),
        }
    }

    fn last_sequence(&self) -> u64 {
        self.messages.last().map_or(0, |stored| stored.sequence)
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|filter| subject::matches(filter, subject))
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            name: self.config.name.clone(),
            subjects: self.config.subjects.clone(),
            messages: self.messages.len() as u64,
            last_sequence: self.last_sequence(),
        }
    }
}

impl Shared {
    /// Appends `message` to the stream capturing its subject.
    pub(crate) fn store(&self, message: RawMessage) -> Result<PublishAck, BrokerError> {
        let mut streams = self.streams.lock();
        let stream = streams
            .values_mut()
            .find(|stream| stream.captures(&message.subject))
            .ok_or(BrokerError::StreamNotFound)?;

        let duplicate_of = message.headers.get(MSG_ID_HEADER).and_then(|id| {
            stream
                .messages
                .iter()
                .find(|stored| stored.message.headers.get(MSG_ID_HEADER) == Some(id))
                .map(|stored| stored.sequence)
        });

        if let Some(sequence) = duplicate_of {
            return Ok(PublishAck {
                stream: stream.config.name.clone(),
                sequence,
                duplicate: true,
            });
        }

        let sequence = stream.last_sequence() + 1;
        stream.messages.push(StoredMessage { sequence, message });
        stream.notify.send_replace(sequence);

        Ok(PublishAck {
            stream: stream.config.name.clone(),
            sequence,
            duplicate: false,
        })
    }

    /// Next message for `consumer` on `stream`, advancing its cursor past it.
    pub(crate) fn next_delivery(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<Option<(u64, RawMessage)>, BrokerError> {
        let mut streams = self.streams.lock();
        let StoredStream {
            consumers,
            messages,
            ..
        } = streams.get_mut(stream).ok_or(BrokerError::StreamNotFound)?;

        let state = consumers
            .get_mut(consumer)
            .ok_or_else(|| BrokerError::Rejected(format!("consumer {consumer} not found")))?;

        let next = messages
            .iter()
            .find(|stored| stored.sequence >= state.next_sequence && state.wants(&stored.message.subject));

        Ok(next.map(|stored| {
            state.next_sequence = stored.sequence + 1;
            (stored.sequence, stored.message.clone())
        }))
    }

    pub(crate) fn watch(&self, stream: &str) -> Result<watch::Receiver<u64>, BrokerError> {
        self.streams
            .lock()
            .get(stream)
            .map(|stored| stored.notify.subscribe())
            .ok_or(BrokerError::StreamNotFound)
    }

    pub(crate) fn ack(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .and_then(|stored| stored.consumers.get_mut(consumer))
            .ok_or(BrokerError::StreamNotFound)?;

        state.acked.push(sequence);

        Ok(())
    }
}

/// Durable messaging over the in-memory broker.
#[derive(Clone)]
pub struct MemoryJetStream {
    shared: Arc<Shared>,
}

impl Debug for MemoryJetStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryJetStream")
            .field("streams", &self.shared.streams.lock().len())
            .finish()
    }
}

impl MemoryJetStream {
    pub(crate) const fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn accept(&self, message: RawMessage) -> Result<PublishAck, BrokerError> {
        self.shared.ensure_open()?;

        if self.shared.reject_publishes {
            return Err(BrokerError::Rejected("maximum messages exceeded".to_string()));
        }

        let ack = self.shared.store(message.clone())?;
        if !ack.duplicate {
            self.shared.deliver(&message);
        }

        debug!(
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "stored message"
        );

        Ok(ack)
    }
}

#[async_trait]
impl JetStream for MemoryJetStream {
    type Consumer = MemoryConsumer;

    async fn publish(&self, message: RawMessage) -> Result<PublishAck, BrokerError> {
        let ack = self.accept(message)?;
        tokio::time::sleep(self.shared.ack_delay).await;

        Ok(ack)
    }

    async fn publish_async(&self, message: RawMessage) -> Result<AckFuture, BrokerError> {
        self.shared.ensure_open()?;

        let ack = self.accept(message);
        let ack_delay = self.shared.ack_delay;

        Ok(async move {
            tokio::time::sleep(ack_delay).await;
            ack
        }
        .boxed())
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BrokerError> {
        self.shared.ensure_open()?;

        Ok(self
            .shared
            .streams
            .lock()
            .values()
            .map(StoredStream::info)
            .collect())
    }

    async fn create_or_update_stream(
        &self,
        config: StreamConfig,
    ) -> Result<StreamInfo, BrokerError> {
        self.shared.ensure_open()?;

        if config.name.is_empty() {
            return Err(BrokerError::Rejected("stream name is required".to_string()));
        }

        let mut streams = self.shared.streams.lock();

        let overlaps = streams
            .values()
            .filter(|stream| stream.config.name != config.name)
            .any(|stream| {
                stream
                    .config
                    .subjects
                    .iter()
                    .any(|subject| config.subjects.contains(subject))
            });
        if overlaps {
            return Err(BrokerError::Rejected(
                "subjects overlap with an existing stream".to_string(),
            ));
        }

        let stream = streams
            .entry(config.name.clone())
            .and_modify(|stream| stream.config = config.clone())
            .or_insert_with(|| StoredStream::new(config));

        Ok(stream.info())
    }

    async fn create_or_update_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<MemoryConsumer, BrokerError> {
        self.shared.ensure_open()?;

        let mut streams = self.shared.streams.lock();
        let stream = streams
            .get_mut(&config.stream)
            .ok_or(BrokerError::StreamNotFound)?;

        let consumer = MemoryConsumer::new(
            Arc::clone(&self.shared),
            config.consumer_name.clone(),
            config.stream.clone(),
        );

        stream
            .consumers
            .entry(config.consumer_name.clone())
            .and_modify(|state| state.config = config.clone())
            .or_insert_with(|| ConsumerState {
                acked: Vec::new(),
                config,
                next_sequence: 1,
            });

        Ok(consumer)
    }
}
