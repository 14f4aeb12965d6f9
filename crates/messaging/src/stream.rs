use crate::broker::{Broker, JetStream, StreamInfo};
use crate::client::{Client, ConsumerOf};
use crate::error::{Error, Result};
use crate::subject;

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What the broker does with messages once they are stored.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep messages until a limit (age, count, size) is reached.
    #[default]
    Limits,
    /// Keep messages while at least one consumer is interested in them.
    Interest,
    /// Remove messages once any consumer acknowledges them.
    #[serde(alias = "workqueue")]
    WorkQueue,
}

/// Compression applied to stored messages.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Store messages as-is.
    #[default]
    None,
    /// S2 compression.
    S2,
}

/// How a durable consumer acknowledges messages.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// No acknowledgment is expected.
    None,
    /// Acknowledging a message acknowledges every earlier one.
    All,
    /// Every message is acknowledged individually.
    #[default]
    Explicit,
}

const fn default_replicas() -> usize {
    1
}

/// Durable stream declaration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject filters captured by the stream.
    pub subjects: Vec<String>,
    /// Retention policy.
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    /// Maximum message age in seconds. Zero keeps messages forever.
    #[serde(default)]
    pub max_age_sec: u64,
    /// Replica count.
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Storage compression.
    #[serde(default, alias = "compressions")]
    pub compression: Compression,
}

impl StreamConfig {
    /// Creates a declaration with default retention, no age limit, one replica and no compression.
    pub fn new<I, S>(name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            retention_policy: RetentionPolicy::default(),
            max_age_sec: 0,
            replicas: default_replicas(),
            compression: Compression::default(),
        }
    }

    /// Sets the retention policy.
    #[must_use]
    pub const fn with_retention_policy(mut self, retention_policy: RetentionPolicy) -> Self {
        self.retention_policy = retention_policy;
        self
    }

    /// Sets the maximum message age, truncated to whole seconds.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_sec = max_age.as_secs();
        self
    }

    /// Sets the replica count.
    #[must_use]
    pub const fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Sets storage compression.
    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Maximum message age. `Duration::ZERO` means unlimited.
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_sec)
    }
}

/// Durable consumer declaration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConsumerConfig {
    /// Durable name. Declaring the same name again reuses the consumer.
    pub consumer_name: String,
    /// Name of the stream the consumer reads from.
    pub stream: String,
    /// Acknowledgment policy.
    #[serde(default)]
    pub ack_policy: AckPolicy,
    /// Subject filters. Empty means every subject of the stream.
    #[serde(default)]
    pub filters: Vec<String>,
}

impl ConsumerConfig {
    /// Creates a declaration with explicit acks and no filters.
    pub fn new(consumer_name: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            stream: stream.into(),
            ack_policy: AckPolicy::default(),
            filters: Vec::new(),
        }
    }

    /// Sets the subject filters.
    #[must_use]
    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters = filters.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the acknowledgment policy.
    #[must_use]
    pub const fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }
}

/// Unions the requested subjects with those of every existing stream named `name`.
/// Requested subjects come first; duplicates keep their first position.
fn merge_subjects(name: &str, requested: &[String], existing: &[StreamInfo]) -> Vec<String> {
    let mut seen = HashSet::new();

    requested
        .iter()
        .chain(
            existing
                .iter()
                .filter(|info| info.name == name)
                .flat_map(|info| info.subjects.iter()),
        )
        .filter(|subject| seen.insert(subject.as_str()))
        .cloned()
        .collect()
}

impl<B> Client<B>
where
    B: Broker,
{
    /// Creates a durable stream, or updates the existing stream with the same name.
    ///
    /// Subjects of an existing stream are kept: re-declaring only ever widens the
    /// subject set.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called, and
    /// wraps listing or creation failures reported by the broker.
    pub async fn declare_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        let state = self.state()?;

        for filter in &config.subjects {
            subject::validate_filter(filter)?;
        }

        let existing = state
            .context
            .list_streams()
            .await
            .map_err(Error::ListStreams)?;

        let subjects = merge_subjects(&config.name, &config.subjects, &existing);
        debug!(stream = %config.name, subjects = ?subjects, "declaring stream");

        let info = state
            .context
            .create_or_update_stream(StreamConfig { subjects, ..config })
            .await
            .map_err(Error::CreateStream)?;

        info!(stream = %info.name, subjects = ?info.subjects, "stream declared");

        Ok(info)
    }

    /// Creates a durable consumer, or updates the existing consumer with the same name.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called, and
    /// `Error::CreateConsumer` if the broker refuses the declaration.
    pub async fn declare_consumer(&self, config: ConsumerConfig) -> Result<ConsumerOf<B>> {
        let state = self.state()?;

        for filter in &config.filters {
            subject::validate_filter(filter)?;
        }

        debug!(
            consumer = %config.consumer_name,
            stream = %config.stream,
            filters = ?config.filters,
            "declaring consumer"
        );

        state
            .context
            .create_or_update_consumer(config)
            .await
            .map_err(Error::CreateConsumer)
    }

    /// Adds a consumer to the list of active consumers.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called.
    pub fn register_active(&self, consumer: ConsumerOf<B>) -> Result<()> {
        self.state()?.consumers.write().push(consumer);

        Ok(())
    }

    /// Consumers registered as active, in registration order.
    ///
    /// The broker remains the source of truth for which consumers exist.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called.
    pub fn active_consumers(&self) -> Result<Vec<ConsumerOf<B>>> {
        Ok(self.state()?.consumers.read().clone())
    }
}
