use crate::error::Error;

use std::time::SystemTime;

use bytes::Bytes;
use prost::Message as _;
use uuid::Uuid;

/// Protobuf layout of the envelope on the wire.
#[derive(Clone, PartialEq, prost::Message)]
struct WireEnvelope {
    #[prost(message, optional, tag = "1")]
    ts: Option<prost_types::Timestamp>,
    #[prost(string, tag = "2")]
    id: String,
    #[prost(string, tag = "3")]
    trace_id: String,
    #[prost(bytes = "bytes", tag = "4")]
    payload: Bytes,
}

/// Wrapper carried by every message: id, timestamp, trace correlation id and payload.
///
/// The id is never empty. One is generated when the caller doesn't supply one, and
/// also when a decoded message arrives without one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    id: String,
    timestamp: SystemTime,
    trace_id: String,
    payload: Bytes,
}

impl Envelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(id: Option<String>, trace_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.filter(|id| !id.is_empty()).unwrap_or_else(new_id),
            timestamp: SystemTime::now(),
            trace_id: trace_id.into(),
            payload: payload.into(),
        }
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Unique message id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Time the envelope was created by the producer.
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Trace correlation id.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Opaque payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the envelope and returns the payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Encodes the envelope to protobuf wire format.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encode` if the buffer cannot hold the message.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let wire = WireEnvelope {
            ts: Some(self.timestamp.into()),
            id: self.id.clone(),
            trace_id: self.trace_id.clone(),
            payload: self.payload.clone(),
        };

        let mut buf = Vec::with_capacity(wire.encoded_len());
        wire.encode(&mut buf)?;

        Ok(Bytes::from(buf))
    }

    /// Decodes an envelope from protobuf wire format.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the bytes are not a valid envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let wire = WireEnvelope::decode(bytes)?;

        // Timestamps outside the representable range fall back to the epoch.
        let timestamp = wire
            .ts
            .and_then(|ts| SystemTime::try_from(ts).ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        Ok(Self {
            id: if wire.id.is_empty() {
                new_id()
            } else {
                wire.id
            },
            timestamp,
            trace_id: wire.trace_id,
            payload: wire.payload,
        })
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}
