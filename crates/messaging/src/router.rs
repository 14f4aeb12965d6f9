use crate::broker::Headers;
use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::subject;

use std::error::Error as StdError;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

/// Error returned by application handlers.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// A decoded message handed to a stream handler.
#[derive(Clone, Debug)]
pub struct Message {
    /// Subject the message was published on.
    pub subject: String,
    /// Broker headers.
    pub headers: Headers,
    /// Decoded envelope.
    pub envelope: Envelope,
}

impl Message {
    /// The application payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        self.envelope.payload()
    }
}

/// Handles messages routed to a subject.
#[async_trait]
pub trait StreamHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles a single message.
    async fn handle(&self, ctx: &Context, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &Context, message: Message) -> Result<(), HandlerError> {
        self(ctx.clone(), message).await
    }
}

/// Maps subjects to handlers. One handler per subject; the last registration wins.
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct Router {
    handlers: Arc<DashMap<String, Arc<dyn StreamHandler>>>,
}

impl Debug for Router {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Router")
            .field("subjects", &self.subjects())
            .finish()
    }
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `subject`, replacing any previous handler.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSubject` if the subject is not a concrete subject.
    pub fn register<H>(&self, subject: impl Into<String>, handler: H) -> Result<(), Error>
    where
        H: StreamHandler,
    {
        let subject = subject.into();
        subject::validate(&subject)?;

        self.handlers.insert(subject, Arc::new(handler));

        Ok(())
    }

    /// Removes the handler bound to `subject`. Returns whether one was bound.
    pub fn unregister(&self, subject: &str) -> bool {
        self.handlers.remove(subject).is_some()
    }

    /// Whether a handler is bound to `subject`.
    #[must_use]
    pub fn contains(&self, subject: &str) -> bool {
        self.handlers.contains_key(subject)
    }

    /// Number of bound subjects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Bound subjects, sorted.
    #[must_use]
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        subjects.sort();
        subjects
    }

    /// Passes `message` to the handler bound to its subject.
    ///
    /// Messages on subjects without a handler are dropped and reported as success.
    ///
    /// # Errors
    ///
    /// Returns `Error::Handler` if the handler fails.
    pub async fn dispatch(&self, ctx: &Context, message: Message) -> Result<(), Error> {
        // Clone the handler out so the shard lock isn't held across the await.
        let Some(handler) = self
            .handlers
            .get(&message.subject)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return Ok(());
        };

        let subject = message.subject.clone();
        handler
            .handle(ctx, message)
            .await
            .map_err(|source| Error::Handler { subject, source })
    }
}
