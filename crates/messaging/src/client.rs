use crate::broker::{Broker, DurableConsumer, JetStream};
use crate::consume::ConsumeState;
use crate::error::{Error, Result};
use crate::router::{Router, StreamHandler};
use crate::tracer::{NoopTracer, Tracer};

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Durable consumer type of a broker.
pub type ConsumerOf<B> = <<B as Broker>::JetStream as JetStream>::Consumer;

/// Delivery type of a broker's durable consumers.
pub type DeliveryOf<B> = <ConsumerOf<B> as DurableConsumer>::Delivery;

/// Options for the messaging client.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Tracer used for every operation.
    pub tracer: Arc<dyn Tracer>,

    /// Enable durable messaging while constructing the client.
    pub jetstream: bool,

    /// Log every processed message, not only failures.
    pub logs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tracer: Arc::new(NoopTracer),
            jetstream: false,
            logs: false,
        }
    }
}

impl ClientOptions {
    /// Default options: no-op tracer, durable messaging off, failure logs only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `tracer` for every operation.
    #[must_use]
    pub fn with_tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Enables durable messaging while constructing the client.
    #[must_use]
    pub const fn with_jetstream(mut self) -> Self {
        self.jetstream = true;
        self
    }

    /// Toggles per-message success logs.
    #[must_use]
    pub const fn with_logs(mut self, enabled: bool) -> Self {
        self.logs = enabled;
        self
    }
}

/// State that exists once durable messaging is enabled.
pub(crate) struct JetStreamState<B>
where
    B: Broker,
{
    pub(crate) context: B::JetStream,
    pub(crate) router: Router,
    pub(crate) consumers: RwLock<Vec<ConsumerOf<B>>>,
}

pub(crate) struct Inner<B>
where
    B: Broker,
{
    pub(crate) broker: B,
    pub(crate) draining: AtomicBool,
    pub(crate) jetstream: OnceCell<JetStreamState<B>>,
    pub(crate) logs: bool,
    pub(crate) loops: Arc<Mutex<Vec<Arc<watch::Sender<ConsumeState>>>>>,
    pub(crate) shutdown_token: CancellationToken,
    pub(crate) task_tracker: TaskTracker,
    pub(crate) tracer: Arc<dyn Tracer>,
}

/// Messaging client over a single broker connection.
///
/// Cheap to clone; clones share the connection, the router and every registry.
pub struct Client<B>
where
    B: Broker,
{
    pub(crate) inner: Arc<Inner<B>>,
}

impl<B> Clone for Client<B>
where
    B: Broker,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B> Debug for Client<B>
where
    B: Broker,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Client")
            .field("broker", &self.inner.broker)
            .field("jetstream", &self.inner.jetstream.initialized())
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

impl<B> Client<B>
where
    B: Broker,
{
    /// Wraps a connected broker.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStream` if durable messaging is requested and cannot be enabled.
    pub async fn new(
        broker: B,
        ClientOptions {
            tracer,
            jetstream,
            logs,
        }: ClientOptions,
    ) -> Result<Self> {
        let client = Self {
            inner: Arc::new(Inner {
                broker,
                draining: AtomicBool::new(false),
                jetstream: OnceCell::new(),
                logs,
                loops: Arc::new(Mutex::new(Vec::new())),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
                tracer,
            }),
        };

        if jetstream {
            client.jetstream().await?;
        }

        Ok(client)
    }

    /// Enables durable messaging and returns its context.
    ///
    /// Idempotent: later calls return the context created by the first one. The first
    /// call also creates the router.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStream` if the broker cannot construct the context.
    pub async fn jetstream(&self) -> Result<B::JetStream> {
        let state = self
            .inner
            .jetstream
            .get_or_try_init(|| async {
                let context = self
                    .inner
                    .broker
                    .jetstream()
                    .await
                    .map_err(Error::JetStream)?;

                debug!("jetstream enabled");

                Ok::<_, Error>(JetStreamState {
                    context,
                    router: Router::new(),
                    consumers: RwLock::new(Vec::new()),
                })
            })
            .await?;

        Ok(state.context.clone())
    }

    /// Whether durable messaging is enabled.
    #[must_use]
    pub fn is_jetstream_enabled(&self) -> bool {
        self.inner.jetstream.initialized()
    }

    /// The underlying broker connection.
    #[must_use]
    pub fn broker(&self) -> &B {
        &self.inner.broker
    }

    /// The subject router.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called.
    pub fn router(&self) -> Result<&Router> {
        Ok(&self.state()?.router)
    }

    /// Routes messages delivered on `subject` to `handler`, replacing any previous handler.
    ///
    /// # Errors
    ///
    /// Returns `Error::Draining` once `close()` has started, `Error::JetStreamNotEnabled`
    /// before `jetstream()` was called and `Error::InvalidSubject` for wildcard subjects.
    pub fn handle<H>(&self, subject: impl Into<String>, handler: H) -> Result<()>
    where
        H: StreamHandler,
    {
        if self.is_draining() {
            return Err(Error::Draining);
        }

        let subject = subject.into();
        self.state()?.router.register(subject.clone(), handler)?;

        debug!(subject = %subject, "handler registered");

        Ok(())
    }

    /// Number of consume loops that have not stopped yet.
    #[must_use]
    pub fn consume_loop_count(&self) -> usize {
        self.inner.loops.lock().len()
    }

    /// Whether `close()` has started.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Stops consume loops and subscriptions, then drains the connection.
    ///
    /// In-flight messages finish first. Drain failures are logged and otherwise ignored.
    pub async fn close(&self) {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            self.inner.task_tracker.wait().await;
            return;
        }

        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;

        if let Err(e) = self.inner.broker.drain().await {
            debug!(error = %e, "failed to drain connection");
        }

        for state in self.inner.loops.lock().drain(..) {
            state.send_replace(ConsumeState::Stopped);
        }

        info!("messaging client closed");
    }

    pub(crate) fn state(&self) -> Result<&JetStreamState<B>> {
        self.inner.jetstream.get().ok_or(Error::JetStreamNotEnabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = ClientOptions::new().with_jetstream().with_logs(true);

        assert!(options.jetstream);
        assert!(options.logs);
    }

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();

        assert!(!options.jetstream);
        assert!(!options.logs);
    }
}
