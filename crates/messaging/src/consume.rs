use crate::broker::{Broker, BrokerError, Delivery, DurableConsumer};
use crate::client::{Client, ConsumerOf, DeliveryOf};
use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::router::{Message, Router};
use crate::tracer::Tracer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DELIVERY_RETRY_MIN: Duration = Duration::from_millis(100);
const DELIVERY_RETRY_MAX: Duration = Duration::from_secs(5);

/// Exponential delay between failed pulls, reset by the next successful delivery.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    const fn new() -> Self {
        Self {
            next: DELIVERY_RETRY_MIN,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(DELIVERY_RETRY_MAX);
        delay
    }

    const fn reset(&mut self) {
        self.next = DELIVERY_RETRY_MIN;
    }
}

/// Lifecycle of a consume loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsumeState {
    /// Created, not yet pulling messages.
    Idle,
    /// Pulling and processing messages.
    Consuming,
    /// The client is closing; the loop has stopped pulling and acknowledgments are flushing.
    Draining,
    /// No more messages will be processed.
    Stopped,
}

/// Processes a single delivery. Errors are reported to the loop's error sink.
#[async_trait]
pub trait DeliveryHandler<D>
where
    Self: Send + Sync + 'static,
    D: Delivery,
{
    /// Handles `delivery`.
    async fn handle(&self, delivery: D) -> Result<()>;
}

/// Receives errors raised inside a consume loop. The loop keeps running after a report.
pub trait ErrorSink
where
    Self: Send + Sync + 'static,
{
    /// Reports `error` raised by the consumer named `consumer`.
    fn report(&self, consumer: &str, error: Error);
}

impl<F> ErrorSink for F
where
    F: Fn(&str, Error) + Send + Sync + 'static,
{
    fn report(&self, consumer: &str, error: Error) {
        self(consumer, error);
    }
}

/// Default delivery handler: acknowledges, decodes, then routes through the client's router.
///
/// Messages are acknowledged before they are processed, so a failing handler never causes
/// a redelivery.
#[derive(Clone, Debug)]
pub struct RoutingHandler {
    logs: bool,
    router: Router,
    tracer: Arc<dyn Tracer>,
}

#[async_trait]
impl<D> DeliveryHandler<D> for RoutingHandler
where
    D: Delivery,
{
    async fn handle(&self, delivery: D) -> Result<()> {
        let span = self
            .tracer
            .start_span("JetStream consume message", None, &[]);
        let subject = delivery.subject().to_string();

        debug!(subject = %subject, trace_id = %span.trace_id(), "got message");

        delivery.double_ack().await.map_err(|e| {
            span.add_event("double ack the message");
            span.record_error("double ack the message", &e);
            Error::Ack(e)
        })?;

        debug!(subject = %subject, "ack");

        let envelope = Envelope::decode(delivery.payload()).inspect_err(|e| {
            span.add_event("unmarshal message");
            span.record_error("unmarshal message", e);
        })?;

        let ctx = Context::new()
            .with_message_id(envelope.id())
            .with_trace_id(envelope.trace_id());
        let message = Message {
            subject: subject.clone(),
            headers: delivery.headers().clone(),
            envelope,
        };

        self.router.dispatch(&ctx, message).await.inspect_err(|e| {
            span.add_event("process message from stream");
            span.record_error("process message from stream", e);
        })?;

        if self.logs {
            info!(subject = %subject, "message processed successfully");
        }

        Ok(())
    }
}

/// Default error sink: logs the error and records it on a span.
#[derive(Clone, Debug)]
pub struct TracingErrorSink {
    tracer: Arc<dyn Tracer>,
}

impl ErrorSink for TracingErrorSink {
    fn report(&self, consumer: &str, e: Error) {
        let span = self
            .tracer
            .start_span("JetStream consume error", None, &[("consumer", consumer.to_string())]);

        error!(consumer = %consumer, error = %e, "consume jetstream message");

        span.add_event("consume error");
        span.record_error("consume error", &e);
    }
}

/// Handle to a running consume loop.
#[derive(Debug)]
pub struct ConsumeHandle {
    cancel: CancellationToken,
    name: String,
    state: watch::Receiver<ConsumeState>,
}

impl ConsumeHandle {
    /// Durable name of the consumer.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state of the loop.
    #[must_use]
    pub fn state(&self) -> ConsumeState {
        *self.state.borrow()
    }

    /// Stops pulling messages. The message being processed, if any, finishes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits until the loop reaches `Stopped`.
    pub async fn wait(&self) {
        let mut state = self.state.clone();
        // The sender only goes away after the loop has finished.
        let _ = state
            .wait_for(|state| *state == ConsumeState::Stopped)
            .await;
    }
}

impl<B> Client<B>
where
    B: Broker,
{
    /// The default message handler: double-ack, decode, route.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called.
    pub fn consumer_message_handler(&self) -> Result<RoutingHandler> {
        Ok(RoutingHandler {
            logs: self.inner.logs,
            router: self.state()?.router.clone(),
            tracer: Arc::clone(&self.inner.tracer),
        })
    }

    /// The default error sink: logs and records errors on a span.
    #[must_use]
    pub fn consumer_error_handler(&self) -> TracingErrorSink {
        TracingErrorSink {
            tracer: Arc::clone(&self.inner.tracer),
        }
    }

    /// Starts a consume loop applying `handler` to every message delivered to `consumer`.
    ///
    /// Errors raised while handling a message go to `errors` and the loop moves on to the
    /// next message. Failed pulls are retried with an exponential backoff; a closed
    /// connection ends the loop. The loop runs until the handle is stopped or the client
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called,
    /// `Error::Draining` once `close()` has started and `Error::Consume` if the broker
    /// refuses to deliver messages.
    pub async fn process_stream<H, S>(
        &self,
        consumer: ConsumerOf<B>,
        handler: H,
        errors: S,
    ) -> Result<ConsumeHandle>
    where
        H: DeliveryHandler<DeliveryOf<B>>,
        S: ErrorSink,
    {
        self.state()?;

        if self.is_draining() {
            return Err(Error::Draining);
        }

        let (state_sender, state) = watch::channel(ConsumeState::Idle);
        let state_sender = Arc::new(state_sender);

        let mut messages = consumer.messages().await.map_err(Error::Consume)?;

        let name = consumer.name().to_string();
        let cancel = self.inner.shutdown_token.child_token();
        let shutdown_token = self.inner.shutdown_token.clone();
        let token = cancel.clone();
        let loop_name = name.clone();
        let loop_state = Arc::clone(&state_sender);
        let loops = Arc::clone(&self.inner.loops);

        loops.lock().push(state_sender);
        loop_state.send_replace(ConsumeState::Consuming);

        debug!(consumer = %name, stream = %consumer.stream_name(), "consume loop started");

        self.inner.task_tracker.spawn(async move {
            let mut backoff = Backoff::new();

            loop {
                let delivery = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = messages.next() => match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(BrokerError::Closed)) | None => break,
                        Some(Err(e)) => {
                            errors.report(&loop_name, Error::Delivery(e));

                            tokio::select! {
                                () = token.cancelled() => break,
                                () = tokio::time::sleep(backoff.next_delay()) => continue,
                            }
                        }
                    },
                };

                backoff.reset();

                if let Err(e) = handler.handle(delivery).await {
                    errors.report(&loop_name, e);
                }
            }

            drop(messages);

            if shutdown_token.is_cancelled() {
                // close() moves the loop to Stopped once the connection has drained.
                loop_state.send_replace(ConsumeState::Draining);
            } else {
                loops.lock().retain(|state| !Arc::ptr_eq(state, &loop_state));
                loop_state.send_replace(ConsumeState::Stopped);
            }

            debug!(consumer = %loop_name, "consume loop stopped");
        });

        Ok(ConsumeHandle {
            cancel,
            name,
            state,
        })
    }

    /// Starts a consume loop with the default message handler and error sink.
    ///
    /// # Errors
    ///
    /// See `process_stream`.
    pub async fn consume(&self, consumer: ConsumerOf<B>) -> Result<ConsumeHandle> {
        let handler = self.consumer_message_handler()?;
        let errors = self.consumer_error_handler();

        self.process_stream(consumer, handler, errors).await
    }
}
