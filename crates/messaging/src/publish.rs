use crate::broker::{Broker, Headers, JetStream, PublishAck, RawMessage};
use crate::client::Client;
use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::router::{HandlerError, Message};
use crate::subject;
use crate::tracer::{Span, Tracer};

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header carrying a caller-chosen message id.
pub const MESSAGE_ID_HEADER: &str = "messageID";

/// Header the broker uses to de-duplicate durable publishes.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Header carrying the reply subject of a durable publish.
pub const REPLY_TO_HEADER: &str = "Reply-To";

/// Picks the message id: the `messageID` header, then the context, then a fresh UUID.
#[must_use]
pub fn message_id(ctx: &Context, headers: &Headers) -> String {
    headers
        .get(MESSAGE_ID_HEADER)
        .map(String::as_str)
        .filter(|id| !id.is_empty())
        .or_else(|| ctx.message_id().filter(|id| !id.is_empty()))
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string)
}

/// Picks the id of a durable publish: the `messageID` header, otherwise a fresh UUID.
///
/// The id is also the broker's de-duplication key; the context's message id is ignored.
#[must_use]
pub fn durable_message_id(headers: &Headers) -> String {
    headers
        .get(MESSAGE_ID_HEADER)
        .filter(|id| !id.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), Clone::clone)
}

fn record_failure(span: &dyn Span, description: &str, error: &dyn StdError) {
    span.add_event(description);
    span.record_error(description, error);
}

fn seal(
    span: &dyn Span,
    message_id: String,
    trace_id: &str,
    payload: Bytes,
) -> Result<Bytes> {
    Envelope::new(Some(message_id), trace_id, payload)
        .encode()
        .inspect_err(|e| record_failure(span, "marshal proto message", e))
}

/// Produces the response to a request received through `Client::subscribe`.
#[async_trait]
pub trait ReplyHandler
where
    Self: Send + Sync + 'static,
{
    /// Returns the response payload for `message`.
    async fn reply(&self, ctx: &Context, message: Message) -> Result<Bytes, HandlerError>;
}

#[async_trait]
impl<F, Fut> ReplyHandler for F
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    async fn reply(&self, ctx: &Context, message: Message) -> Result<Bytes, HandlerError> {
        self(ctx.clone(), message).await
    }
}

/// Handle to a reply subscription.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    cancel: CancellationToken,
}

impl Subscription {
    /// The subscribed subject filter.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stops the subscription once the current request is answered.
    pub fn unsubscribe(self) {
        self.cancel.cancel();
    }
}

impl<B> Client<B>
where
    B: Broker,
{
    /// Publishes a non-durable message. Returns once the broker has accepted it; there is
    /// no delivery guarantee.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSubject`, `Error::Encode` or `Error::Publish`.
    pub async fn publish(
        &self,
        ctx: &Context,
        subject: &str,
        payload: impl Into<Bytes> + Send,
        headers: Headers,
    ) -> Result<()> {
        subject::validate(subject)?;

        let message_id = message_id(ctx, &headers);
        let span = self.inner.tracer.start_span(
            "NATS publish",
            ctx.trace_id(),
            &[("messageID", message_id.clone()), ("subj", subject.to_string())],
        );

        let data = seal(&*span, message_id, span.trace_id(), payload.into())?;

        let message = RawMessage {
            subject: subject.to_string(),
            reply: None,
            headers,
            payload: data,
        };

        if let Err(e) = self.inner.broker.publish(message).await {
            record_failure(&*span, "error publishing to nats", &e);
            return Err(Error::Publish(e));
        }

        span.add_event("published to nats");

        Ok(())
    }

    /// Sends a request and waits up to `timeout` for the response.
    ///
    /// # Errors
    ///
    /// Returns `Error::RequestTimeout` when no response arrives in time or the context is
    /// done first, `Error::Request` for other broker failures and `Error::Decode` if the
    /// response is not an envelope.
    pub async fn request(
        &self,
        ctx: &Context,
        subject: &str,
        payload: impl Into<Bytes> + Send,
        headers: Headers,
        timeout: Duration,
    ) -> Result<Message> {
        subject::validate(subject)?;

        let message_id = message_id(ctx, &headers);
        let span = self.inner.tracer.start_span(
            "NATS request",
            ctx.trace_id(),
            &[("messageID", message_id.clone()), ("subj", subject.to_string())],
        );

        let data = seal(&*span, message_id, span.trace_id(), payload.into())?;

        let message = RawMessage {
            subject: subject.to_string(),
            reply: None,
            headers,
            payload: data,
        };

        let result = tokio::select! {
            biased;
            () = ctx.done() => Err(Error::RequestTimeout),
            response = self.inner.broker.request(message, timeout) => {
                response.map_err(|e| if e.is_timeout() {
                    Error::RequestTimeout
                } else {
                    Error::Request(e)
                })
            }
        };

        let response = result
            .inspect_err(|e| record_failure(&*span, "error requesting from nats", e))?;

        let envelope = Envelope::decode(&response.payload)
            .inspect_err(|e| record_failure(&*span, "unmarshal proto response message", e))?;

        Ok(Message {
            subject: response.subject,
            headers: response.headers,
            envelope,
        })
    }

    /// Answers requests on `subject` with `handler`.
    ///
    /// Each response is wrapped in a new envelope with a fresh id and the request's trace
    /// id. Failures while answering are logged and recorded on the span; the subscription
    /// keeps running until unsubscribed or the client closes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSubject` for malformed filters and `Error::Subscribe` if the
    /// broker refuses the subscription.
    pub async fn subscribe<H>(&self, subject: &str, handler: H) -> Result<Subscription>
    where
        H: ReplyHandler,
    {
        if self.is_draining() {
            return Err(Error::Draining);
        }

        subject::validate_filter(subject)?;

        let mut messages = self
            .inner
            .broker
            .subscribe(subject.to_string())
            .await
            .map_err(|source| Error::Subscribe {
                subject: subject.to_string(),
                source,
            })?;

        let cancel = self.inner.shutdown_token.child_token();
        let broker = self.inner.broker.clone();
        let tracer = Arc::clone(&self.inner.tracer);
        let logs = self.inner.logs;
        let filter = subject.to_string();
        let token = cancel.clone();

        self.inner.task_tracker.spawn(async move {
            loop {
                let request = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = messages.next() => match next {
                        Some(request) => request,
                        None => break,
                    },
                };

                if let Err(e) = respond(&broker, &*tracer, &filter, &handler, request).await {
                    warn!(subject = %filter, error = %e, "failed to answer request");
                } else if logs {
                    debug!(subject = %filter, "request answered");
                }
            }

            debug!(subject = %filter, "subscription stopped");
        });

        Ok(Subscription {
            subject: subject.to_string(),
            cancel,
        })
    }

    /// Publishes to a durable stream and waits for the broker to acknowledge storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called,
    /// `Error::AckTimeout` if the context is done before the acknowledgment arrives and
    /// `Error::Publish` if the broker rejects the message.
    pub async fn publish_sync(
        &self,
        ctx: &Context,
        subject: &str,
        reply_to: Option<&str>,
        payload: impl Into<Bytes> + Send,
        headers: Headers,
    ) -> Result<PublishAck> {
        let state = self.state()?;
        subject::validate(subject)?;

        let message_id = durable_message_id(&headers);
        let span = self.inner.tracer.start_span(
            "JetStream publish",
            ctx.trace_id(),
            &[("messageID", message_id.clone()), ("subj", subject.to_string())],
        );

        let message =
            durable_message(&*span, subject, reply_to, message_id, payload.into(), headers)?;

        let result = tokio::select! {
            biased;
            () = ctx.done() => Err(Error::AckTimeout),
            ack = state.context.publish(message) => ack.map_err(Error::Publish),
        };

        let ack = result.inspect_err(|e| record_failure(&*span, "error publishing to stream", e))?;

        span.set_attribute("stream", ack.stream.clone());
        span.add_event("published to stream");

        Ok(ack)
    }

    /// Publishes to a durable stream without blocking on storage.
    ///
    /// With `wait_for_ack` the acknowledgment is awaited until the context is done and
    /// returned; otherwise the call returns as soon as the publish is submitted.
    ///
    /// # Errors
    ///
    /// Returns `Error::JetStreamNotEnabled` before `jetstream()` was called,
    /// `Error::AckTimeout` if the context is done while waiting for the acknowledgment and
    /// `Error::Publish` if the broker rejects the message.
    pub async fn publish_async(
        &self,
        ctx: &Context,
        subject: &str,
        reply_to: Option<&str>,
        payload: impl Into<Bytes> + Send,
        wait_for_ack: bool,
        headers: Headers,
    ) -> Result<Option<PublishAck>> {
        let state = self.state()?;
        subject::validate(subject)?;

        let message_id = durable_message_id(&headers);
        let span = self.inner.tracer.start_span(
            "JetStream async publish",
            ctx.trace_id(),
            &[("messageID", message_id.clone()), ("subj", subject.to_string())],
        );

        let message =
            durable_message(&*span, subject, reply_to, message_id, payload.into(), headers)?;

        let ack_future = state
            .context
            .publish_async(message)
            .await
            .map_err(Error::Publish)
            .inspect_err(|e| record_failure(&*span, "error async publishing to stream", e))?;

        if !wait_for_ack {
            return Ok(None);
        }

        let result = tokio::select! {
            biased;
            ack = ack_future => ack.map_err(Error::Publish),
            () = ctx.done() => Err(Error::AckTimeout),
        };

        let ack = result
            .inspect_err(|e| record_failure(&*span, "error waiting for async publish ack", e))?;

        span.set_attribute("stream", ack.stream.clone());
        span.add_event("async published to stream");

        Ok(Some(ack))
    }
}

fn durable_message(
    span: &dyn Span,
    subject: &str,
    reply_to: Option<&str>,
    message_id: String,
    payload: Bytes,
    mut headers: Headers,
) -> Result<RawMessage> {
    let reply = reply_to.filter(|reply| !reply.is_empty()).map(ToString::to_string);

    headers.insert(MSG_ID_HEADER.to_string(), message_id.clone());
    if let Some(reply) = &reply {
        headers.insert(REPLY_TO_HEADER.to_string(), reply.clone());
    }

    Ok(RawMessage {
        subject: subject.to_string(),
        reply,
        headers,
        payload: seal(span, message_id, span.trace_id(), payload)?,
    })
}

async fn respond<B, H>(
    broker: &B,
    tracer: &dyn Tracer,
    filter: &str,
    handler: &H,
    request: RawMessage,
) -> Result<()>
where
    B: Broker,
    H: ReplyHandler,
{
    let span = tracer.start_span(
        "NATS pub/sub response",
        None,
        &[("subj", filter.to_string())],
    );

    let envelope = Envelope::decode(&request.payload)
        .inspect_err(|e| record_failure(&*span, "unmarshal proto message", e))?;

    span.set_attribute("messageID", envelope.id().to_string());

    let ctx = Context::new()
        .with_message_id(envelope.id())
        .with_trace_id(envelope.trace_id());
    let trace_id = envelope.trace_id().to_string();

    let Some(reply) = request.reply else {
        let error = Error::NoReply;
        record_failure(&*span, "respond to nats message", &error);
        return Err(error);
    };

    let message = Message {
        subject: request.subject,
        headers: request.headers,
        envelope,
    };

    let result = match handler.reply(&ctx, message).await {
        Ok(result) => result,
        Err(source) => {
            let error = Error::Handler {
                subject: filter.to_string(),
                source,
            };
            record_failure(&*span, "handler returned an error", &error);
            return Err(error);
        }
    };

    let data = Envelope::new(None, trace_id, result)
        .encode()
        .inspect_err(|e| record_failure(&*span, "marshal proto response message", e))?;

    broker
        .publish(RawMessage::new(reply, data))
        .await
        .map_err(Error::Publish)
        .inspect_err(|e| record_failure(&*span, "respond to nats message", e))
}
