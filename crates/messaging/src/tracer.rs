use std::error::Error as StdError;
use std::fmt::Debug;

use tracing::field::Empty;
use uuid::Uuid;

/// Trace id reported when no tracer is configured.
pub const EMPTY_TRACE_ID: &str = "00000000000000000000000000000000";

/// A span attribute.
pub type KeyValue = (&'static str, String);

/// Starts spans around messaging operations.
///
/// Injected into the client at construction; there is no process-wide tracer.
pub trait Tracer
where
    Self: Debug + Send + Sync + 'static,
{
    /// Starts a span. The span joins `parent_trace_id` when one is given.
    fn start_span(
        &self,
        name: &'static str,
        parent_trace_id: Option<&str>,
        attributes: &[KeyValue],
    ) -> Box<dyn Span>;
}

/// A started span. Dropping the span ends it.
pub trait Span
where
    Self: Send + Sync,
{
    /// Trace id of the span, carried in outgoing envelopes.
    fn trace_id(&self) -> &str;

    /// Attaches an attribute after the span has started.
    fn set_attribute(&self, key: &'static str, value: String);

    /// Records a named event.
    fn add_event(&self, name: &str);

    /// Records an error and marks the span as failed.
    fn record_error(&self, description: &str, error: &dyn StdError);

    /// Ends the span.
    fn end(self: Box<Self>);
}

/// Tracer used when none is configured. Spans do nothing but still carry a trace id.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(
        &self,
        _name: &'static str,
        parent_trace_id: Option<&str>,
        _attributes: &[KeyValue],
    ) -> Box<dyn Span> {
        Box::new(NoopSpan {
            trace_id: parent_trace_id.unwrap_or(EMPTY_TRACE_ID).to_string(),
        })
    }
}

struct NoopSpan {
    trace_id: String,
}

impl Span for NoopSpan {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn set_attribute(&self, _key: &'static str, _value: String) {}

    fn add_event(&self, _name: &str) {}

    fn record_error(&self, _description: &str, _error: &dyn StdError) {}

    fn end(self: Box<Self>) {}
}

/// Tracer backed by `tracing` spans. Generates a fresh 128-bit trace id per root span.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(
        &self,
        name: &'static str,
        parent_trace_id: Option<&str>,
        attributes: &[KeyValue],
    ) -> Box<dyn Span> {
        let trace_id = parent_trace_id.map_or_else(
            || Uuid::new_v4().simple().to_string(),
            ToString::to_string,
        );

        let span = tracing::info_span!(
            "messaging",
            otel.name = name,
            otel.status_code = Empty,
            trace_id = %trace_id,
            attributes = ?attributes,
        );

        Box::new(TracingSpan { span, trace_id })
    }
}

struct TracingSpan {
    span: tracing::Span,
    trace_id: String,
}

impl Span for TracingSpan {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn set_attribute(&self, key: &'static str, value: String) {
        tracing::trace!(parent: &self.span, key, value = %value, "attribute");
    }

    fn add_event(&self, name: &str) {
        tracing::debug!(parent: &self.span, "{name}");
    }

    fn record_error(&self, description: &str, error: &dyn StdError) {
        self.span.record("otel.status_code", "ERROR");
        tracing::debug!(parent: &self.span, error = %error, "{description}");
    }

    fn end(self: Box<Self>) {}
}
