use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call context: cancellation, an optional deadline and values carried with the call.
///
/// Cloning a context shares its cancellation token.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    message_id: Option<String>,
    trace_id: Option<String>,
}

impl Context {
    /// A context that is never done unless cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given token for cancellation.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Sets a deadline, keeping the earlier one if a deadline is already set.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Sets a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Carries a message id used when publishing without a `messageID` header.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Carries the trace id of the caller's span.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Cancels the context and every clone of it.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// The cancellation token backing this context.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The message id carried by the context.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// The trace id carried by the context.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Whether the context is cancelled or past its deadline.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cancellation.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancellation.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancellation.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::timeout;

    #[tokio::test]
    async fn test_done_on_deadline() {
        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        assert!(!ctx.is_done());

        timeout(Duration::from_secs(1), ctx.done())
            .await
            .expect("deadline should resolve done()");
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_done_on_cancel_of_clone() {
        let ctx = Context::new();
        let clone = ctx.clone();

        clone.cancel();

        timeout(Duration::from_secs(1), ctx.done())
            .await
            .expect("cancel should resolve done()");
    }

    #[tokio::test]
    async fn test_not_done_without_signal() {
        let ctx = Context::new();

        assert!(timeout(Duration::from_millis(20), ctx.done()).await.is_err());
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = Context::new()
            .with_deadline(now + Duration::from_secs(10))
            .with_deadline(now + Duration::from_secs(1));

        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}
