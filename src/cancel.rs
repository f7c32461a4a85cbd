//! Cancellation signal with an observable reason.
//!
//! A thin layer over [`CancellationToken`] that remembers why it was fired.
//! Signals form a tree: a connection signal parents every call signal, so
//! closing the connection cancels all of its calls, while cancelling one
//! call leaves its siblings alone.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Reason used when a call is aborted without an explicit reason.
pub const CALL_ABORTED: &str = "Call aborted";

/// Reason used when the owning connection goes away.
pub const CONNECTION_CLOSED: &str = "Connection closed";

#[derive(Debug)]
struct Inner {
    reason: OnceLock<String>,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn reason(&self) -> Option<&str> {
        self.reason
            .get()
            .map(String::as_str)
            .or_else(|| self.parent.as_ref().and_then(|p| p.reason()))
    }
}

/// Composable, cloneable cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    inner: Arc<Inner>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            inner: Arc::new(Inner {
                reason: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Signal cancelled whenever `self` is, but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            inner: Arc::new(Inner {
                reason: OnceLock::new(),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Fire the signal. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.inner.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the signal fired, inherited from the parent when fired there.
    pub fn reason(&self) -> Option<String> {
        if !self.is_cancelled() {
            return None;
        }
        self.inner.reason().map(str::to_owned)
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Underlying token, for APIs that take one directly.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_records_reason() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert_eq!(signal.reason(), None);

        signal.cancel("stop");
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason().as_deref(), Some("stop"));
    }

    #[test]
    fn test_first_reason_wins() {
        let signal = CancelSignal::new();
        signal.cancel("first");
        signal.cancel("second");
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_child_inherits_parent_reason() {
        let parent = CancelSignal::new();
        let child = parent.child();

        parent.cancel(CONNECTION_CLOSED);
        assert!(child.is_cancelled());
        assert_eq!(child.reason().as_deref(), Some(CONNECTION_CLOSED));
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = CancelSignal::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel(CALL_ABORTED);
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();

        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.reason()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel("done");

        assert_eq!(task.await.unwrap().as_deref(), Some("done"));
    }
}
