//! Server-side registry of executing calls.
//!
//! Calls are keyed by `(connectionId, callId)`. Closing a connection
//! matches the connection id exactly, so closing `conn-1` never touches
//! `conn-10`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::pull::{CallKey, PullCoordinator, PullOutcome};
use crate::cancel::{CancelSignal, CALL_ABORTED, CONNECTION_CLOSED};
use crate::error::{CallwireError, Result};

/// Executing calls of every connection, with their pull credits.
#[derive(Default)]
pub struct CallRegistry {
    calls: Mutex<HashMap<CallKey, CancelSignal>>,
    pulls: PullCoordinator,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallKey, CancelSignal>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an executing call with its cancellation signal.
    ///
    /// A call id reused by the client replaces the previous entry after
    /// aborting it.
    pub fn set(&self, connection_id: &str, call_id: u32, signal: CancelSignal) {
        let key = CallKey::new(connection_id, call_id);
        if let Some(previous) = self.lock().insert(key.clone(), signal) {
            tracing::warn!(call = %key, "call id reused while in flight");
            previous.cancel(CALL_ABORTED);
            self.pulls.close(&key);
        }
    }

    pub fn get(&self, connection_id: &str, call_id: u32) -> Option<CancelSignal> {
        self.lock()
            .get(&CallKey::new(connection_id, call_id))
            .cloned()
    }

    /// Forget a finished call without firing its signal.
    pub fn delete(&self, connection_id: &str, call_id: u32) -> bool {
        let key = CallKey::new(connection_id, call_id);
        self.pulls.close(&key);
        self.lock().remove(&key).is_some()
    }

    /// Abort a call: fire its signal, forget it and release its pull wait.
    ///
    /// Returns `false` for an unknown call.
    pub fn abort(&self, connection_id: &str, call_id: u32, reason: Option<&str>) -> bool {
        let key = CallKey::new(connection_id, call_id);
        let Some(signal) = self.lock().remove(&key) else {
            return false;
        };
        signal.cancel(reason.unwrap_or(CALL_ABORTED));
        self.pulls.close(&key);
        tracing::debug!(call = %key, "call aborted");
        true
    }

    /// Abort every call of one connection, returning how many there were.
    pub fn close(&self, connection_id: &str) -> usize {
        let aborted: Vec<CancelSignal> = {
            let mut calls = self.lock();
            let keys: Vec<CallKey> = calls
                .keys()
                .filter(|key| &*key.connection_id == connection_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| calls.remove(key)).collect()
        };
        for signal in &aborted {
            signal.cancel(CONNECTION_CLOSED);
        }
        self.pulls.close_connection(connection_id);
        if !aborted.is_empty() {
            tracing::debug!(connection_id, count = aborted.len(), "calls closed");
        }
        aborted.len()
    }

    /// Number of executing calls across all connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of executing calls of one connection.
    pub fn count(&self, connection_id: &str) -> usize {
        self.lock()
            .keys()
            .filter(|key| &*key.connection_id == connection_id)
            .count()
    }

    /// Prepare the pull credit slot of a streaming call.
    pub fn open_pull(&self, connection_id: &str, call_id: u32) {
        self.pulls.open(CallKey::new(connection_id, call_id));
    }

    /// Wait for the client's next pull of a streaming call.
    ///
    /// Resolves as cancelled when the call is aborted meanwhile.
    pub async fn await_pull(&self, connection_id: &str, call_id: u32) -> Result<PullOutcome> {
        let key = CallKey::new(connection_id, call_id);
        let signal = self
            .get(connection_id, call_id)
            .ok_or(CallwireError::CallNotFound(call_id))?;
        self.pulls.await_pull(&key, Some(&signal)).await
    }

    /// Grant the next pull credit to a streaming call.
    pub fn release_pull(&self, connection_id: &str, call_id: u32) -> bool {
        self.pulls.release_pull(&CallKey::new(connection_id, call_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_set_get_delete() {
        let calls = CallRegistry::new();
        let signal = CancelSignal::new();
        calls.set("conn-1", 1, signal.clone());

        assert!(calls.get("conn-1", 1).is_some());
        assert!(calls.get("conn-1", 2).is_none());
        assert!(calls.delete("conn-1", 1));
        assert!(!calls.delete("conn-1", 1));
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_abort_fires_signal_with_reason() {
        let calls = CallRegistry::new();
        let signal = CancelSignal::new();
        calls.set("conn-1", 2, signal.clone());

        assert!(calls.abort("conn-1", 2, None));
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason().as_deref(), Some(CALL_ABORTED));
        assert!(calls.get("conn-1", 2).is_none());

        // Late abort is harmless
        assert!(!calls.abort("conn-1", 2, Some("again")));
    }

    #[test]
    fn test_close_matches_connection_exactly() {
        let calls = CallRegistry::new();
        let one = CancelSignal::new();
        let ten = CancelSignal::new();
        calls.set("conn-1", 1, one.clone());
        calls.set("conn-1", 2, CancelSignal::new());
        calls.set("conn-10", 1, ten.clone());

        assert_eq!(calls.close("conn-1"), 2);
        assert_eq!(one.reason().as_deref(), Some(CONNECTION_CLOSED));
        assert!(!ten.is_cancelled());
        assert_eq!(calls.count("conn-10"), 1);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn test_reused_call_id_aborts_previous() {
        let calls = CallRegistry::new();
        let first = CancelSignal::new();
        calls.set("c", 1, first.clone());
        calls.set("c", 1, CancelSignal::new());

        assert!(first.is_cancelled());
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_releases_pull_wait() {
        let calls = Arc::new(CallRegistry::new());
        calls.set("c", 3, CancelSignal::new());
        calls.open_pull("c", 3);

        let waiter = calls.clone();
        let task = tokio::spawn(async move { waiter.await_pull("c", 3).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        calls.abort("c", 3, None);

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PullOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_release_pull_resumes_producer() {
        let calls = CallRegistry::new();
        calls.set("c", 3, CancelSignal::new());
        calls.open_pull("c", 3);

        assert!(calls.release_pull("c", 3));
        assert_eq!(calls.await_pull("c", 3).await.unwrap(), PullOutcome::Pulled);
    }

    #[tokio::test]
    async fn test_await_pull_unknown_call() {
        let calls = CallRegistry::new();
        assert!(matches!(
            calls.await_pull("c", 9).await,
            Err(CallwireError::CallNotFound(9))
        ));
    }
}
