//! Credit gate for streaming results.
//!
//! The producer of a streaming result sends one chunk, then waits here for
//! the client's next pull before producing another. Each call has a
//! single-slot credit:
//!
//! - a pull that arrives while nobody waits is stored, never lost;
//! - further pulls while a credit is stored do not accumulate;
//! - closing the slot wakes the waiter so it can observe cancellation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::cancel::CancelSignal;
use crate::error::{CallwireError, Result};

/// Gateway-wide identity of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallKey {
    pub connection_id: Arc<str>,
    pub call_id: u32,
}

impl CallKey {
    pub fn new(connection_id: impl Into<Arc<str>>, call_id: u32) -> Self {
        Self {
            connection_id: connection_id.into(),
            call_id,
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.call_id)
    }
}

/// How a wait for the next pull ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The client granted a credit; produce the next chunk.
    Pulled,
    /// The call was cancelled or its slot closed; stop producing.
    Cancelled,
}

/// Per-call single-slot pull credits.
#[derive(Default)]
pub struct PullCoordinator {
    slots: Mutex<HashMap<CallKey, Arc<Notify>>>,
}

impl PullCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallKey, Arc<Notify>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the credit slot of a streaming call.
    pub fn open(&self, key: CallKey) {
        self.lock().entry(key).or_default();
    }

    pub fn is_open(&self, key: &CallKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Wait for the next pull of `key`.
    ///
    /// Resolves at once when a credit is already stored. Resolves with
    /// [`PullOutcome::Cancelled`] when `signal` fires or the slot closes.
    pub async fn await_pull(
        &self,
        key: &CallKey,
        signal: Option<&CancelSignal>,
    ) -> Result<PullOutcome> {
        let notify = self
            .lock()
            .get(key)
            .cloned()
            .ok_or(CallwireError::CallNotFound(key.call_id))?;

        if signal.is_some_and(CancelSignal::is_cancelled) {
            return Ok(PullOutcome::Cancelled);
        }

        match signal {
            Some(signal) => {
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => return Ok(PullOutcome::Cancelled),
                    _ = notify.notified() => {}
                }
            }
            None => notify.notified().await,
        }

        if self.is_open(key) {
            Ok(PullOutcome::Pulled)
        } else {
            Ok(PullOutcome::Cancelled)
        }
    }

    /// Grant one credit to `key`.
    ///
    /// Returns `false` when the call has no open slot.
    pub fn release_pull(&self, key: &CallKey) -> bool {
        match self.lock().get(key) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Remove the slot of `key`, waking any waiter.
    pub fn close(&self, key: &CallKey) {
        if let Some(notify) = self.lock().remove(key) {
            notify.notify_one();
        }
    }

    /// Remove every slot of one connection.
    pub fn close_connection(&self, connection_id: &str) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|key, notify| {
            if &*key.connection_id == connection_id {
                notify.notify_one();
                false
            } else {
                true
            }
        });
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
