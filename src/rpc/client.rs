//! Client-side table of calls awaiting their response.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::ProtocolError;
use crate::ids::IdGenerator;

/// Settles the caller's future.
pub type Responder<T> = oneshot::Sender<Result<T, ProtocolError>>;

struct PendingCall<T> {
    procedure: String,
    tx: Responder<T>,
}

struct Table<T> {
    calls: HashMap<u32, PendingCall<T>>,
    ids: IdGenerator,
}

/// Calls issued on one connection that have not been settled yet.
///
/// Ids are allocated from 1 upwards and never collide with a live call.
pub struct PendingCalls<T> {
    table: Mutex<Table<T>>,
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self {
            table: Mutex::new(Table {
                calls: HashMap::new(),
                ids: IdGenerator::default(),
            }),
        }
    }
}

impl<T> PendingCalls<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table<T>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a call id and the receiver its response will arrive on.
    ///
    /// Returns `None` only when every id is in use.
    pub fn register(
        &self,
        procedure: &str,
    ) -> Option<(u32, oneshot::Receiver<Result<T, ProtocolError>>)> {
        let mut table = self.lock();
        let Table { calls, ids } = &mut *table;
        let call_id = ids.next_unused(|id| calls.contains_key(&id))?;
        let (tx, rx) = oneshot::channel();
        calls.insert(
            call_id,
            PendingCall {
                procedure: procedure.to_string(),
                tx,
            },
        );
        Some((call_id, rx))
    }

    /// Settle a call successfully. Returns `false` for an unknown call.
    pub fn resolve(&self, call_id: u32, value: T) -> bool {
        match self.lock().calls.remove(&call_id) {
            Some(call) => {
                tracing::trace!(call_id, procedure = %call.procedure, "call resolved");
                let _ = call.tx.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Settle a call with an error. Returns `false` for an unknown call.
    pub fn reject(&self, call_id: u32, error: ProtocolError) -> bool {
        match self.lock().calls.remove(&call_id) {
            Some(call) => {
                tracing::debug!(call_id, procedure = %call.procedure, %error, "call rejected");
                let _ = call.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Forget a call without settling it.
    pub fn remove(&self, call_id: u32) -> bool {
        self.lock().calls.remove(&call_id).is_some()
    }

    pub fn contains(&self, call_id: u32) -> bool {
        self.lock().calls.contains_key(&call_id)
    }

    /// Procedure name of a pending call.
    pub fn procedure(&self, call_id: u32) -> Option<String> {
        self.lock()
            .calls
            .get(&call_id)
            .map(|call| call.procedure.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().calls.is_empty()
    }

    /// Reject every pending call with `error` and restart ids from 1.
    ///
    /// Returns the ids that were rejected.
    pub fn close(&self, error: &ProtocolError) -> Vec<u32> {
        let drained: Vec<(u32, PendingCall<T>)> = {
            let mut table = self.lock();
            table.ids.reset();
            table.calls.drain().collect()
        };
        let mut ids = Vec::with_capacity(drained.len());
        for (id, call) in drained {
            let _ = call.tx.send(Err(error.clone()));
            ids.push(id);
        }
        ids.sort_unstable();
        ids
    }
}
