use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use remote_acp_error::RemoteAcpError;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::frame::RequestId;

pub(crate) type CallOutcome = Result<Value, RemoteAcpError>;

/// Outstanding requests on one connection, keyed by request id.
///
/// Ids come from a single counter and are never reused, so a late response
/// can only ever match the call it was meant for, or nothing.
#[derive(Debug)]
pub(crate) struct PendingCalls {
    next_id: AtomicU64,
    state: Mutex<PendingState>,
}

#[derive(Debug, Default)]
struct PendingState {
    closed: Option<RemoteAcpError>,
    calls: HashMap<RequestId, PendingEntry>,
}

#[derive(Debug)]
struct PendingEntry {
    method: String,
    registered_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(PendingState::default()),
        }
    }

    pub(crate) fn register(
        &self,
        method: &str,
    ) -> Result<(RequestId, oneshot::Receiver<CallOutcome>), RemoteAcpError> {
        let mut state = self.lock();
        if let Some(error) = &state.closed {
            return Err(error.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        state.calls.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                registered_at: Instant::now(),
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Delivers `outcome` to the call registered under `id`. Returns false
    /// when no such call exists (late, duplicate or foreign response).
    pub(crate) fn resolve(&self, id: RequestId, outcome: CallOutcome) -> bool {
        let entry = self.lock().calls.remove(&id);
        let Some(entry) = entry else {
            return false;
        };
        tracing::debug!(
            id = id,
            method = %entry.method,
            elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "pending call resolved"
        );
        // The caller may have given up between removal and send.
        let _ = entry.tx.send(outcome);
        true
    }

    /// Removes the entry without resolving it. Idempotent.
    pub(crate) fn cancel(&self, id: RequestId) -> bool {
        self.lock().calls.remove(&id).is_some()
    }

    /// Fails every outstanding call and refuses new registrations.
    pub(crate) fn fail_all(&self, error: RemoteAcpError) -> usize {
        let drained = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(error.clone());
            }
            state.calls.drain().collect::<Vec<_>>()
        };
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<RequestId> {
        let mut ids = self.lock().calls.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the pending entry when a call future is dropped before it
/// resolves (timeout, session close, caller abandonment).
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: RequestId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingCalls, id: RequestId) -> Self {
        Self { pending, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.cancel(self.id) {
            tracing::debug!(id = self.id, "pending call abandoned");
        }
    }
}
