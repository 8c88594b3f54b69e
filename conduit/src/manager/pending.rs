//! Pending-request bookkeeping for process connections.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::McpError;

/// Continuation parked until a matching correlation id is observed.
pub(crate) type Settle = oneshot::Sender<Result<Value, McpError>>;

/// Correlation table for one process connection.
///
/// Mutated only by the facade when issuing a call and by the owning
/// connection's reader task when dispatching or draining.
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<HashMap<String, Settle>>,
}

impl PendingTable {
    /// Register a continuation. Reuse of an id still pending is rejected.
    pub(crate) async fn insert(&self, id: String, tx: Settle) -> Result<(), McpError> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(&id) {
            return Err(McpError::DuplicateRequestId(id));
        }
        inner.insert(id, tx);
        Ok(())
    }

    pub(crate) async fn remove(&self, id: &str) -> Option<Settle> {
        self.inner.lock().await.remove(id)
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Reject every outstanding request with a caller-supplied error.
    pub(crate) async fn drain(&self, mut make_err: impl FnMut() -> McpError) {
        let drained = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut *inner)
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
    }
}
