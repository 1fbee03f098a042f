//! Client-side table of calls awaiting a response.

use std::collections::HashMap;

use bytes::Bytes;
use knot_network::CorrelationId;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::CallError;

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<Vec<Value>, CallError>;

/// Correlation id to one-shot waiter.
#[derive(Debug, Default)]
pub struct PendingCalls {
    waiters: RwLock<HashMap<CorrelationId, oneshot::Sender<CallResult>>>,
}

impl PendingCalls {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`.
    ///
    /// An older waiter under the same id (left behind after the counter
    /// wrapped) is replaced and sees its call closed.
    pub fn insert(&self, correlation_id: CorrelationId) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.write().insert(correlation_id, tx).is_some() {
            debug!(correlation_id, "replaced stale pending call");
        }
        rx
    }

    /// Hand a response body to the waiter for `correlation_id`.
    ///
    /// Returns `false` if nothing is waiting for that id.
    pub fn resolve(&self, correlation_id: CorrelationId, body: &Bytes) -> bool {
        if !self.waiters.read().contains_key(&correlation_id) {
            return false;
        }

        let result = if body.is_empty() {
            // Also what an oversized reply looks like on the wire.
            debug!(correlation_id, "empty response body, resolving with no results");
            Ok(Vec::new())
        } else {
            serde_json::from_slice(body).map_err(CallError::MalformedResponse)
        };

        let Some(waiter) = self.waiters.write().remove(&correlation_id) else {
            return false;
        };
        // The caller may have given up in the meantime.
        let _ = waiter.send(result);
        true
    }

    /// Drop the waiter for `correlation_id` without answering it.
    pub fn cancel(&self, correlation_id: CorrelationId) {
        self.waiters.write().remove(&correlation_id);
    }

    /// Close every outstanding waiter. Returns how many there were.
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = self.waiters.write().drain().collect();
        let count = drained.len();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(CallError::Closed));
        }
        count
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.read().len()
    }

    /// Whether no calls are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.read().is_empty()
    }
}
