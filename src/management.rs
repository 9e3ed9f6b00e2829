//! Request/response correlation for the management stream.
//!
//! Outbound requests are tagged with a fresh correlation id and parked here
//! until the matching `response` frame arrives. Ids are monotonically
//! increasing and never reused; a response consumes its entry at most once,
//! and late or duplicate responses are dropped silently.

use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::error::{PanelLinkError, Result};
use crate::models::{Envelope, StreamKind};

/// Outstanding management requests keyed by correlation id.
#[derive(Default)]
pub(crate) struct PendingRequests {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<JsonValue>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh correlation id and park a result slot for it.
    pub fn register(&mut self) -> (u64, oneshot::Receiver<Result<JsonValue>>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Resolve the request with `id`, consuming its entry.
    ///
    /// Returns false when no entry exists (late or duplicate response).
    pub fn complete(&mut self, id: u64, result: Result<JsonValue>) -> bool {
        match self.pending.remove(&id) {
            Some(tx) => {
                // The caller may have stopped waiting (e.g. its own timeout);
                // a failed send is fine.
                let _ = tx.send(result);
                true
            },
            None => false,
        }
    }

    /// Drop the entry for `id` without resolving it (caller gave up).
    pub fn forget(&mut self, id: u64) {
        self.pending.remove(&id);
    }

    /// Fail every outstanding request with clones of `error`.
    ///
    /// Called in the same step that handles a disconnect, so no request is
    /// ever left unresolved across a connection loss.
    pub fn fail_all(&mut self, error: PanelLinkError) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Route an inbound `response` payload (`{id, data}` or
    /// `{id, error: {code, message}}`) to its pending entry.
    pub fn handle_response(&mut self, data: &JsonValue) -> bool {
        let Some(id) = data.get("id").and_then(|v| v.as_u64()) else {
            log::warn!("[panel-link] Management response without a usable id, dropping");
            return false;
        };

        let result = match data.get("error") {
            Some(err) => Err(PanelLinkError::RemoteError {
                code: err
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                message: err
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            None => Ok(data.get("data").cloned().unwrap_or(JsonValue::Null)),
        };

        let matched = self.complete(id, result);
        if !matched {
            log::debug!("[panel-link] No pending management request for id {}, dropping", id);
        }
        matched
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Build the outbound `request` envelope for the management stream.
pub(crate) fn request_envelope(id: u64, method: &str, params: JsonValue) -> Envelope {
    Envelope::command_with_data(
        StreamKind::Management,
        "request",
        json!({
            "id": id,
            "method": method,
            "params": params,
        }),
    )
}
