//! Table of requests awaiting a response, keyed by request id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use super::SyncError;
use crate::protocol::{RequestId, ResponseKind, ServerMessage};

struct PendingRequest {
    expected: ResponseKind,
    tx: oneshot::Sender<ServerMessage>,
}

/// Outstanding requests. Responses are matched by id, never by arrival order.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<RequestId, PendingRequest>>,
}

/// Receiving side of one pending request.
pub(crate) struct ResponseWaiter {
    request_id: RequestId,
    rx: oneshot::Receiver<ServerMessage>,
    deadline: Option<Instant>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a request. `limit` of `None` waits until a response arrives or
    /// the connection goes away.
    pub(crate) fn register(
        &self,
        request_id: RequestId,
        expected: ResponseKind,
        limit: Option<Duration>,
    ) -> ResponseWaiter {
        let (tx, rx) = oneshot::channel();
        self.table().insert(request_id, PendingRequest { expected, tx });
        ResponseWaiter {
            request_id,
            rx,
            deadline: limit.map(|d| Instant::now() + d),
        }
    }

    /// Hand a response to its waiter. Returns `false` if nothing was waiting
    /// for it or the kind does not match.
    pub(crate) fn resolve(&self, msg: ServerMessage) -> bool {
        let Some(request_id) = msg.request_id() else {
            return false;
        };
        let mut table = self.table();
        let Some(entry) = table.remove(&request_id) else {
            return false;
        };
        if let Some(kind) = msg.response_kind() {
            if kind != entry.expected {
                log::warn!(
                    "Response {request_id} is {kind:?}, expected {:?}; ignoring",
                    entry.expected
                );
                table.insert(request_id, entry);
                return false;
            }
        }
        drop(table);
        // The waiter may have timed out in the meantime.
        entry.tx.send(msg).is_ok()
    }

    pub(crate) fn cancel(&self, request_id: RequestId) {
        self.table().remove(&request_id);
    }

    /// Drop every outstanding request; their waiters observe a closed
    /// connection.
    pub(crate) fn abandon_all(&self) -> usize {
        let mut table = self.table();
        let count = table.len();
        table.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.table().len()
    }
}

impl ResponseWaiter {
    pub(crate) fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the matching response, bounded by the deadline if any.
    pub(crate) async fn wait(self, table: &PendingRequests) -> Result<ServerMessage, SyncError> {
        let outcome = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    table.cancel(self.request_id);
                    return Err(SyncError::Timeout);
                }
            },
            None => self.rx.await,
        };
        outcome.map_err(|_| SyncError::ConnectionClosed)
    }
}
