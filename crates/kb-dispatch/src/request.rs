//! Request/reply correlation for `SignalSlotable::request` (spec §4.6).
//!
//! Each outstanding request is tracked by a UUID correlation id carried in
//! the envelope header (`replyTo`). A background reaper cancels requests
//! that outlive their deadline with `ErrorCode::TimedOut`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kb_common::{ErrorCode, Hash, KaraboError, Result};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

struct Pending {
    responder: oneshot::Sender<Result<(Hash, Hash)>>,
    deadline: Instant,
}

/// Tracks in-flight `request()` calls keyed by correlation id.
#[derive(Clone)]
pub struct PendingRequests {
    inner: Arc<DashMap<Uuid, Pending>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self { inner: Arc::new(DashMap::new()) }
    }

    /// Register a new pending request, returning its correlation id and a
    /// future that resolves with the reply or a timeout error.
    pub fn register(&self, timeout: Duration) -> (Uuid, impl std::future::Future<Output = Result<(Hash, Hash)>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.insert(id, Pending { responder: tx, deadline: Instant::now() + timeout });
        let fut = async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(KaraboError::new(ErrorCode::OperationCanceled, "request dropped before reply")),
            }
        };
        (id, fut)
    }

    /// Deliver a reply for `id`, if it is still pending.
    pub fn complete(&self, id: Uuid, header: Hash, body: Hash) {
        if let Some((_, pending)) = self.inner.remove(&id) {
            let _ = pending.responder.send(Ok((header, body)));
        }
    }

    /// Cancel every request whose deadline has passed, waking each with a
    /// `TimedOut` error. Meant to be polled periodically by the owner.
    pub fn expire_overdue(&self) {
        let now = Instant::now();
        let overdue: Vec<Uuid> = self.inner.iter().filter(|e| e.deadline <= now).map(|e| *e.key()).collect();
        for id in overdue {
            if let Some((_, pending)) = self.inner.remove(&id) {
                let _ = pending.responder.send(Err(KaraboError::new(ErrorCode::TimedOut, "request timed out")));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_the_waiting_future() {
        let pending = PendingRequests::new();
        let (id, fut) = pending.register(Duration::from_secs(5));
        let mut reply_body = Hash::new();
        reply_body.set("ok", true);
        pending.complete(id, Hash::new(), reply_body.clone());
        let (_, body) = fut.await.unwrap();
        assert!(body.fully_equals(&reply_body));
    }

    #[tokio::test]
    async fn expire_overdue_times_out_unanswered_requests() {
        let pending = PendingRequests::new();
        let (_, fut) = pending.register(Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(5)).await;
        pending.expire_overdue();
        let result = fut.await;
        assert_eq!(result.unwrap_err().code, ErrorCode::TimedOut);
    }

    #[tokio::test]
    async fn completing_an_unknown_id_is_a_no_op() {
        let pending = PendingRequests::new();
        pending.complete(Uuid::new_v4(), Hash::new(), Hash::new());
        assert_eq!(pending.pending_count(), 0);
    }
}
