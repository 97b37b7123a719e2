//! Client role: correlated requests with bounded retransmission.
//!
//! Each request gets a fresh message id and exactly one waiter. A retry
//! resends the identical frame, same id included, so the responder's
//! duplicate detection can recognize it. Once a request fails its waiter
//! is removed and any late response is dropped by the dispatch loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tracing::trace;

use crate::core::frame::Frame;

/// Retransmission schedule for one request: `retry_times` resends after
/// the first attempt, each armed with `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct RequestRetry {
    pub retry_times: u32,
    pub timeout: Duration,
}

impl RequestRetry {
    pub fn new(retry_times: u32, timeout: Duration) -> Self {
        Self {
            retry_times,
            timeout,
        }
    }

    /// Total send attempts including the first.
    pub fn attempts(&self) -> u32 {
        self.retry_times + 1
    }
}

impl Default for RequestRetry {
    fn default() -> Self {
        Self {
            retry_times: 2,
            timeout: Duration::from_millis(1000),
        }
    }
}

struct PendingRequest {
    resp_type: i32,
    tx: oneshot::Sender<Frame>,
}

/// Outstanding-request table for one endpoint.
pub(crate) struct ClientManager {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingRequest>>,
}

impl ClientManager {
    pub(crate) fn new() -> Self {
        // Random seed so ids do not collide across process restarts.
        let seed: i64 = rand::rng().random();
        Self {
            next_id: AtomicI64::new(seed),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn next_message_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register the single waiter for `message_id`.
    pub(crate) fn register_waiter(
        &self,
        message_id: i64,
        resp_type: i32,
    ) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(message_id, PendingRequest { resp_type, tx });
        rx
    }

    /// Try to complete a pending request with an inbound frame. Returns
    /// whether the frame was consumed as a response.
    pub(crate) fn complete(&self, frame: Frame) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let matches = pending
            .get(&frame.message_id)
            .is_some_and(|p| p.resp_type == frame.frame_type);
        if !matches {
            return false;
        }
        if let Some(p) = pending.remove(&frame.message_id) {
            trace!(message_id = frame.message_id, frame_type = frame.frame_type, "Response correlated");
            // Waiter may have timed out between checks; drop is fine.
            let _ = p.tx.send(frame);
        }
        true
    }

    /// Drop the waiter for a request that failed locally.
    pub(crate) fn remove_waiter(&self, message_id: i64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn completes_only_matching_type_and_id() {
        let manager = ClientManager::new();
        let mut rx = manager.register_waiter(10, 1);

        assert!(!manager.complete(Frame::new(1, 11, Bytes::new())));
        assert!(!manager.complete(Frame::new(3, 10, Bytes::new())));
        assert!(manager.complete(Frame::new(1, 10, Bytes::new())));
        assert_eq!(rx.try_recv().unwrap().message_id, 10);

        // Consumed; a second identical response is dropped.
        assert!(!manager.complete(Frame::new(1, 10, Bytes::new())));
    }

    #[test]
    fn removed_waiters_drop_late_responses() {
        let manager = ClientManager::new();
        let _rx = manager.register_waiter(5, 1);
        manager.remove_waiter(5);
        assert!(!manager.complete(Frame::new(1, 5, Bytes::new())));
    }

    #[test]
    fn message_ids_are_distinct() {
        let manager = ClientManager::new();
        let a = manager.next_message_id();
        let b = manager.next_message_id();
        assert_ne!(a, b);
    }
}
