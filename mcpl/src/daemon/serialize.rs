//! Optional per-server serialization of in-flight requests.
//!
//! When a server is configured with `serialize=true`, session requests pass
//! through this queue instead of going straight to stdin. The worker admits
//! one request at a time and blocks until the dispatcher observes its
//! response (or the server crashes and the waiter is released), so the
//! server never sees overlapping requests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};

use crate::daemon::server::ManagedServer;

/// A queued request: the line to write and the signal its response fires.
pub(crate) struct QueueEntry {
    /// The request's global ID (doubles as the cancellation handle).
    pub global_id: u64,
    /// Serialized message, without trailing newline.
    pub line: String,
    /// Resolved by `signal_serialize_waiter` when the response is routed,
    /// or by waiter draining on crash/shutdown.
    pub waiter: oneshot::Receiver<()>,
    cancelled: bool,
}

/// FIFO queue with pre-execution cancellation and prompt close.
///
/// Notifications bypass the queue entirely; only requests are enqueued.
#[derive(Debug, Default)]
pub(crate) struct SerializeQueue {
    queue: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    closed: AtomicBool,
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("global_id", &self.global_id)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl SerializeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Returns `false` if the queue is closed (the caller
    /// must discard the waiter it registered).
    pub fn enqueue(&self, global_id: u64, line: String, waiter: oneshot::Receiver<()>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.queue
            .lock()
            .expect("serialize queue lock poisoned")
            .push_back(QueueEntry {
                global_id,
                line,
                waiter,
                cancelled: false,
            });
        self.notify.notify_one();
        true
    }

    /// Mark the entry for `global_id` cancelled, if it has not begun
    /// executing. Returns whether an entry was found.
    pub fn cancel(&self, global_id: u64) -> bool {
        let mut queue = self.queue.lock().expect("serialize queue lock poisoned");
        for entry in queue.iter_mut() {
            if entry.global_id == global_id {
                entry.cancelled = true;
                return true;
            }
        }
        false
    }

    /// Close the queue: pending entries are discarded by the worker and new
    /// enqueues are refused.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next non-discarded entry, or `None` once closed.
    async fn next(&self) -> Option<QueueEntry> {
        loop {
            if self.is_closed() {
                return None;
            }
            {
                let mut queue = self.queue.lock().expect("serialize queue lock poisoned");
                if let Some(entry) = queue.pop_front() {
                    return Some(entry);
                }
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .expect("serialize queue lock poisoned")
            .len()
    }
}

/// Worker loop: one in-flight request at a time.
///
/// Cancelled entries are skipped (their waiters discarded). A failed stdin
/// write abandons the entry rather than blocking on a response that cannot
/// arrive.
pub(crate) async fn run_queue_worker(server: Arc<ManagedServer>) {
    let Some(queue) = server.serialize_queue() else {
        return;
    };
    while let Some(entry) = queue.next().await {
        if entry.cancelled {
            server.take_waiter(entry.global_id);
            tracing::debug!(
                server = %server.name(),
                global_id = entry.global_id,
                "skipping cancelled serialized request"
            );
            continue;
        }
        match server.write_to_stdin(&entry.line).await {
            Ok(()) => {
                // Block until the response is routed back, or the waiter is
                // drained because the server died.
                let _ = entry.waiter.await;
            }
            Err(e) => {
                tracing::warn!(
                    server = %server.name(),
                    global_id = entry.global_id,
                    error = %e,
                    "serialized write failed"
                );
                server.take_waiter(entry.global_id);
            }
        }
    }
    tracing::debug!(server = %server.name(), "serialize queue worker exited");
}
