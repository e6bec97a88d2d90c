//! Bounded backpressure queue for requests waiting on an admission slot.
//!
//! Strict FIFO: [`BackpressureQueue::signal_slot_available`] always wakes
//! the head. Each waiter carries its own deadline; expiry removes it from
//! the queue and rejects it with `queue_timeout`. The queue never exceeds
//! its capacity — at capacity, enqueue rejects immediately with
//! `queue_full`. Cancellation is an O(n) scan, which is fine at the sizes
//! this queue runs at.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::ErrorKind;

#[derive(Debug)]
struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<(), ErrorKind>>,
}

#[derive(Debug)]
struct Inner {
    waiters: VecDeque<Waiter>,
    closed: bool,
}

/// A waiter's handle, produced by [`BackpressureQueue::try_enqueue`].
///
/// Await [`PendingSlot::wait`] to block until a slot is granted, the
/// per-entry deadline passes, or the queue is cleared.
#[derive(Debug)]
pub struct PendingSlot<'a> {
    id: u64,
    rx: oneshot::Receiver<Result<(), ErrorKind>>,
    queue: &'a BackpressureQueue,
}

impl PendingSlot<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for a slot, up to `deadline`.
    pub async fn wait(mut self, deadline: Duration) -> Result<(), ErrorKind> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a message — queue was torn down.
            Ok(Err(_)) => Err(ErrorKind::Shutdown),
            Err(_elapsed) => {
                // Deadline hit. If the entry is gone a grant raced the
                // timeout; honor the grant rather than losing the slot.
                if self.queue.remove(self.id) {
                    Err(ErrorKind::QueueTimeout)
                } else {
                    match self.rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ErrorKind::QueueTimeout),
                    }
                }
            }
        }
    }
}

/// Bounded FIFO of admission waiters.
#[derive(Debug)]
pub struct BackpressureQueue {
    max_size: usize,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl BackpressureQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner { waiters: VecDeque::new(), closed: false }),
        }
    }

    /// Join the queue. Rejects with `queue_full` at capacity and with
    /// `shutdown` once the queue is closed.
    pub fn try_enqueue(&self) -> Result<PendingSlot<'_>, ErrorKind> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.closed {
            return Err(ErrorKind::Shutdown);
        }
        if inner.waiters.len() >= self.max_size {
            return Err(ErrorKind::QueueFull);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back(Waiter { id, enqueued_at: Instant::now(), tx });
        Ok(PendingSlot { id, rx, queue: self })
    }

    /// Grant one slot to the head of the queue.
    ///
    /// Waiters whose receiver is already gone (timed out, cancelled) are
    /// skipped so the slot is never wasted on a dead entry.
    pub fn signal_slot_available(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        while let Some(waiter) = inner.waiters.pop_front() {
            let waited = waiter.enqueued_at.elapsed();
            if waiter.tx.send(Ok(())).is_ok() {
                tracing::trace!(id = waiter.id, waited_ms = waited.as_millis() as u64, "queue slot granted");
                return;
            }
        }
    }

    /// Remove and reject a specific waiter. Returns whether it was found.
    pub fn cancel(&self, id: u64) -> bool {
        if self.remove_with(id, |waiter| {
            let _ = waiter.tx.send(Err(ErrorKind::Other));
        }) {
            tracing::trace!(id, "queue entry cancelled");
            true
        } else {
            false
        }
    }

    /// Reject every queued waiter with `reason`.
    pub fn clear(&self, reason: ErrorKind) {
        let drained: Vec<Waiter> = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if reason == ErrorKind::Shutdown {
                inner.closed = true;
            }
            inner.waiters.drain(..).collect()
        };
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(reason));
        }
        if count > 0 {
            tracing::info!(count, reason = %reason, "queue cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove without notifying (used by the timeout path, where the waiter
    /// itself is the one giving up).
    fn remove(&self, id: u64) -> bool {
        self.remove_with(id, |_| {})
    }

    fn remove_with(&self, id: u64, on_removed: impl FnOnce(Waiter)) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == id) {
            let waiter = inner.waiters.remove(pos).expect("position just found");
            drop(inner);
            on_removed(waiter);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_grant_resolves_the_head_waiter() {
        let queue = BackpressureQueue::new(4);
        let pending = queue.try_enqueue().unwrap();
        assert_eq!(queue.len(), 1);

        queue.signal_slot_available();
        assert_eq!(pending.wait(Duration::from_secs(1)).await, Ok(()));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn grants_are_strict_fifo() {
        let queue = BackpressureQueue::new(4);
        let first = queue.try_enqueue().unwrap();
        let second = queue.try_enqueue().unwrap();

        queue.signal_slot_available();
        // Only the head resolved; the second waiter is still queued.
        assert_eq!(first.wait(Duration::from_millis(100)).await, Ok(()));
        assert_eq!(queue.len(), 1);

        queue.signal_slot_available();
        assert_eq!(second.wait(Duration::from_millis(100)).await, Ok(()));
    }

    #[tokio::test]
    async fn enqueue_rejects_at_capacity() {
        let queue = BackpressureQueue::new(2);
        let _a = queue.try_enqueue().unwrap();
        let _b = queue.try_enqueue().unwrap();
        match queue.try_enqueue() {
            Err(ErrorKind::QueueFull) => {}
            other => panic!("expected queue_full, got {other:?}"),
        }
        assert_eq!(queue.len(), 2, "depth never exceeds max_size");
    }

    #[tokio::test]
    async fn waiter_times_out_and_leaves_the_queue() {
        let queue = BackpressureQueue::new(2);
        let pending = queue.try_enqueue().unwrap();
        let outcome = pending.wait(Duration::from_millis(20)).await;
        assert_eq!(outcome, Err(ErrorKind::QueueTimeout));
        assert!(queue.is_empty(), "timed-out entry must be removed");
    }

    #[tokio::test]
    async fn grant_skips_dead_entries() {
        let queue = BackpressureQueue::new(4);
        let dead = queue.try_enqueue().unwrap();
        let live = queue.try_enqueue().unwrap();
        drop(dead.rx); // simulate a cancelled waiter whose future was dropped
        queue.remove(dead.id);

        queue.signal_slot_available();
        assert_eq!(live.wait(Duration::from_millis(100)).await, Ok(()));
    }

    #[tokio::test]
    async fn clear_rejects_all_with_reason() {
        let queue = BackpressureQueue::new(4);
        let a = queue.try_enqueue().unwrap();
        let b = queue.try_enqueue().unwrap();

        queue.clear(ErrorKind::Shutdown);
        assert_eq!(a.wait(Duration::from_millis(100)).await, Err(ErrorKind::Shutdown));
        assert_eq!(b.wait(Duration::from_millis(100)).await, Err(ErrorKind::Shutdown));

        // A shutdown clear also closes the queue for new entries.
        match queue.try_enqueue() {
            Err(ErrorKind::Shutdown) => {}
            other => panic!("expected shutdown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_removes_a_specific_entry() {
        let queue = BackpressureQueue::new(4);
        let a = queue.try_enqueue().unwrap();
        let b = queue.try_enqueue().unwrap();

        assert!(queue.cancel(a.id()));
        assert_eq!(queue.len(), 1);
        assert!(!queue.cancel(a.id()), "already gone");

        queue.signal_slot_available();
        assert_eq!(b.wait(Duration::from_millis(100)).await, Ok(()));
    }
}
