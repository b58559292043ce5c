// ABOUTME: Unbounded FIFO of pending ChangeEvents, many producers / one consumer
// ABOUTME: Producers never block; the consumer parks on a Notify with a poll timeout

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::event::ChangeEvent;

/// Process-lifetime queue of pending replication work.
///
/// Global FIFO order is preserved, which implies the per-entity ordering
/// the applier depends on (an Update is never applied before the Insert
/// that created its row). Retries re-enter at the tail.
#[derive(Debug, Default)]
pub struct OperationQueue {
    inner: Mutex<VecDeque<ChangeEvent>>,
    notify: Notify,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail. Never blocks, never rejects.
    pub fn enqueue(&self, event: ChangeEvent) {
        self.inner.lock().unwrap().push_back(event);
        self.notify.notify_one();
    }

    /// Remove and return the head, waiting up to `timeout` for an item
    /// when the queue is empty. Returns None when the interval elapses.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        if let Some(event) = self.try_dequeue() {
            return Some(event);
        }
        // A permit stored between the check above and this await is picked
        // up immediately, so an enqueue cannot be missed.
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.try_dequeue()
    }

    /// Non-blocking head removal.
    pub fn try_dequeue(&self) -> Option<ChangeEvent> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
