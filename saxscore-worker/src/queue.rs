//! Job admission queue
//!
//! FIFO buffer of job ids shared between the admission path (producers) and
//! the worker loop (single consumer). It stores identifiers only and never
//! touches the database.
//!
//! The queue does not deduplicate: enqueueing an id twice yields two
//! dequeues. The worker claims a job with a `queued → processing` status
//! compare-and-set, so a stale duplicate is skipped rather than run twice.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<VecDeque<Uuid>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail
    pub fn enqueue(&self, job_id: Uuid) {
        let depth = {
            let mut queue = self.lock();
            queue.push_back(job_id);
            queue.len()
        };
        tracing::debug!(job_id = %job_id, depth, "Job enqueued");
    }

    /// Remove and return the head, or `None` if the queue is empty. Never blocks on I/O.
    pub fn try_dequeue(&self) -> Option<Uuid> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queued ids, head first
    pub fn snapshot(&self) -> Vec<Uuid> {
        self.lock().iter().copied().collect()
    }

    // A panic while holding the lock cannot leave the deque half-modified,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Uuid>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
