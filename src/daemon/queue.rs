//! FIFO hand-off between the acceptor and the single inference worker.

use crate::protocol::Envelope;
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::sync::{Condvar, Mutex, MutexGuard};

/// A fully read message together with the connection it arrived on.
#[derive(Debug)]
pub struct PendingRequest {
    pub connection: UnixStream,
    pub envelope: Envelope,
}

/// What the worker can pull off the queue.
#[derive(Debug)]
pub enum QueueEntry {
    Request(PendingRequest),
    /// Reserved entry pushed during shutdown to wake a blocked worker.
    Wake,
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    running: bool,
}

/// Requests waiting for the worker, oldest first.
pub struct RequestQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    /// An empty, running queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                running: true,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a request and wake the worker.
    pub fn push(&self, request: PendingRequest) {
        self.push_entry(QueueEntry::Request(request));
    }

    /// Append a wake entry so a blocked `pop` returns.
    pub fn push_wake(&self) {
        self.push_entry(QueueEntry::Wake);
    }

    fn push_entry(&self, entry: QueueEntry) {
        let mut state = self.lock();
        state.entries.push_back(entry);
        self.available.notify_one();
    }

    /// Block until an entry is available or the queue is stopped.
    ///
    /// Returns `None` once stopped, even if entries remain; those are
    /// dropped with the queue and their connections close.
    pub fn pop(&self) -> Option<QueueEntry> {
        let mut state = self.lock();
        while state.entries.is_empty() && state.running {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if !state.running {
            return None;
        }
        state.entries.pop_front()
    }

    /// Flip the running flag and wake every waiter.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.running = false;
        self.available.notify_all();
    }

    /// False once `stop` has been called.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Number of queued entries, wake entries included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn request(text: &str) -> PendingRequest {
        let (connection, _peer) = UnixStream::pair().unwrap();
        PendingRequest {
            connection,
            envelope: Envelope::prompt(text),
        }
    }

    fn prompt_of(entry: Option<QueueEntry>) -> String {
        match entry {
            Some(QueueEntry::Request(r)) => r.envelope.prompt_text(),
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = RequestQueue::new();
        queue.push(request("first"));
        queue.push(request("second"));
        assert_eq!(queue.len(), 2);
        assert_eq!(prompt_of(queue.pop()), "first");
        assert_eq!(prompt_of(queue.pop()), "second");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wake_entry_is_delivered() {
        let queue = RequestQueue::new();
        queue.push_wake();
        assert!(matches!(queue.pop(), Some(QueueEntry::Wake)));
    }

    #[test]
    fn test_blocked_worker_wakes_on_push() {
        let queue = Arc::new(RequestQueue::new());
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || prompt_of(queue.pop()))
        };
        thread::sleep(Duration::from_millis(50));
        queue.push(request("late"));
        assert_eq!(worker.join().unwrap(), "late");
    }

    #[test]
    fn test_blocked_worker_wakes_on_stop() {
        let queue = Arc::new(RequestQueue::new());
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop().is_none())
        };
        thread::sleep(Duration::from_millis(50));
        queue.stop();
        assert!(worker.join().unwrap());
        assert!(!queue.is_running());
    }

    #[test]
    fn test_stopped_queue_yields_nothing() {
        let queue = RequestQueue::new();
        queue.push(request("pending"));
        queue.stop();
        queue.push_wake();
        assert!(queue.pop().is_none());
    }
}
