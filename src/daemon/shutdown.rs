//! One-shot shutdown coordination.
//!
//! The request to stop arrives on the worker thread, and tearing down joins
//! that same worker, so the teardown always runs on its own detached thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, error};

#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    begun: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a teardown has been started.
    pub fn is_shutting_down(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    /// Start `teardown` on a detached thread unless a shutdown has already
    /// begun. Returns whether this call started it.
    pub fn trigger<F>(&self, teardown: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .begun
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already in progress");
            return false;
        }

        match thread::Builder::new()
            .name("llxd-shutdown".to_string())
            .spawn(teardown)
        {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to spawn shutdown thread: {}", e);
                self.begun.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}
