//! I/O-thread ownership guard.
//!
//! Everything except `schedule` and `terminate` belongs to the thread that
//! called `serve`. Calling a guarded operation from anywhere else is a
//! programming error in the host application, and silently corrupting the
//! connection table would be far worse than stopping: the guard logs at
//! error level and panics.

use std::thread::{self, ThreadId};
use tracing::error;

/// Violation raised when a guarded operation runs off the I/O thread.
#[derive(Debug, thiserror::Error)]
#[error("called on thread {actual:?} instead of the I/O thread {owner:?}")]
pub(crate) struct WrongThread {
    owner: ThreadId,
    actual: ThreadId,
}

/// Captures the I/O thread identity at `serve` entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadGuard {
    owner: ThreadId,
}

impl ThreadGuard {
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
        }
    }

    pub fn try_check(&self) -> Result<(), WrongThread> {
        let actual = thread::current().id();
        if actual == self.owner {
            Ok(())
        } else {
            Err(WrongThread {
                owner: self.owner,
                actual,
            })
        }
    }

    /// Panics (after logging) if called off the owning thread.
    pub fn check(&self) {
        if let Err(violation) = self.try_check() {
            error!("{violation}");
            panic!("{violation}");
        }
    }
}
