//! Cross-thread task injection.
//!
//! A mutex-guarded FIFO drained on the I/O thread at the top of every loop
//! iteration, before the readiness wait. Pushing is cheap and callable from
//! any thread; the caller is responsible for poking the wakeup pipe so a
//! parked loop notices.

use super::EventLoop;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A deferred action injected from any thread, run on the I/O thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue entries: host-supplied tasks, or internal control actions that need
/// the loop itself (the stats snapshot uses this).
pub(crate) enum Queued {
    User(Task),
    Control(Box<dyn FnOnce(&mut EventLoop) + Send + 'static>),
}

#[derive(Default)]
pub(crate) struct TaskQueue {
    inner: Mutex<VecDeque<Queued>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task. Safe from any thread; FIFO per submitting thread.
    pub fn push(&self, task: Queued) {
        self.inner.lock().push_back(task);
    }

    /// Pops the oldest task, if any.
    ///
    /// The drain loop calls this repeatedly and runs each task with the
    /// mutex released, so tasks may themselves push more tasks.
    pub fn pop(&self) -> Option<Queued> {
        self.inner.lock().pop_front()
    }
}
