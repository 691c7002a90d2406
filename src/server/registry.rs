//! Endpoint → WebSocket handler registry.
//!
//! Written before `serve` starts, read on the I/O thread afterwards. There is
//! deliberately no way to mutate it once the loop owns it; late registration
//! would have to be funnelled through the task queue, and no such API is
//! offered. When the loop takes ownership it binds the registry to the I/O
//! thread, after which every lookup asserts it is running there.

use super::guard::ThreadGuard;
use crate::ws::WebSocketHandler;
use std::collections::HashMap;
use std::sync::Arc;

struct HandlerEntry {
    handler: Arc<dyn WebSocketHandler>,
    allow_cross_origin: bool,
}

/// Immutable-after-setup mapping from endpoint path to handler.
#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    entries: HashMap<String, Arc<HandlerEntry>>,
    guard: Option<ThreadGuard>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        endpoint: impl Into<String>,
        handler: Arc<dyn WebSocketHandler>,
        allow_cross_origin: bool,
    ) {
        self.entries.insert(
            endpoint.into(),
            Arc::new(HandlerEntry {
                handler,
                allow_cross_origin,
            }),
        );
    }

    /// Binds lookups to the I/O thread the guard was captured on.
    pub fn bound_to(mut self, guard: ThreadGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    fn check_thread(&self) {
        if let Some(guard) = &self.guard {
            guard.check();
        }
    }

    /// The handler registered for `endpoint`, if any.
    pub fn handler(&self, endpoint: &str) -> Option<Arc<dyn WebSocketHandler>> {
        self.check_thread();
        self.entries
            .get(endpoint)
            .map(|entry| entry.handler.clone())
    }

    /// Whether `endpoint` accepts cross-origin upgrades. Unknown endpoints
    /// do not.
    pub fn is_cross_origin_allowed(&self, endpoint: &str) -> bool {
        self.check_thread();
        self.entries
            .get(endpoint)
            .is_some_and(|entry| entry.allow_cross_origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Connection;
    use crate::ws::Message;
    use std::thread;

    struct Nop;

    impl WebSocketHandler for Nop {
        fn on_message(&self, _conn: &mut Connection, _message: Message) {}
    }

    #[test]
    fn lookup_distinguishes_absence() {
        let mut registry = HandlerRegistry::new();
        registry.add("/open", Arc::new(Nop), true);
        registry.add("/closed", Arc::new(Nop), false);

        assert!(registry.handler("/open").is_some());
        assert!(registry.handler("/missing").is_none());

        assert!(registry.is_cross_origin_allowed("/open"));
        assert!(!registry.is_cross_origin_allowed("/closed"));
        assert!(!registry.is_cross_origin_allowed("/missing"));
    }

    #[test]
    fn re_adding_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.add("/a", Arc::new(Nop), false);
        registry.add("/a", Arc::new(Nop), true);
        assert!(registry.is_cross_origin_allowed("/a"));
    }

    #[test]
    fn bound_lookups_fail_loudly_off_thread() {
        let mut registry = HandlerRegistry::new();
        registry.add("/a", Arc::new(Nop), true);
        let registry = registry.bound_to(ThreadGuard::new());

        // On the owning thread both lookups work.
        assert!(registry.handler("/a").is_some());
        assert!(registry.is_cross_origin_allowed("/a"));

        let moved = registry.clone();
        let panicked = thread::spawn(move || moved.handler("/a")).join();
        assert!(panicked.is_err(), "handler lookup must panic off-thread");

        let moved = registry.clone();
        let panicked = thread::spawn(move || moved.is_cross_origin_allowed("/a")).join();
        assert!(
            panicked.is_err(),
            "cross-origin lookup must panic off-thread"
        );
    }
}
