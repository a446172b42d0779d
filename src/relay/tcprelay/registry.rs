//! The process-wide Session registry (invariant #6): every live Session is tracked here
//! and removed exactly once at teardown, so an orderly shutdown can walk it to
//! completion. Realized with a `CancellationToken` tree rather than a doubly-linked list
//! of raw Session pointers, since tasks (not callbacks recovering `self` from a watcher
//! pointer) are the async translation's unit of cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct SessionRegistry {
    root: CancellationToken,
    sessions: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    drained: Notify,
}

/// A registered Session's handle: its id and the token that fires when either this
/// Session's own teardown begins or a global shutdown is requested.
pub struct SessionHandle {
    pub id: u64,
    pub shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry {
            root: CancellationToken::new(),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            drained: Notify::new(),
        }
    }

    /// Registers a new Session and returns its id and a cancellation token scoped to it
    /// (child of the global shutdown token).
    pub fn register(&self) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        self.sessions.lock().expect("registry mutex is never held across an await").insert(id, token.clone());
        SessionHandle { id, shutdown: token }
    }

    /// Removes a Session from the registry. Idempotent: deregistering an id twice (e.g.
    /// because both halves independently observed teardown) is a no-op the second time.
    pub fn deregister(&self, id: u64) {
        let mut sessions = self.sessions.lock().expect("registry mutex is never held across an await");
        sessions.remove(&id);
        if sessions.is_empty() {
            self.drained.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry mutex is never held across an await").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every live Session and waits for the registry to drain. Idempotent: a
    /// second call against an already-empty, already-cancelled registry returns
    /// immediately.
    pub async fn shutdown(&self) {
        self.root.cancel();
        while !self.is_empty() {
            let notified = self.drained.notified();
            if self.is_empty() {
                break;
            }
            notified.await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> SessionRegistry {
        SessionRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn register_and_deregister_tracks_count() {
        let registry = Arc::new(SessionRegistry::new());
        let h1 = registry.register();
        let h2 = registry.register();
        assert_eq!(registry.len(), 2);

        registry.deregister(h1.id);
        assert_eq!(registry.len(), 1);

        registry.deregister(h2.id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let h1 = registry.register();
        registry.deregister(h1.id);
        registry.deregister(h1.id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_every_session_token() {
        let registry = Arc::new(SessionRegistry::new());
        let h1 = registry.register();
        let h2 = registry.register();

        let registry_clone = registry.clone();
        let (id1, id2) = (h1.id, h2.id);
        let drain_task = tokio::spawn(async move {
            h1.shutdown.cancelled().await;
            registry_clone.deregister(id1);
        });
        let registry_clone2 = registry.clone();
        let drain_task2 = tokio::spawn(async move {
            h2.shutdown.cancelled().await;
            registry_clone2.deregister(id2);
        });

        registry.shutdown().await;
        drain_task.await.unwrap();
        drain_task2.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_on_empty_registry_returns_immediately() {
        let registry = SessionRegistry::new();
        registry.shutdown().await;
    }
}
