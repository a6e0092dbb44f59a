//! # Listener Broadcast
//!
//! Typed fan-out of status and change events to registered listeners.
//! Listeners are plain callables registered with an identity handle;
//! the registry is copy-on-write so broadcasting iterates a snapshot without
//! holding any lock, and every listener runs on a spawned task so caller
//! threads never execute listener code and one panicking listener cannot
//! block delivery to the rest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Identity of a registered listener, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A single-event-type broadcaster.
pub struct Broadcaster<E> {
    listeners: RwLock<Arc<Vec<(u64, Listener<E>)>>>,
    next_id: AtomicU64,
    runtime: tokio::runtime::Handle,
}

impl<E: Clone + Send + Sync + 'static> Broadcaster<E> {
    /// Creates a broadcaster bound to the current tokio runtime, which is
    /// where listener invocations are dispatched.
    pub fn new() -> Broadcaster<E> {
        Broadcaster {
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.listeners.write().expect("listener registry poisoned");
        let mut next = guard.as_ref().clone();
        next.push((id, Arc::new(listener)));
        *guard = Arc::new(next);
        ListenerHandle(id)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        let mut guard = self.listeners.write().expect("listener registry poisoned");
        if guard.iter().any(|(id, _)| *id == handle.0) {
            let next = guard
                .iter()
                .filter(|(id, _)| *id != handle.0)
                .cloned()
                .collect::<Vec<_>>();
            *guard = Arc::new(next);
        }
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().expect("listener registry poisoned").is_empty()
    }

    /// Delivers the event to every currently registered listener, each on its
    /// own task.
    pub fn broadcast(&self, event: E) {
        let snapshot = self
            .listeners
            .read()
            .expect("listener registry poisoned")
            .clone();
        if snapshot.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for (_, listener) in snapshot.iter() {
            let listener = listener.clone();
            let event = event.clone();
            self.runtime.spawn(async move {
                listener(event.as_ref());
            });
        }
    }
}

/// A flag's effective configuration may have changed: the flag itself, one of
/// its prerequisites, or a referenced segment was updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChangeEvent {
    pub key: String,
}

/// A watched flag's value changed for a specific context.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagValueChangeEvent {
    pub key: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn delivers_to_all_listeners() {
        let b: Broadcaster<FlagChangeEvent> = Broadcaster::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            b.add_listener(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        b.broadcast(FlagChangeEvent { key: "f".into() });
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn removal_is_by_identity() {
        let b: Broadcaster<FlagChangeEvent> = Broadcaster::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = {
            let hits = hits.clone();
            b.add_listener(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        {
            let hits = hits.clone();
            b.add_listener(move |_| {
                hits.fetch_add(10, Ordering::SeqCst);
            });
        }
        b.remove_listener(h1);
        b.broadcast(FlagChangeEvent { key: "f".into() });
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        // Removing twice is harmless.
        b.remove_listener(h1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let b: Broadcaster<FlagChangeEvent> = Broadcaster::new();
        b.add_listener(|_| panic!("listener blew up"));
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            b.add_listener(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        b.broadcast(FlagChangeEvent { key: "f".into() });
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_listeners_is_a_no_op() {
        let b: Broadcaster<FlagChangeEvent> = Broadcaster::new();
        assert!(!b.has_listeners());
        b.broadcast(FlagChangeEvent { key: "f".into() });
        let _ = b.add_listener(|_| {});
        assert!(b.has_listeners());
    }
}
