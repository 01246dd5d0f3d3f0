//! Typed listener registry.
//!
//! Each component owns an `Emitter<E>` for its own closed event enum.
//! Listeners are registered per kind and removed by the `ListenerId` returned
//! at registration, so transient one-shot listeners can be attached and
//! detached without touching anybody else's.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// An event that can be routed by kind.
pub trait Dispatchable: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`Emitter::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Dispatch table from event kind to listeners.
pub struct Emitter<E: Dispatchable> {
    table: Mutex<HashMap<E::Kind, Vec<(ListenerId, Handler<E>)>>>,
    next_id: AtomicU64,
}

impl<E: Dispatchable> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Dispatchable> Emitter<E> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<E::Kind, Vec<(ListenerId, Handler<E>)>>> {
        // A panicking listener never runs under this lock, so poisoning can
        // only come from a bug in this module; the table itself stays consistent.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut table = self.table();
        for listeners in table.values_mut() {
            if let Some(pos) = listeners.iter().position(|(lid, _)| *lid == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove several listeners, returning how many were still registered.
    pub fn off_all(&self, ids: &[ListenerId]) -> usize {
        ids.iter().filter(|id| self.off(**id)).count()
    }

    /// Deliver an event to every listener of its kind, in registration order.
    ///
    /// Listeners run outside the table lock so they may register or remove
    /// listeners themselves.
    pub fn emit(&self, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = self
            .table()
            .get(&event.kind())
            .map(|listeners| listeners.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.table().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn total_listeners(&self) -> usize {
        self.table().values().map(Vec::len).sum()
    }
}

impl<E: Dispatchable> Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.total_listeners())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    struct Event(Kind);

    impl Dispatchable for Event {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            self.0
        }
    }

    #[test]
    fn test_emit_routes_by_kind() {
        let emitter = Emitter::<Event>::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = pings.clone();
        emitter.on(Kind::Ping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(emitter.emit(&Event(Kind::Ping)), 1);
        assert_eq!(emitter.emit(&Event(Kind::Pong)), 0);
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_only_that_listener() {
        let emitter = Emitter::<Event>::new();
        let a = emitter.on(Kind::Ping, |_| {});
        let _b = emitter.on(Kind::Ping, |_| {});

        assert!(emitter.off(a));
        assert!(!emitter.off(a));
        assert_eq!(emitter.listener_count(Kind::Ping), 1);
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let emitter = Arc::new(Emitter::<Event>::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let em = emitter.clone();
        let s = slot.clone();
        let id = emitter.on(Kind::Ping, move |_| {
            if let Some(id) = s.lock().unwrap().take() {
                em.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        assert_eq!(emitter.emit(&Event(Kind::Ping)), 1);
        assert_eq!(emitter.emit(&Event(Kind::Ping)), 0);
    }

    #[test]
    fn test_off_all_counts_removed() {
        let emitter = Emitter::<Event>::new();
        let ids = vec![emitter.on(Kind::Ping, |_| {}), emitter.on(Kind::Pong, |_| {})];
        assert_eq!(emitter.off_all(&ids), 2);
        assert_eq!(emitter.off_all(&ids), 0);
        assert_eq!(emitter.total_listeners(), 0);
    }
}
