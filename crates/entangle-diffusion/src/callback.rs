//! Engine callbacks
//!
//! Callbacks are invoked in registration order, outside every engine lock.
//! A panicking callback is logged and skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use entangle_core::{panic_message, ResourceId};

use crate::ResourceRecord;

/// Event kinds a callback can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FileChanged,
    Propagation,
}

/// Event delivered to callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A resource's fingerprint changed; carries the record after the update
    FileChanged { record: ResourceRecord },
    /// The change signal crossed the edge `from`–`to`
    Propagation {
        origin: ResourceId,
        from: ResourceId,
        to: ResourceId,
        probability: f64,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::FileChanged { .. } => EventKind::FileChanged,
            EngineEvent::Propagation { .. } => EventKind::Propagation,
        }
    }
}

/// Handle returned by `add_callback`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

pub type Callback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Ordered callback list
#[derive(Default)]
pub struct CallbackSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<(CallbackId, EventKind, Callback)>>,
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, kind: EventKind, callback: F) -> CallbackId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(callback);
        self.entries.write().push((id, kind, callback));
        id
    }

    pub fn remove(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Deliver an event; returns how many callbacks panicked
    pub fn emit(&self, event: &EngineEvent) -> usize {
        let kind = event.kind();
        let targets: Vec<Callback> = self
            .entries
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, cb)| Arc::clone(cb))
            .collect();

        let mut failures = 0;
        for callback in targets {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                failures += 1;
                tracing::warn!(
                    kind = ?kind,
                    error = %panic_message(payload.as_ref()),
                    "engine callback panicked"
                );
            }
        }
        failures
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn hop() -> EngineEvent {
        EngineEvent::Propagation {
            origin: ResourceId::new("a"),
            from: ResourceId::new("a"),
            to: ResourceId::new("b"),
            probability: 0.5,
        }
    }

    #[test]
    fn test_registration_order_and_filtering() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let set = CallbackSet::new();
        for tag in ["first", "second"] {
            let calls = Arc::clone(&calls);
            set.add(EventKind::Propagation, move |_| calls.lock().push(tag));
        }
        let other = Arc::clone(&calls);
        set.add(EventKind::FileChanged, move |_| other.lock().push("changed"));

        assert_eq!(set.emit(&hop()), 0);
        assert_eq!(*calls.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_remove() {
        let set = CallbackSet::new();
        let id = set.add(EventKind::Propagation, |_| {});
        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());
    }

    #[test]
    fn test_panic_is_isolated() {
        let calls = Arc::new(Mutex::new(0));
        let set = CallbackSet::new();
        set.add(EventKind::Propagation, |_| panic!("callback failure"));
        let counter = Arc::clone(&calls);
        set.add(EventKind::Propagation, move |_| *counter.lock() += 1);

        assert_eq!(set.emit(&hop()), 1);
        assert_eq!(*calls.lock(), 1);
    }
}
