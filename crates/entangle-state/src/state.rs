//! Channel state - shared key/value store with a decaying fidelity score

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use entangle_core::{panic_message, ChannelId, EntangleConfig};

/// A single write, captured after the state lock is released
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub channel_id: ChannelId,
    pub key: String,
    pub old: Option<Value>,
    pub new: Value,
}

/// Receives every write made to a [`ChannelState`]
pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, change: &StateChange);
}

fn same_observer(a: &Arc<dyn StateObserver>, b: &Arc<dyn StateObserver>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Debug)]
struct StateInner {
    data: BTreeMap<String, Value>,
    fidelity: f64,
    active: bool,
    last_update: Instant,
}

/// Shared key/value state owned by exactly one channel
pub struct ChannelState {
    channel_id: ChannelId,
    fidelity_floor: f64,
    degrade_step: f64,
    inner: Mutex<StateInner>,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
}

impl ChannelState {
    pub fn new(channel_id: ChannelId) -> Self {
        Self::with_config(channel_id, &EntangleConfig::default())
    }

    pub fn with_config(channel_id: ChannelId, config: &EntangleConfig) -> Self {
        ChannelState {
            channel_id,
            fidelity_floor: config.fidelity_floor,
            degrade_step: config.degrade_step,
            inner: Mutex::new(StateInner {
                data: BTreeMap::new(),
                fidelity: 1.0,
                active: true,
                last_update: Instant::now(),
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Write a value and notify observers; returns the previous value
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        let old = {
            let mut inner = self.inner.lock();
            inner.last_update = Instant::now();
            inner.data.insert(key.clone(), value.clone())
        };

        let change = StateChange {
            channel_id: self.channel_id.clone(),
            key,
            old: old.clone(),
            new: value,
        };
        self.notify(&change);
        old
    }

    fn notify(&self, change: &StateChange) {
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_state_changed(change)));
            if let Err(payload) = outcome {
                tracing::warn!(
                    channel = %self.channel_id,
                    key = %change.key,
                    error = %panic_message(payload.as_ref()),
                    "state observer panicked"
                );
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().data.get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Copy of the whole store
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner.lock().data.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }

    /// Returns false if the observer was already registered
    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) -> bool {
        let mut observers = self.observers.write();
        if observers.iter().any(|o| same_observer(o, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    /// Returns false if the observer was not registered
    pub fn remove_observer(&self, observer: &Arc<dyn StateObserver>) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| !same_observer(o, observer));
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Lower fidelity by `amount`; deactivates once below the floor
    pub fn degrade(&self, amount: f64) -> f64 {
        let mut inner = self.inner.lock();
        inner.fidelity = (inner.fidelity - amount.max(0.0)).max(0.0);
        if inner.fidelity < self.fidelity_floor {
            inner.active = false;
        }
        inner.fidelity
    }

    /// Degrade by the configured step
    pub fn degrade_step(&self) -> f64 {
        self.degrade(self.degrade_step)
    }

    /// Restore full fidelity. A deactivated state stays inactive.
    pub fn reset(&self) {
        self.inner.lock().fidelity = 1.0;
    }

    pub fn deactivate(&self) {
        self.inner.lock().active = false;
    }

    pub fn fidelity(&self) -> f64 {
        self.inner.lock().fidelity
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn last_update(&self) -> Instant {
        self.inner.lock().last_update
    }

    pub fn is_usable(&self) -> bool {
        let inner = self.inner.lock();
        inner.active && inner.fidelity > self.fidelity_floor
    }
}

impl std::fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChannelState")
            .field("channel_id", &self.channel_id)
            .field("keys", &inner.data.len())
            .field("fidelity", &inner.fidelity)
            .field("active", &inner.active)
            .finish()
    }
}
