//! Resource node - a participating resource and the channels it belongs to

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use entangle_core::{ChannelId, ResourceId};

use crate::{Channel, StateChange, StateObserver};

/// Reaction of a resource kind to writes on its channels
///
/// The default does nothing; kinds that react to change override it.
pub trait ResourceBehavior: Send + Sync {
    fn on_state_changed(&self, resource: &ResourceId, change: &StateChange) {
        let _ = (resource, change);
    }
}

/// Behavior of resources that only store state
#[derive(Debug, Clone, Copy, Default)]
pub struct Passive;

impl ResourceBehavior for Passive {}

/// A resource participating in one or more channels
pub struct ResourceNode {
    resource_id: ResourceId,
    kind: String,
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
    metadata: RwLock<BTreeMap<String, String>>,
    behavior: Arc<dyn ResourceBehavior>,
    /// Registered by name rather than created as a channel endpoint
    explicit: AtomicBool,
    /// Has held at least one channel
    joined: AtomicBool,
}

impl ResourceNode {
    pub fn new(resource_id: ResourceId, kind: impl Into<String>) -> Self {
        Self::with_behavior(resource_id, kind, Arc::new(Passive))
    }

    pub fn with_behavior(
        resource_id: ResourceId,
        kind: impl Into<String>,
        behavior: Arc<dyn ResourceBehavior>,
    ) -> Self {
        ResourceNode {
            resource_id,
            kind: kind.into(),
            channels: RwLock::new(HashMap::new()),
            metadata: RwLock::new(BTreeMap::new()),
            behavior,
            explicit: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Keep the node alive until it has joined a channel and lost them all
    pub fn mark_explicit(&self) {
        self.explicit.store(true, Ordering::Release);
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit.load(Ordering::Acquire)
    }

    pub fn has_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    /// No usable channel, and either created implicitly or left by every channel it joined
    pub fn is_collectible(&self) -> bool {
        !self.has_usable_channel() && (!self.is_explicit() || self.has_joined())
    }

    /// Join a channel and observe its state; false if already attached
    pub fn attach(self: &Arc<Self>, channel: Arc<Channel>) -> bool {
        {
            let mut channels = self.channels.write();
            if channels.contains_key(channel.id()) {
                return false;
            }
            channels.insert(channel.id().clone(), Arc::clone(&channel));
        }
        self.joined.store(true, Ordering::Release);
        let observer: Arc<dyn StateObserver> = self.clone();
        channel.state().add_observer(observer);
        true
    }

    pub fn detach(self: &Arc<Self>, channel_id: &ChannelId) -> Option<Arc<Channel>> {
        let channel = self.channels.write().remove(channel_id)?;
        let observer: Arc<dyn StateObserver> = self.clone();
        channel.state().remove_observer(&observer);
        Some(channel)
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.read().get(channel_id).cloned()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    fn usable_channel(&self, channel_id: &ChannelId) -> Option<Arc<Channel>> {
        self.channel(channel_id).filter(|c| c.is_usable())
    }

    pub fn update_through(&self, channel_id: &ChannelId, key: impl Into<String>, value: Value) -> bool {
        match self.usable_channel(channel_id) {
            Some(channel) => channel.update(key, value),
            None => false,
        }
    }

    pub fn read_through(&self, channel_id: &ChannelId, key: &str, default: Value) -> Value {
        match self.usable_channel(channel_id) {
            Some(channel) => channel.read(key, default),
            None => default,
        }
    }

    pub fn has_usable_channel(&self) -> bool {
        self.channels.read().values().any(|c| c.is_usable())
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.read().get(key).cloned()
    }

    pub fn metadata_snapshot(&self) -> BTreeMap<String, String> {
        self.metadata.read().clone()
    }
}

impl StateObserver for ResourceNode {
    fn on_state_changed(&self, change: &StateChange) {
        self.behavior.on_state_changed(&self.resource_id, change);
    }
}

impl std::fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNode")
            .field("resource_id", &self.resource_id)
            .field("kind", &self.kind)
            .field("channels", &self.channel_ids())
            .finish()
    }
}
