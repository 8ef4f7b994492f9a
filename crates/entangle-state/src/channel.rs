//! Channel - one source resource, a set of targets, one owned state

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use entangle_core::{ChannelId, EntangleConfig, ResourceId};

use crate::ChannelState;

/// Bidirectional link carrying shared key/value state
#[derive(Debug)]
pub struct Channel {
    channel_id: ChannelId,
    source_id: ResourceId,
    target_ids: RwLock<BTreeSet<ResourceId>>,
    state: ChannelState,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    active: AtomicBool,
}

impl Channel {
    pub fn new<I>(channel_id: ChannelId, source_id: ResourceId, targets: I) -> Self
    where
        I: IntoIterator<Item = ResourceId>,
    {
        Self::with_config(channel_id, source_id, targets, &EntangleConfig::default())
    }

    pub fn with_config<I>(
        channel_id: ChannelId,
        source_id: ResourceId,
        targets: I,
        config: &EntangleConfig,
    ) -> Self
    where
        I: IntoIterator<Item = ResourceId>,
    {
        let now = Instant::now();
        Channel {
            state: ChannelState::with_config(channel_id.clone(), config),
            channel_id,
            source_id,
            target_ids: RwLock::new(targets.into_iter().collect()),
            created_at: now,
            last_activity: Mutex::new(now),
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn source_id(&self) -> &ResourceId {
        &self.source_id
    }

    pub fn target_ids(&self) -> BTreeSet<ResourceId> {
        self.target_ids.read().clone()
    }

    /// Source first, then targets in order
    pub fn participants(&self) -> Vec<ResourceId> {
        let targets = self.target_ids.read();
        std::iter::once(self.source_id.clone())
            .chain(targets.iter().filter(|t| **t != self.source_id).cloned())
            .collect()
    }

    pub fn involves(&self, resource: &ResourceId) -> bool {
        self.source_id == *resource || self.target_ids.read().contains(resource)
    }

    /// Raw membership edit. Channels owned by a registry are edited through
    /// the registry so endpoints get registered and attached.
    pub fn add_target(&self, target: ResourceId) -> bool {
        self.target_ids.write().insert(target)
    }

    pub fn remove_target(&self, target: &ResourceId) -> bool {
        self.target_ids.write().remove(target)
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Write through to the state; false once closed
    pub fn update(&self, key: impl Into<String>, value: Value) -> bool {
        if !self.is_active() {
            return false;
        }
        self.touch();
        self.state.set(key, value);
        true
    }

    pub fn read(&self, key: &str, default: Value) -> Value {
        if !self.is_active() {
            return default;
        }
        self.touch();
        self.state.get_or(key, default)
    }

    /// Returns true only on the first call
    pub fn close(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if was_active {
            self.state.deactivate();
            tracing::debug!(channel = %self.channel_id, "channel closed");
        }
        was_active
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_usable(&self) -> bool {
        self.is_active() && self.state.is_usable()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }
}
