//! Registry - owns every resource node and channel
//!
//! The registry is the state-sharing half of Entangle. It opens channels
//! between resources, fans a source's writes out to its channels, and runs a
//! periodic sweep that evicts channels which lost fidelity or targets, then
//! drops resources left without a usable channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sha2::{Digest, Sha256};

use entangle_core::{BackgroundLoop, ChannelId, EntangleConfig, ResourceId};
use entangle_state::{Channel, ResourceBehavior, ResourceNode};

/// Kind given to resources created implicitly by `create_channel`
pub const AUTO_KIND: &str = "auto";

/// Outcome of one maintenance sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle channels whose fidelity was lowered
    pub degraded: usize,
    pub evicted_channels: Vec<ChannelId>,
    pub removed_resources: Vec<ResourceId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted_channels.is_empty() && self.removed_resources.is_empty()
    }
}

/// Channel and resource registry
pub struct Registry {
    config: EntangleConfig,
    resources: RwLock<HashMap<ResourceId, Arc<ResourceNode>>>,
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
    /// Disambiguates channels created in the same instant
    sequence: AtomicU64,
    last_sweep: Mutex<Instant>,
    /// Held shared while endpoints are wired, exclusive for a sweep
    sweep_guard: RwLock<()>,
    maintenance: BackgroundLoop,
}

impl Registry {
    pub fn new(config: EntangleConfig) -> Self {
        Registry {
            config,
            resources: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
            sweep_guard: RwLock::new(()),
            maintenance: BackgroundLoop::new("entangle-maintenance"),
        }
    }

    pub fn config(&self) -> &EntangleConfig {
        &self.config
    }

    /// Register a resource; returns the existing node if already known.
    ///
    /// Explicitly registered resources outlive sweeps until they have joined
    /// a channel and lost every one of them.
    pub fn register(&self, id: impl Into<ResourceId>, kind: &str) -> Arc<ResourceNode> {
        let id = id.into();
        let node = self.insert_node(id.clone(), || ResourceNode::new(id, kind));
        node.mark_explicit();
        node
    }

    pub fn register_with_behavior(
        &self,
        id: impl Into<ResourceId>,
        kind: &str,
        behavior: Arc<dyn ResourceBehavior>,
    ) -> Arc<ResourceNode> {
        let id = id.into();
        let node = self.insert_node(id.clone(), || ResourceNode::with_behavior(id, kind, behavior));
        node.mark_explicit();
        node
    }

    /// Channel endpoint registration; the node lives only as long as its channels
    fn register_endpoint(&self, id: ResourceId) -> Arc<ResourceNode> {
        self.insert_node(id.clone(), || ResourceNode::new(id, AUTO_KIND))
    }

    fn insert_node(
        &self,
        id: ResourceId,
        make: impl FnOnce() -> ResourceNode,
    ) -> Arc<ResourceNode> {
        if let Some(existing) = self.resources.read().get(&id) {
            return Arc::clone(existing);
        }
        let mut resources = self.resources.write();
        let node = resources.entry(id).or_insert_with(|| {
            let node = Arc::new(make());
            tracing::debug!(resource = %node.id(), kind = node.kind(), "resource registered");
            node
        });
        Arc::clone(node)
    }

    /// Close every channel the resource takes part in, then drop it
    pub fn unregister(&self, id: &ResourceId) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };

        let mut channel_ids: BTreeSet<ChannelId> = node.channel_ids().into_iter().collect();
        channel_ids.extend(
            self.channels
                .read()
                .values()
                .filter(|c| c.involves(id))
                .map(|c| c.id().clone()),
        );
        for channel_id in &channel_ids {
            self.remove_channel(channel_id);
        }

        let removed = self.resources.write().remove(id).is_some();
        if removed {
            tracing::debug!(resource = %id, channels = channel_ids.len(), "resource unregistered");
        }
        removed
    }

    /// Open a channel from `source` to `targets`, registering missing endpoints
    pub fn create_channel<I>(&self, source: impl Into<ResourceId>, targets: I) -> ChannelId
    where
        I: IntoIterator,
        I::Item: Into<ResourceId>,
    {
        let source = source.into();
        let targets: BTreeSet<ResourceId> = targets
            .into_iter()
            .map(Into::into)
            .filter(|t| *t != source)
            .collect();

        let channel_id = self.derive_channel_id(&source, &targets);
        let channel = Arc::new(Channel::with_config(
            channel_id.clone(),
            source.clone(),
            targets.iter().cloned(),
            &self.config,
        ));

        // A sweep must not collect endpoints before they hold the channel
        let _wiring = self.sweep_guard.read();
        let participants: Vec<_> = std::iter::once(source.clone())
            .chain(targets.iter().cloned())
            .map(|id| self.register_endpoint(id))
            .collect();

        self.channels
            .write()
            .insert(channel_id.clone(), Arc::clone(&channel));
        for node in &participants {
            node.attach(Arc::clone(&channel));
        }

        tracing::debug!(
            channel = %channel_id,
            source = %source,
            targets = targets.len(),
            "channel created"
        );
        channel_id
    }

    fn derive_channel_id(&self, source: &ResourceId, targets: &BTreeSet<ResourceId>) -> ChannelId {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        for target in targets {
            hasher.update([0u8]);
            hasher.update(target.as_str().as_bytes());
        }
        hasher.update(nanos.to_le_bytes());
        hasher.update(seq.to_le_bytes());
        let digest = hasher.finalize();

        let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        ChannelId::new(format!("ch-{hex}"))
    }

    /// Add a target to a registered channel, registering and attaching it
    pub fn add_target(&self, channel_id: &ChannelId, target: impl Into<ResourceId>) -> bool {
        let target = target.into();
        let _wiring = self.sweep_guard.read();
        let Some(channel) = self.channel(channel_id) else {
            return false;
        };
        if target == *channel.source_id() || !channel.add_target(target.clone()) {
            return false;
        }
        self.register_endpoint(target.clone()).attach(channel);
        tracing::debug!(channel = %channel_id, target = %target, "target added");
        true
    }

    /// Drop a target from a registered channel and detach its node
    pub fn remove_target(&self, channel_id: &ChannelId, target: &ResourceId) -> bool {
        let Some(channel) = self.channel(channel_id) else {
            return false;
        };
        if !channel.remove_target(target) {
            return false;
        }
        if let Some(node) = self.node(target) {
            node.detach(channel_id);
        }
        tracing::debug!(channel = %channel_id, target = %target, "target removed");
        true
    }

    /// Detach from every node holding it, close and forget the channel
    pub fn remove_channel(&self, id: &ChannelId) -> bool {
        let Some(channel) = self.channels.write().remove(id) else {
            return false;
        };

        let holders: Vec<Arc<ResourceNode>> = self
            .resources
            .read()
            .values()
            .filter(|n| n.channel(id).is_some())
            .cloned()
            .collect();
        for node in holders {
            node.detach(id);
        }
        channel.close();
        tracing::debug!(channel = %id, "channel removed");
        true
    }

    /// Write `key` on every usable channel `source` owns; returns the channels written
    pub fn broadcast(&self, source: &ResourceId, key: &str, value: Value) -> Vec<ChannelId> {
        let owned: Vec<Arc<Channel>> = self
            .channels
            .read()
            .values()
            .filter(|c| c.source_id() == source)
            .cloned()
            .collect();

        let mut written: Vec<ChannelId> = owned
            .into_iter()
            .filter(|c| c.is_usable() && c.update(key, value.clone()))
            .map(|c| c.id().clone())
            .collect();
        written.sort();
        written
    }

    /// Run one sweep now
    pub fn run_maintenance(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let _sweep = self.sweep_guard.write();
        let previous_sweep = std::mem::replace(&mut *self.last_sweep.lock(), Instant::now());

        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        for channel in &channels {
            if channel.is_active() && channel.last_activity() < previous_sweep {
                channel.state().degrade_step();
                report.degraded += 1;
            }
        }

        for channel in &channels {
            let live_target = {
                let resources = self.resources.read();
                channel
                    .target_ids()
                    .iter()
                    .any(|t| resources.contains_key(t))
            };
            if (!channel.is_usable() || !live_target) && self.remove_channel(channel.id()) {
                report.evicted_channels.push(channel.id().clone());
            }
        }

        let orphans: Vec<ResourceId> = self
            .resources
            .read()
            .values()
            .filter(|n| n.is_collectible())
            .map(|n| n.id().clone())
            .collect();
        for id in orphans {
            if self.unregister(&id) {
                report.removed_resources.push(id);
            }
        }

        report.evicted_channels.sort();
        report.removed_resources.sort();
        if report.is_empty() {
            tracing::debug!(degraded = report.degraded, "maintenance sweep: nothing to evict");
        } else {
            tracing::info!(
                degraded = report.degraded,
                evicted = report.evicted_channels.len(),
                removed = report.removed_resources.len(),
                "maintenance sweep"
            );
        }
        report
    }

    /// Start the periodic sweep; false if already running
    pub fn start(self: &Arc<Self>) -> bool {
        let weak: Weak<Registry> = Arc::downgrade(self);
        self.maintenance
            .start(self.config.maintenance_interval(), move || match weak.upgrade() {
                Some(registry) => {
                    registry.run_maintenance();
                    true
                }
                None => false,
            })
    }

    /// Stop the sweep, waiting at most the configured shutdown timeout
    pub fn stop(&self) -> bool {
        self.maintenance.stop(self.config.shutdown_timeout())
    }

    pub fn is_running(&self) -> bool {
        self.maintenance.is_running()
    }

    pub fn node(&self, id: &ResourceId) -> Option<Arc<ResourceNode>> {
        self.resources.read().get(id).cloned()
    }

    pub fn channel(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.read().get(id).cloned()
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.resources.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn resource_count(&self) -> usize {
        self.resources.read().len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(EntangleConfig::default())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("resources", &self.resource_count())
            .field("channels", &self.channel_count())
            .field("running", &self.is_running())
            .finish()
    }
}
