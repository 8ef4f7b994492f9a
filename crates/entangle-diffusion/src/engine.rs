//! Diffusion engine - records, link graph, change detection and polling
//!
//! The engine is owned by the application and shared by handle. It keeps one
//! record per registered resource and a symmetric link graph derived from
//! the records' declared links. When a resource's fingerprint changes, the
//! engine fires `FileChanged` callbacks and floods the change across the
//! graph, firing `Propagation` callbacks per accepted hop.
//!
//! Lock order is records, then graph. Callbacks run with no lock held.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use entangle_core::{
    BackgroundLoop, Descriptor, DescriptorSource, EntangleConfig, EntangleError, EntangleResult,
    HeaderDescriptorSource, ResourceId,
};

use crate::{
    resolve_link, CallbackId, CallbackSet, Diffusion, EngineEvent, EventKind, LinkGraph,
    ResourceRecord, ResourceStore,
};

/// Outcome of registering a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// Content carries no descriptor; the resource is not tracked
    NotEligible,
}

/// Outcome of an update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub changed: bool,
    /// Resources the change reached, origin first
    pub affected: Vec<ResourceId>,
}

impl UpdateOutcome {
    pub fn unchanged() -> Self {
        Self::default()
    }
}

/// Counts from a bulk scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub registered: usize,
    pub ineligible: usize,
    pub errored: usize,
}

/// Counts from one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub checked: usize,
    pub changed: usize,
    pub removed: Vec<ResourceId>,
    pub errored: usize,
}

/// Entanglement engine
pub struct DiffusionEngine {
    config: EntangleConfig,
    store: Arc<dyn ResourceStore>,
    descriptors: Arc<dyn DescriptorSource>,
    records: RwLock<HashMap<ResourceId, ResourceRecord>>,
    graph: RwLock<LinkGraph>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    callbacks: CallbackSet,
    poller: BackgroundLoop,
}

impl DiffusionEngine {
    /// Engine reading content from `store`, with header descriptors and an
    /// entropy-seeded generator
    pub fn new(config: EntangleConfig, store: Arc<dyn ResourceStore>) -> Self {
        let descriptors = Arc::new(HeaderDescriptorSource::new(config.default_strength));
        DiffusionEngine {
            config,
            store,
            descriptors,
            records: RwLock::new(HashMap::new()),
            graph: RwLock::new(LinkGraph::new()),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            callbacks: CallbackSet::new(),
            poller: BackgroundLoop::new("entangle-poll"),
        }
    }

    pub fn with_descriptor_source(mut self, source: Arc<dyn DescriptorSource>) -> Self {
        self.descriptors = source;
        self
    }

    /// Replace the generator behind diffusion draws (seed it for reproducible runs)
    pub fn with_rng<R>(mut self, rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    pub fn config(&self) -> &EntangleConfig {
        &self.config
    }

    /// Fetch, describe and track a resource
    pub fn register(&self, id: impl Into<ResourceId>) -> EntangleResult<Registration> {
        let id = id.into();
        let Some(content) = self.store.fetch(&id)? else {
            return Err(EntangleError::ResourceNotFound(id));
        };

        match self.descriptors.describe(&content) {
            Ok(descriptor) => Ok(self.register_descriptor(id, descriptor)),
            Err(EntangleError::NotEligible) => {
                tracing::debug!(resource = %id, "no descriptor, not tracked");
                Ok(Registration::NotEligible)
            }
            Err(e) => Err(e),
        }
    }

    /// Track a resource from a descriptor produced elsewhere.
    ///
    /// A known id goes through [`update`](Self::update), so new content
    /// fires callbacks and diffuses exactly as a poll would.
    pub fn register_descriptor(&self, id: impl Into<ResourceId>, descriptor: Descriptor) -> Registration {
        let id = id.into();
        let known = {
            let mut records = self.records.write();
            match records.entry(id.clone()) {
                Entry::Occupied(_) => Some(descriptor),
                Entry::Vacant(slot) => {
                    slot.insert(ResourceRecord::new(id.clone(), descriptor));
                    None
                }
            }
        };
        if let Some(descriptor) = known {
            self.update(&id, descriptor);
            return Registration::Registered;
        }

        let degree = self.relink(&id);
        tracing::debug!(resource = %id, neighbors = degree, "resource registered");
        Registration::Registered
    }

    /// Forget a resource and strip it from its neighbors
    pub fn unregister(&self, id: &ResourceId) -> bool {
        let mut records = self.records.write();
        let removed = records.remove(id).is_some();
        self.graph.write().remove_node(id);
        drop(records);

        if removed {
            tracing::debug!(resource = %id, "resource unregistered");
        }
        removed
    }

    /// Rebuild every edge touching `id` from current records; returns its degree
    fn relink(&self, id: &ResourceId) -> usize {
        let records = self.records.read();
        let Some(record) = records.get(id) else {
            return 0;
        };
        let mode = self.config.link_resolution;

        let mut neighbors: BTreeSet<ResourceId> = record
            .linked_ids
            .iter()
            .flat_map(|link| resolve_link(link, id, records.keys(), mode))
            .collect();
        neighbors.extend(
            records
                .values()
                .filter(|other| other.resource_id != *id)
                .filter(|other| {
                    other
                        .linked_ids
                        .iter()
                        .any(|link| crate::link_matches(link, id, mode))
                })
                .map(|other| other.resource_id.clone()),
        );

        let mut graph = self.graph.write();
        graph.clear_edges(id);
        graph.add_node(id.clone());
        for neighbor in &neighbors {
            graph.add_edge(id, neighbor);
        }
        neighbors.len()
    }

    /// Apply a new descriptor; diffuses only when the fingerprint changed
    pub fn update(&self, id: &ResourceId, descriptor: Descriptor) -> UpdateOutcome {
        let record = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(id) else {
                return UpdateOutcome::unchanged();
            };
            if record.fingerprint == descriptor.fingerprint {
                return UpdateOutcome::unchanged();
            }
            record.apply(descriptor);
            record.clone()
        };

        self.relink(id);
        tracing::debug!(resource = %id, fingerprint = %record.fingerprint, "resource changed");
        self.callbacks.emit(&EngineEvent::FileChanged { record });

        let affected = self.diffuse_from(id);
        UpdateOutcome {
            changed: true,
            affected,
        }
    }

    /// Describe raw content and apply it; ineligible content is ignored
    pub fn update_content(&self, id: &ResourceId, content: &[u8]) -> UpdateOutcome {
        match self.descriptors.describe(content) {
            Ok(descriptor) => self.update(id, descriptor),
            Err(EntangleError::NotEligible) => UpdateOutcome::unchanged(),
            Err(e) => {
                tracing::warn!(resource = %id, error = %e, "descriptor extraction failed");
                UpdateOutcome::unchanged()
            }
        }
    }

    /// Re-fetch a resource from the store and apply it
    pub fn refresh(&self, id: &ResourceId) -> EntangleResult<UpdateOutcome> {
        match self.store.fetch(id)? {
            Some(content) => Ok(self.update_content(id, &content)),
            None => Err(EntangleError::ResourceNotFound(id.clone())),
        }
    }

    fn diffuse_from(&self, origin: &ResourceId) -> Vec<ResourceId> {
        let (graph, profiles) = {
            let records = self.records.read();
            let graph = self.graph.read().clone();
            let profiles: HashMap<_, _> = records
                .iter()
                .map(|(id, record)| (id.clone(), record.profile()))
                .collect();
            (graph, profiles)
        };

        let affected = Diffusion::new(&graph, &profiles, self.config.default_strength).run(
            origin,
            || self.rng.lock().gen::<f64>(),
            |hop| {
                self.callbacks.emit(&EngineEvent::Propagation {
                    origin: origin.clone(),
                    from: hop.from.clone(),
                    to: hop.to.clone(),
                    probability: hop.probability,
                });
            },
        );
        tracing::debug!(origin = %origin, reached = affected.len() - 1, "diffusion finished");
        affected
    }

    /// Refresh every tracked resource once, dropping the ones that vanished
    pub fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();
        for id in self.resource_ids() {
            report.checked += 1;
            match self.refresh(&id) {
                Ok(outcome) => {
                    if outcome.changed {
                        report.changed += 1;
                    }
                }
                Err(EntangleError::ResourceNotFound(_)) => {
                    if self.unregister(&id) {
                        report.removed.push(id);
                    }
                }
                Err(e) => {
                    report.errored += 1;
                    tracing::warn!(resource = %id, error = %e, "poll failed, retrying next cycle");
                }
            }
        }

        if report.changed > 0 || !report.removed.is_empty() {
            tracing::info!(
                checked = report.checked,
                changed = report.changed,
                removed = report.removed.len(),
                "poll cycle"
            );
        }
        report
    }

    /// Register everything the store lists under `root`
    pub fn scan(&self, root: &str, recursive: bool) -> EntangleResult<ScanReport> {
        let mut report = ScanReport::default();
        for id in self.store.enumerate(root, recursive)? {
            match self.register(id.clone()) {
                Ok(Registration::Registered) => report.registered += 1,
                Ok(Registration::NotEligible) => report.ineligible += 1,
                Err(e) => {
                    report.errored += 1;
                    tracing::warn!(resource = %id, error = %e, "scan could not register resource");
                }
            }
        }
        tracing::info!(
            root,
            registered = report.registered,
            ineligible = report.ineligible,
            errored = report.errored,
            "scan finished"
        );
        Ok(report)
    }

    pub fn add_callback<F>(&self, kind: EventKind, callback: F) -> CallbackId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.callbacks.add(kind, callback)
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.callbacks.remove(id)
    }

    /// Start polling on the configured interval; false if already running
    pub fn start(self: &Arc<Self>) -> bool {
        let weak: Weak<DiffusionEngine> = Arc::downgrade(self);
        self.poller
            .start(self.config.poll_interval(), move || match weak.upgrade() {
                Some(engine) => {
                    engine.poll_once();
                    true
                }
                None => false,
            })
    }

    /// Stop polling, waiting at most the configured shutdown timeout
    pub fn stop(&self) -> bool {
        self.poller.stop(self.config.shutdown_timeout())
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }

    pub fn record(&self, id: &ResourceId) -> Option<ResourceRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn neighbors(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.graph.read().neighbors(id).cloned().collect()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.records.read().contains_key(id)
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.records.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.read().edge_count()
    }
}

impl std::fmt::Debug for DiffusionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffusionEngine")
            .field("resources", &self.len())
            .field("edges", &self.edge_count())
            .field("callbacks", &self.callbacks)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use entangle_core::{DeclaredState, Fingerprint};

    fn rid(s: &str) -> ResourceId {
        ResourceId::new(s)
    }

    fn descriptor(content: &str, links: &[&str], strength: f64) -> Descriptor {
        Descriptor::new(Fingerprint::of(content.as_bytes()), strength).with_links(links.iter().copied())
    }

    fn engine() -> DiffusionEngine {
        DiffusionEngine::new(EntangleConfig::default(), Arc::new(MemoryStore::new()))
            .with_rng(StdRng::seed_from_u64(1))
    }

    #[test]
    fn test_symmetric_edges() {
        let engine = engine();
        engine.register_descriptor("A", descriptor("a", &["B"], 0.9));
        engine.register_descriptor("B", descriptor("b", &[], 0.9));

        assert_eq!(engine.neighbors(&rid("A")), vec![rid("B")]);
        assert_eq!(engine.neighbors(&rid("B")), vec![rid("A")]);
    }

    #[test]
    fn test_register_twice_keeps_one_edge() {
        let engine = engine();
        engine.register_descriptor("B", descriptor("b", &[], 0.9));
        engine.register_descriptor("A", descriptor("a", &["B"], 0.9));
        engine.register_descriptor("A", descriptor("a", &["B"], 0.9));

        assert_eq!(engine.len(), 2);
        assert_eq!(engine.edge_count(), 1);
    }

    #[test]
    fn test_relink_drops_stale_links() {
        let engine = engine();
        engine.register_descriptor("B", descriptor("b", &[], 0.9));
        engine.register_descriptor("C", descriptor("c", &["A"], 0.9));
        engine.register_descriptor("A", descriptor("a1", &["B"], 0.9));

        engine.update(&rid("A"), descriptor("a2", &[], 0.9));

        // A no longer links B, but C still links A
        assert_eq!(engine.neighbors(&rid("A")), vec![rid("C")]);
        assert!(engine.neighbors(&rid("B")).is_empty());
    }

    #[test]
    fn test_reregister_with_new_content_is_an_update() {
        let engine = engine();
        engine.register_descriptor("A", descriptor("a1", &["B"], 1.0));
        engine.register_descriptor("B", descriptor("b", &[], 1.0));

        let changed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changed);
        engine.add_callback(EventKind::FileChanged, move |event| {
            if let EngineEvent::FileChanged { record } = event {
                sink.lock().push(record.resource_id.clone());
            }
        });
        let hops = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hops);
        engine.add_callback(EventKind::Propagation, move |_| *counter.lock() += 1);

        engine.register_descriptor("A", descriptor("a1", &["B"], 1.0));
        assert!(changed.lock().is_empty());

        engine.register_descriptor("A", descriptor("a2", &["B"], 1.0));
        assert_eq!(*changed.lock(), vec![rid("A")]);
        assert_eq!(*hops.lock(), 1);
        assert_eq!(engine.record(&rid("A")).unwrap().fingerprint, Fingerprint::of(b"a2"));
    }

    #[test]
    fn test_unregister_strips_neighbors() {
        let engine = engine();
        engine.register_descriptor("A", descriptor("a", &["B", "C"], 0.9));
        engine.register_descriptor("B", descriptor("b", &[], 0.9));
        engine.register_descriptor("C", descriptor("c", &[], 0.9));

        assert!(engine.unregister(&rid("A")));
        assert!(!engine.unregister(&rid("A")));
        assert!(engine.neighbors(&rid("B")).is_empty());
        assert!(engine.neighbors(&rid("C")).is_empty());
        assert!(engine.record(&rid("A")).is_none());
    }

    #[test]
    fn test_unchanged_fingerprint_is_a_noop() {
        let engine = engine();
        engine.register_descriptor("A", descriptor("a", &["B"], 0.9));
        engine.register_descriptor("B", descriptor("b", &[], 0.9));

        let fired = Arc::new(Mutex::new(0));
        for kind in [EventKind::FileChanged, EventKind::Propagation] {
            let fired = Arc::clone(&fired);
            engine.add_callback(kind, move |_| *fired.lock() += 1);
        }

        let outcome = engine.update(&rid("A"), descriptor("a", &["B"], 0.9));
        assert_eq!(outcome, UpdateOutcome::unchanged());
        assert_eq!(*fired.lock(), 0);
    }

    #[test]
    fn test_update_unknown_is_unchanged() {
        let engine = engine();
        let outcome = engine.update(&rid("ghost"), descriptor("x", &[], 0.9));
        assert!(!outcome.changed);
        assert!(outcome.affected.is_empty());
    }

    #[test]
    fn test_active_neighbor_always_affected() {
        let engine = engine();
        engine.register_descriptor("A", descriptor("a", &["B"], 0.0));
        engine.register_descriptor("B", descriptor("b", &[], 0.0).with_state(DeclaredState::Active));

        let outcome = engine.update(&rid("A"), descriptor("a2", &["B"], 0.0));
        assert!(outcome.changed);
        assert_eq!(outcome.affected, vec![rid("A"), rid("B")]);
    }

    #[test]
    fn test_file_changed_carries_new_record() {
        let engine = engine();
        engine.register_descriptor("A", descriptor("a", &[], 0.9));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.add_callback(EventKind::FileChanged, move |event| {
            if let EngineEvent::FileChanged { record } = event {
                sink.lock().push(record.fingerprint);
            }
        });

        engine.update(&rid("A"), descriptor("a2", &[], 0.9));
        assert_eq!(*seen.lock(), vec![Fingerprint::of(b"a2")]);
    }

    #[test]
    fn test_exact_link_resolution() {
        let config = EntangleConfig {
            link_resolution: entangle_core::LinkResolution::Exact,
            ..Default::default()
        };
        let engine = DiffusionEngine::new(config, Arc::new(MemoryStore::new()));
        engine.register_descriptor("docs/a.md", descriptor("a", &["b.md"], 0.9));
        engine.register_descriptor("docs/b.md", descriptor("b", &[], 0.9));
        assert!(engine.neighbors(&rid("docs/a.md")).is_empty());

        engine.register_descriptor("docs/c.md", descriptor("c", &["docs/b.md"], 0.9));
        assert_eq!(engine.neighbors(&rid("docs/b.md")), vec![rid("docs/c.md")]);
    }
}
