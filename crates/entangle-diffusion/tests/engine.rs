//! End-to-end engine flows over an in-memory store
//!
//! - Registration through header descriptors
//! - Seeded diffusion outcomes
//! - Poll cycles, vanished resources and the background poller
//! - Concurrent mutation of one engine

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use entangle_core::{EntangleConfig, EntangleError, ResourceId};
use entangle_diffusion::{
    DiffusionEngine, EngineEvent, EventKind, MemoryStore, Registration, ResourceStore,
};

// ============================================================================
// HELPERS
// ============================================================================

fn rid(s: &str) -> ResourceId {
    ResourceId::new(s)
}

fn header(links: &str, strength: f64, body: &str) -> String {
    format!("# entangle-links: {links}\n# entangle-strength: {strength}\n{body}\n")
}

fn setup(seed: u64) -> (Arc<MemoryStore>, DiffusionEngine) {
    let store = Arc::new(MemoryStore::new());
    let engine = DiffusionEngine::new(EntangleConfig::testing(), store.clone())
        .with_rng(StdRng::seed_from_u64(seed));
    (store, engine)
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

// ============================================================================
// REGISTRATION
// ============================================================================

#[test]
fn test_register_from_store() {
    let (store, engine) = setup(0);
    store.put("notes/a.md", header("b.md", 0.9, "alpha"));
    store.put("notes/b.md", header("", 0.9, "beta"));
    store.put("notes/plain.txt", "no markers here");

    assert_eq!(engine.register("notes/a.md").unwrap(), Registration::Registered);
    assert_eq!(engine.register("notes/b.md").unwrap(), Registration::Registered);
    assert_eq!(
        engine.register("notes/plain.txt").unwrap(),
        Registration::NotEligible
    );
    assert!(matches!(
        engine.register("notes/missing.md"),
        Err(EntangleError::ResourceNotFound(_))
    ));

    assert_eq!(engine.len(), 2);
    assert_eq!(engine.neighbors(&rid("notes/b.md")), vec![rid("notes/a.md")]);
    assert!(!engine.contains(&rid("notes/plain.txt")));
}

#[test]
fn test_scan_counts() {
    let (store, engine) = setup(0);
    store.put("docs/a.md", header("c.md", 0.9, "a"));
    store.put("docs/b.txt", "plain");
    store.put("docs/deep/c.md", header("", 0.9, "c"));

    let flat = engine.scan("docs", false).unwrap();
    assert_eq!(flat.registered, 1);
    assert_eq!(flat.ineligible, 1);
    assert_eq!(flat.errored, 0);

    let deep = engine.scan("docs", true).unwrap();
    assert_eq!(deep.registered, 2);
    assert_eq!(engine.len(), 2);
    assert_eq!(engine.neighbors(&rid("docs/a.md")), vec![rid("docs/deep/c.md")]);
}

#[test]
fn test_rescan_after_edit_reports_change() {
    let (store, engine) = setup(0);
    store.put("d/a", header("b", 1.0, "a1"));
    store.put("d/b", header("", 1.0, "b"));
    engine.scan("d", false).unwrap();

    let changed = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&changed);
    engine.add_callback(EventKind::FileChanged, move |_| *counter.lock() += 1);

    engine.scan("d", false).unwrap();
    assert_eq!(*changed.lock(), 0);

    store.put("d/a", header("b", 1.0, "a2"));
    let rescan = engine.scan("d", false).unwrap();
    assert_eq!(rescan.registered, 2);
    assert_eq!(*changed.lock(), 1);

    // Already observed by the rescan
    assert_eq!(engine.poll_once().changed, 0);
    assert_eq!(*changed.lock(), 1);
}

// ============================================================================
// DIFFUSION
// ============================================================================

#[test]
fn test_seeded_diffusion_matches_first_draw() {
    for seed in 0..32u64 {
        let (store, engine) = setup(seed);
        store.put("A", header("B", 0.9, "a1"));
        store.put("B", header("", 0.9, "b"));
        engine.register("A").unwrap();
        engine.register("B").unwrap();

        store.put("A", header("B", 0.9, "a2"));
        let outcome = engine.refresh(&rid("A")).unwrap();
        assert!(outcome.changed);

        let first_draw = StdRng::seed_from_u64(seed).gen::<f64>();
        let expected = if first_draw < 0.81 {
            vec![rid("A"), rid("B")]
        } else {
            vec![rid("A")]
        };
        assert_eq!(outcome.affected, expected, "seed {seed}");
    }
}

#[test]
fn test_full_strength_reaches_component() {
    let (store, engine) = setup(7);
    store.put("a", header("b", 1.0, "a1"));
    store.put("b", header("c", 1.0, "b"));
    store.put("c", header("", 1.0, "c"));
    store.put("island", header("", 1.0, "i"));
    for id in ["a", "b", "c", "island"] {
        engine.register(id).unwrap();
    }

    let hops = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hops);
    engine.add_callback(EventKind::Propagation, move |event| {
        if let EngineEvent::Propagation { from, to, .. } = event {
            sink.lock().push((from.clone(), to.clone()));
        }
    });

    let outcome = engine.update_content(&rid("a"), header("b", 1.0, "a2").as_bytes());
    assert_eq!(outcome.affected, vec![rid("a"), rid("b"), rid("c")]);
    assert_eq!(
        *hops.lock(),
        vec![(rid("a"), rid("b")), (rid("b"), rid("c"))]
    );
}

#[test]
fn test_callback_panic_does_not_stop_diffusion() {
    let (store, engine) = setup(3);
    store.put("a", header("b", 1.0, "a1"));
    store.put("b", header("", 1.0, "b"));
    engine.register("a").unwrap();
    engine.register("b").unwrap();

    engine.add_callback(EventKind::FileChanged, |_| panic!("observer bug"));
    let changed = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&changed);
    let id = engine.add_callback(EventKind::FileChanged, move |_| *counter.lock() += 1);

    let outcome = engine.update_content(&rid("a"), header("b", 1.0, "a2").as_bytes());
    assert_eq!(outcome.affected.len(), 2);
    assert_eq!(*changed.lock(), 1);

    assert!(engine.remove_callback(id));
    engine.update_content(&rid("a"), header("b", 1.0, "a3").as_bytes());
    assert_eq!(*changed.lock(), 1);
}

// ============================================================================
// POLLING
// ============================================================================

#[test]
fn test_poll_once_detects_change_and_removal() {
    let (store, engine) = setup(0);
    store.put("a", header("b", 0.9, "a1"));
    store.put("b", header("", 0.9, "b"));
    engine.register("a").unwrap();
    engine.register("b").unwrap();

    let quiet = engine.poll_once();
    assert_eq!(quiet.checked, 2);
    assert_eq!(quiet.changed, 0);

    store.put("a", header("b", 0.9, "a2"));
    store.remove(&rid("b"));
    let report = engine.poll_once();
    assert_eq!(report.changed, 1);
    assert_eq!(report.removed, vec![rid("b")]);
    assert!(engine.neighbors(&rid("a")).is_empty());
    assert_eq!(engine.resource_ids(), vec![rid("a")]);
}

#[test]
fn test_ineligible_content_keeps_record() {
    let (store, engine) = setup(0);
    store.put("a", header("", 0.9, "a1"));
    engine.register("a").unwrap();
    let before = engine.record(&rid("a")).unwrap();

    store.put("a", "markers removed");
    let report = engine.poll_once();
    assert_eq!(report.changed, 0);
    assert_eq!(engine.record(&rid("a")).unwrap().fingerprint, before.fingerprint);
}

struct FlakyStore;

impl ResourceStore for FlakyStore {
    fn fetch(&self, id: &ResourceId) -> entangle_core::EntangleResult<Option<Vec<u8>>> {
        Err(EntangleError::transient_io(
            id.as_str(),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
        ))
    }

    fn enumerate(
        &self,
        _root: &str,
        _recursive: bool,
    ) -> entangle_core::EntangleResult<Vec<ResourceId>> {
        Ok(vec![rid("x")])
    }
}

#[test]
fn test_transient_errors_are_counted_not_fatal() {
    let engine = DiffusionEngine::new(EntangleConfig::testing(), Arc::new(FlakyStore));
    let scan = engine.scan("", true).unwrap();
    assert_eq!(scan.errored, 1);

    engine.register_descriptor(
        "x",
        entangle_core::Descriptor::new(entangle_core::Fingerprint::of(b"x"), 0.9),
    );
    let report = engine.poll_once();
    assert_eq!(report.errored, 1);
    assert!(report.removed.is_empty());
    assert!(engine.contains(&rid("x")));
}

#[test]
fn test_background_poller() {
    let (store, engine) = setup(0);
    store.put("a", header("", 0.9, "a1"));
    engine.register("a").unwrap();

    let engine = Arc::new(engine);
    let changed = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&changed);
    engine.add_callback(EventKind::FileChanged, move |_| *counter.lock() += 1);

    assert!(engine.start());
    assert!(!engine.start());
    assert!(engine.is_running());

    store.put("a", header("", 0.9, "a2"));
    assert!(wait_for(Duration::from_secs(2), || *changed.lock() == 1));

    store.remove(&rid("a"));
    assert!(wait_for(Duration::from_secs(2), || engine.is_empty()));

    assert!(engine.stop());
    assert!(!engine.is_running());
    assert!(!engine.stop());
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_concurrent_mutation_keeps_graph_consistent() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(
        DiffusionEngine::new(EntangleConfig::testing(), store).with_rng(StdRng::seed_from_u64(9)),
    );
    let names: Vec<String> = (0..12).map(|i| format!("n{i}")).collect();

    let workers: Vec<_> = (0..6u64)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            let names = names.clone();
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                for round in 0..200 {
                    let id = &names[rng.gen_range(0..names.len())];
                    let link = &names[rng.gen_range(0..names.len())];
                    let descriptor = entangle_core::Descriptor::new(
                        entangle_core::Fingerprint::of(format!("{worker}-{round}").as_bytes()),
                        0.5,
                    )
                    .with_links([link.clone()]);
                    match rng.gen_range(0..3) {
                        0 => {
                            engine.register_descriptor(id.as_str(), descriptor);
                        }
                        1 => {
                            engine.update(&rid(id), descriptor);
                        }
                        _ => {
                            engine.unregister(&rid(id));
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let registered = engine.resource_ids();
    for id in &registered {
        for neighbor in engine.neighbors(id) {
            assert!(registered.contains(&neighbor), "{neighbor} is not registered");
            assert!(
                engine.neighbors(&neighbor).contains(id),
                "edge {id}-{neighbor} is one-sided"
            );
        }
    }
}
