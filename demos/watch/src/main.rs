//! Entangle Watch
//!
//! Scans a directory for files carrying `entangle-*` header markers, polls
//! them for change and diffuses each change across the declared links.
//! Every change that reaches neighbors opens a registry channel from the
//! changed file to the files it reached and broadcasts the new fingerprint.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use serde_json::json;

use entangle_core::{EntangleConfig, ResourceId};
use entangle_diffusion::{DiffusionEngine, EngineEvent, EventKind, FsStore};
use entangle_runtime::telemetry::{self, TelemetryConfig};
use entangle_runtime::Registry;
use entangle_state::{ResourceBehavior, StateChange};

const FILE_KIND: &str = "file";
const FINGERPRINT_KEY: &str = "fingerprint";

#[derive(Parser, Debug)]
#[command(name = "entangle-watch")]
#[command(about = "Watch linked files and diffuse their changes", long_about = None)]
struct Cli {
    /// Directory to scan
    root: PathBuf,

    /// Descend into subdirectories
    #[arg(short, long)]
    recursive: bool,

    /// Poll cycles to run before exiting
    #[arg(short, long, default_value = "12")]
    cycles: u32,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Logs writes arriving on a file's channels
struct LoggingBehavior;

impl ResourceBehavior for LoggingBehavior {
    fn on_state_changed(&self, resource: &ResourceId, change: &StateChange) {
        tracing::info!(
            resource = %resource,
            channel = %change.channel_id,
            key = %change.key,
            value = %change.new,
            "channel write observed"
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    telemetry::init(&TelemetryConfig {
        json: cli.json,
        ..Default::default()
    })?;

    let config = match &cli.config {
        Some(path) => EntangleConfig::from_json_file(path)?,
        None => EntangleConfig::default(),
    };
    config.validate()?;

    let engine = Arc::new(DiffusionEngine::new(config.clone(), Arc::new(FsStore::new())));
    let registry = Arc::new(Registry::new(config.clone()));

    // origin -> resources the change reached, filled by the poll thread
    let reached: Arc<Mutex<BTreeMap<ResourceId, Vec<ResourceId>>>> = Arc::default();

    engine.add_callback(EventKind::FileChanged, |event| {
        if let EngineEvent::FileChanged { record } = event {
            tracing::info!(
                resource = %record.resource_id,
                fingerprint = %record.fingerprint,
                state = record.declared_state.as_str(),
                "file changed"
            );
        }
    });
    let sink = Arc::clone(&reached);
    engine.add_callback(EventKind::Propagation, move |event| {
        if let EngineEvent::Propagation {
            origin,
            from,
            to,
            probability,
        } = event
        {
            tracing::info!(origin = %origin, from = %from, to = %to, probability, "propagated");
            sink.lock().entry(origin.clone()).or_default().push(to.clone());
        }
    });

    let root = cli.root.to_string_lossy().into_owned();
    let scan = engine.scan(&root, cli.recursive)?;
    println!(
        "Tracking {} file(s) under {} ({} without markers, {} unreadable)",
        scan.registered, root, scan.ineligible, scan.errored
    );

    let behavior: Arc<dyn ResourceBehavior> = Arc::new(LoggingBehavior);
    for id in engine.resource_ids() {
        registry.register_with_behavior(id, FILE_KIND, Arc::clone(&behavior));
    }

    engine.start();
    registry.start();

    for cycle in 1..=cli.cycles {
        std::thread::sleep(config.poll_interval());

        let batch = std::mem::take(&mut *reached.lock());
        for (origin, targets) in batch {
            let Some(record) = engine.record(&origin) else {
                continue;
            };
            let channel = registry.create_channel(origin.clone(), targets);
            registry.broadcast(&origin, FINGERPRINT_KEY, json!(record.fingerprint.to_hex()));
            tracing::debug!(origin = %origin, channel = %channel, "change channel opened");
        }

        tracing::debug!(
            cycle,
            files = engine.len(),
            channels = registry.channel_count(),
            "cycle complete"
        );
    }

    engine.stop();
    registry.stop();

    println!(
        "Done: {} file(s), {} link(s), {} open channel(s)",
        engine.len(),
        engine.edge_count(),
        registry.channel_count()
    );
    Ok(())
}
