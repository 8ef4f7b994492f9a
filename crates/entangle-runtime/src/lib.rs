//! Entangle Runtime - Registry orchestration and process setup
//!
//! This crate owns the long-lived parts of the state-sharing path:
//! 1. Resource and channel tables
//! 2. Channel creation and fan-out
//! 3. The periodic maintenance sweep
//! 4. Tracing subscriber installation for binaries

pub mod registry;
pub mod telemetry;

pub use registry::*;
