//! Entangle State - Channels and the resources that share them
//!
//! This crate implements the explicit state-sharing path:
//! - Channel state with observers and decaying fidelity
//! - Channels linking a source resource to targets
//! - Resource nodes holding the channels they joined

pub mod channel;
pub mod node;
pub mod state;

pub use channel::*;
pub use node::*;
pub use state::*;
