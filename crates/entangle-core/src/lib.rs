//! Entangle Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every Entangle layer:
//! - Identifiers (ResourceId, ChannelId)
//! - Descriptors, fingerprints and the descriptor source seam
//! - Configuration
//! - Error taxonomy
//! - The background loop used by the registry and the diffusion engine

pub mod config;
pub mod descriptor;
pub mod error;
pub mod id;
pub mod worker;

pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use id::*;
pub use worker::*;
