//! Entangle Diffusion - Change detection and propagation across linked resources
//!
//! Resources declare links to each other in their content. The engine turns
//! those declarations into a symmetric graph and, whenever a resource's
//! content fingerprint changes, floods the change outward:
//!
//! ```text
//! poll / update
//!      │
//!      ▼
//! fingerprint changed? ──no──▶ nothing
//!      │ yes
//!      ▼
//! FileChanged callbacks
//!      │
//!      ▼
//! BFS over LinkGraph, each hop kept with p = s(n) * s(m)
//!      │
//!      ▼
//! Propagation callbacks per accepted hop
//! ```

pub mod callback;
pub mod engine;
pub mod propagation;
pub mod record;
pub mod store;
pub mod topology;

pub use callback::*;
pub use engine::*;
pub use propagation::*;
pub use record::*;
pub use store::*;
pub use topology::*;
