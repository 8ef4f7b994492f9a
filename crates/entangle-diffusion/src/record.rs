//! Resource records - the engine's view of each registered resource

use std::time::SystemTime;

use entangle_core::{DeclaredState, Descriptor, Fingerprint, ResourceId};

/// What diffusion needs to know about a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeProfile {
    pub strength: f64,
    pub declared_state: DeclaredState,
}

/// Registered resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    pub declared_state: DeclaredState,
    pub linked_ids: Vec<String>,
    pub strength: f64,
    pub fingerprint: Fingerprint,
    pub last_updated: SystemTime,
}

impl ResourceRecord {
    pub fn new(resource_id: ResourceId, descriptor: Descriptor) -> Self {
        ResourceRecord {
            resource_id,
            declared_state: descriptor.declared_state,
            linked_ids: descriptor.linked_ids,
            strength: descriptor.strength,
            fingerprint: descriptor.fingerprint,
            last_updated: SystemTime::now(),
        }
    }

    /// Replace the descriptor fields and stamp the update time
    pub fn apply(&mut self, descriptor: Descriptor) {
        self.declared_state = descriptor.declared_state;
        self.linked_ids = descriptor.linked_ids;
        self.strength = descriptor.strength;
        self.fingerprint = descriptor.fingerprint;
        self.last_updated = SystemTime::now();
    }

    pub fn profile(&self) -> NodeProfile {
        NodeProfile {
            strength: self.strength,
            declared_state: self.declared_state,
        }
    }

    pub fn is_active(&self) -> bool {
        self.declared_state == DeclaredState::Active
    }
}
