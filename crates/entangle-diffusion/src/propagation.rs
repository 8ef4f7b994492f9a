//! Propagation - how a change signal floods the link graph
//!
//! Breadth-first from the changed resource. Each edge n–m is crossed with
//! probability `strength(n) * strength(m)`; a neighbor that declared itself
//! active is always reached. Best effort: nothing is retried.

use std::collections::{HashMap, HashSet, VecDeque};

use entangle_core::{DeclaredState, ResourceId};

use crate::{LinkGraph, NodeProfile};

/// One accepted edge crossing
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub from: ResourceId,
    pub to: ResourceId,
    pub probability: f64,
}

/// A diffusion run over a fixed view of the graph
#[derive(Debug)]
pub struct Diffusion<'a> {
    graph: &'a LinkGraph,
    profiles: &'a HashMap<ResourceId, NodeProfile>,
    default_strength: f64,
}

impl<'a> Diffusion<'a> {
    pub fn new(
        graph: &'a LinkGraph,
        profiles: &'a HashMap<ResourceId, NodeProfile>,
        default_strength: f64,
    ) -> Self {
        Self {
            graph,
            profiles,
            default_strength,
        }
    }

    fn strength(&self, id: &ResourceId) -> f64 {
        self.profiles
            .get(id)
            .map(|p| p.strength)
            .unwrap_or(self.default_strength)
    }

    fn is_active(&self, id: &ResourceId) -> bool {
        self.profiles
            .get(id)
            .map(|p| p.declared_state == DeclaredState::Active)
            .unwrap_or(false)
    }

    /// Flood from `origin`. `draw` yields uniform samples in [0, 1); `on_hop`
    /// sees every accepted crossing. Returns visited ids, origin first.
    pub fn run<D, H>(&self, origin: &ResourceId, mut draw: D, mut on_hop: H) -> Vec<ResourceId>
    where
        D: FnMut() -> f64,
        H: FnMut(&Hop),
    {
        let mut frontier = VecDeque::from([origin.clone()]);
        let mut visited: HashSet<ResourceId> = HashSet::new();
        let mut order = Vec::new();

        while let Some(node) = frontier.pop_front() {
            if !visited.insert(node.clone()) {
                continue;
            }
            order.push(node.clone());

            let node_strength = self.strength(&node);
            for neighbor in self.graph.neighbors(&node) {
                if neighbor == origin || visited.contains(neighbor) {
                    continue;
                }
                let probability = node_strength * self.strength(neighbor);
                if self.is_active(neighbor) || draw() < probability {
                    frontier.push_back(neighbor.clone());
                    on_hop(&Hop {
                        from: node.clone(),
                        to: neighbor.clone(),
                        probability,
                    });
                }
            }
        }

        order
    }
}
