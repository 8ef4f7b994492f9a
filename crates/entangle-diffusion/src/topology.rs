//! Topology - the link graph diffusion runs over
//!
//! Edges are derived from declared links and are always symmetric: a link
//! from A to B makes A and B neighbors of each other.

use std::collections::{BTreeMap, BTreeSet};

use entangle_core::{LinkResolution, ResourceId};

/// Undirected resource graph
#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    /// Node -> neighbors. Ordered so traversal order is reproducible.
    adjacency: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
}

impl LinkGraph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node without edges
    pub fn add_node(&mut self, node: ResourceId) {
        self.adjacency.entry(node).or_default();
    }

    /// Remove a node and strip it from every neighbor
    pub fn remove_node(&mut self, node: &ResourceId) -> bool {
        let Some(neighbors) = self.adjacency.remove(node) else {
            return false;
        };
        for neighbor in neighbors {
            if let Some(set) = self.adjacency.get_mut(&neighbor) {
                set.remove(node);
            }
        }
        true
    }

    /// Add the edge a–b; self-loops are ignored
    pub fn add_edge(&mut self, a: &ResourceId, b: &ResourceId) -> bool {
        if a == b {
            return false;
        }
        let added = self
            .adjacency
            .entry(a.clone())
            .or_default()
            .insert(b.clone());
        self.adjacency.entry(b.clone()).or_default().insert(a.clone());
        added
    }

    /// Drop every edge touching `node`, keeping the node itself
    pub fn clear_edges(&mut self, node: &ResourceId) {
        let neighbors = match self.adjacency.get_mut(node) {
            Some(set) => std::mem::take(set),
            None => return,
        };
        for neighbor in neighbors {
            if let Some(set) = self.adjacency.get_mut(&neighbor) {
                set.remove(node);
            }
        }
    }

    /// Neighbors of a node, in id order
    pub fn neighbors(&self, node: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.adjacency.get(node).into_iter().flatten()
    }

    pub fn has_edge(&self, a: &ResourceId, b: &ResourceId) -> bool {
        self.adjacency
            .get(a)
            .map(|set| set.contains(b))
            .unwrap_or(false)
    }

    pub fn has_node(&self, node: &ResourceId) -> bool {
        self.adjacency.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }
}

/// Does a declared link name this resource?
///
/// `Heuristic` accepts the full id, its base name, any single path segment,
/// or a trailing run of segments (`notes/todo.md` names `/srv/notes/todo.md`).
/// A segment match can pair resources that merely share a directory name.
pub fn link_matches(link: &str, id: &ResourceId, mode: LinkResolution) -> bool {
    let link = link.trim().trim_start_matches("./").trim_end_matches('/');
    if link.is_empty() {
        return false;
    }
    if link == id.as_str() {
        return true;
    }
    match mode {
        LinkResolution::Exact => false,
        LinkResolution::Heuristic => {
            link == id.base_name()
                || id.segments().any(|segment| segment == link)
                || id
                    .as_str()
                    .strip_suffix(link)
                    .map(|head| head.ends_with('/'))
                    .unwrap_or(false)
        }
    }
}

/// Every known id a declared link names, excluding `owner`
pub fn resolve_link<'a, I>(
    link: &str,
    owner: &ResourceId,
    known: I,
    mode: LinkResolution,
) -> Vec<ResourceId>
where
    I: IntoIterator<Item = &'a ResourceId>,
{
    known
        .into_iter()
        .filter(|candidate| *candidate != owner && link_matches(link, candidate, mode))
        .cloned()
        .collect()
}
