//! Resource stores - where resource content comes from
//!
//! The engine never touches the file system directly. It asks a store for
//! content while polling and for ids while scanning.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use parking_lot::RwLock;
use walkdir::WalkDir;

use entangle_core::{EntangleError, EntangleResult, ResourceId};

/// Content fetcher and enumerator
pub trait ResourceStore: Send + Sync {
    /// Current content; `Ok(None)` once the resource is gone
    fn fetch(&self, id: &ResourceId) -> EntangleResult<Option<Vec<u8>>>;

    /// Ids under `root`, each at most once
    fn enumerate(&self, root: &str, recursive: bool) -> EntangleResult<Vec<ResourceId>>;
}

/// Files on the local file system, identified by path
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStore;

impl FsStore {
    pub fn new() -> Self {
        FsStore
    }
}

impl ResourceStore for FsStore {
    fn fetch(&self, id: &ResourceId) -> EntangleResult<Option<Vec<u8>>> {
        match std::fs::read(id.as_str()) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EntangleError::transient_io(id.as_str(), e)),
        }
    }

    fn enumerate(&self, root: &str, recursive: bool) -> EntangleResult<Vec<ResourceId>> {
        if !Path::new(root).is_dir() {
            return Err(EntangleError::Enumeration {
                root: root.to_string(),
                reason: "not a directory".to_string(),
            });
        }

        let mut walker = WalkDir::new(root).follow_links(false);
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut ids = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    ids.push(ResourceId::new(entry.path().to_string_lossy().into_owned()));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(root, error = %e, "skipping unreadable entry"),
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// In-memory store keyed by `/`-separated ids
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<ResourceId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace content; returns the previous content
    pub fn put(&self, id: impl Into<ResourceId>, content: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        self.entries.write().insert(id.into(), content.into())
    }

    pub fn remove(&self, id: &ResourceId) -> Option<Vec<u8>> {
        self.entries.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ResourceStore for MemoryStore {
    fn fetch(&self, id: &ResourceId) -> EntangleResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(id).cloned())
    }

    fn enumerate(&self, root: &str, recursive: bool) -> EntangleResult<Vec<ResourceId>> {
        let prefix = root.trim_end_matches('/');
        let entries = self.entries.read();
        let ids = entries
            .keys()
            .filter(|id| {
                let rest = if prefix.is_empty() {
                    Some(id.as_str().trim_start_matches('/'))
                } else {
                    id.as_str()
                        .strip_prefix(prefix)
                        .and_then(|r| r.strip_prefix('/'))
                };
                match rest {
                    Some(rest) if !rest.is_empty() => recursive || !rest.contains('/'),
                    _ => false,
                }
            })
            .cloned()
            .collect();
        Ok(ids)
    }
}
