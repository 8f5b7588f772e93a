//! Deletion Index
//!
//! Maps a resource group (one build+lane combination) to the resource kinds
//! currently persisted for it, so evicting a group deletes exactly its keys
//! without scanning the whole store.

use std::collections::HashMap;

use super::{cache_entry_key, SizeAccountedStore};

/// Tracks which resource-kind suffixes are persisted per group
#[derive(Debug, Default)]
pub struct DeletionIndex {
    groups: HashMap<String, Vec<String>>,
}

impl DeletionIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `kind` is now persisted for `group`. The caller only adds
    /// each kind once per successful write; duplicates are tolerated but
    /// produce a redundant (harmless) delete on clear.
    pub fn add(&mut self, group: &str, kind: &str) {
        let kinds = self.groups.entry(group.to_string()).or_default();
        if !kinds.iter().any(|k| k == kind) {
            kinds.push(kind.to_string());
        }
    }

    /// Delete every persisted entry recorded for `group`, then forget the
    /// group. A group with no recorded kinds is a no-op.
    pub fn clear(&mut self, store: &SizeAccountedStore, group: &str) {
        if let Some(kinds) = self.groups.remove(group) {
            for kind in kinds {
                store.clear_one(&cache_entry_key(group, &kind));
            }
        }
    }

    /// Kinds currently recorded for a group (in insertion order)
    pub fn kinds(&self, group: &str) -> &[String] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of tracked groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether any groups are tracked
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
