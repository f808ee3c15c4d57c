//! Cluster-wide storage deduplication
//!
//! Shared backends (NFS, Ceph, ...) are visible from every node but back a
//! single physical capacity; they must count once in cluster totals.
//! Non-shared entries (e.g. "local") are distinct per node even when they
//! reuse the same id.

use pvedash_common::Storage;
use std::collections::{BTreeSet, HashMap};

/// Canonical storage registry for one snapshot build
#[derive(Debug, Default)]
pub struct StorageDedup {
    /// One canonical entry per shared storage id
    shared: HashMap<String, Storage>,
    /// Which nodes report each shared id
    shared_nodes: HashMap<String, BTreeSet<String>>,
    /// Non-shared entries, keyed by (node, id)
    local: HashMap<(String, String), Storage>,
}

impl StorageDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one storage entry as reported by a node.
    pub fn register(&mut self, storage: &Storage) {
        if storage.shared {
            self.shared
                .entry(storage.id.clone())
                .or_insert_with(|| storage.clone());
            self.shared_nodes
                .entry(storage.id.clone())
                .or_default()
                .insert(storage.node.clone());
        } else {
            self.local.insert(
                (storage.node.clone(), storage.id.clone()),
                storage.clone(),
            );
        }
    }

    /// Sum of max capacity: shared ids once, non-shared per node.
    pub fn total_capacity(&self) -> u64 {
        self.shared.values().map(|s| s.max_disk).sum::<u64>()
            + self.local.values().map(|s| s.max_disk).sum::<u64>()
    }

    /// Sum of usage, counted the same way as capacity.
    pub fn total_usage(&self) -> u64 {
        self.shared.values().map(|s| s.disk).sum::<u64>()
            + self.local.values().map(|s| s.disk).sum::<u64>()
    }

    /// Nodes reporting a given shared storage id.
    pub fn nodes_for(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.shared_nodes.get(id)
    }
}
