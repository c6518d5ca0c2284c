//! Process-scoped member registry.
//!
//! Originals are the live methods eligible for swapping; replacements are the most recently
//! loaded bodies for the same identity. Both maps are sharded concurrent maps, so writers on
//! watcher threads and readers on application threads need no extra locking. Replacement
//! writes are last-write-wins; a reader sees either the old or the new `Arc`, never a mix.

use std::sync::Arc;

use dashmap::DashMap;

use crate::model::{IdentityKey, MethodDef, ModuleName};
use crate::runtime::MethodHandle;

/// A body loaded from a reloaded module, waiting to be compiled in place of an original.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub identity: IdentityKey,
    pub module: ModuleName,
    pub revision: u32,
    pub method: MethodDef,
}

#[derive(Debug, Default)]
pub struct MemberRegistry {
    originals: DashMap<IdentityKey, MethodHandle>,
    replacements: DashMap<IdentityKey, Arc<Replacement>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live method as swappable. The first registration for an identity wins.
    pub fn register_original(&self, identity: IdentityKey, member: MethodHandle) -> bool {
        let mut inserted = false;
        self.originals.entry(identity).or_insert_with(|| {
            inserted = true;
            member
        });
        inserted
    }

    pub fn register_replacement(&self, identity: IdentityKey, body: Replacement) {
        self.replacements.insert(identity, Arc::new(body));
    }

    pub fn lookup_original(&self, identity: &IdentityKey) -> Option<MethodHandle> {
        self.originals.get(identity).map(|entry| entry.value().clone())
    }

    pub fn lookup_replacement(&self, identity: &IdentityKey) -> Option<Arc<Replacement>> {
        self.replacements.get(identity).map(|entry| entry.value().clone())
    }

    /// Sorted identities of every registered original.
    pub fn original_identities(&self) -> Vec<IdentityKey> {
        let mut keys: Vec<IdentityKey> = self.originals.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn original_count(&self) -> usize {
        self.originals.len()
    }

    pub fn replacement_count(&self) -> usize {
        self.replacements.len()
    }
}
