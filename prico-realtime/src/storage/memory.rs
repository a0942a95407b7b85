//! In-process document store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use super::{assign_id, merge, DocumentStore, StoreError};

/// Write counters, for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub saves: u64,
    pub updates: u64,
    pub deletes: u64,
    pub documents: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<(String, String), Value>>,
    saves: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            saves: self.saves.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            documents: self.documents.read().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    /// Number of documents in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(c, _)| c == collection)
            .count()
    }
}

fn key(collection: &str, id: &str) -> (String, String) {
    (collection.to_string(), id.to_string())
}

impl DocumentStore for MemoryStore {
    fn save(&self, collection: &str, mut document: Value) -> Result<String, StoreError> {
        let id = assign_id(&mut document)?;
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(collection, &id), document);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn update(&self, collection: &str, id: &str, partial: Value) -> Result<(), StoreError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let document = documents
            .get_mut(&key(collection, id))
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        merge(document, partial)?;
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn find(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(collection, id))
            .cloned())
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(collection, id))
            .is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }
}
