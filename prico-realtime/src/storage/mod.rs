//! Document persistence behind the rooms.
//!
//! ```text
//! Room ──► PersistQueue ──► spawn_blocking ──► DocumentStore
//!                                                │
//!                              ┌─────────────────┴────────────────┐
//!                              ▼                                  ▼
//!                         MemoryStore                        RocksStore
//!                      (tests, dev default)        CF "documents", LZ4 JSON values
//! ```
//!
//! Stores are synchronous; the hub always calls them from a blocking task.
//! Documents are JSON objects identified by their string `id` field.

pub mod memory;
pub mod rocks;

pub use memory::{MemoryStore, StoreStats};
pub use rocks::{RocksStore, StoreConfig};

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Collection holding chat messages.
pub const MESSAGES: &str = "messages";
/// Collection holding projects and their `files` arrays.
pub const PROJECTS: &str = "projects";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// Document persistence interface.
pub trait DocumentStore: Send + Sync {
    /// Stores `document` and returns its id. The document's own `id` is
    /// used when present; otherwise a UUID v4 is assigned.
    fn save(&self, collection: &str, document: Value) -> Result<String, StoreError>;

    /// Shallow-merges `partial` into an existing document.
    fn update(&self, collection: &str, id: &str, partial: Value) -> Result<(), StoreError>;

    fn find(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Returns whether a document was removed.
    fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;
}

/// Ensures `document` is an object carrying a string id, assigning one if
/// needed, and returns that id.
pub(crate) fn assign_id(document: &mut Value) -> Result<String, StoreError> {
    let object = document
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidDocument("expected a JSON object".into()))?;
    match object.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        None | Some(Value::Null) => {
            let id = Uuid::new_v4().to_string();
            object.insert("id".into(), Value::String(id.clone()));
            Ok(id)
        }
        Some(_) => Err(StoreError::InvalidDocument("`id` must be a non-empty string".into())),
    }
}

/// Shallow merge: top-level keys of `partial` overwrite those of `document`.
/// The `id` key is never changed.
pub(crate) fn merge(document: &mut Value, partial: Value) -> Result<(), StoreError> {
    let Value::Object(fields) = partial else {
        return Err(StoreError::InvalidDocument("partial update must be a JSON object".into()));
    };
    let target: &mut Map<String, Value> = document
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidDocument("stored document is not an object".into()))?;
    for (key, value) in fields {
        if key != "id" {
            target.insert(key, value);
        }
    }
    Ok(())
}
