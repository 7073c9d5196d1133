//! Namespaced key-value records backing every persisted object.
//!
//! Records are opaque to the store: a flat `data` map plus labels,
//! annotations and an optional owner reference. Writes are guarded by a
//! per-record resource version, and reads come in two flavours: a cached
//! path that may lag behind other writers, and a consistent path that goes
//! straight to the database.

mod sqlite;

#[cfg(test)]
mod tests;

pub use sqlite::SqliteRecordStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::broadcast;

/// Reference to the object that owns a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub namespace: String,
    pub name: String,
    /// Assigned by the store on create.
    pub uid: String,
    /// Bumped on every write; stale versions are rejected on update.
    pub resource_version: u64,
    /// Set by the writer on create and preserved by the store afterwards.
    pub created_at: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    pub data: BTreeMap<String, String>,
}

impl Record {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: String::new(),
            resource_version: 0,
            created_at: Utc::now(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner: None,
            data: BTreeMap::new(),
        }
    }

    /// Value of a data field, if present.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<String>) {
        self.data.insert(key.to_string(), value.into());
    }
}

/// Which read path to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Served from the in-process cache; may lag writes from other processes.
    Cached,
    /// Served from the database.
    Consistent,
}

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(key, value)
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Atomic partial update: every listed key is replaced in one write.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub data: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl RecordPatch {
    pub fn data(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    Added(Record),
    Modified(Record),
    Deleted(Record),
}

impl RecordEvent {
    pub fn record(&self) -> &Record {
        match self {
            RecordEvent::Added(r) | RecordEvent::Modified(r) | RecordEvent::Deleted(r) => r,
        }
    }

    pub fn into_record(self) -> Record {
        match self {
            RecordEvent::Added(r) | RecordEvent::Modified(r) | RecordEvent::Deleted(r) => r,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("record {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },

    #[error("record {namespace}/{name} was modified concurrently (submitted version {submitted})")]
    Conflict {
        namespace: String,
        name: String,
        submitted: u64,
    },

    #[error("watch fell behind and dropped {0} events")]
    Lagged(u64),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn not_found(namespace: &str, name: &str) -> Self {
        StoreError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Change feed for one namespace.
///
/// Ends (`None`) when the store is dropped. A consumer that falls too far
/// behind gets a single [`StoreError::Lagged`] and then resumes with newer
/// events.
pub struct RecordWatch {
    namespace: String,
    rx: broadcast::Receiver<RecordEvent>,
}

impl RecordWatch {
    pub(crate) fn new(namespace: &str, rx: broadcast::Receiver<RecordEvent>) -> Self {
        Self {
            namespace: namespace.to_string(),
            rx,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn next(&mut self) -> Option<Result<RecordEvent, StoreError>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.record().namespace == self.namespace => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(Err(StoreError::Lagged(skipped)))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Backing object store.
///
/// Read-modify-write is not transactional across calls: writers re-read,
/// submit the version they read, and retry on [`StoreError::Conflict`].
pub trait RecordStore: Send + Sync {
    fn create(&self, record: Record) -> Result<Record, StoreError>;

    fn get(&self, namespace: &str, name: &str, mode: ReadMode) -> Result<Record, StoreError>;

    /// Replaces a record. Fails with `Conflict` if `record.resource_version`
    /// is not the stored version.
    fn update(&self, record: Record) -> Result<Record, StoreError>;

    /// Merges the patch into the stored record in a single write.
    fn patch(&self, namespace: &str, name: &str, patch: &RecordPatch)
        -> Result<Record, StoreError>;

    fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        mode: ReadMode,
    ) -> Result<Vec<Record>, StoreError>;

    fn watch(&self, namespace: &str) -> RecordWatch;

    /// Picks up writes made outside this handle and publishes them to
    /// watchers. Returns the number of records that changed.
    fn refresh(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
