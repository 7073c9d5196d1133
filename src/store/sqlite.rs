//! SQLite-backed record store.

use super::{
    LabelSelector, OwnerReference, ReadMode, Record, RecordEvent, RecordPatch, RecordStore,
    RecordWatch, StoreError,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Record store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE records (
///     namespace TEXT NOT NULL,
///     name TEXT NOT NULL,
///     uid TEXT NOT NULL,
///     resource_version INTEGER NOT NULL,
///     created_at TEXT NOT NULL,      -- RFC3339
///     labels TEXT NOT NULL,          -- JSON object
///     annotations TEXT NOT NULL,     -- JSON object
///     owner TEXT,                    -- JSON object (optional)
///     data TEXT NOT NULL,            -- JSON object
///     PRIMARY KEY(namespace, name)
/// );
/// ```
///
/// # Caching
/// The cache is loaded when the store is opened and kept current by this
/// instance's own writes. Writes made through another instance on the same
/// file are only visible to [`ReadMode::Consistent`] reads until
/// [`RecordStore::refresh`] runs, which also replays them to watchers.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
    cache: DashMap<(String, String), Record>,
    events: broadcast::Sender<RecordEvent>,
}

impl SqliteRecordStore {
    /// Opens or creates a store. `":memory:"` gives a private in-memory database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                uid TEXT NOT NULL,
                resource_version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                labels TEXT NOT NULL,
                annotations TEXT NOT NULL,
                owner TEXT,
                data TEXT NOT NULL,
                PRIMARY KEY(namespace, name)
            )
            "#,
            [],
        )?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Self {
            conn: Mutex::new(conn),
            cache: DashMap::new(),
            events,
        };
        store.reload_cache()?;
        Ok(store)
    }

    /// In-memory store, used by tests and single-process setups.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Rebuilds the cache from the database.
    pub fn reload_cache(&self) -> Result<(), StoreError> {
        let records = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!("SELECT {} FROM records", COLUMNS))?;
            let rows = stmt.query_map([], RawRow::from_row)?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            records
        };

        self.cache.clear();
        for raw in records {
            let record = raw.into_record()?;
            self.cache
                .insert((record.namespace.clone(), record.name.clone()), record);
        }
        debug!(records = self.cache.len(), "Record cache loaded");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn select(conn: &Connection, namespace: &str, name: &str) -> Result<Option<Record>, StoreError> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM records WHERE namespace = ?1 AND name = ?2",
                    COLUMNS
                ),
                params![namespace, name],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn publish(&self, event: RecordEvent) {
        let record = event.record();
        let key = (record.namespace.clone(), record.name.clone());
        match &event {
            RecordEvent::Deleted(_) => {
                self.cache.remove(&key);
            }
            RecordEvent::Added(r) | RecordEvent::Modified(r) => {
                self.cache.insert(key, r.clone());
            }
        }
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    fn write(conn: &Connection, record: &Record) -> Result<(), StoreError> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO records (
                namespace, name, uid, resource_version, created_at,
                labels, annotations, owner, data
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.namespace,
                record.name,
                record.uid,
                record.resource_version as i64,
                record.created_at.to_rfc3339(),
                serde_json::to_string(&record.labels)?,
                serde_json::to_string(&record.annotations)?,
                record.owner.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&record.data)?,
            ],
        )?;
        Ok(())
    }
}

const COLUMNS: &str =
    "namespace, name, uid, resource_version, created_at, labels, annotations, owner, data";

/// Row as stored, before JSON decoding.
struct RawRow {
    namespace: String,
    name: String,
    uid: String,
    resource_version: i64,
    created_at: String,
    labels: String,
    annotations: String,
    owner: Option<String>,
    data: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            namespace: row.get(0)?,
            name: row.get(1)?,
            uid: row.get(2)?,
            resource_version: row.get(3)?,
            created_at: row.get(4)?,
            labels: row.get(5)?,
            annotations: row.get(6)?,
            owner: row.get(7)?,
            data: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<Record, StoreError> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                StoreError::Encoding(serde::de::Error::custom(format!(
                    "invalid created_at '{}': {}",
                    self.created_at, e
                )))
            })?;
        let owner: Option<OwnerReference> =
            self.owner.as_deref().map(serde_json::from_str).transpose()?;
        let labels: BTreeMap<String, String> = serde_json::from_str(&self.labels)?;
        let annotations: BTreeMap<String, String> = serde_json::from_str(&self.annotations)?;
        let data: BTreeMap<String, String> = serde_json::from_str(&self.data)?;

        Ok(Record {
            namespace: self.namespace,
            name: self.name,
            uid: self.uid,
            resource_version: self.resource_version as u64,
            created_at,
            labels,
            annotations,
            owner,
            data,
        })
    }
}

impl RecordStore for SqliteRecordStore {
    fn create(&self, mut record: Record) -> Result<Record, StoreError> {
        {
            let conn = self.conn()?;
            if Self::select(&conn, &record.namespace, &record.name)?.is_some() {
                return Err(StoreError::AlreadyExists {
                    namespace: record.namespace,
                    name: record.name,
                });
            }

            record.uid = Uuid::new_v4().to_string();
            record.resource_version = 1;
            Self::write(&conn, &record)?;
        }

        debug!(namespace = %record.namespace, name = %record.name, "Record created");
        self.publish(RecordEvent::Added(record.clone()));
        Ok(record)
    }

    fn get(&self, namespace: &str, name: &str, mode: ReadMode) -> Result<Record, StoreError> {
        match mode {
            ReadMode::Cached => self
                .cache
                .get(&(namespace.to_string(), name.to_string()))
                .map(|r| r.value().clone())
                .ok_or_else(|| StoreError::not_found(namespace, name)),
            ReadMode::Consistent => {
                let conn = self.conn()?;
                Self::select(&conn, namespace, name)?
                    .ok_or_else(|| StoreError::not_found(namespace, name))
            }
        }
    }

    fn update(&self, mut record: Record) -> Result<Record, StoreError> {
        {
            let conn = self.conn()?;
            let current = Self::select(&conn, &record.namespace, &record.name)?
                .ok_or_else(|| StoreError::not_found(&record.namespace, &record.name))?;
            if current.resource_version != record.resource_version {
                return Err(StoreError::Conflict {
                    namespace: record.namespace,
                    name: record.name,
                    submitted: record.resource_version,
                });
            }

            // Identity fields are owned by the store.
            record.uid = current.uid;
            record.created_at = current.created_at;
            record.resource_version = current.resource_version + 1;
            Self::write(&conn, &record)?;
        }

        self.publish(RecordEvent::Modified(record.clone()));
        Ok(record)
    }

    fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &RecordPatch,
    ) -> Result<Record, StoreError> {
        let record = {
            let conn = self.conn()?;
            let mut record = Self::select(&conn, namespace, name)?
                .ok_or_else(|| StoreError::not_found(namespace, name))?;
            record
                .data
                .extend(patch.data.iter().map(|(k, v)| (k.clone(), v.clone())));
            record
                .annotations
                .extend(patch.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
            record.resource_version += 1;
            Self::write(&conn, &record)?;
            record
        };

        self.publish(RecordEvent::Modified(record.clone()));
        Ok(record)
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let record = {
            let conn = self.conn()?;
            let record = Self::select(&conn, namespace, name)?
                .ok_or_else(|| StoreError::not_found(namespace, name))?;
            conn.execute(
                "DELETE FROM records WHERE namespace = ?1 AND name = ?2",
                params![namespace, name],
            )?;
            record
        };

        debug!(namespace = %namespace, name = %name, "Record deleted");
        self.publish(RecordEvent::Deleted(record));
        Ok(())
    }

    fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        mode: ReadMode,
    ) -> Result<Vec<Record>, StoreError> {
        let mut records = match mode {
            ReadMode::Cached => self
                .cache
                .iter()
                .filter(|entry| entry.key().0 == namespace)
                .map(|entry| entry.value().clone())
                .collect::<Vec<_>>(),
            ReadMode::Consistent => {
                let raw = {
                    let conn = self.conn()?;
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM records WHERE namespace = ?1",
                        COLUMNS
                    ))?;
                    let rows = stmt.query_map(params![namespace], RawRow::from_row)?;
                    let raw = rows.collect::<Result<Vec<_>, _>>()?;
                    raw
                };
                raw.into_iter()
                    .map(RawRow::into_record)
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        records.retain(|r| selector.matches(&r.labels));
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn watch(&self, namespace: &str) -> RecordWatch {
        RecordWatch::new(namespace, self.events.subscribe())
    }

    fn refresh(&self) -> Result<usize, StoreError> {
        // Held throughout so no local write lands between the read and the diff.
        let conn = self.conn()?;
        let raw = {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM records", COLUMNS))?;
            let rows = stmt.query_map([], RawRow::from_row)?;
            let raw = rows.collect::<Result<Vec<_>, _>>()?;
            raw
        };

        let mut seen = HashSet::with_capacity(raw.len());
        let mut changed = 0;
        for raw in raw {
            let record = raw.into_record()?;
            let key = (record.namespace.clone(), record.name.clone());
            let event = match self.cache.get(&key) {
                None => Some(RecordEvent::Added(record)),
                Some(cached)
                    if cached.uid != record.uid
                        || cached.resource_version != record.resource_version =>
                {
                    Some(RecordEvent::Modified(record))
                }
                Some(_) => None,
            };
            seen.insert(key);
            if let Some(event) = event {
                self.publish(event);
                changed += 1;
            }
        }

        let gone: Vec<Record> = self
            .cache
            .iter()
            .filter(|entry| !seen.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        for record in gone {
            self.publish(RecordEvent::Deleted(record));
            changed += 1;
        }
        drop(conn);

        if changed > 0 {
            debug!(changed, "Picked up external writes");
        }
        Ok(changed)
    }
}
