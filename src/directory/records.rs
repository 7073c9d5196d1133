use super::{
    Cluster, Directory, DirectoryError, User, UserAttribute, CLUSTER_NAMESPACE,
    USER_ATTRIBUTE_NAMESPACE, USER_NAMESPACE,
};
use crate::store::{ReadMode, Record, RecordStore, RecordWatch, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

const FIELD_DISPLAY_NAME: &str = "display-name";
const FIELD_USERNAME: &str = "username";
const FIELD_ENABLED: &str = "enabled";
const FIELD_PRINCIPAL_IDS: &str = "principal-ids";
const FIELD_GROUPS: &str = "group-principals";
const FIELD_EXTRA: &str = "extra";
const FIELD_NEEDS_REFRESH: &str = "needs-refresh";
const FIELD_LAST_REFRESH: &str = "last-refresh";

/// [`Directory`] over the shared record store.
#[derive(Clone)]
pub struct RecordDirectory {
    store: Arc<dyn RecordStore>,
}

impl RecordDirectory {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Creates or replaces a user. Returns the stored user with its uid.
    pub fn put_user(&self, user: &User) -> Result<User, DirectoryError> {
        let mut record = Record::new(USER_NAMESPACE, &user.name);
        record.set_field(FIELD_DISPLAY_NAME, &user.display_name);
        record.set_field(FIELD_USERNAME, &user.username);
        record.set_field(FIELD_ENABLED, user.enabled.to_string());
        record.set_field(FIELD_PRINCIPAL_IDS, encode_json(&user.principal_ids)?);
        let stored = self.upsert(record)?;
        user_from_record(&stored)
    }

    pub fn put_user_attribute(&self, attribute: &UserAttribute) -> Result<UserAttribute, DirectoryError> {
        let mut record = Record::new(USER_ATTRIBUTE_NAMESPACE, &attribute.name);
        record.set_field(FIELD_GROUPS, encode_json(&attribute.group_principals)?);
        record.set_field(FIELD_EXTRA, encode_json(&attribute.extra_by_provider)?);
        record.set_field(FIELD_NEEDS_REFRESH, attribute.needs_refresh.to_string());
        record.set_field(FIELD_LAST_REFRESH, &attribute.last_refresh);
        let stored = self.upsert(record)?;
        user_attribute_from_record(&stored)
    }

    pub fn put_cluster(&self, cluster: &Cluster) -> Result<Cluster, DirectoryError> {
        let mut record = Record::new(CLUSTER_NAMESPACE, &cluster.name);
        record.set_field(FIELD_DISPLAY_NAME, &cluster.display_name);
        self.upsert(record)?;
        Ok(cluster.clone())
    }

    pub fn delete_user_attribute(&self, name: &str) -> Result<(), DirectoryError> {
        self.store
            .delete(USER_ATTRIBUTE_NAMESPACE, name)
            .map_err(|e| map_store_error(e, "user attribute", name))
    }

    pub fn delete_user(&self, name: &str) -> Result<(), DirectoryError> {
        self.store
            .delete(USER_NAMESPACE, name)
            .map_err(|e| map_store_error(e, "user", name))
    }

    fn upsert(&self, mut record: Record) -> Result<Record, DirectoryError> {
        match self
            .store
            .get(&record.namespace, &record.name, ReadMode::Consistent)
        {
            Ok(existing) => {
                record.resource_version = existing.resource_version;
                record.owner = existing.owner;
                self.store.update(record).map_err(DirectoryError::Store)
            }
            Err(e) if e.is_not_found() => self.store.create(record).map_err(DirectoryError::Store),
            Err(e) => Err(DirectoryError::Store(e)),
        }
    }
}

impl Directory for RecordDirectory {
    fn get_user(&self, name: &str, mode: ReadMode) -> Result<User, DirectoryError> {
        let record = self
            .store
            .get(USER_NAMESPACE, name, mode)
            .map_err(|e| map_store_error(e, "user", name))?;
        user_from_record(&record)
    }

    fn get_user_attribute(&self, name: &str, mode: ReadMode) -> Result<UserAttribute, DirectoryError> {
        let record = self
            .store
            .get(USER_ATTRIBUTE_NAMESPACE, name, mode)
            .map_err(|e| map_store_error(e, "user attribute", name))?;
        user_attribute_from_record(&record)
    }

    fn get_cluster(&self, name: &str) -> Result<Cluster, DirectoryError> {
        let record = self
            .store
            .get(CLUSTER_NAMESPACE, name, ReadMode::Cached)
            .map_err(|e| map_store_error(e, "cluster", name))?;
        Ok(Cluster {
            name: record.name.clone(),
            display_name: record.field(FIELD_DISPLAY_NAME).unwrap_or_default().to_string(),
        })
    }

    fn watch_users(&self) -> RecordWatch {
        self.store.watch(USER_NAMESPACE)
    }

    fn watch_user_attributes(&self) -> RecordWatch {
        self.store.watch(USER_ATTRIBUTE_NAMESPACE)
    }
}

fn map_store_error(e: StoreError, kind: &'static str, name: &str) -> DirectoryError {
    if e.is_not_found() {
        DirectoryError::NotFound {
            kind,
            name: name.to_string(),
        }
    } else {
        DirectoryError::Store(e)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, DirectoryError> {
    serde_json::to_string(value).map_err(|e| DirectoryError::Store(StoreError::Encoding(e)))
}

fn decode_json<T: DeserializeOwned + Default>(
    record: &Record,
    field: &str,
    kind: &'static str,
) -> Result<T, DirectoryError> {
    match record.field(field) {
        None | Some("") => Ok(T::default()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| DirectoryError::Corrupt {
            kind,
            name: record.name.clone(),
            reason: format!("field {}: {}", field, e),
        }),
    }
}

/// Decodes a user record. Records written by other tools may omit the
/// enabled flag, which then defaults to enabled.
pub(crate) fn user_from_record(record: &Record) -> Result<User, DirectoryError> {
    let enabled = match record.field(FIELD_ENABLED) {
        None | Some("") => true,
        Some(raw) => raw.parse().map_err(|_| DirectoryError::Corrupt {
            kind: "user",
            name: record.name.clone(),
            reason: format!("invalid enabled flag '{}'", raw),
        })?,
    };

    Ok(User {
        name: record.name.clone(),
        uid: record.uid.clone(),
        display_name: record.field(FIELD_DISPLAY_NAME).unwrap_or_default().to_string(),
        username: record.field(FIELD_USERNAME).unwrap_or_default().to_string(),
        enabled,
        principal_ids: decode_json(record, FIELD_PRINCIPAL_IDS, "user")?,
    })
}

pub(crate) fn user_attribute_from_record(record: &Record) -> Result<UserAttribute, DirectoryError> {
    Ok(UserAttribute {
        name: record.name.clone(),
        group_principals: decode_json(record, FIELD_GROUPS, "user attribute")?,
        extra_by_provider: decode_json(record, FIELD_EXTRA, "user attribute")?,
        needs_refresh: record.field(FIELD_NEEDS_REFRESH) == Some("true"),
        last_refresh: record.field(FIELD_LAST_REFRESH).unwrap_or_default().to_string(),
    })
}
