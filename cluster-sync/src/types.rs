//! Shadow objects kept in a downstream cluster.
//!
//! Decoding is lenient on purpose: a shadow that does not decode cleanly
//! compares unequal to the desired state and simply gets rewritten.

use std::collections::BTreeMap;
use tokensync::directory::{User, UserAttribute};
use tokensync::store::Record;
use tokensync::tokens::Token;

pub const CLUSTER_AUTH_TOKEN_NAMESPACE: &str = "cluster-auth-tokens";
pub const CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE: &str = "cluster-auth-token-secrets";
pub const CLUSTER_USER_ATTRIBUTE_NAMESPACE: &str = "cluster-user-attributes";

/// Label carrying the owning user, for per-user listing of shadows.
pub const LABEL_USER_NAME: &str = "cluster.cattle.io/user-name";

pub const FIELD_USER_NAME: &str = "user-name";
pub const FIELD_ENABLED: &str = "enabled";
pub const FIELD_EXPIRES_AT: &str = "expires-at";
pub const FIELD_HASH: &str = "hash";
pub const FIELD_GROUPS: &str = "groups";
pub const FIELD_NEEDS_REFRESH: &str = "needs-refresh";
pub const FIELD_LAST_REFRESH: &str = "last-refresh";
pub const FIELD_EXTRA: &str = "extra";

const SECRET_PREFIX: &str = "cat-";

/// Name of the record holding the hash of shadow credential `token`.
pub fn secret_name(token: &str) -> String {
    format!("{}{}", SECRET_PREFIX, token)
}

/// Downstream shadow of a cluster-scoped token. Never carries the hash;
/// that lives in the companion secret record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAuthToken {
    pub name: String,
    pub user_name: String,
    pub enabled: bool,
    /// RFC3339, empty when the token never expires.
    pub expires_at: String,
}

impl ClusterAuthToken {
    pub fn from_token(token: &Token) -> Self {
        Self {
            name: token.name.clone(),
            user_name: token.spec.user_id.clone(),
            enabled: token.spec.enabled,
            expires_at: token.status.expires_at.clone(),
        }
    }

    pub fn from_record(record: &Record) -> Self {
        Self {
            name: record.name.clone(),
            user_name: record.field(FIELD_USER_NAME).unwrap_or_default().to_string(),
            enabled: record.field(FIELD_ENABLED) == Some("true"),
            expires_at: record.field(FIELD_EXPIRES_AT).unwrap_or_default().to_string(),
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(CLUSTER_AUTH_TOKEN_NAMESPACE, &self.name);
        self.apply(&mut record);
        record
    }

    /// Writes the shadow fields into an existing record, keeping its
    /// identity and version.
    pub fn apply(&self, record: &mut Record) {
        record
            .labels
            .insert(LABEL_USER_NAME.to_string(), self.user_name.clone());
        record.set_field(FIELD_USER_NAME, &self.user_name);
        record.set_field(FIELD_ENABLED, self.enabled.to_string());
        record.set_field(FIELD_EXPIRES_AT, &self.expires_at);
    }
}

/// Downstream shadow of a user's enabled flag and provider attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterUserAttribute {
    pub name: String,
    pub enabled: bool,
    /// Sorted and de-duplicated.
    pub groups: Vec<String>,
    pub needs_refresh: bool,
    pub last_refresh: String,
    pub extra: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl ClusterUserAttribute {
    pub fn from_upstream(user: &User, attribute: &UserAttribute) -> Self {
        Self {
            name: user.name.clone(),
            enabled: user.enabled,
            groups: attribute.sorted_groups(),
            needs_refresh: attribute.needs_refresh,
            last_refresh: attribute.last_refresh.clone(),
            extra: attribute.extra_by_provider.clone(),
        }
    }

    pub fn from_record(record: &Record) -> Self {
        let json = |key: &str| record.field(key).unwrap_or_default();
        Self {
            name: record.name.clone(),
            enabled: record.field(FIELD_ENABLED) == Some("true"),
            groups: serde_json::from_str(json(FIELD_GROUPS)).unwrap_or_default(),
            needs_refresh: record.field(FIELD_NEEDS_REFRESH) == Some("true"),
            last_refresh: record.field(FIELD_LAST_REFRESH).unwrap_or_default().to_string(),
            extra: serde_json::from_str(json(FIELD_EXTRA)).unwrap_or_default(),
        }
    }

    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        let mut record = Record::new(CLUSTER_USER_ATTRIBUTE_NAMESPACE, &self.name);
        self.apply(&mut record)?;
        Ok(record)
    }

    pub fn apply(&self, record: &mut Record) -> Result<(), serde_json::Error> {
        record.set_field(FIELD_ENABLED, self.enabled.to_string());
        record.set_field(FIELD_GROUPS, serde_json::to_string(&self.groups)?);
        record.set_field(FIELD_NEEDS_REFRESH, self.needs_refresh.to_string());
        record.set_field(FIELD_LAST_REFRESH, &self.last_refresh);
        record.set_field(FIELD_EXTRA, serde_json::to_string(&self.extra)?);
        Ok(())
    }
}
