//! Users, user attributes and clusters.
//!
//! The token store and the sync controllers only read these objects. They
//! are kept as records in the shared backing store so that the same change
//! feeds drive everything.

mod records;


pub use records::RecordDirectory;

use crate::store::{ReadMode, RecordWatch, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const USER_NAMESPACE: &str = "users";
pub const USER_ATTRIBUTE_NAMESPACE: &str = "user-attributes";
pub const CLUSTER_NAMESPACE: &str = "clusters";

/// Provider name used for principals that belong to the built-in user database.
pub const LOCAL_PROVIDER: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// Assigned by the backing store.
    #[serde(default)]
    pub uid: String,
    pub display_name: String,
    pub username: String,
    pub enabled: bool,
    /// Principal ids of the form `<provider>[_<type>]://<id>`.
    pub principal_ids: Vec<String>,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uid: String::new(),
            display_name: name.to_string(),
            username: name.to_string(),
            enabled: true,
            principal_ids: vec![format!("{}://{}", LOCAL_PROVIDER, name)],
        }
    }
}

/// Provider-scoped attributes of a user, refreshed from the auth providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAttribute {
    /// User name this attribute object belongs to.
    pub name: String,
    /// Group principal ids per provider.
    pub group_principals: BTreeMap<String, Vec<String>>,
    /// Extra claims per provider.
    pub extra_by_provider: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub needs_refresh: bool,
    /// Opaque marker of the last successful refresh (RFC3339 or empty).
    pub last_refresh: String,
}

impl UserAttribute {
    /// Every group principal across providers, sorted and de-duplicated.
    pub fn sorted_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .group_principals
            .values()
            .flatten()
            .cloned()
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub display_name: String,
}

/// Provider identity derived from a user's principal ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub provider: String,
    pub principal_id: String,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} is corrupt: {reason}")]
    Corrupt {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("user {user} has no principal to derive an identity from")]
    IdentityMissing { user: String },

    #[error("user {user} has principals from several providers: {providers:?}")]
    IdentityAmbiguous { user: String, providers: Vec<String> },

    #[error(transparent)]
    Store(StoreError),
}

impl DirectoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::NotFound { .. })
    }
}

/// Read access to users, user attributes and clusters.
pub trait Directory: Send + Sync {
    fn get_user(&self, name: &str, mode: ReadMode) -> Result<User, DirectoryError>;

    fn get_user_attribute(&self, name: &str, mode: ReadMode) -> Result<UserAttribute, DirectoryError>;

    fn get_cluster(&self, name: &str) -> Result<Cluster, DirectoryError>;

    fn watch_users(&self) -> RecordWatch;

    fn watch_user_attributes(&self) -> RecordWatch;
}

/// Provider name of a principal id (`github_user://123` -> `github`).
pub fn principal_provider(principal_id: &str) -> Option<&str> {
    let (scheme, rest) = principal_id.split_once("://")?;
    if rest.is_empty() {
        return None;
    }
    let provider = scheme.split('_').next().unwrap_or(scheme);
    (!provider.is_empty()).then_some(provider)
}

/// Derives the provider identity tokens are attributed to.
///
/// External principals win over the local one. Principals from more than
/// one external provider make the identity ambiguous. With no external
/// principal the local one is used, and a user without any principal has
/// no identity at all.
pub fn resolve_identity(user: &User) -> Result<Identity, DirectoryError> {
    let mut external: BTreeMap<&str, &str> = BTreeMap::new();
    let mut local = None;

    for id in &user.principal_ids {
        match principal_provider(id) {
            Some(LOCAL_PROVIDER) => {
                local.get_or_insert(id.as_str());
            }
            Some(provider) => {
                external.entry(provider).or_insert(id.as_str());
            }
            None => {}
        }
    }

    match external.len() {
        0 => local
            .map(|id| Identity {
                provider: LOCAL_PROVIDER.to_string(),
                principal_id: id.to_string(),
            })
            .ok_or_else(|| DirectoryError::IdentityMissing {
                user: user.name.clone(),
            }),
        1 => {
            let (provider, id) = external.into_iter().next().unwrap_or_default();
            Ok(Identity {
                provider: provider.to_string(),
                principal_id: id.to_string(),
            })
        }
        _ => Err(DirectoryError::IdentityAmbiguous {
            user: user.name.clone(),
            providers: external.keys().map(|p| p.to_string()).collect(),
        }),
    }
}
