//! Token store.
//!
//! Tokens live 1:1 in backing records of a dedicated namespace. The
//! [`SystemTokenStore`] performs unrestricted operations; the scoped
//! [`TokenStore`] wraps it and applies the per-caller permission rules.
//!
//! The plaintext secret of a token is generated server-side, returned once
//! in the create response and never persisted. Expiry is recomputed from
//! creation time and TTL on every read.

mod clock;
mod record;
mod scoped;
mod system;
mod ttl;


pub use clock::{Clock, ManualClock, SystemClock};
pub use record::{
    from_record, to_record, FIELD_AUTH_PROVIDER, FIELD_CLUSTER_NAME, FIELD_DESCRIPTION,
    FIELD_DISPLAY_NAME, FIELD_ENABLED, FIELD_HASH, FIELD_KIND, FIELD_LAST_UPDATE_TIME,
    FIELD_LAST_USED_AT, FIELD_LOGIN_NAME, FIELD_PRINCIPAL_ID, FIELD_TTL, FIELD_UID, FIELD_USER_ID,
    LABEL_KIND, LABEL_USER_ID,
};
pub use scoped::TokenStore;
pub use system::{SystemTokenStore, TokenEvent, WATCH_CHANNEL_CAPACITY};
pub use ttl::{clamp_max_ttl, expires_at, ttl_greater};

use crate::directory::DirectoryError;
use crate::hashers::{HashError, HashVersion};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of server-generated token names.
pub const GENERATED_NAME_PREFIX: &str = "token-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Token derived from a login for programmatic use.
    #[default]
    Derived,
    /// Token backing an interactive login session.
    Session,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Derived => "",
            TokenKind::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenSpec {
    pub user_id: String,
    /// Empty for tokens valid across all clusters.
    pub cluster_name: String,
    /// Milliseconds. 0 requests the default, negative never expires.
    pub ttl: i64,
    pub enabled: bool,
    pub description: String,
    pub kind: TokenKind,
}

/// Derived state. Never accepted from clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenStatus {
    /// Plaintext secret. Only set in the create response.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// `ext/<name>:<value>`. Only set in the create response.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bearer_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash: String,
    pub hash_algorithm: Option<HashVersion>,
    pub auth_provider: String,
    pub display_name: String,
    pub login_name: String,
    pub principal_id: String,
    pub last_update_time: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expired: bool,
    /// RFC3339, empty when the token never expires.
    pub expires_at: String,
    /// True when this token authenticates the requesting session.
    pub current: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Token {
    pub name: String,
    pub uid: String,
    pub resource_version: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub spec: TokenSpec,
    pub status: TokenStatus,
}

impl Token {
    pub fn new(user_id: &str) -> Self {
        Self {
            spec: TokenSpec {
                user_id: user_id.to_string(),
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Drops everything that must not leave the store after creation.
    pub(crate) fn scrub(&mut self) {
        self.status.value.clear();
        self.status.bearer_token.clear();
        self.status.hash.clear();
    }
}

/// How much a caller may change on an existing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    /// "Manage credentials": may grow or shrink the TTL.
    Elevated,
    /// Owner of the token: may only shrink the TTL.
    Owner,
    /// Neither: may not touch the TTL at all.
    None,
}

/// Options for create and update.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Validate and return the would-be object without writing.
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("token {0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("token {0} already exists")]
    AlreadyExists(String),

    #[error("token {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("failed to hash token secret: {0}")]
    Hash(#[from] HashError),

    #[error("directory lookup failed: {0}")]
    Directory(DirectoryError),

    #[error("backing store failure: {0}")]
    Store(StoreError),
}

impl TokenError {
    pub(crate) fn corrupt(name: &str, reason: impl Into<String>) -> Self {
        TokenError::Corrupt {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Maps backing store errors for the token `name`.
    pub(crate) fn from_store(name: &str, e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => TokenError::NotFound(name.to_string()),
            StoreError::AlreadyExists { .. } => TokenError::AlreadyExists(name.to_string()),
            other => TokenError::Store(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TokenError::NotFound(_))
    }
}
