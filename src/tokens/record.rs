//! Token <-> backing record conversion.
//!
//! The field layout is shared with other consumers of the records and must
//! stay stable. Decoding fails closed: a record missing any
//! security-relevant field is reported as corrupt instead of defaulted.

use super::ttl::expires_at;
use super::{Token, TokenError, TokenKind, TokenSpec, TokenStatus};
use crate::hashers::parse_version;
use crate::store::Record;
use chrono::{DateTime, SecondsFormat, Utc};

pub const FIELD_USER_ID: &str = "user-id";
pub const FIELD_CLUSTER_NAME: &str = "cluster-name";
pub const FIELD_TTL: &str = "ttl";
pub const FIELD_ENABLED: &str = "enabled";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_KIND: &str = "kind";
pub const FIELD_HASH: &str = "hash";
pub const FIELD_AUTH_PROVIDER: &str = "auth-provider";
pub const FIELD_DISPLAY_NAME: &str = "display-name";
pub const FIELD_LOGIN_NAME: &str = "login-name";
pub const FIELD_PRINCIPAL_ID: &str = "principal-id";
pub const FIELD_LAST_UPDATE_TIME: &str = "last-update-time";
pub const FIELD_LAST_USED_AT: &str = "last-used-at";
pub const FIELD_UID: &str = "kube-uid";

pub const LABEL_USER_ID: &str = "tokens.cattle.io/user-id";
pub const LABEL_KIND: &str = "tokens.cattle.io/kind";

/// Encodes a token into a record of `namespace`. The plaintext value is
/// never written.
pub fn to_record(token: &Token, namespace: &str) -> Result<Record, TokenError> {
    if token.spec.user_id.is_empty() {
        return Err(TokenError::BadRequest("spec.userID is required".to_string()));
    }

    let mut record = Record::new(namespace, &token.name);
    record.resource_version = token.resource_version;
    if let Some(created_at) = token.created_at {
        record.created_at = created_at;
    }

    record
        .labels
        .insert(LABEL_USER_ID.to_string(), token.spec.user_id.clone());
    let kind_label = match token.spec.kind {
        TokenKind::Session => "session",
        TokenKind::Derived => "derived",
    };
    record
        .labels
        .insert(LABEL_KIND.to_string(), kind_label.to_string());

    record.set_field(FIELD_UID, &token.uid);
    record.set_field(FIELD_USER_ID, &token.spec.user_id);
    record.set_field(FIELD_CLUSTER_NAME, &token.spec.cluster_name);
    record.set_field(FIELD_TTL, token.spec.ttl.to_string());
    record.set_field(FIELD_ENABLED, token.spec.enabled.to_string());
    record.set_field(FIELD_DESCRIPTION, &token.spec.description);
    record.set_field(FIELD_KIND, token.spec.kind.as_str());
    record.set_field(FIELD_HASH, &token.status.hash);
    record.set_field(FIELD_AUTH_PROVIDER, &token.status.auth_provider);
    record.set_field(FIELD_DISPLAY_NAME, &token.status.display_name);
    record.set_field(FIELD_LOGIN_NAME, &token.status.login_name);
    record.set_field(FIELD_PRINCIPAL_ID, &token.status.principal_id);
    record.set_field(FIELD_LAST_UPDATE_TIME, &token.status.last_update_time);
    record.set_field(
        FIELD_LAST_USED_AT,
        token
            .status
            .last_used_at
            .map(format_time)
            .unwrap_or_default(),
    );

    Ok(record)
}

/// Decodes a token from its record and computes expiry against `now`.
pub fn from_record(record: &Record, now: DateTime<Utc>) -> Result<Token, TokenError> {
    let name = record.name.as_str();
    let required = |key: &str, what: &str| -> Result<String, TokenError> {
        match record.field(key) {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(TokenError::corrupt(name, format!("{} missing", what))),
        }
    };
    let optional = |key: &str| record.field(key).unwrap_or_default().to_string();

    let uid = required(FIELD_UID, "kube uid")?;
    let user_id = required(FIELD_USER_ID, "user id")?;
    let principal_id = required(FIELD_PRINCIPAL_ID, "principal id")?;
    let auth_provider = required(FIELD_AUTH_PROVIDER, "auth provider")?;
    let hash = required(FIELD_HASH, "hash")?;
    let last_update_time = required(FIELD_LAST_UPDATE_TIME, "last update time")?;

    let enabled: bool = optional(FIELD_ENABLED)
        .parse()
        .map_err(|_| TokenError::corrupt(name, "enabled flag is not a boolean"))?;
    let ttl: i64 = optional(FIELD_TTL)
        .parse()
        .map_err(|_| TokenError::corrupt(name, "ttl is not an integer"))?;
    let kind = match record.field(FIELD_KIND).unwrap_or_default() {
        "" => TokenKind::Derived,
        "session" => TokenKind::Session,
        other => return Err(TokenError::corrupt(name, format!("unknown kind '{}'", other))),
    };
    let last_used_at = match record.field(FIELD_LAST_USED_AT).unwrap_or_default() {
        "" => None,
        raw => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| TokenError::corrupt(name, format!("last used at: {}", e)))?
                .with_timezone(&Utc),
        ),
    };

    let mut token = Token {
        name: record.name.clone(),
        uid,
        resource_version: record.resource_version,
        created_at: Some(record.created_at),
        spec: TokenSpec {
            user_id,
            cluster_name: optional(FIELD_CLUSTER_NAME),
            ttl,
            enabled,
            description: optional(FIELD_DESCRIPTION),
            kind,
        },
        status: TokenStatus {
            hash_algorithm: parse_version(&hash).ok(),
            hash,
            auth_provider,
            display_name: optional(FIELD_DISPLAY_NAME),
            login_name: optional(FIELD_LOGIN_NAME),
            principal_id,
            last_update_time,
            last_used_at,
            ..Default::default()
        },
    };
    set_expired(&mut token, now);
    Ok(token)
}

/// Recomputes `expired`/`expires_at` from creation time and TTL.
pub(crate) fn set_expired(token: &mut Token, now: DateTime<Utc>) {
    let created_at = token.created_at.unwrap_or(now);
    match expires_at(created_at, token.spec.ttl) {
        Some(at) => {
            token.status.expired = now > at;
            token.status.expires_at = format_time(at);
        }
        None => {
            token.status.expired = false;
            token.status.expires_at.clear();
        }
    }
}

pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
