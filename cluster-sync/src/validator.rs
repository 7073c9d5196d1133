//! Validates cluster-auth bearer tokens against the shadow objects in a
//! downstream cluster, without calling back to the upstream store.

use crate::types::{
    secret_name, ClusterAuthToken, ClusterUserAttribute, CLUSTER_AUTH_TOKEN_NAMESPACE,
    CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, CLUSTER_USER_ATTRIBUTE_NAMESPACE, FIELD_HASH,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokensync::auth::{parse_token_bearer, BearerError};
use tokensync::hashers::HashRegistry;
use tokensync::store::{ReadMode, Record, RecordStore, StoreError};
use tokensync::tokens::{Clock, SystemClock};
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{0}")]
    Malformed(#[from] BearerError),

    #[error("invalid token")]
    Invalid,

    #[error("token is disabled")]
    Disabled,

    #[error("token has expired")]
    Expired,

    #[error("user is disabled")]
    UserDisabled,

    #[error("store failure: {0}")]
    Backend(String),
}

impl From<StoreError> for ValidationError {
    fn from(e: StoreError) -> Self {
        ValidationError::Backend(e.to_string())
    }
}

/// Identity behind a validated cluster-auth token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedToken {
    pub token: String,
    pub user: String,
    pub groups: Vec<String>,
}

pub struct ClusterTokenValidator {
    downstream: Arc<dyn RecordStore>,
    hashers: HashRegistry,
    clock: Arc<dyn Clock>,
}

impl ClusterTokenValidator {
    pub fn new(downstream: Arc<dyn RecordStore>, hashers: HashRegistry) -> Self {
        Self {
            downstream,
            hashers,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn validate(&self, bearer: &str) -> Result<ValidatedToken, ValidationError> {
        let (name, secret) = parse_token_bearer(bearer)?;

        let Some(record) = self.lookup(CLUSTER_AUTH_TOKEN_NAMESPACE, &name)? else {
            return Err(ValidationError::Invalid);
        };
        let shadow = ClusterAuthToken::from_record(&record);
        if !shadow.enabled {
            return Err(ValidationError::Disabled);
        }
        if !shadow.expires_at.is_empty() {
            let expires_at = DateTime::parse_from_rfc3339(&shadow.expires_at).map_err(|e| {
                debug!(token = %name, error = %e, "Unparsable shadow expiry");
                ValidationError::Expired
            })?;
            if self.clock.now() > expires_at.with_timezone(&Utc) {
                return Err(ValidationError::Expired);
            }
        }

        let Some(secret_record) =
            self.lookup(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret_name(&name))?
        else {
            return Err(ValidationError::Invalid);
        };
        let hash = secret_record.field(FIELD_HASH).unwrap_or_default();
        if let Err(e) = self.hashers.verify(hash, &secret) {
            debug!(token = %name, error = %e, "Cluster token secret rejected");
            return Err(ValidationError::Invalid);
        }

        let Some(attribute) = self.lookup(CLUSTER_USER_ATTRIBUTE_NAMESPACE, &shadow.user_name)?
        else {
            return Err(ValidationError::Invalid);
        };
        let attribute = ClusterUserAttribute::from_record(&attribute);
        if !attribute.enabled {
            return Err(ValidationError::UserDisabled);
        }

        Ok(ValidatedToken {
            token: name,
            user: shadow.user_name,
            groups: attribute.groups,
        })
    }

    /// Cached read, confirmed with a direct read on a miss.
    fn lookup(&self, namespace: &str, name: &str) -> Result<Option<Record>, ValidationError> {
        for mode in [ReadMode::Cached, ReadMode::Consistent] {
            match self.downstream.get(namespace, name, mode) {
                Ok(record) => return Ok(Some(record)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}
