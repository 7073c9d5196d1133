//! Mirrors cluster-scoped tokens into a downstream cluster.
//!
//! Each token becomes a shadow credential plus a companion record holding
//! its hash. Tokens are only mirrored once hashed with the current default
//! algorithm; the plaintext never leaves the upstream store anyway.

use crate::error::SyncError;
use crate::types::{
    secret_name, ClusterAuthToken, CLUSTER_AUTH_TOKEN_NAMESPACE,
    CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, CLUSTER_USER_ATTRIBUTE_NAMESPACE, FIELD_HASH,
    FIELD_USER_NAME, LABEL_USER_NAME,
};
use crate::user_sync::{delete_if_present, UserSync, WhenMissing};
use std::sync::Arc;
use tokensync::hashers::parse_version;
use tokensync::store::{LabelSelector, ReadMode, Record, RecordPatch, RecordStore};
use tokensync::tokens::{self, from_record, SystemTokenStore, Token, TokenError};
use tracing::{debug, info, warn};

pub struct TokenSync {
    cluster: String,
    tokens: Arc<SystemTokenStore>,
    downstream: Arc<dyn RecordStore>,
    users: UserSync,
    token_hashing_required: bool,
}

impl TokenSync {
    pub fn new(
        cluster: impl Into<String>,
        tokens: Arc<SystemTokenStore>,
        downstream: Arc<dyn RecordStore>,
        token_hashing_required: bool,
    ) -> Self {
        let cluster = cluster.into();
        let users = UserSync::new(
            cluster.clone(),
            Arc::clone(tokens.directory()),
            Arc::clone(&downstream),
        );
        Self {
            cluster,
            tokens,
            downstream,
            users,
            token_hashing_required,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Reconciles the shadow of token `name` with the upstream token.
    ///
    /// A token that is gone upstream has its shadow removed. The absence is
    /// confirmed with a direct read, so a lagging cache never deletes a
    /// live shadow.
    pub fn sync(&self, name: &str) -> Result<(), SyncError> {
        let Some(record) = self.upstream_record(name)? else {
            return self.remove(name);
        };

        if record.field(tokens::FIELD_CLUSTER_NAME) != Some(self.cluster.as_str()) {
            debug!(cluster = %self.cluster, token = %name, "Token not scoped to cluster");
            return Ok(());
        }

        self.check_hash(&record)?;
        let token = from_record(&record, self.tokens.now())?;

        if self.users.lookup_user(&token.spec.user_id)?.is_none() {
            self.users.revoke(&token.spec.user_id)?;
            return Err(SyncError::Skip(format!(
                "user {} no longer exists",
                token.spec.user_id
            )));
        }

        self.sync_shadow(&token)?;
        self.users.reconcile(&token.spec.user_id, WhenMissing::Create)
    }

    fn upstream_record(&self, name: &str) -> Result<Option<Record>, SyncError> {
        match self.tokens.get_record(name, ReadMode::Cached) {
            Ok(record) => return Ok(Some(record)),
            Err(TokenError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.tokens.get_record(name, ReadMode::Consistent) {
            Ok(record) => Ok(Some(record)),
            Err(TokenError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn check_hash(&self, record: &Record) -> Result<(), SyncError> {
        let hash = record.field(tokens::FIELD_HASH).unwrap_or_default();
        if hash.is_empty() {
            return Err(if self.token_hashing_required {
                SyncError::Retry("token not hashed yet".to_string())
            } else {
                SyncError::Skip("token has no hash to mirror".to_string())
            });
        }

        let current = self.tokens.hashers().default_version();
        match parse_version(hash) {
            Ok(version) if version == current => Ok(()),
            Ok(version) => Err(SyncError::Skip(format!(
                "token is hashed with {} instead of {}; it must be re-issued",
                version, current
            ))),
            Err(e) => Err(SyncError::Skip(format!("invalid token hash: {}", e))),
        }
    }

    fn sync_shadow(&self, token: &Token) -> Result<(), SyncError> {
        let desired = ClusterAuthToken::from_token(token);
        match self
            .downstream
            .get(CLUSTER_AUTH_TOKEN_NAMESPACE, &token.name, ReadMode::Consistent)
        {
            Ok(existing) => self.update_shadow(existing, &desired, &token.status.hash),
            Err(e) if e.is_not_found() => self.create_shadow(&desired, &token.status.hash),
            Err(e) => Err(e.into()),
        }
    }

    fn create_shadow(&self, desired: &ClusterAuthToken, hash: &str) -> Result<(), SyncError> {
        self.downstream.create(desired.to_record())?;

        if let Err(e) = self.ensure_hash_record(&desired.name, hash) {
            if let Err(cleanup) = self
                .downstream
                .delete(CLUSTER_AUTH_TOKEN_NAMESPACE, &desired.name)
            {
                warn!(cluster = %self.cluster, token = %desired.name, error = %cleanup, "Failed to remove shadow without hash");
            }
            return Err(SyncError::Retry(format!("writing hash record: {}", e)));
        }

        info!(cluster = %self.cluster, token = %desired.name, "Shadow token created");
        Ok(())
    }

    fn update_shadow(
        &self,
        mut existing: Record,
        desired: &ClusterAuthToken,
        hash: &str,
    ) -> Result<(), SyncError> {
        if ClusterAuthToken::from_record(&existing) != *desired {
            desired.apply(&mut existing);
            self.downstream.update(existing)?;
            info!(cluster = %self.cluster, token = %desired.name, "Shadow token updated");
        }
        self.ensure_hash_record(&desired.name, hash)
    }

    /// Creates the hash record for `token`, or rewrites its hash if it
    /// differs. Left alone when already current.
    fn ensure_hash_record(&self, token: &str, hash: &str) -> Result<(), SyncError> {
        let secret = secret_name(token);
        match self
            .downstream
            .get(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret, ReadMode::Consistent)
        {
            Ok(record) if record.field(FIELD_HASH) == Some(hash) => {}
            Ok(_) => {
                self.downstream.patch(
                    CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE,
                    &secret,
                    &RecordPatch::default().data(FIELD_HASH, hash),
                )?;
                info!(cluster = %self.cluster, token = %token, "Shadow token hash updated");
            }
            Err(e) if e.is_not_found() => {
                let mut record = Record::new(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, secret);
                record.set_field(FIELD_HASH, hash);
                self.downstream.create(record)?;
                debug!(cluster = %self.cluster, token = %token, "Shadow token hash record created");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Deletes the shadow and its hash record. The user-attribute shadow
    /// goes too once its user has no shadow tokens left in the cluster.
    fn remove(&self, name: &str) -> Result<(), SyncError> {
        let user = match self
            .downstream
            .get(CLUSTER_AUTH_TOKEN_NAMESPACE, name, ReadMode::Consistent)
        {
            Ok(record) => record.field(FIELD_USER_NAME).map(str::to_string),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        delete_if_present(&*self.downstream, CLUSTER_AUTH_TOKEN_NAMESPACE, name)?;
        delete_if_present(
            &*self.downstream,
            CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE,
            &secret_name(name),
        )?;

        let Some(user) = user else {
            return Ok(());
        };
        info!(cluster = %self.cluster, token = %name, user = %user, "Shadow token removed");

        let remaining = self.downstream.list(
            CLUSTER_AUTH_TOKEN_NAMESPACE,
            &LabelSelector::eq(LABEL_USER_NAME, user.clone()),
            ReadMode::Consistent,
        )?;
        if remaining.is_empty()
            && delete_if_present(&*self.downstream, CLUSTER_USER_ATTRIBUTE_NAMESPACE, &user)?
        {
            info!(cluster = %self.cluster, user = %user, "User attribute shadow removed with last token");
        }
        Ok(())
    }
}
