//! Keeps user-attribute shadows in step with upstream users.

use crate::error::SyncError;
use crate::types::{
    secret_name, ClusterUserAttribute, CLUSTER_AUTH_TOKEN_NAMESPACE,
    CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, CLUSTER_USER_ATTRIBUTE_NAMESPACE, LABEL_USER_NAME,
};
use std::sync::Arc;
use tokensync::directory::{Directory, DirectoryError, User, UserAttribute};
use tokensync::store::{LabelSelector, ReadMode, RecordStore};
use tracing::{debug, info};

/// What to do when a user has no shadow in the cluster yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WhenMissing {
    Create,
    Ignore,
}

pub struct UserSync {
    cluster: String,
    directory: Arc<dyn Directory>,
    downstream: Arc<dyn RecordStore>,
}

impl UserSync {
    pub fn new(
        cluster: impl Into<String>,
        directory: Arc<dyn Directory>,
        downstream: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            directory,
            downstream,
        }
    }

    /// Handles a user or user-attribute change. Only users that already
    /// have a shadow in this cluster are touched. A user deleted upstream
    /// loses every shadow it has here.
    pub fn sync(&self, user: &str) -> Result<(), SyncError> {
        self.reconcile(user, WhenMissing::Ignore)
    }

    pub(crate) fn reconcile(&self, user: &str, when_missing: WhenMissing) -> Result<(), SyncError> {
        let existing = match self
            .downstream
            .get(CLUSTER_USER_ATTRIBUTE_NAMESPACE, user, ReadMode::Consistent)
        {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        if existing.is_none() && when_missing == WhenMissing::Ignore {
            debug!(cluster = %self.cluster, user = %user, "No user attribute shadow to update");
            return Ok(());
        }

        let Some((upstream_user, attribute)) = self.upstream(user, when_missing)? else {
            return Ok(());
        };
        let desired = ClusterUserAttribute::from_upstream(&upstream_user, &attribute);

        match existing {
            None => {
                self.downstream.create(desired.to_record()?)?;
                info!(cluster = %self.cluster, user = %user, "User attribute shadow created");
            }
            Some(mut record) => {
                if ClusterUserAttribute::from_record(&record) == desired {
                    debug!(cluster = %self.cluster, user = %user, "User attribute shadow up to date");
                    return Ok(());
                }
                desired.apply(&mut record)?;
                self.downstream.update(record)?;
                info!(cluster = %self.cluster, user = %user, "User attribute shadow updated");
            }
        }
        Ok(())
    }

    /// Current upstream user and attributes. `None` when either is gone and
    /// nothing needs to be created.
    fn upstream(
        &self,
        user: &str,
        when_missing: WhenMissing,
    ) -> Result<Option<(User, UserAttribute)>, SyncError> {
        let Some(upstream_user) = self.lookup_user(user)? else {
            self.revoke(user)?;
            return match when_missing {
                WhenMissing::Create => {
                    Err(SyncError::Skip(format!("user {} no longer exists", user)))
                }
                WhenMissing::Ignore => Ok(None),
            };
        };

        let attribute = match self.lookup_attribute(user) {
            Ok(a) => a,
            Err(e) if e.is_not_found() => {
                return match when_missing {
                    WhenMissing::Create => Err(SyncError::Retry(e.to_string())),
                    WhenMissing::Ignore => Ok(None),
                };
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some((upstream_user, attribute)))
    }

    /// Upstream user, or `None` once a direct read confirms it is gone.
    pub(crate) fn lookup_user(&self, user: &str) -> Result<Option<User>, SyncError> {
        for mode in [ReadMode::Cached, ReadMode::Consistent] {
            match self.directory.get_user(user, mode) {
                Ok(u) => return Ok(Some(u)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn lookup_attribute(&self, user: &str) -> Result<UserAttribute, DirectoryError> {
        match self.directory.get_user_attribute(user, ReadMode::Cached) {
            Err(e) if e.is_not_found() => {
                self.directory.get_user_attribute(user, ReadMode::Consistent)
            }
            other => other,
        }
    }

    /// Deletes every shadow credential of `user` in the cluster, their hash
    /// records and the user-attribute shadow.
    pub(crate) fn revoke(&self, user: &str) -> Result<(), SyncError> {
        let credentials = self.downstream.list(
            CLUSTER_AUTH_TOKEN_NAMESPACE,
            &LabelSelector::eq(LABEL_USER_NAME, user),
            ReadMode::Consistent,
        )?;
        for record in &credentials {
            delete_if_present(&*self.downstream, CLUSTER_AUTH_TOKEN_NAMESPACE, &record.name)?;
            delete_if_present(
                &*self.downstream,
                CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE,
                &secret_name(&record.name),
            )?;
        }
        let attribute = delete_if_present(&*self.downstream, CLUSTER_USER_ATTRIBUTE_NAMESPACE, user)?;

        if attribute || !credentials.is_empty() {
            info!(
                cluster = %self.cluster,
                user = %user,
                tokens = credentials.len(),
                "Shadows of deleted user removed"
            );
        }
        Ok(())
    }
}

/// Deletes a record, returning false if it was already gone.
pub(crate) fn delete_if_present(
    store: &dyn RecordStore,
    namespace: &str,
    name: &str,
) -> Result<bool, SyncError> {
    match store.delete(namespace, name) {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.into()),
    }
}
