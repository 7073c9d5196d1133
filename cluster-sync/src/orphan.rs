use crate::error::SyncError;
use crate::types::CLUSTER_USER_ATTRIBUTE_NAMESPACE;
use std::sync::Arc;
use tokensync::directory::Directory;
use tokensync::store::{ReadMode, RecordStore};
use tracing::info;

/// Removes user-attribute shadows whose upstream attributes are gone.
pub struct OrphanCleaner {
    cluster: String,
    directory: Arc<dyn Directory>,
    downstream: Arc<dyn RecordStore>,
}

impl OrphanCleaner {
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

    /// Deletes the shadow for `user` when the upstream attribute no longer
    /// exists. A cache miss is confirmed with a direct read first.
    pub fn check_user_attribute(&self, user: &str) -> Result<(), SyncError> {
        match self
            .downstream
            .get(CLUSTER_USER_ATTRIBUTE_NAMESPACE, user, ReadMode::Cached)
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for mode in [ReadMode::Cached, ReadMode::Consistent] {
            match self.directory.get_user_attribute(user, mode) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match self.downstream.delete(CLUSTER_USER_ATTRIBUTE_NAMESPACE, user) {
            Ok(()) => {
                info!(cluster = %self.cluster, user = %user, "Orphaned user attribute shadow removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
