//! Sync manager - Runs the reconcile loops for every downstream cluster.
//!
//! Each cluster gets its own work queue, a set of watch tasks feeding it,
//! a periodic resync and a pool of workers draining it.

use crate::error::SyncError;
use crate::orphan::OrphanCleaner;
use crate::queue::WorkQueue;
use crate::token_sync::TokenSync;
use crate::types::{CLUSTER_AUTH_TOKEN_NAMESPACE, CLUSTER_USER_ATTRIBUTE_NAMESPACE};
use crate::user_sync::UserSync;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokensync::config::SyncConfig;
use tokensync::store::{
    LabelSelector, ReadMode, RecordEvent, RecordStore, RecordWatch, SqliteRecordStore, StoreError,
};
use tokensync::tokens::{SystemTokenStore, FIELD_CLUSTER_NAME};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unit of work for a cluster's queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncKey {
    /// Reconcile the shadow of a token.
    Token(String),
    /// Refresh the user-attribute shadow of a user that already has one.
    User(String),
    /// Remove the user-attribute shadow if the upstream attribute is gone.
    OrphanCheck(String),
}

/// All reconcilers for one downstream cluster.
pub struct ClusterSync {
    cluster: String,
    upstream: Arc<dyn RecordStore>,
    token_namespace: String,
    downstream: Arc<dyn RecordStore>,
    tokens: TokenSync,
    users: UserSync,
    orphans: OrphanCleaner,
}

impl ClusterSync {
    pub fn new(
        cluster: &str,
        tokens: Arc<SystemTokenStore>,
        upstream: Arc<dyn RecordStore>,
        downstream: Arc<dyn RecordStore>,
        token_hashing_required: bool,
    ) -> Self {
        let directory = Arc::clone(tokens.directory());
        Self {
            cluster: cluster.to_string(),
            upstream,
            token_namespace: tokens.namespace().to_string(),
            downstream: Arc::clone(&downstream),
            users: UserSync::new(cluster, Arc::clone(&directory), Arc::clone(&downstream)),
            orphans: OrphanCleaner::new(cluster, directory, Arc::clone(&downstream)),
            tokens: TokenSync::new(cluster, tokens, downstream, token_hashing_required),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn process(&self, key: &SyncKey) -> Result<(), SyncError> {
        match key {
            SyncKey::Token(name) => self.tokens.sync(name),
            SyncKey::User(name) => self.users.sync(name),
            SyncKey::OrphanCheck(name) => self.orphans.check_user_attribute(name),
        }
    }

    /// Keys covering everything this cluster could be out of step on:
    /// upstream tokens for the cluster, every shadow token and every
    /// user-attribute shadow.
    pub fn resync_keys(&self) -> Result<Vec<SyncKey>, StoreError> {
        let everything = LabelSelector::everything();
        let mut keys: Vec<SyncKey> = self
            .upstream
            .list(&self.token_namespace, &everything, ReadMode::Consistent)?
            .into_iter()
            .filter(|r| r.field(FIELD_CLUSTER_NAME) == Some(self.cluster.as_str()))
            .map(|r| SyncKey::Token(r.name))
            .collect();

        for record in self
            .downstream
            .list(CLUSTER_AUTH_TOKEN_NAMESPACE, &everything, ReadMode::Cached)?
        {
            let key = SyncKey::Token(record.name);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        for record in self
            .downstream
            .list(CLUSTER_USER_ATTRIBUTE_NAMESPACE, &everything, ReadMode::Cached)?
        {
            keys.push(SyncKey::User(record.name.clone()));
            keys.push(SyncKey::OrphanCheck(record.name));
        }
        Ok(keys)
    }

    fn token_key(&self, event: &RecordEvent) -> Option<SyncKey> {
        let record = event.record();
        (record.field(FIELD_CLUSTER_NAME) == Some(self.cluster.as_str()))
            .then(|| SyncKey::Token(record.name.clone()))
    }
}

struct ClusterWorkers {
    queue: WorkQueue<SyncKey>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ClusterWorkers {
    fn stop(&mut self) {
        self.cancel.cancel();
        self.queue.shutdown();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

struct UpstreamPoll {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl UpstreamPoll {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Sync manager - Orchestrates per-cluster token and user-attribute sync.
pub struct SyncManager {
    tokens: Arc<SystemTokenStore>,
    upstream: Arc<dyn RecordStore>,
    config: SyncConfig,
    /// Per-cluster workers, enables per-cluster stop/restart
    clusters: Arc<tokio::sync::Mutex<HashMap<String, ClusterWorkers>>>,
    poll: tokio::sync::Mutex<Option<UpstreamPoll>>,
}

impl SyncManager {
    pub fn new(
        tokens: Arc<SystemTokenStore>,
        upstream: Arc<dyn RecordStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            tokens,
            upstream,
            config,
            clusters: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            poll: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens the store of every configured cluster and starts syncing it.
    /// Also starts polling the upstream store for writes made by other
    /// processes.
    ///
    /// # Returns
    /// Number of clusters started
    pub async fn start(&self) -> Result<usize> {
        info!(cluster_count = self.config.clusters.len(), "Starting sync manager");

        let mut started = 0;
        for cluster in &self.config.clusters {
            let store = SqliteRecordStore::open(&cluster.store_path).with_context(|| {
                format!(
                    "Failed to open store for cluster '{}' at {}",
                    cluster.name, cluster.store_path
                )
            })?;
            self.add_cluster(&cluster.name, Arc::new(store)).await;
            started += 1;
        }

        if started == 0 {
            warn!("No downstream clusters configured, nothing to sync");
        }
        self.start_upstream_poll().await;
        Ok(started)
    }

    /// Periodically refreshes the upstream store so its cache and watches
    /// see writes from other processes. Replaces any running poll.
    pub async fn start_upstream_poll(&self) {
        if self.config.upstream_poll_ms == 0 {
            debug!("Upstream polling disabled");
            return;
        }

        let period = Duration::from_millis(self.config.upstream_poll_ms);
        let cancel = CancellationToken::new();
        let handle = spawn_upstream_poll(Arc::clone(&self.upstream), cancel.clone(), period);

        if let Some(old) = self.poll.lock().await.replace(UpstreamPoll { cancel, handle }) {
            old.stop();
        }
        info!(period_ms = self.config.upstream_poll_ms, "Polling upstream store");
    }

    /// Starts syncing `cluster` into `downstream`.
    ///
    /// Stops any existing workers for the same cluster first.
    pub async fn add_cluster(&self, cluster: &str, downstream: Arc<dyn RecordStore>) {
        let sync = Arc::new(ClusterSync::new(
            cluster,
            Arc::clone(&self.tokens),
            Arc::clone(&self.upstream),
            Arc::clone(&downstream),
            self.config.token_hashing_required,
        ));
        let queue = WorkQueue::new(
            Duration::from_millis(self.config.retry_base_ms),
            Duration::from_millis(self.config.retry_max_ms),
        );
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        // Subscribe before listing so nothing between the two is missed.
        let directory = self.tokens.directory();
        {
            let sync = Arc::clone(&sync);
            handles.push(spawn_watch(
                self.upstream.watch(self.tokens.namespace()),
                cluster,
                queue.clone(),
                cancel.clone(),
                move |event| sync.token_key(event),
            ));
        }
        handles.push(spawn_watch(
            directory.watch_users(),
            cluster,
            queue.clone(),
            cancel.clone(),
            |event| Some(SyncKey::User(event.record().name.clone())),
        ));
        handles.push(spawn_watch(
            directory.watch_user_attributes(),
            cluster,
            queue.clone(),
            cancel.clone(),
            |event| match event {
                RecordEvent::Deleted(r) => Some(SyncKey::OrphanCheck(r.name.clone())),
                other => Some(SyncKey::User(other.record().name.clone())),
            },
        ));
        handles.push(spawn_watch(
            downstream.watch(CLUSTER_AUTH_TOKEN_NAMESPACE),
            cluster,
            queue.clone(),
            cancel.clone(),
            |event| Some(SyncKey::Token(event.record().name.clone())),
        ));
        handles.push(spawn_watch(
            downstream.watch(CLUSTER_USER_ATTRIBUTE_NAMESPACE),
            cluster,
            queue.clone(),
            cancel.clone(),
            |event| match event {
                RecordEvent::Deleted(_) => None,
                other => Some(SyncKey::OrphanCheck(other.record().name.clone())),
            },
        ));

        enqueue_resync(&sync, &queue);
        handles.push(spawn_resync(
            Arc::clone(&sync),
            queue.clone(),
            cancel.clone(),
            Duration::from_secs(self.config.resync_interval_secs.max(1)),
        ));

        for worker in 0..self.config.workers.max(1) {
            handles.push(spawn_worker(
                worker,
                Arc::clone(&sync),
                queue.clone(),
                cancel.clone(),
            ));
        }

        let workers = ClusterWorkers {
            queue,
            cancel,
            handles,
        };
        let mut clusters = self.clusters.lock().await;
        if let Some(mut old) = clusters.insert(cluster.to_string(), workers) {
            old.stop();
            info!(cluster = %cluster, "Stopped existing sync workers before restart");
        }
        info!(cluster = %cluster, workers = self.config.workers.max(1), "Cluster sync started");
    }

    /// Stops syncing `cluster`. Returns false if it was not running.
    pub async fn remove_cluster(&self, cluster: &str) -> bool {
        match self.clusters.lock().await.remove(cluster) {
            Some(mut workers) => {
                workers.stop();
                info!(cluster = %cluster, "Cluster sync stopped");
                true
            }
            None => false,
        }
    }

    /// Names of the clusters currently being synced.
    pub async fn clusters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Keys waiting in a cluster's queue.
    pub async fn pending(&self, cluster: &str) -> Option<usize> {
        self.clusters.lock().await.get(cluster).map(|w| w.queue.len())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down sync manager");

        if let Some(poll) = self.poll.lock().await.take() {
            poll.stop();
        }

        let mut clusters = self.clusters.lock().await;
        let count = clusters.len();
        for (_, mut workers) in clusters.drain() {
            workers.stop();
        }

        info!(cluster_count = count, "All sync workers stopped");
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        // Best-effort, Drop is sync
        if let Ok(mut poll) = self.poll.try_lock() {
            if let Some(poll) = poll.take() {
                poll.stop();
            }
        }
        if let Ok(mut clusters) = self.clusters.try_lock() {
            for (_, mut workers) in clusters.drain() {
                workers.stop();
            }
        }
    }
}

fn spawn_watch<F>(
    mut watch: RecordWatch,
    cluster: &str,
    queue: WorkQueue<SyncKey>,
    cancel: CancellationToken,
    key_for: F,
) -> JoinHandle<()>
where
    F: Fn(&RecordEvent) -> Option<SyncKey> + Send + 'static,
{
    let cluster = cluster.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = watch.next() => match event {
                    Some(Ok(event)) => {
                        if let Some(key) = key_for(&event) {
                            queue.add(key);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(cluster = %cluster, namespace = %watch.namespace(), error = %e, "Watch fell behind, waiting for resync");
                    }
                    None => {
                        debug!(cluster = %cluster, namespace = %watch.namespace(), "Watch closed");
                        break;
                    }
                },
            }
        }
    })
}

fn enqueue_resync(sync: &ClusterSync, queue: &WorkQueue<SyncKey>) {
    match sync.resync_keys() {
        Ok(keys) => {
            debug!(cluster = %sync.cluster(), count = keys.len(), "Resync queued");
            for key in keys {
                queue.add(key);
            }
        }
        Err(e) => warn!(cluster = %sync.cluster(), error = %e, "Resync listing failed"),
    }
}

fn spawn_resync(
    sync: Arc<ClusterSync>,
    queue: WorkQueue<SyncKey>,
    cancel: CancellationToken,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.tick().await; // initial resync already queued

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => enqueue_resync(&sync, &queue),
            }
        }
    })
}

fn spawn_upstream_poll(
    upstream: Arc<dyn RecordStore>,
    cancel: CancellationToken,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = upstream.refresh() {
                        warn!(error = %e, "Upstream refresh failed");
                    }
                }
            }
        }
    })
}

fn spawn_worker(
    worker: usize,
    sync: Arc<ClusterSync>,
    queue: WorkQueue<SyncKey>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            let result = sync.process(&key);
            match &result {
                Ok(()) => debug!(cluster = %sync.cluster(), worker, key = ?key, "Synced"),
                Err(SyncError::Skip(reason)) => {
                    warn!(cluster = %sync.cluster(), key = ?key, reason = %reason, "Not syncing")
                }
                Err(SyncError::Retry(reason)) => {
                    warn!(cluster = %sync.cluster(), key = ?key, reason = %reason, "Sync failed, will retry")
                }
            }
            queue.done(key, &result);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokensync::config::{HashingConfig, TokenConfig};
    use tokensync::directory::RecordDirectory;
    use tokensync::hashers::HashRegistry;

    fn manager(config: SyncConfig) -> SyncManager {
        let upstream: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::in_memory().unwrap());
        let directory = Arc::new(RecordDirectory::new(Arc::clone(&upstream)));
        let tokens = Arc::new(SystemTokenStore::new(
            Arc::clone(&upstream),
            directory,
            HashRegistry::new(&HashingConfig::default()).unwrap(),
            TokenConfig::default(),
        ));
        SyncManager::new(tokens, upstream, config)
    }

    #[tokio::test]
    async fn test_manager_creation() {
        let manager = manager(SyncConfig::default());
        assert!(manager.clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_remove_cluster() {
        let manager = manager(SyncConfig::default());
        let downstream = Arc::new(SqliteRecordStore::in_memory().unwrap());

        manager.add_cluster("c-1", downstream.clone()).await;
        manager.add_cluster("c-1", downstream).await;
        assert_eq!(manager.clusters().await, vec!["c-1"]);

        assert!(manager.remove_cluster("c-1").await);
        assert!(!manager.remove_cluster("c-1").await);
        assert!(manager.clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_opens_configured_clusters() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            clusters: vec![tokensync::config::DownstreamCluster {
                name: "c-1".to_string(),
                store_path: temp_dir.path().join("c-1.db").to_string_lossy().into_owned(),
            }],
            ..Default::default()
        };
        let manager = manager(config);

        assert_eq!(manager.start().await.unwrap(), 1);
        assert_eq!(manager.clusters().await, vec!["c-1"]);

        manager.shutdown().await;
        assert!(manager.clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_on_unopenable_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            clusters: vec![tokensync::config::DownstreamCluster {
                name: "c-1".to_string(),
                store_path: temp_dir
                    .path()
                    .join("missing-dir")
                    .join("c-1.db")
                    .to_string_lossy()
                    .into_owned(),
            }],
            ..Default::default()
        };
        let manager = manager(config);
        assert!(manager.start().await.is_err());
    }
}
