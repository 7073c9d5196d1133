use super::clock::{Clock, SystemClock};
use super::record::{format_time, from_record, set_expired, to_record, FIELD_ENABLED, FIELD_LAST_USED_AT, LABEL_USER_ID};
use super::ttl::{resolve_ttl, ttl_greater};
use super::{AccessLevel, Token, TokenError, TokenStatus, WriteOptions, GENERATED_NAME_PREFIX};
use crate::auth::format_token_bearer;
use crate::config::TokenConfig;
use crate::directory::{resolve_identity, Directory, DirectoryError, User};
use crate::hashers::{parse_version, HashRegistry};
use crate::store::{LabelSelector, ReadMode, Record, RecordEvent, RecordPatch, RecordStore};
use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffer of the channel returned by [`SystemTokenStore::watch`].
pub const WATCH_CHANNEL_CAPACITY: usize = 100;

/// Attempts for an update that keeps losing optimistic-concurrency races.
const UPDATE_ATTEMPTS: usize = 3;

/// Attempts at finding an unused generated name.
const NAME_ATTEMPTS: usize = 5;

const GENERATED_NAME_SUFFIX_LENGTH: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    Added(Token),
    Modified(Token),
    Deleted(Token),
}

impl TokenEvent {
    pub fn token(&self) -> &Token {
        match self {
            TokenEvent::Added(t) | TokenEvent::Modified(t) | TokenEvent::Deleted(t) => t,
        }
    }
}

/// Unrestricted token operations.
///
/// Used directly by authentication and the sync controllers, and wrapped by
/// [`super::TokenStore`] for caller-facing requests.
pub struct SystemTokenStore {
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn Directory>,
    hashers: HashRegistry,
    config: TokenConfig,
    clock: Arc<dyn Clock>,
}

impl SystemTokenStore {
    pub fn new(
        store: Arc<dyn RecordStore>,
        directory: Arc<dyn Directory>,
        hashers: HashRegistry,
        config: TokenConfig,
    ) -> Self {
        Self {
            store,
            directory,
            hashers,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn hashers(&self) -> &HashRegistry {
        &self.hashers
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn max_ttl_ms(&self) -> i64 {
        self.config.max_ttl_minutes.saturating_mul(60_000)
    }

    /// Creates a token for `token.spec.user_id`.
    ///
    /// The secret is generated here and returned in `status.value` and
    /// `status.bearer_token`. This is the only time it is ever visible.
    pub fn create(&self, mut token: Token, options: WriteOptions) -> Result<Token, TokenError> {
        if !token.status.value.is_empty() || !token.status.hash.is_empty() {
            return Err(TokenError::BadRequest(
                "token secret and hash are generated by the server".to_string(),
            ));
        }
        if token.spec.user_id.is_empty() {
            return Err(TokenError::BadRequest("spec.userID is required".to_string()));
        }

        let user = self.lookup_user(&token.spec.user_id)?;
        if !user.enabled {
            return Err(TokenError::BadRequest(
                "operation references a disabled user".to_string(),
            ));
        }
        if !token.spec.cluster_name.is_empty() {
            self.check_cluster(&token.spec.cluster_name)?;
        }
        let identity = resolve_identity(&user).map_err(|e| match e {
            DirectoryError::IdentityMissing { .. } | DirectoryError::IdentityAmbiguous { .. } => {
                TokenError::BadRequest(e.to_string())
            }
            other => TokenError::Directory(other),
        })?;

        if token.name.is_empty() {
            token.name = self.generate_name()?;
        } else {
            match self.store.get(self.namespace(), &token.name, ReadMode::Consistent) {
                Ok(_) => return Err(TokenError::AlreadyExists(token.name)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(TokenError::Store(e)),
            }
        }

        token.spec.ttl = resolve_ttl(token.spec.ttl, self.config.default_ttl_ms, self.max_ttl_ms());

        // Hash before touching the store.
        let (secret, hash) = self.hashers.generate_secret_and_hash()?;

        let now = self.now();
        token.uid = Uuid::new_v4().to_string();
        token.resource_version = 0;
        token.created_at = Some(now);
        token.status = TokenStatus {
            hash_algorithm: parse_version(&hash).ok(),
            hash,
            auth_provider: identity.provider,
            principal_id: identity.principal_id,
            display_name: user.display_name,
            login_name: user.username,
            last_update_time: format_time(now),
            ..Default::default()
        };

        if options.dry_run {
            set_expired(&mut token, now);
            token.status.hash.clear();
            return Ok(token);
        }

        let record = to_record(&token, self.namespace())?;
        let created = self
            .store
            .create(record)
            .map_err(|e| TokenError::from_store(&token.name, e))?;

        // Return what was stored, not what we meant to store.
        let mut stored = match from_record(&created, now) {
            Ok(stored) => stored,
            Err(e) => {
                if let Err(cleanup) = self.store.delete(self.namespace(), &created.name) {
                    warn!(token = %created.name, error = %cleanup, "Failed to remove unreadable token record");
                }
                return Err(e);
            }
        };

        stored.status.hash.clear();
        stored.status.current = false;
        stored.status.bearer_token = format_token_bearer(&stored.name, &secret);
        stored.status.value = secret;

        info!(
            token = %stored.name,
            user = %stored.spec.user_id,
            cluster = %stored.spec.cluster_name,
            "Token created"
        );
        Ok(stored)
    }

    pub fn get(&self, name: &str, mode: ReadMode) -> Result<Token, TokenError> {
        let record = self.get_record(name, mode)?;
        from_record(&record, self.now())
    }

    /// Raw backing record of a token.
    pub fn get_record(&self, name: &str, mode: ReadMode) -> Result<Record, TokenError> {
        self.store
            .get(self.namespace(), name, mode)
            .map_err(|e| TokenError::from_store(name, e))
    }

    /// Lists tokens matching `selector`. Records that do not decode are
    /// skipped.
    pub fn list(&self, selector: &LabelSelector, mode: ReadMode) -> Result<Vec<Token>, TokenError> {
        let now = self.now();
        let records = self
            .store
            .list(self.namespace(), selector, mode)
            .map_err(TokenError::Store)?;

        Ok(records
            .iter()
            .filter_map(|record| match from_record(record, now) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(token = %record.name, error = %e, "Skipping unreadable token record");
                    None
                }
            })
            .collect())
    }

    pub fn list_for_user(&self, user: &str) -> Result<Vec<Token>, TokenError> {
        self.list(&LabelSelector::eq(LABEL_USER_ID, user), ReadMode::Cached)
    }

    pub(crate) fn list_records(&self, selector: &LabelSelector) -> Result<Vec<Record>, TokenError> {
        self.store
            .list(self.namespace(), selector, ReadMode::Consistent)
            .map_err(TokenError::Store)
    }

    /// Updates the mutable spec of a token.
    ///
    /// The stored token is re-read first and its status is kept; client
    /// status is ignored. Concurrent writes are retried from a fresh read.
    pub fn update(
        &self,
        token: Token,
        level: AccessLevel,
        options: WriteOptions,
    ) -> Result<Token, TokenError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(&token.name, ReadMode::Consistent)?;
            match self.try_update(&current, token.clone(), level, options) {
                Err(TokenError::Store(e)) if e.is_conflict() && attempt < UPDATE_ATTEMPTS => {
                    debug!(token = %token.name, attempt, "Token update conflicted, retrying");
                }
                result => return result,
            }
        }
    }

    fn try_update(
        &self,
        current: &Token,
        mut token: Token,
        level: AccessLevel,
        options: WriteOptions,
    ) -> Result<Token, TokenError> {
        if !token.uid.is_empty() && token.uid != current.uid {
            return Err(TokenError::BadRequest("uid is immutable".to_string()));
        }
        if token.spec.user_id != current.spec.user_id {
            return Err(TokenError::BadRequest("spec.userID is immutable".to_string()));
        }
        if token.spec.cluster_name != current.spec.cluster_name {
            return Err(TokenError::BadRequest("spec.clusterName is immutable".to_string()));
        }
        if token.spec.kind != current.spec.kind {
            return Err(TokenError::BadRequest("spec.kind is immutable".to_string()));
        }

        match level {
            AccessLevel::Elevated => {
                if token.spec.ttl == 0 {
                    token.spec.ttl = self.config.default_ttl_ms;
                }
            }
            AccessLevel::Owner => {
                let ttl = resolve_ttl(token.spec.ttl, self.config.default_ttl_ms, self.max_ttl_ms());
                if ttl_greater(ttl, current.spec.ttl) {
                    return Err(TokenError::Forbidden(
                        "not allowed to extend time-to-live".to_string(),
                    ));
                }
                token.spec.ttl = ttl;
            }
            AccessLevel::None => {
                if token.spec.ttl != current.spec.ttl {
                    return Err(TokenError::Forbidden(
                        "not allowed to change time-to-live".to_string(),
                    ));
                }
            }
        }

        let now = self.now();
        token.uid = current.uid.clone();
        token.created_at = current.created_at;
        token.resource_version = current.resource_version;
        token.status = current.status.clone();
        token.status.value.clear();
        token.status.bearer_token.clear();
        token.status.last_update_time = format_time(now);

        if options.dry_run {
            set_expired(&mut token, now);
            return Ok(token);
        }

        let record = to_record(&token, self.namespace())?;
        let updated = self
            .store
            .update(record)
            .map_err(|e| TokenError::from_store(&token.name, e))?;

        info!(token = %token.name, "Token updated");
        from_record(&updated, now)
    }

    /// Deletes a token. Deleting a token that does not exist succeeds.
    pub fn delete(&self, name: &str) -> Result<(), TokenError> {
        match self.store.delete(self.namespace(), name) {
            Ok(()) => {
                info!(token = %name, "Token deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(token = %name, "Token already gone");
                Ok(())
            }
            Err(e) => Err(TokenError::Store(e)),
        }
    }

    /// Records the time a token was last used to authenticate.
    pub fn update_last_used_at(&self, name: &str, at: DateTime<Utc>) -> Result<(), TokenError> {
        self.store
            .patch(
                self.namespace(),
                name,
                &RecordPatch::default().data(FIELD_LAST_USED_AT, format_time(at)),
            )
            .map(|_| ())
            .map_err(|e| TokenError::from_store(name, e))
    }

    /// Turns a token off without touching anything else.
    pub fn disable(&self, name: &str) -> Result<(), TokenError> {
        self.store
            .patch(
                self.namespace(),
                name,
                &RecordPatch::default().data(FIELD_ENABLED, "false"),
            )
            .map(|_| ())
            .map_err(|e| TokenError::from_store(name, e))?;
        info!(token = %name, "Token disabled");
        Ok(())
    }

    /// Streams token changes.
    ///
    /// `view` decides per token whether (and how) the event is delivered.
    /// Records that do not decode are dropped. The returned channel closes
    /// when `cancel` fires, when the backing feed ends or errors, or when
    /// the receiver is dropped.
    pub fn watch<F>(&self, view: F, cancel: CancellationToken) -> mpsc::Receiver<TokenEvent>
    where
        F: Fn(Token) -> Option<Token> + Send + 'static,
    {
        let mut feed = self.store.watch(self.namespace());
        let clock = Arc::clone(&self.clock);
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = feed.next() => match next {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            warn!(error = %e, "Token watch feed failed");
                            break;
                        }
                        None => {
                            debug!("Token watch feed closed");
                            break;
                        }
                    },
                };

                let token = match from_record(event.record(), clock.now()) {
                    Ok(token) => token,
                    Err(e) => {
                        debug!(token = %event.record().name, error = %e, "Dropping unreadable token event");
                        continue;
                    }
                };
                let Some(token) = view(token) else {
                    continue;
                };
                let event = match event {
                    RecordEvent::Added(_) => TokenEvent::Added(token),
                    RecordEvent::Modified(_) => TokenEvent::Modified(token),
                    RecordEvent::Deleted(_) => TokenEvent::Deleted(token),
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        rx
    }

    fn lookup_user(&self, name: &str) -> Result<User, TokenError> {
        self.directory.get_user(name, ReadMode::Cached).map_err(|e| match e {
            DirectoryError::NotFound { .. } => {
                TokenError::BadRequest(format!("user {} not found", name))
            }
            other => TokenError::Directory(other),
        })
    }

    pub(crate) fn check_cluster(&self, name: &str) -> Result<(), TokenError> {
        match self.directory.get_cluster(name) {
            Ok(_) => Ok(()),
            Err(DirectoryError::NotFound { .. }) => {
                Err(TokenError::BadRequest(format!("cluster {} not found", name)))
            }
            Err(e) => Err(TokenError::Directory(e)),
        }
    }

    fn generate_name(&self) -> Result<String, TokenError> {
        let mut name = String::new();
        for _ in 0..NAME_ATTEMPTS {
            let suffix = Alphanumeric
                .sample_string(&mut rand::thread_rng(), GENERATED_NAME_SUFFIX_LENGTH)
                .to_lowercase();
            name = format!("{}{}", GENERATED_NAME_PREFIX, suffix);
            match self.store.get(self.namespace(), &name, ReadMode::Cached) {
                Err(e) if e.is_not_found() => return Ok(name),
                Ok(_) => continue,
                Err(e) => return Err(TokenError::Store(e)),
            }
        }
        Err(TokenError::AlreadyExists(name))
    }
}
