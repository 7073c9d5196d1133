// Integration tests for token and user-attribute sync into a downstream cluster

use chrono::{Duration, TimeZone, Utc};
use cluster_sync::types::{
    secret_name, CLUSTER_AUTH_TOKEN_NAMESPACE, CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE,
    CLUSTER_USER_ATTRIBUTE_NAMESPACE, FIELD_ENABLED, FIELD_EXPIRES_AT, FIELD_GROUPS, FIELD_HASH,
    FIELD_USER_NAME,
};
use cluster_sync::{
    ClusterTokenValidator, OrphanCleaner, SyncError, SyncManager, TokenSync, UserSync,
    ValidationError,
};
use std::sync::Arc;
use tokensync::config::{HashingConfig, SyncConfig, TokenConfig};
use tokensync::directory::{Cluster, RecordDirectory, User, UserAttribute};
use tokensync::hashers::HashRegistry;
use tokensync::store::{
    LabelSelector, ReadMode, Record, RecordPatch, RecordStore, RecordWatch, SqliteRecordStore,
    StoreError,
};
use tokensync::tokens::{self, ManualClock, SystemTokenStore, Token, WriteOptions};

struct Fixture {
    upstream: Arc<SqliteRecordStore>,
    directory: Arc<RecordDirectory>,
    clock: Arc<ManualClock>,
    tokens: Arc<SystemTokenStore>,
    downstream: Arc<SqliteRecordStore>,
}

fn hashers() -> HashRegistry {
    HashRegistry::new(&HashingConfig::default()).unwrap()
}

impl Fixture {
    fn new() -> Self {
        let upstream = Arc::new(SqliteRecordStore::in_memory().unwrap());
        let directory = Arc::new(RecordDirectory::new(upstream.clone()));
        for name in ["alice", "bob"] {
            directory.put_user(&User::new(name)).unwrap();
        }
        for name in ["c-1", "c-2"] {
            directory
                .put_cluster(&Cluster {
                    name: name.to_string(),
                    display_name: name.to_string(),
                })
                .unwrap();
        }
        let mut attribute = UserAttribute {
            name: "alice".to_string(),
            ..Default::default()
        };
        attribute
            .group_principals
            .insert("github".to_string(), vec!["github_team://2".into(), "github_team://1".into()]);
        directory.put_user_attribute(&attribute).unwrap();

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let tokens = Arc::new(
            SystemTokenStore::new(
                upstream.clone(),
                directory.clone(),
                hashers(),
                TokenConfig::default(),
            )
            .with_clock(clock.clone()),
        );

        Self {
            upstream,
            directory,
            clock,
            tokens,
            downstream: Arc::new(SqliteRecordStore::in_memory().unwrap()),
        }
    }

    /// Issues a token scoped to `cluster` and returns its bearer value.
    fn issue(&self, user: &str, name: &str, cluster: &str) -> String {
        let mut token = Token::new(user);
        token.name = name.to_string();
        token.spec.cluster_name = cluster.to_string();
        token.spec.ttl = 60_000;
        self.tokens
            .create(token, WriteOptions::default())
            .unwrap()
            .status
            .bearer_token
    }

    fn token_sync(&self) -> TokenSync {
        TokenSync::new("c-1", self.tokens.clone(), self.downstream.clone(), true)
    }

    fn set_upstream_hash(&self, name: &str, hash: &str) {
        self.upstream
            .patch(
                self.tokens.namespace(),
                name,
                &RecordPatch::default().data(tokens::FIELD_HASH, hash),
            )
            .unwrap();
    }

    fn shadow(&self, namespace: &str, name: &str) -> Option<Record> {
        match self.downstream.get(namespace, name, ReadMode::Consistent) {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => panic!("unexpected store error: {}", e),
        }
    }
}

mod token_sync_tests {
    use super::*;

    #[test]
    fn test_sync_creates_shadow_hash_record_and_user_attribute() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");

        f.token_sync().sync("t1").unwrap();

        let upstream = f.tokens.get_record("t1", ReadMode::Consistent).unwrap();
        let expected = f.tokens.get("t1", ReadMode::Consistent).unwrap();

        let shadow = f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").unwrap();
        assert_eq!(shadow.field(FIELD_USER_NAME), Some("alice"));
        assert_eq!(shadow.field(FIELD_ENABLED), Some("true"));
        assert_eq!(
            shadow.field(FIELD_EXPIRES_AT),
            Some(expected.status.expires_at.as_str())
        );
        assert!(shadow.field(FIELD_HASH).is_none());

        let secret = f
            .shadow(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret_name("t1"))
            .unwrap();
        assert_eq!(secret.field(FIELD_HASH), upstream.field(tokens::FIELD_HASH));

        let attribute = f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").unwrap();
        assert_eq!(attribute.field(FIELD_ENABLED), Some("true"));
        assert_eq!(
            attribute.field(FIELD_GROUPS),
            Some(r#"["github_team://1","github_team://2"]"#)
        );
    }

    #[test]
    fn test_second_sync_writes_nothing() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        let sync = f.token_sync();
        sync.sync("t1").unwrap();

        let versions = |f: &Fixture| {
            [
                f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1"),
                f.shadow(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret_name("t1")),
                f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice"),
            ]
            .map(|r| r.unwrap().resource_version)
        };
        let before = versions(&f);

        sync.sync("t1").unwrap();
        assert_eq!(versions(&f), before);
    }

    #[test]
    fn test_tokens_of_other_clusters_are_ignored() {
        let f = Fixture::new();
        f.issue("alice", "t2", "c-2");
        f.issue("alice", "global", "");

        let sync = f.token_sync();
        sync.sync("t2").unwrap();
        sync.sync("global").unwrap();

        assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t2").is_none());
        assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "global").is_none());
    }

    #[test]
    fn test_legacy_and_malformed_hashes_are_skipped() {
        let f = Fixture::new();
        f.issue("alice", "legacy", "c-1");
        f.issue("alice", "old", "c-1");
        f.issue("alice", "garbled", "c-1");
        f.set_upstream_hash(
            "legacy",
            "$2a$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy",
        );
        f.set_upstream_hash("old", "$2:c2FsdA:ZGlnZXN0");
        f.set_upstream_hash("garbled", "no-prefix");

        let sync = f.token_sync();
        for name in ["legacy", "old", "garbled"] {
            let result = sync.sync(name);
            assert!(
                matches!(result, Err(SyncError::Skip(_))),
                "{}: {:?}",
                name,
                result
            );
            assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, name).is_none());
        }
        assert!(f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_none());
    }

    #[test]
    fn test_unhashed_token_waits_when_hashing_is_required() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        f.set_upstream_hash("t1", "");

        let result = f.token_sync().sync("t1");
        assert_eq!(result, Err(SyncError::Retry("token not hashed yet".to_string())));

        let lenient = TokenSync::new("c-1", f.tokens.clone(), f.downstream.clone(), false);
        assert!(matches!(lenient.sync("t1"), Err(SyncError::Skip(_))));
        assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").is_none());
    }

    #[test]
    fn test_changes_propagate_to_shadow() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        let sync = f.token_sync();
        sync.sync("t1").unwrap();

        f.tokens.disable("t1").unwrap();
        sync.sync("t1").unwrap();

        let shadow = f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").unwrap();
        assert_eq!(shadow.field(FIELD_ENABLED), Some("false"));
    }

    #[test]
    fn test_missing_or_stale_hash_record_is_repaired() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        let sync = f.token_sync();
        sync.sync("t1").unwrap();
        let hash = f
            .tokens
            .get_record("t1", ReadMode::Consistent)
            .unwrap()
            .field(tokens::FIELD_HASH)
            .map(str::to_string);

        f.downstream
            .delete(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret_name("t1"))
            .unwrap();
        sync.sync("t1").unwrap();
        let secret = f
            .shadow(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret_name("t1"))
            .unwrap();
        assert_eq!(secret.field(FIELD_HASH).map(str::to_string), hash);

        f.downstream
            .patch(
                CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE,
                &secret_name("t1"),
                &RecordPatch::default().data(FIELD_HASH, "stale"),
            )
            .unwrap();
        sync.sync("t1").unwrap();
        let secret = f
            .shadow(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret_name("t1"))
            .unwrap();
        assert_eq!(secret.field(FIELD_HASH).map(str::to_string), hash);
    }

    #[test]
    fn test_missing_user_attribute_is_retried_after_shadow_token() {
        let f = Fixture::new();
        f.issue("bob", "t1", "c-1");

        let result = f.token_sync().sync("t1");
        assert!(matches!(result, Err(SyncError::Retry(_))), "{:?}", result);
        assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").is_some());
        assert!(f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "bob").is_none());
    }

    #[test]
    fn test_removal_deletes_user_attribute_with_last_token() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        f.issue("alice", "t2", "c-1");
        let sync = f.token_sync();
        sync.sync("t1").unwrap();
        sync.sync("t2").unwrap();

        f.tokens.delete("t1").unwrap();
        sync.sync("t1").unwrap();
        assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").is_none());
        assert!(f
            .shadow(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret_name("t1"))
            .is_none());
        assert!(f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_some());

        f.tokens.delete("t2").unwrap();
        sync.sync("t2").unwrap();
        assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t2").is_none());
        assert!(f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_none());

        // Nothing left to remove.
        sync.sync("t2").unwrap();
    }

    /// Downstream store that refuses to create hash records.
    struct NoSecrets(Arc<SqliteRecordStore>);

    impl RecordStore for NoSecrets {
        fn create(&self, record: Record) -> Result<Record, StoreError> {
            if record.namespace == CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE {
                return Err(StoreError::Poisoned);
            }
            self.0.create(record)
        }

        fn get(&self, namespace: &str, name: &str, mode: ReadMode) -> Result<Record, StoreError> {
            self.0.get(namespace, name, mode)
        }

        fn update(&self, record: Record) -> Result<Record, StoreError> {
            self.0.update(record)
        }

        fn patch(
            &self,
            namespace: &str,
            name: &str,
            patch: &RecordPatch,
        ) -> Result<Record, StoreError> {
            self.0.patch(namespace, name, patch)
        }

        fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
            self.0.delete(namespace, name)
        }

        fn list(
            &self,
            namespace: &str,
            selector: &LabelSelector,
            mode: ReadMode,
        ) -> Result<Vec<Record>, StoreError> {
            self.0.list(namespace, selector, mode)
        }

        fn watch(&self, namespace: &str) -> RecordWatch {
            self.0.watch(namespace)
        }
    }

    #[test]
    fn test_failed_hash_record_create_removes_shadow() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        let sync = TokenSync::new(
            "c-1",
            f.tokens.clone(),
            Arc::new(NoSecrets(f.downstream.clone())),
            true,
        );

        let result = sync.sync("t1");
        assert!(matches!(result, Err(SyncError::Retry(_))), "{:?}", result);
        assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").is_none());
    }
}

mod user_sync_tests {
    use super::*;

    #[test]
    fn test_users_without_shadow_are_left_alone() {
        let f = Fixture::new();
        let sync = UserSync::new("c-1", f.directory.clone(), f.downstream.clone());

        sync.sync("alice").unwrap();
        assert!(f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_none());
    }

    #[test]
    fn test_attribute_and_user_changes_refresh_shadow() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        f.token_sync().sync("t1").unwrap();
        let sync = UserSync::new("c-1", f.directory.clone(), f.downstream.clone());

        let mut attribute = UserAttribute {
            name: "alice".to_string(),
            ..Default::default()
        };
        attribute
            .group_principals
            .insert("okta".to_string(), vec!["okta_group://ops".into()]);
        f.directory.put_user_attribute(&attribute).unwrap();
        sync.sync("alice").unwrap();

        let shadow = f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").unwrap();
        assert_eq!(shadow.field(FIELD_GROUPS), Some(r#"["okta_group://ops"]"#));

        let mut user = User::new("alice");
        user.enabled = false;
        f.directory.put_user(&user).unwrap();
        sync.sync("alice").unwrap();

        let shadow = f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").unwrap();
        assert_eq!(shadow.field(FIELD_ENABLED), Some("false"));
    }

    #[test]
    fn test_deleted_user_loses_every_shadow() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        f.issue("alice", "t2", "c-1");
        let tokens = f.token_sync();
        tokens.sync("t1").unwrap();
        tokens.sync("t2").unwrap();
        let sync = UserSync::new("c-1", f.directory.clone(), f.downstream.clone());

        f.directory.delete_user("alice").unwrap();
        sync.sync("alice").unwrap();

        for name in ["t1", "t2"] {
            assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, name).is_none());
            assert!(f
                .shadow(CLUSTER_AUTH_TOKEN_SECRET_NAMESPACE, &secret_name(name))
                .is_none());
        }
        assert!(f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_none());

        // The upstream token outlives its user but is never mirrored again.
        assert!(matches!(tokens.sync("t1"), Err(SyncError::Skip(_))));
        assert!(f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").is_none());
    }

    #[test]
    fn test_orphaned_user_attribute_shadow_is_removed() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");
        f.token_sync().sync("t1").unwrap();
        let cleaner = OrphanCleaner::new("c-1", f.directory.clone(), f.downstream.clone());

        cleaner.check_user_attribute("alice").unwrap();
        assert!(f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_some());

        f.directory.delete_user_attribute("alice").unwrap();
        cleaner.check_user_attribute("alice").unwrap();
        assert!(f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_none());

        cleaner.check_user_attribute("alice").unwrap();
    }
}

mod validator_tests {
    use super::*;

    fn synced() -> (Fixture, String, ClusterTokenValidator) {
        let f = Fixture::new();
        let bearer = f.issue("alice", "t1", "c-1");
        f.token_sync().sync("t1").unwrap();
        let validator =
            ClusterTokenValidator::new(f.downstream.clone(), hashers()).with_clock(f.clock.clone());
        (f, bearer, validator)
    }

    #[test]
    fn test_valid_token_resolves_user_and_groups() {
        let (_f, bearer, validator) = synced();

        let validated = validator.validate(&bearer).unwrap();
        assert_eq!(validated.token, "t1");
        assert_eq!(validated.user, "alice");
        assert_eq!(validated.groups, vec!["github_team://1", "github_team://2"]);
    }

    #[test]
    fn test_wrong_secret_and_unknown_token_are_invalid() {
        let (_f, _bearer, validator) = synced();

        assert_eq!(
            validator.validate("ext/t1:wrong").unwrap_err(),
            ValidationError::Invalid
        );
        assert_eq!(
            validator.validate("ext/nope:secret").unwrap_err(),
            ValidationError::Invalid
        );
        assert!(matches!(
            validator.validate("ext/t1"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let (f, bearer, validator) = synced();

        f.clock.advance(Duration::seconds(59));
        assert!(validator.validate(&bearer).is_ok());

        f.clock.advance(Duration::seconds(2));
        assert_eq!(
            validator.validate(&bearer).unwrap_err(),
            ValidationError::Expired
        );
    }

    #[test]
    fn test_expiry_instant_matches_upstream() {
        let (f, bearer, validator) = synced();

        f.clock.advance(Duration::seconds(60));
        assert!(!f.tokens.get("t1", ReadMode::Consistent).unwrap().status.expired);
        assert!(validator.validate(&bearer).is_ok());

        f.clock.advance(Duration::milliseconds(1));
        assert!(f.tokens.get("t1", ReadMode::Consistent).unwrap().status.expired);
        assert_eq!(
            validator.validate(&bearer).unwrap_err(),
            ValidationError::Expired
        );
    }

    #[test]
    fn test_tokens_of_deleted_user_stop_validating() {
        let (f, bearer, validator) = synced();

        f.directory.delete_user("alice").unwrap();
        assert!(matches!(f.token_sync().sync("t1"), Err(SyncError::Skip(_))));
        assert_eq!(
            validator.validate(&bearer).unwrap_err(),
            ValidationError::Invalid
        );
    }

    #[test]
    fn test_disabled_token_and_user_are_rejected() {
        let (f, bearer, validator) = synced();

        let mut user = User::new("alice");
        user.enabled = false;
        f.directory.put_user(&user).unwrap();
        UserSync::new("c-1", f.directory.clone(), f.downstream.clone())
            .sync("alice")
            .unwrap();
        assert_eq!(
            validator.validate(&bearer).unwrap_err(),
            ValidationError::UserDisabled
        );

        f.tokens.disable("t1").unwrap();
        f.token_sync().sync("t1").unwrap();
        assert_eq!(
            validator.validate(&bearer).unwrap_err(),
            ValidationError::Disabled
        );
    }
}

mod manager_tests {
    use super::*;

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_manager_mirrors_and_removes_tokens() {
        let f = Fixture::new();
        f.issue("alice", "existing", "c-1");

        let config = SyncConfig {
            workers: 1,
            retry_base_ms: 10,
            retry_max_ms: 50,
            ..Default::default()
        };
        let manager = SyncManager::new(f.tokens.clone(), f.upstream.clone(), config);
        manager.add_cluster("c-1", f.downstream.clone()).await;

        // Picked up by the initial resync.
        assert!(wait_for(|| f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "existing").is_some()).await);

        // Picked up by the watch.
        f.issue("alice", "fresh", "c-1");
        assert!(wait_for(|| f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "fresh").is_some()).await);

        f.tokens.delete("existing").unwrap();
        f.tokens.delete("fresh").unwrap();
        assert!(wait_for(|| {
            f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "fresh").is_none()
                && f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "existing").is_none()
                && f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_none()
        })
        .await);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_sees_writes_from_another_process() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("upstream.db");

        // The API process and the sync process each open the shared file.
        let api_store = Arc::new(SqliteRecordStore::open(&path).unwrap());
        let api_directory = Arc::new(RecordDirectory::new(api_store.clone()));
        let api_tokens = SystemTokenStore::new(
            api_store.clone(),
            api_directory.clone(),
            hashers(),
            TokenConfig::default(),
        );

        let sync_store = Arc::new(SqliteRecordStore::open(&path).unwrap());
        let sync_tokens = Arc::new(SystemTokenStore::new(
            sync_store.clone(),
            Arc::new(RecordDirectory::new(sync_store.clone())),
            hashers(),
            TokenConfig::default(),
        ));
        let downstream = Arc::new(SqliteRecordStore::in_memory().unwrap());

        let config = SyncConfig {
            workers: 1,
            retry_base_ms: 10,
            retry_max_ms: 50,
            upstream_poll_ms: 20,
            ..Default::default()
        };
        let manager = SyncManager::new(sync_tokens, sync_store, config);
        manager.add_cluster("c-1", downstream.clone()).await;
        manager.start_upstream_poll().await;

        api_directory.put_user(&User::new("alice")).unwrap();
        api_directory
            .put_cluster(&Cluster {
                name: "c-1".to_string(),
                display_name: "c-1".to_string(),
            })
            .unwrap();
        api_directory
            .put_user_attribute(&UserAttribute {
                name: "alice".to_string(),
                ..Default::default()
            })
            .unwrap();
        let mut token = Token::new("alice");
        token.name = "t1".to_string();
        token.spec.cluster_name = "c-1".to_string();
        api_tokens.create(token, WriteOptions::default()).unwrap();

        let present = |namespace: &str, name: &str| {
            downstream.get(namespace, name, ReadMode::Consistent).is_ok()
        };
        assert!(wait_for(|| {
            present(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1")
                && present(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice")
        })
        .await);

        api_tokens.delete("t1").unwrap();
        assert!(wait_for(|| !present(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1")).await);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_revokes_tokens_of_deleted_user() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");

        let config = SyncConfig {
            workers: 1,
            retry_base_ms: 10,
            retry_max_ms: 50,
            ..Default::default()
        };
        let manager = SyncManager::new(f.tokens.clone(), f.upstream.clone(), config);
        manager.add_cluster("c-1", f.downstream.clone()).await;
        assert!(wait_for(|| f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_some()).await);

        f.directory.delete_user("alice").unwrap();
        assert!(wait_for(|| {
            f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").is_none()
                && f.shadow(CLUSTER_USER_ATTRIBUTE_NAMESPACE, "alice").is_none()
        })
        .await);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_recreates_deleted_shadow() {
        let f = Fixture::new();
        f.issue("alice", "t1", "c-1");

        let manager = SyncManager::new(f.tokens.clone(), f.upstream.clone(), SyncConfig::default());
        manager.add_cluster("c-1", f.downstream.clone()).await;
        assert!(wait_for(|| f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").is_some()).await);

        f.downstream
            .delete(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1")
            .unwrap();
        assert!(wait_for(|| f.shadow(CLUSTER_AUTH_TOKEN_NAMESPACE, "t1").is_some()).await);

        manager.shutdown().await;
    }
}
