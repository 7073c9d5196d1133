use crate::hashers::HashVersion;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hashing: HashingConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub passwords: PasswordConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Secret hashing configuration.
///
/// `default_algorithm` is read once at startup; existing hashes keep
/// verifying under whatever algorithm produced them.
#[derive(Debug, Clone, Deserialize)]
pub struct HashingConfig {
    #[serde(default = "default_algorithm")]
    pub default_algorithm: HashVersion,
    #[serde(default = "default_scrypt_log_n")]
    pub scrypt_log_n: u8,
    #[serde(default = "default_scrypt_r")]
    pub scrypt_r: u32,
    #[serde(default = "default_scrypt_p")]
    pub scrypt_p: u32,
    #[serde(default = "default_sha3_iterations")]
    pub sha3_iterations: u32,
}

fn default_algorithm() -> HashVersion {
    HashVersion::Sha3
}

fn default_scrypt_log_n() -> u8 {
    15
}

fn default_scrypt_r() -> u32 {
    8
}

fn default_scrypt_p() -> u32 {
    1
}

fn default_sha3_iterations() -> u32 {
    1
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            default_algorithm: default_algorithm(),
            scrypt_log_n: default_scrypt_log_n(),
            scrypt_r: default_scrypt_r(),
            scrypt_p: default_scrypt_p(),
            sha3_iterations: default_sha3_iterations(),
        }
    }
}

/// Token store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_namespace")]
    pub namespace: String,
    /// TTL applied when a token is created with `ttl = 0`.
    #[serde(default = "default_token_ttl_ms")]
    pub default_ttl_ms: i64,
    /// Upper bound for any token TTL. 0 disables the limit.
    #[serde(default)]
    pub max_ttl_minutes: i64,
}

fn default_token_namespace() -> String {
    "cattle-tokens".to_string()
}

fn default_token_ttl_ms() -> i64 {
    30 * 24 * 60 * 60 * 1000
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            namespace: default_token_namespace(),
            default_ttl_ms: default_token_ttl_ms(),
            max_ttl_minutes: 0,
        }
    }
}

/// Password store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordConfig {
    #[serde(default = "default_password_namespace")]
    pub namespace: String,
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
    #[serde(default = "default_key_length")]
    pub key_length: usize,
    #[serde(default = "default_salt_length")]
    pub salt_length: usize,
    /// Cost for rewriting passwords that are still stored as bcrypt.
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

fn default_password_namespace() -> String {
    "cattle-local-user-passwords".to_string()
}

fn default_pbkdf2_iterations() -> u32 {
    210_000
}

fn default_key_length() -> usize {
    32
}

fn default_salt_length() -> usize {
    32
}

fn default_bcrypt_cost() -> u32 {
    10
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            namespace: default_password_namespace(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
            key_length: default_key_length(),
            salt_length: default_salt_length(),
            bcrypt_cost: default_bcrypt_cost(),
        }
    }
}

/// Backing record store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `":memory:"` keeps everything in process.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "tokensync.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Cross-cluster sync configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Refuse to mirror tokens that have no hash yet.
    #[serde(default = "default_token_hashing_required")]
    pub token_hashing_required: bool,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Reconcile workers per downstream cluster.
    #[serde(default = "default_sync_workers")]
    pub workers: usize,
    /// Full resync period; catches events lost by a lagging watch.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// How often the upstream store is polled for writes made by other
    /// processes. 0 disables polling.
    #[serde(default = "default_upstream_poll_ms")]
    pub upstream_poll_ms: u64,
    #[serde(default)]
    pub clusters: Vec<DownstreamCluster>,
}

/// A downstream cluster and the store its shadow objects live in.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DownstreamCluster {
    pub name: String,
    pub store_path: String,
}

fn default_token_hashing_required() -> bool {
    true
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_sync_workers() -> usize {
    2
}

fn default_resync_interval_secs() -> u64 {
    300
}

fn default_upstream_poll_ms() -> u64 {
    1000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            token_hashing_required: default_token_hashing_required(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            workers: default_sync_workers(),
            resync_interval_secs: default_resync_interval_secs(),
            upstream_poll_ms: default_upstream_poll_ms(),
            clusters: Vec::new(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Users granted the "manage credentials" capability.
    #[serde(default)]
    pub administrators: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            administrators: Vec::new(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

impl Config {
    /// Loads the file named by `TOKENSYNC_CONFIG` (if set), then applies
    /// environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("TOKENSYNC_CONFIG") {
            Ok(path) => load_config(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TOKENSYNC_STORE_PATH") {
            self.store.path = v;
        }
        if let Ok(v) = std::env::var("TOKENSYNC_LISTEN") {
            self.api.listen = v;
        }
        if let Ok(v) = std::env::var("TOKENSYNC_HASH_ALGORITHM") {
            match v.as_str() {
                "scrypt" => self.hashing.default_algorithm = HashVersion::Scrypt,
                "sha256" => self.hashing.default_algorithm = HashVersion::Sha256,
                "sha3" => self.hashing.default_algorithm = HashVersion::Sha3,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hashing.default_algorithm, HashVersion::Sha3);
        assert_eq!(config.hashing.scrypt_log_n, 15);
        assert_eq!(config.tokens.namespace, "cattle-tokens");
        assert_eq!(config.tokens.default_ttl_ms, 2_592_000_000);
        assert_eq!(config.passwords.pbkdf2_iterations, 210_000);
        assert!(config.sync.token_hashing_required);
        assert!(config.sync.clusters.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [hashing]
            default_algorithm = "scrypt"
            scrypt_log_n = 10

            [tokens]
            namespace = "tokens"
            max_ttl_minutes = 90

            [passwords]
            pbkdf2_iterations = 1000

            [store]
            path = "/var/lib/tokensync/records.db"

            [sync]
            token_hashing_required = false
            retry_base_ms = 100

            [[sync.clusters]]
            name = "c-abc"
            store_path = "/var/lib/tokensync/c-abc.db"

            [api]
            listen = "127.0.0.1:9000"
            administrators = ["admin"]
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.hashing.default_algorithm, HashVersion::Scrypt);
        assert_eq!(config.hashing.scrypt_log_n, 10);
        assert_eq!(config.hashing.scrypt_r, 8);
        assert_eq!(config.tokens.namespace, "tokens");
        assert_eq!(config.tokens.max_ttl_minutes, 90);
        assert_eq!(config.passwords.pbkdf2_iterations, 1000);
        assert_eq!(config.store.path, "/var/lib/tokensync/records.db");
        assert!(!config.sync.token_hashing_required);
        assert_eq!(config.sync.retry_max_ms, 60_000);
        assert_eq!(
            config.sync.clusters,
            vec![DownstreamCluster {
                name: "c-abc".to_string(),
                store_path: "/var/lib/tokensync/c-abc.db".to_string(),
            }]
        );
        assert_eq!(config.api.administrators, vec!["admin".to_string()]);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [tokens]
            default_ttl_ms = 1000
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.tokens.default_ttl_ms, 1000);
        assert_eq!(config.tokens.namespace, "cattle-tokens"); // Default
        assert_eq!(config.api.listen, "0.0.0.0:8443"); // Default
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokensync.toml");
        std::fs::write(&path, "[store]\npath = \":memory:\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.store.path, ":memory:");
        assert!(load_config(dir.path().join("missing.toml")).is_err());
    }
}
