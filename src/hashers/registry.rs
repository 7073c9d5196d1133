use super::{generate_secret, parse_version, HashError, HashVersion, Hasher, ScryptHasher, Sha256Hasher, Sha3Hasher};
use crate::config::HashingConfig;
use std::sync::Arc;

/// Dispatches hash strings to the algorithm that produced them and holds
/// the single default algorithm used for new secrets.
///
/// Built once from configuration and handed to the stores, so tests can
/// swap in a different default or cheaper cost parameters.
#[derive(Clone)]
pub struct HashRegistry {
    default_version: HashVersion,
    scrypt: Arc<ScryptHasher>,
    sha256: Arc<Sha256Hasher>,
    sha3: Arc<Sha3Hasher>,
}

impl HashRegistry {
    pub fn new(config: &HashingConfig) -> Result<Self, HashError> {
        Ok(Self {
            default_version: config.default_algorithm,
            scrypt: Arc::new(ScryptHasher::new(
                config.scrypt_log_n,
                config.scrypt_r,
                config.scrypt_p,
            )?),
            sha256: Arc::new(Sha256Hasher),
            sha3: Arc::new(Sha3Hasher::new(config.sha3_iterations)?),
        })
    }

    /// Version new secrets are hashed with.
    pub fn default_version(&self) -> HashVersion {
        self.default_version
    }

    /// Current default hasher.
    pub fn hasher(&self) -> Arc<dyn Hasher> {
        self.hasher_for_version(self.default_version)
    }

    pub fn hasher_for_version(&self, version: HashVersion) -> Arc<dyn Hasher> {
        match version {
            HashVersion::Scrypt => self.scrypt.clone(),
            HashVersion::Sha256 => self.sha256.clone(),
            HashVersion::Sha3 => self.sha3.clone(),
        }
    }

    /// Hasher selected by the version tag embedded in `hash`.
    pub fn hasher_for_hash(&self, hash: &str) -> Result<Arc<dyn Hasher>, HashError> {
        Ok(self.hasher_for_version(parse_version(hash)?))
    }

    /// Verifies `secret` against `hash` using whichever algorithm produced it.
    pub fn verify(&self, hash: &str, secret: &str) -> Result<(), HashError> {
        self.hasher_for_hash(hash)?.verify_hash(hash, secret)
    }

    /// Generates a new bearer secret and its hash under the default algorithm.
    pub fn generate_secret_and_hash(&self) -> Result<(String, String), HashError> {
        let secret = generate_secret();
        let hash = self.hasher().create_hash(&secret)?;
        Ok((secret, hash))
    }
}

impl std::fmt::Debug for HashRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRegistry")
            .field("default_version", &self.default_version)
            .finish()
    }
}
