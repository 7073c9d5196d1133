use super::{compare_digest, decode, encode, generate_salt, split_fields, HashError, HashVersion, Hasher};
use sha2::{Digest, Sha256};

/// Salted double-round SHA-256: `SHA256(SHA256(salt || secret))`.
///
/// Format: `$2:<salt>:<digest>`. Kept so credentials issued under it keep
/// verifying; it is not strong enough to be mirrored downstream.
#[derive(Debug, Clone, Default)]
pub struct Sha256Hasher;

impl Sha256Hasher {
    fn digest(secret: &str, salt: &[u8]) -> Vec<u8> {
        let mut first = Sha256::new();
        first.update(salt);
        first.update(secret.as_bytes());
        Sha256::digest(first.finalize()).to_vec()
    }
}

impl Hasher for Sha256Hasher {
    fn version(&self) -> HashVersion {
        HashVersion::Sha256
    }

    fn create_hash(&self, secret: &str) -> Result<String, HashError> {
        let salt = generate_salt();
        let digest = Self::digest(secret, &salt);
        Ok(format!(
            "${}:{}:{}",
            HashVersion::Sha256.tag(),
            encode(&salt),
            encode(&digest)
        ))
    }

    fn verify_hash(&self, hash: &str, secret: &str) -> Result<(), HashError> {
        let fields = split_fields(hash, HashVersion::Sha256, 3)?;
        let salt = decode(fields[1], "salt")?;
        let stored = decode(fields[2], "digest")?;
        compare_digest(&stored, &Self::digest(secret, &salt))
    }
}
