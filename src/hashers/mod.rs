//! Versioned secret hashing.
//!
//! Every hash string produced here is self-describing:
//!
//! ```text
//! $<version>[:<algorithm fields>...]:<base64 salt>:<base64 digest>
//! ```
//!
//! The leading version tag selects the algorithm on verification, so
//! secrets hashed under an older default keep verifying after the default
//! changes. Salt and digest are unpadded standard base64.

mod registry;
mod scrypt;
mod sha256;
mod sha3;

#[cfg(test)]
mod tests;

pub use self::registry::HashRegistry;
pub use self::scrypt::ScryptHasher;
pub use self::sha256::Sha256Hasher;
pub use self::sha3::Sha3Hasher;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of generated salts in bytes.
pub const SALT_LENGTH: usize = 32;

/// Length of generated bearer secrets in characters.
pub const SECRET_LENGTH: usize = 54;

const SECRET_CHARSET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Algorithm identifier embedded at the front of every hash string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashVersion {
    /// Memory-hard KDF with tunable N/r/p.
    Scrypt,
    /// Salted double-round SHA-256.
    Sha256,
    /// Iterated, salted SHA3-512.
    Sha3,
}

impl HashVersion {
    pub fn tag(self) -> u32 {
        match self {
            HashVersion::Scrypt => 1,
            HashVersion::Sha256 => 2,
            HashVersion::Sha3 => 3,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self, HashError> {
        match tag {
            1 => Ok(HashVersion::Scrypt),
            2 => Ok(HashVersion::Sha256),
            3 => Ok(HashVersion::Sha3),
            other => Err(HashError::UnsupportedVersion(other)),
        }
    }
}

impl std::fmt::Display for HashVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashVersion::Scrypt => write!(f, "scrypt"),
            HashVersion::Sha256 => write!(f, "sha256"),
            HashVersion::Sha3 => write!(f, "sha3"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("malformed hash: {0}")]
    Malformed(String),

    #[error("unsupported hash version {0}")]
    UnsupportedVersion(u32),

    #[error("hash version {found} does not match hasher version {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("invalid hash parameters: {0}")]
    Parameters(String),

    #[error("hash has an empty digest")]
    EmptyDigest,

    #[error("secret does not match hash")]
    Mismatch,
}

/// A versioned secret hashing algorithm.
pub trait Hasher: Send + Sync {
    /// Version tag written into every hash this algorithm produces.
    fn version(&self) -> HashVersion;

    /// Hashes `secret` under a fresh random salt.
    fn create_hash(&self, secret: &str) -> Result<String, HashError>;

    /// Returns `Ok(())` only when `secret` matches `hash`.
    fn verify_hash(&self, hash: &str, secret: &str) -> Result<(), HashError>;
}

/// Extracts the version tag from a hash string without validating the rest.
pub fn parse_version(hash: &str) -> Result<HashVersion, HashError> {
    let body = hash
        .strip_prefix('$')
        .ok_or_else(|| HashError::Malformed("missing '$' prefix".to_string()))?;
    let tag = body.split(':').next().unwrap_or_default();
    let tag: u32 = tag
        .parse()
        .map_err(|_| HashError::Malformed(format!("non-numeric version '{}'", tag)))?;
    HashVersion::from_tag(tag)
}

/// Generates a random bearer secret.
pub fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    (0..SECRET_LENGTH)
        .map(|_| SECRET_CHARSET[rng.gen_range(0..SECRET_CHARSET.len())] as char)
        .collect()
}

pub(crate) fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub(crate) fn encode(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

pub(crate) fn decode(field: &str, what: &str) -> Result<Vec<u8>, HashError> {
    STANDARD_NO_PAD
        .decode(field)
        .map_err(|e| HashError::Malformed(format!("invalid {} encoding: {}", what, e)))
}

/// Splits a hash into its fields after checking the field count and that
/// the version tag belongs to `expected`.
pub(crate) fn split_fields<'a>(
    hash: &'a str,
    expected: HashVersion,
    field_count: usize,
) -> Result<Vec<&'a str>, HashError> {
    let body = hash
        .strip_prefix('$')
        .ok_or_else(|| HashError::Malformed("missing '$' prefix".to_string()))?;
    let fields: Vec<&str> = body.split(':').collect();
    if fields.len() != field_count {
        return Err(HashError::Malformed(format!(
            "expected {} fields, found {}",
            field_count,
            fields.len()
        )));
    }

    let found: u32 = fields[0]
        .parse()
        .map_err(|_| HashError::Malformed(format!("non-numeric version '{}'", fields[0])))?;
    if found != expected.tag() {
        return Err(HashError::VersionMismatch {
            expected: expected.tag(),
            found,
        });
    }

    Ok(fields)
}

/// Constant-time digest comparison. An empty stored digest never matches.
pub(crate) fn compare_digest(stored: &[u8], computed: &[u8]) -> Result<(), HashError> {
    if stored.is_empty() {
        return Err(HashError::EmptyDigest);
    }
    if bool::from(stored.ct_eq(computed)) {
        Ok(())
    } else {
        Err(HashError::Mismatch)
    }
}
