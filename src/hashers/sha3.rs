use super::{compare_digest, decode, encode, generate_salt, split_fields, HashError, HashVersion, Hasher};
use ::sha3::{Digest, Sha3_512};

/// Iterated, salted SHA3-512.
///
/// Format: `$3:<iterations>:<salt>:<digest>`. The first round hashes
/// `salt || secret`, every further round rehashes the previous digest.
#[derive(Debug, Clone)]
pub struct Sha3Hasher {
    iterations: u32,
}

impl Sha3Hasher {
    pub fn new(iterations: u32) -> Result<Self, HashError> {
        if iterations == 0 {
            return Err(HashError::Parameters(
                "sha3 iterations must be at least 1".to_string(),
            ));
        }
        Ok(Self { iterations })
    }

    fn digest(secret: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut hasher = Sha3_512::new();
        hasher.update(salt);
        hasher.update(secret.as_bytes());
        let mut digest = hasher.finalize();
        for _ in 1..iterations {
            digest = Sha3_512::digest(digest);
        }
        digest.to_vec()
    }
}

impl Default for Sha3Hasher {
    fn default() -> Self {
        Self { iterations: 1 }
    }
}

impl Hasher for Sha3Hasher {
    fn version(&self) -> HashVersion {
        HashVersion::Sha3
    }

    fn create_hash(&self, secret: &str) -> Result<String, HashError> {
        let salt = generate_salt();
        let digest = Self::digest(secret, &salt, self.iterations);
        Ok(format!(
            "${}:{}:{}:{}",
            HashVersion::Sha3.tag(),
            self.iterations,
            encode(&salt),
            encode(&digest)
        ))
    }

    fn verify_hash(&self, hash: &str, secret: &str) -> Result<(), HashError> {
        let fields = split_fields(hash, HashVersion::Sha3, 4)?;
        let iterations: u32 = fields[1].parse().map_err(|_| {
            HashError::Malformed(format!("invalid sha3 iteration count '{}'", fields[1]))
        })?;
        if iterations == 0 {
            return Err(HashError::Malformed("sha3 iteration count is zero".to_string()));
        }
        let salt = decode(fields[2], "salt")?;
        let stored = decode(fields[3], "digest")?;
        compare_digest(&stored, &Self::digest(secret, &salt, iterations))
    }
}
