use super::{compare_digest, decode, encode, generate_salt, split_fields, HashError, HashVersion, Hasher};
use ::scrypt::{scrypt, Params};

/// Derived key length in bytes.
const KEY_LENGTH: usize = 64;

/// scrypt KDF.
///
/// Format: `$1:<log_n>:<r>:<p>:<salt>:<key>`. Cost parameters are read
/// back from the hash on verification, so changing them only affects new
/// hashes.
#[derive(Debug, Clone)]
pub struct ScryptHasher {
    log_n: u8,
    r: u32,
    p: u32,
}

impl ScryptHasher {
    pub fn new(log_n: u8, r: u32, p: u32) -> Result<Self, HashError> {
        params(log_n, r, p)?;
        Ok(Self { log_n, r, p })
    }

    fn derive(secret: &str, salt: &[u8], params: &Params) -> Result<Vec<u8>, HashError> {
        let mut key = vec![0u8; KEY_LENGTH];
        scrypt(secret.as_bytes(), salt, params, &mut key)
            .map_err(|e| HashError::Parameters(e.to_string()))?;
        Ok(key)
    }
}

fn params(log_n: u8, r: u32, p: u32) -> Result<Params, HashError> {
    Params::new(log_n, r, p, KEY_LENGTH).map_err(|e| HashError::Parameters(e.to_string()))
}

fn parse_number<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, HashError> {
    field
        .parse()
        .map_err(|_| HashError::Malformed(format!("invalid scrypt {} '{}'", name, field)))
}

impl Hasher for ScryptHasher {
    fn version(&self) -> HashVersion {
        HashVersion::Scrypt
    }

    fn create_hash(&self, secret: &str) -> Result<String, HashError> {
        let salt = generate_salt();
        let key = Self::derive(secret, &salt, &params(self.log_n, self.r, self.p)?)?;
        Ok(format!(
            "${}:{}:{}:{}:{}:{}",
            HashVersion::Scrypt.tag(),
            self.log_n,
            self.r,
            self.p,
            encode(&salt),
            encode(&key)
        ))
    }

    fn verify_hash(&self, hash: &str, secret: &str) -> Result<(), HashError> {
        let fields = split_fields(hash, HashVersion::Scrypt, 6)?;
        let log_n: u8 = parse_number(fields[1], "log_n")?;
        let r: u32 = parse_number(fields[2], "r")?;
        let p: u32 = parse_number(fields[3], "p")?;
        let salt = decode(fields[4], "salt")?;
        let stored = decode(fields[5], "key")?;
        if stored.is_empty() {
            return Err(HashError::EmptyDigest);
        }

        let computed = Self::derive(secret, &salt, &params(log_n, r, p)?)?;
        compare_digest(&stored, &computed)
    }
}
