//! Login passwords of local users.
//!
//! One record per user, named after the user, in a dedicated namespace.
//! The record carries the hash and salt plus an annotation naming the
//! algorithm. Passwords still stored under the legacy bcrypt scheme are
//! rewritten with PBKDF2-HMAC-SHA3-512 the first time they verify.


use crate::config::PasswordConfig;
use crate::directory::{Directory, DirectoryError};
use crate::store::{OwnerReference, ReadMode, Record, RecordStore, StoreError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use sha3::Sha3_512;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info};

/// Annotation naming the algorithm the record was written with.
pub const PASSWORD_HASH_ANNOTATION: &str = "cattle.io/password-hash";

pub const FIELD_PASSWORD: &str = "password";
pub const FIELD_SALT: &str = "salt";

const UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordAlgorithm {
    Pbkdf2Sha3512,
    /// Legacy. Verified, then migrated.
    Bcrypt,
}

impl PasswordAlgorithm {
    pub fn marker(self) -> &'static str {
        match self {
            PasswordAlgorithm::Pbkdf2Sha3512 => "pbkdf2sha3512",
            PasswordAlgorithm::Bcrypt => "bcrypt",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "pbkdf2sha3512" => Some(PasswordAlgorithm::Pbkdf2Sha3512),
            "bcrypt" => Some(PasswordAlgorithm::Bcrypt),
            _ => None,
        }
    }
}

impl fmt::Display for PasswordAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("password for user {0} already exists")]
    AlreadyExists(String),

    #[error("password for user {0} not found")]
    NotFound(String),

    #[error("invalid password")]
    Mismatch,

    #[error("new password must differ from the current one")]
    Unchanged,

    #[error("password of user {0} was changed concurrently")]
    Conflict(String),

    #[error("password record of user {user} is corrupt: {reason}")]
    Corrupt { user: String, reason: String },

    #[error("failed to hash password: {0}")]
    Hashing(String),

    #[error("directory lookup failed: {0}")]
    Directory(DirectoryError),

    #[error("backing store failure: {0}")]
    Store(StoreError),
}

impl PasswordError {
    fn corrupt(user: &str, reason: impl Into<String>) -> Self {
        PasswordError::Corrupt {
            user: user.to_string(),
            reason: reason.into(),
        }
    }

    fn from_store(user: &str, e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => PasswordError::NotFound(user.to_string()),
            StoreError::AlreadyExists { .. } => PasswordError::AlreadyExists(user.to_string()),
            StoreError::Conflict { .. } => PasswordError::Conflict(user.to_string()),
            other => PasswordError::Store(other),
        }
    }
}

/// Hash and salt as written to a record.
struct Stored {
    algorithm: PasswordAlgorithm,
    password: String,
    salt: Option<String>,
}

pub struct PasswordStore {
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn Directory>,
    config: PasswordConfig,
}

impl PasswordStore {
    pub fn new(
        store: Arc<dyn RecordStore>,
        directory: Arc<dyn Directory>,
        config: PasswordConfig,
    ) -> Self {
        Self {
            store,
            directory,
            config,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Stores the first password of `user`. The record is owned by the user
    /// so it goes away with it.
    pub fn create_password(&self, user: &str, password: &str) -> Result<(), PasswordError> {
        let owner = self.directory.get_user(user, ReadMode::Cached).map_err(|e| match e {
            DirectoryError::NotFound { .. } => PasswordError::UserNotFound(user.to_string()),
            other => PasswordError::Directory(other),
        })?;

        let stored = self.hash(PasswordAlgorithm::Pbkdf2Sha3512, password)?;
        let mut record = Record::new(self.namespace(), user);
        record.owner = Some(OwnerReference {
            kind: "User".to_string(),
            name: owner.name,
            uid: owner.uid,
        });
        record.annotations.insert(
            PASSWORD_HASH_ANNOTATION.to_string(),
            stored.algorithm.marker().to_string(),
        );
        record.set_field(FIELD_PASSWORD, stored.password);
        if let Some(salt) = stored.salt {
            record.set_field(FIELD_SALT, salt);
        }

        self.store
            .create(record)
            .map_err(|e| PasswordError::from_store(user, e))?;
        info!(user = %user, "Password created");
        Ok(())
    }

    /// Replaces the password without checking the current one. A fresh salt
    /// is drawn; the recorded algorithm is kept. Re-read and retried when
    /// another writer got in first.
    pub fn update_password(&self, user: &str, password: &str) -> Result<(), PasswordError> {
        let mut attempt = 1;
        loop {
            let record = self.get_record(user, ReadMode::Consistent)?;
            let algorithm = self.algorithm(&record)?;
            let stored = self.hash(algorithm, password)?;
            match self.write(record, stored) {
                Ok(()) => {
                    info!(user = %user, algorithm = %algorithm, "Password updated");
                    return Ok(());
                }
                Err(PasswordError::Conflict(_)) if attempt < UPDATE_ATTEMPTS => {
                    debug!(user = %user, attempt, "Password changed underneath update, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Rotates the password after checking the current one. The new
    /// password is always written with the current algorithm. Fails with
    /// `Conflict` if the password changed after it was checked.
    pub fn verify_and_update_password(
        &self,
        user: &str,
        current: &str,
        new: &str,
    ) -> Result<(), PasswordError> {
        if current == new {
            return Err(PasswordError::Unchanged);
        }

        let record = self.get_record(user, ReadMode::Consistent)?;
        self.check(&record, current)?;

        let stored = self.hash(PasswordAlgorithm::Pbkdf2Sha3512, new)?;
        self.write(record, stored)?;
        info!(user = %user, "Password changed");
        Ok(())
    }

    /// Checks `password` against the stored one. A legacy record that
    /// verifies is rewritten with the current algorithm, unless it changed
    /// since it was read.
    pub fn verify_password(&self, user: &str, password: &str) -> Result<(), PasswordError> {
        let record = self.get_record(user, ReadMode::Cached)?;
        let algorithm = self.check(&record, password)?;

        if algorithm == PasswordAlgorithm::Bcrypt {
            let stored = self.hash(PasswordAlgorithm::Pbkdf2Sha3512, password)?;
            match self.write(record, stored) {
                Ok(()) => info!(user = %user, "Password migrated from bcrypt"),
                Err(PasswordError::Conflict(_)) => {
                    debug!(user = %user, "Password changed before migration, leaving it")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn get_record(&self, user: &str, mode: ReadMode) -> Result<Record, PasswordError> {
        self.store
            .get(self.namespace(), user, mode)
            .map_err(|e| PasswordError::from_store(user, e))
    }

    fn algorithm(&self, record: &Record) -> Result<PasswordAlgorithm, PasswordError> {
        let marker = record
            .annotations
            .get(PASSWORD_HASH_ANNOTATION)
            .map(String::as_str)
            .unwrap_or_default();
        PasswordAlgorithm::from_marker(marker).ok_or_else(|| {
            PasswordError::corrupt(&record.name, format!("unknown algorithm '{}'", marker))
        })
    }

    fn check(&self, record: &Record, password: &str) -> Result<PasswordAlgorithm, PasswordError> {
        let user = record.name.as_str();
        let algorithm = self.algorithm(record)?;
        let hash = record
            .field(FIELD_PASSWORD)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PasswordError::corrupt(user, "password missing"))?;

        match algorithm {
            PasswordAlgorithm::Pbkdf2Sha3512 => {
                let expected = STANDARD
                    .decode(hash)
                    .map_err(|e| PasswordError::corrupt(user, format!("password: {}", e)))?;
                let salt = record
                    .field(FIELD_SALT)
                    .ok_or_else(|| PasswordError::corrupt(user, "salt missing"))?;
                let salt = STANDARD
                    .decode(salt)
                    .map_err(|e| PasswordError::corrupt(user, format!("salt: {}", e)))?;
                let computed = self.pbkdf2(password, &salt, expected.len());
                if expected.is_empty() || !bool::from(expected.ct_eq(&computed)) {
                    return Err(PasswordError::Mismatch);
                }
            }
            PasswordAlgorithm::Bcrypt => {
                let valid = bcrypt::verify(password, hash)
                    .map_err(|e| PasswordError::corrupt(user, format!("bcrypt: {}", e)))?;
                if !valid {
                    return Err(PasswordError::Mismatch);
                }
            }
        }
        Ok(algorithm)
    }

    fn hash(&self, algorithm: PasswordAlgorithm, password: &str) -> Result<Stored, PasswordError> {
        match algorithm {
            PasswordAlgorithm::Pbkdf2Sha3512 => {
                let mut salt = vec![0u8; self.config.salt_length];
                rand::thread_rng().fill_bytes(&mut salt);
                let key = self.pbkdf2(password, &salt, self.config.key_length);
                Ok(Stored {
                    algorithm,
                    password: STANDARD.encode(key),
                    salt: Some(STANDARD.encode(salt)),
                })
            }
            PasswordAlgorithm::Bcrypt => {
                let hash = bcrypt::hash(password, self.config.bcrypt_cost)
                    .map_err(|e| PasswordError::Hashing(e.to_string()))?;
                Ok(Stored {
                    algorithm,
                    password: hash,
                    salt: None,
                })
            }
        }
    }

    fn pbkdf2(&self, password: &str, salt: &[u8], length: usize) -> Vec<u8> {
        let mut key = vec![0u8; length];
        pbkdf2::pbkdf2_hmac::<Sha3_512>(
            password.as_bytes(),
            salt,
            self.config.pbkdf2_iterations,
            &mut key,
        );
        key
    }

    /// Hash, salt and algorithm marker go out in one write, conditional on
    /// `record` still being the stored version.
    fn write(&self, mut record: Record, stored: Stored) -> Result<(), PasswordError> {
        let user = record.name.clone();
        record.annotations.insert(
            PASSWORD_HASH_ANNOTATION.to_string(),
            stored.algorithm.marker().to_string(),
        );
        record.set_field(FIELD_PASSWORD, stored.password);
        match stored.salt {
            Some(salt) => record.set_field(FIELD_SALT, salt),
            None => {
                record.data.remove(FIELD_SALT);
            }
        }

        self.store
            .update(record)
            .map(|_| ())
            .map_err(|e| PasswordError::from_store(&user, e))
    }
}
