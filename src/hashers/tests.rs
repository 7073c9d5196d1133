use super::*;
use crate::config::HashingConfig;

fn cheap_config(default_algorithm: HashVersion) -> HashingConfig {
    HashingConfig {
        default_algorithm,
        scrypt_log_n: 4,
        scrypt_r: 8,
        scrypt_p: 1,
        sha3_iterations: 3,
    }
}

fn registry(default_algorithm: HashVersion) -> HashRegistry {
    HashRegistry::new(&cheap_config(default_algorithm)).unwrap()
}

const ALL_VERSIONS: [HashVersion; 3] = [HashVersion::Scrypt, HashVersion::Sha256, HashVersion::Sha3];

#[test]
fn every_algorithm_verifies_its_own_hash() {
    let registry = registry(HashVersion::Sha3);
    for version in ALL_VERSIONS {
        let hasher = registry.hasher_for_version(version);
        let hash = hasher.create_hash("hunter2").unwrap();

        assert!(hash.starts_with(&format!("${}:", version.tag())), "{}", hash);
        assert_eq!(hasher.verify_hash(&hash, "hunter2"), Ok(()));
        assert_eq!(
            hasher.verify_hash(&hash, "hunter2x"),
            Err(HashError::Mismatch),
            "{} accepted a wrong secret",
            version
        );
    }
}

#[test]
fn registry_dispatches_by_embedded_version() {
    let registry = registry(HashVersion::Sha3);
    for version in ALL_VERSIONS {
        let hash = registry.hasher_for_version(version).create_hash("s3cret").unwrap();
        let found = registry.hasher_for_hash(&hash).unwrap();
        assert_eq!(found.version(), version);
        assert!(found.verify_hash(&hash, "s3cret").is_ok());
        assert!(registry.verify(&hash, "s3cret").is_ok());
    }
}

#[test]
fn default_hasher_follows_configuration() {
    assert_eq!(registry(HashVersion::Sha3).hasher().version(), HashVersion::Sha3);
    assert_eq!(registry(HashVersion::Scrypt).hasher().version(), HashVersion::Scrypt);

    let (secret, hash) = registry(HashVersion::Sha256).generate_secret_and_hash().unwrap();
    assert_eq!(parse_version(&hash).unwrap(), HashVersion::Sha256);
    assert!(registry(HashVersion::Sha3).verify(&hash, &secret).is_ok());
}

#[test]
fn same_secret_hashes_differently_each_time() {
    let hasher = Sha3Hasher::new(1).unwrap();
    let first = hasher.create_hash("repeat").unwrap();
    let second = hasher.create_hash("repeat").unwrap();
    assert_ne!(first, second);
}

#[test]
fn malformed_hashes_are_rejected() {
    let sha3 = Sha3Hasher::default();

    assert!(matches!(
        sha3.verify_hash("3:1:c2FsdA:ZGlnZXN0", "x"),
        Err(HashError::Malformed(_))
    ));
    assert!(matches!(
        sha3.verify_hash("$3:1:c2FsdA", "x"),
        Err(HashError::Malformed(_))
    ));
    assert!(matches!(
        sha3.verify_hash("$three:1:c2FsdA:ZGlnZXN0", "x"),
        Err(HashError::Malformed(_))
    ));
    assert!(matches!(
        sha3.verify_hash("$3:1:not base64!:ZGlnZXN0", "x"),
        Err(HashError::Malformed(_))
    ));
    assert!(matches!(
        sha3.verify_hash("$3:0:c2FsdA:ZGlnZXN0", "x"),
        Err(HashError::Malformed(_))
    ));
}

#[test]
fn parse_version_reports_unknown_and_garbage_tags() {
    assert_eq!(parse_version("$9:abc:def"), Err(HashError::UnsupportedVersion(9)));
    assert!(matches!(parse_version("$-1:abc:def"), Err(HashError::Malformed(_))));
    assert!(matches!(parse_version(""), Err(HashError::Malformed(_))));
    assert_eq!(parse_version("$1:15:8:1:a:b"), Ok(HashVersion::Scrypt));
}

#[test]
fn hash_from_another_algorithm_is_a_version_mismatch() {
    let sha3_hash = Sha3Hasher::default().create_hash("secret").unwrap();
    let sha256_hash = Sha256Hasher.create_hash("secret").unwrap();

    // Same field count as a sha3 hash, different tag.
    let forged = sha3_hash.replacen("$3:", "$2:", 1);
    assert_eq!(
        Sha256Hasher.verify_hash(&sha256_hash.replacen("$2:", "$3:", 1), "secret"),
        Err(HashError::VersionMismatch { expected: 2, found: 3 })
    );
    assert_eq!(
        Sha3Hasher::default().verify_hash(&forged, "secret"),
        Err(HashError::VersionMismatch { expected: 3, found: 2 })
    );
}

#[test]
fn empty_digest_never_matches() {
    let salt = encode(b"salt");
    assert_eq!(
        Sha3Hasher::default().verify_hash(&format!("$3:1:{}:", salt), ""),
        Err(HashError::EmptyDigest)
    );
    assert_eq!(
        Sha256Hasher.verify_hash(&format!("$2:{}:", salt), ""),
        Err(HashError::EmptyDigest)
    );
    assert_eq!(
        ScryptHasher::new(4, 8, 1)
            .unwrap()
            .verify_hash(&format!("$1:4:8:1:{}:", salt), ""),
        Err(HashError::EmptyDigest)
    );
}

#[test]
fn scrypt_verification_uses_parameters_from_the_hash() {
    let cheap = ScryptHasher::new(4, 8, 1).unwrap();
    let hash = cheap.create_hash("pw").unwrap();
    assert!(hash.starts_with("$1:4:8:1:"));

    let other = ScryptHasher::new(5, 8, 1).unwrap();
    assert_eq!(other.verify_hash(&hash, "pw"), Ok(()));
}

#[test]
fn invalid_parameters_are_rejected_up_front() {
    assert!(matches!(Sha3Hasher::new(0), Err(HashError::Parameters(_))));
    assert!(matches!(ScryptHasher::new(4, 0, 1), Err(HashError::Parameters(_))));
}

#[test]
fn generated_secrets_use_the_secret_alphabet() {
    let secret = generate_secret();
    assert_eq!(secret.len(), SECRET_LENGTH);
    assert!(secret.bytes().all(|b| SECRET_CHARSET.contains(&b)));
    assert_ne!(secret, generate_secret());
}
