//! Salted password hashing.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Salt length in bytes (stored as 32 hex characters).
const SALT_BYTES: usize = 16;

/// A SHA-256 digest of `salt || password`, both hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HashedPassword {
    hash: String,
    salt: String,
}

impl HashedPassword {
    /// Hashes `password` under a fresh random salt.
    pub(crate) fn new(password: &str) -> Self {
        let mut salt = [0u8; SALT_BYTES];
        rand::thread_rng().fill(&mut salt);
        let salt = hex::encode(salt);
        Self {
            hash: digest(password, &salt),
            salt,
        }
    }

    pub(crate) fn verify(&self, password: &str) -> bool {
        constant_time_eq(&digest(password, &self.salt), &self.hash)
    }
}

fn digest(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_matches_only_the_original() {
        let hashed = HashedPassword::new("hunter2");
        assert!(hashed.verify("hunter2"));
        assert!(!hashed.verify("hunter3"));
        assert!(!hashed.verify(""));
    }

    #[test]
    fn salts_differ_per_hash() {
        let a = HashedPassword::new("same");
        let b = HashedPassword::new("same");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.salt.len(), 32);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn digest_is_stable() {
        // sha256("abc")
        assert_eq!(
            digest("c", "ab"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn constant_time_comparison() {
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
        assert!(!constant_time_eq("short", "longer"));
    }
}
