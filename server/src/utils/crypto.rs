//! Cryptographic utility functions

use sha2::{Digest, Sha256};

/// Calculate SHA-256 of a string and return it hex encoded
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}
