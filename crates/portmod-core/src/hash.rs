//! Content hashing for cache validation.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;

/// SHA-256 of `bytes`, lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's contents, lowercase hex.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

/// Whether `path` currently hashes to `expected`. A missing or unreadable
/// file never matches.
pub fn file_matches(path: &Path, expected: &str) -> bool {
    hash_file(path).map(|h| h == expected).unwrap_or(false)
}
