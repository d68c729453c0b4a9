// Path: crates/types/src/hash.rs

//! SHA-256 helpers shared by node hashing, proofs and the commit info root.

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest.
pub type Hash = [u8; 32];

/// Length of every hash stored on disk or carried in a proof.
pub const HASH_LEN: usize = 32;

/// Hashes a single byte string.
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Hashes the concatenation of several byte strings without allocating.
pub fn sha256_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// The hash of an empty tree: SHA-256 over the empty input.
pub fn empty_hash() -> Hash {
    sha256(&[])
}

/// Renders a hash as lowercase hex for logs.
pub fn short_hex(hash: &[u8]) -> String {
    hex::encode(hash.get(..8).unwrap_or(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hash_is_sha256_of_nothing() {
        assert_eq!(
            hex::encode(empty_hash()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn concat_matches_single_shot() {
        assert_eq!(sha256_concat(&[b"ab", b"c"]), sha256(b"abc"));
    }
}
