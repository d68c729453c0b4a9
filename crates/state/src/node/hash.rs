// Path: crates/state/src/node/hash.rs

//! Legacy IAVL node hashing.
//!
//! Preimage: zigzag varint height, size and version, followed for leaves by
//! the length-prefixed key and the length-prefixed SHA-256 of the value, and
//! for branches by the length-prefixed left and right child hashes.

use iavlx_types::hash::{sha256, Hash, HASH_LEN};
use iavlx_types::varint::{put_bytes, put_varint};
use iavlx_types::Version;

/// The zigzag header shared by every node preimage.
pub(crate) fn header(height: u8, size: u64, version: Version) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    put_varint(&mut out, i64::from(height));
    put_varint(&mut out, i64::try_from(size).unwrap_or(i64::MAX));
    put_varint(&mut out, i64::from(version));
    out
}

/// Hash of a leaf carrying `key` and `value`, created at `version`.
pub fn leaf_hash(version: Version, key: &[u8], value: &[u8]) -> Hash {
    let mut preimage = header(0, 1, version);
    put_bytes(&mut preimage, key);
    put_bytes(&mut preimage, &sha256(value));
    sha256(&preimage)
}

/// Hash of a branch over two child hashes.
pub fn branch_hash(height: u8, size: u64, version: Version, left: &Hash, right: &Hash) -> Hash {
    let mut preimage = header(height, size, version);
    preimage.reserve(2 * (HASH_LEN + 1));
    put_bytes(&mut preimage, left);
    put_bytes(&mut preimage, right);
    sha256(&preimage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_preimage_layout() {
        let mut expected = vec![0x00, 0x02, 0x0a];
        expected.push(3);
        expected.extend_from_slice(b"key");
        expected.push(32);
        expected.extend_from_slice(&sha256(b"value"));
        assert_eq!(leaf_hash(5, b"key", b"value"), sha256(&expected));
    }

    #[test]
    fn branch_preimage_layout() {
        let left = sha256(b"l");
        let right = sha256(b"r");
        let mut expected = vec![0x02, 0x04, 0x06];
        expected.push(32);
        expected.extend_from_slice(&left);
        expected.push(32);
        expected.extend_from_slice(&right);
        assert_eq!(branch_hash(1, 2, 3, &left, &right), sha256(&expected));
    }

    #[test]
    fn version_changes_hash() {
        assert_ne!(leaf_hash(1, b"k", b"v"), leaf_hash(2, b"k", b"v"));
    }
}
