// Path: crates/types/src/commit.rs

//! Commit identifiers and the multi-store commit info root.

use crate::hash::{empty_hash, sha256, sha256_concat, Hash};
use crate::varint::put_bytes;
use crate::Version;
use serde::{Deserialize, Serialize};

/// The version and root hash produced by one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitId {
    /// The committed version.
    pub version: Version,
    /// The root hash at that version.
    pub hash: Vec<u8>,
}

impl CommitId {
    /// Creates a commit id from a version and hash.
    pub fn new(version: Version, hash: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            hash: hash.into(),
        }
    }

    /// True for the zero-value id of a store that has never committed.
    pub fn is_zero(&self) -> bool {
        self.version == 0 && self.hash.is_empty()
    }
}

/// One named store's contribution to a multi-store commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// The mount name of the store.
    pub name: String,
    /// The store's own commit id.
    pub commit_id: CommitId,
}

/// The per-version summary of every hashed store in a multi-store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// The multi-store version.
    pub version: Version,
    /// Unix timestamp in nanoseconds at which the commit info was produced.
    pub timestamp_nanos: u64,
    /// Store infos; `hash()` sorts them by name.
    pub store_infos: Vec<StoreInfo>,
}

impl CommitInfo {
    /// The multi-store root: a simple Merkle tree over `name -> H(hash)`
    /// pairs sorted by name.
    pub fn hash(&self) -> Hash {
        let mut infos: Vec<&StoreInfo> = self.store_infos.iter().collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        let leaves: Vec<Vec<u8>> = infos
            .iter()
            .map(|info| {
                let mut leaf = Vec::with_capacity(info.name.len() + 34);
                put_bytes(&mut leaf, info.name.as_bytes());
                put_bytes(&mut leaf, &sha256(&info.commit_id.hash));
                leaf
            })
            .collect();
        merkle_root(&leaves)
    }

    /// The commit id of the multi-store at this version.
    pub fn commit_id(&self) -> CommitId {
        CommitId::new(self.version, self.hash().to_vec())
    }
}

fn merkle_root(items: &[Vec<u8>]) -> Hash {
    match items {
        [] => empty_hash(),
        [single] => sha256_concat(&[&[0u8], single]),
        _ => {
            let (left, right) = items.split_at(split_point(items.len()));
            sha256_concat(&[&[1u8], &merkle_root(left), &merkle_root(right)])
        }
    }
}

/// Largest power of two strictly below `n` (n >= 2).
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, hash: &[u8]) -> StoreInfo {
        StoreInfo {
            name: name.to_string(),
            commit_id: CommitId::new(1, hash.to_vec()),
        }
    }

    #[test]
    fn empty_commit_info_hashes_to_empty_hash() {
        assert_eq!(CommitInfo::default().hash(), empty_hash());
    }

    #[test]
    fn hash_is_independent_of_store_order() {
        let a = CommitInfo {
            version: 1,
            timestamp_nanos: 0,
            store_infos: vec![info("acc", b"1"), info("bank", b"2"), info("gov", b"3")],
        };
        let b = CommitInfo {
            version: 1,
            timestamp_nanos: 99,
            store_infos: vec![info("gov", b"3"), info("acc", b"1"), info("bank", b"2")],
        };
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn split_point_is_largest_power_below() {
        assert_eq!(split_point(2), 1);
        assert_eq!(split_point(3), 2);
        assert_eq!(split_point(4), 2);
        assert_eq!(split_point(5), 4);
        assert_eq!(split_point(9), 8);
    }

    #[test]
    fn single_store_root_is_leaf_hash() {
        let ci = CommitInfo {
            version: 1,
            timestamp_nanos: 0,
            store_infos: vec![info("acc", b"h")],
        };
        let mut leaf = Vec::new();
        put_bytes(&mut leaf, b"acc");
        put_bytes(&mut leaf, &sha256(b"h"));
        assert_eq!(ci.hash(), sha256_concat(&[&[0u8], &leaf]));
    }
}
