// Path: crates/state/src/tree/readonly.rs

//! Immutable views of committed versions.

use super::export::Exporter;
use super::iterator::TreeIterator;
use super::read;
use crate::node::NodePointer;
use crate::proof::{builder, CommitmentProof};
use crate::store::TreeStore;
use bytes::Bytes;
use iavlx_types::hash::Hash;
use iavlx_types::{CommitId, Result, Version};
use std::sync::Arc;

/// A committed version of a tree. Cheap to clone; reads never block the
/// writer.
#[derive(Clone)]
pub struct ReadOnlyTree {
    store: Arc<TreeStore>,
    root: Option<Arc<NodePointer>>,
    version: Version,
    hash: Hash,
}

impl ReadOnlyTree {
    pub(crate) fn new(store: Arc<TreeStore>, root: Option<Arc<NodePointer>>, version: Version, hash: Hash) -> Self {
        Self {
            store,
            root,
            version,
            hash,
        }
    }

    /// The version this view reads.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The root hash at this version.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Version and hash together.
    pub fn commit_id(&self) -> CommitId {
        CommitId::new(self.version, self.hash.to_vec())
    }

    /// The value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        read::get(&self.store, self.root.as_ref(), key)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.get(key).map(|v| v.is_some())
    }

    /// The in-order index `key` has or would have, with its value if present.
    pub fn get_with_index(&self, key: &[u8]) -> Result<(u64, Option<Bytes>)> {
        read::get_with_index(&self.store, self.root.as_ref(), key)
    }

    /// The key and value at in-order `index`.
    pub fn get_by_index(&self, index: u64) -> Result<Option<(Bytes, Bytes)>> {
        read::get_by_index(&self.store, self.root.as_ref(), index)
    }

    /// Number of keys.
    pub fn size(&self) -> Result<u64> {
        read::size(&self.store, self.root.as_ref())
    }

    /// Tree height; zero for empty and single-leaf trees.
    pub fn height(&self) -> Result<u8> {
        read::height(&self.store, self.root.as_ref())
    }

    /// Whether the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Ascending iteration over `start <= key < end`.
    pub fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<TreeIterator> {
        self.range(start, end, true)
    }

    /// Descending iteration over `start <= key < end`.
    pub fn reverse_iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<TreeIterator> {
        self.range(start, end, false)
    }

    fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>, ascending: bool) -> Result<TreeIterator> {
        TreeIterator::new(
            Arc::clone(&self.store),
            self.root.as_ref(),
            start.map(Bytes::copy_from_slice),
            end.map(Bytes::copy_from_slice),
            ascending,
        )
    }

    /// Proves `key` is present at this version.
    pub fn get_membership_proof(&self, key: &[u8]) -> Result<CommitmentProof> {
        builder::membership_proof(&self.store, self.root.as_ref(), key)
    }

    /// Proves `key` is absent at this version.
    pub fn get_non_membership_proof(&self, key: &[u8]) -> Result<CommitmentProof> {
        builder::non_membership_proof(&self.store, self.root.as_ref(), key)
    }

    /// Streams every node in post-order for import elsewhere.
    pub fn export(&self) -> Result<Exporter> {
        Exporter::new(Arc::clone(&self.store), self.root.as_ref())
    }

    /// Checks AVL balance, sizes, heights and key order over the whole tree.
    pub fn verify(&self) -> Result<()> {
        super::verify::check_tree(&self.store, self.root.as_ref())
    }
}

impl std::fmt::Debug for ReadOnlyTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyTree")
            .field("version", &self.version)
            .field("hash", &hex::encode(self.hash))
            .finish()
    }
}
