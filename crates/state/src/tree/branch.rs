// Path: crates/state/src/tree/branch.rs

//! A transactional overlay producing one candidate version.

use super::iterator::TreeIterator;
use super::mutation::{remove_recursive, set_recursive, MutationContext};
use super::read;
use crate::node::{MemNode, NodePointer};
use crate::store::TreeStore;
use crate::wal::WalOp;
use bytes::Bytes;
use iavlx_storage::NodeId;
use iavlx_types::{Result, StoreError, Version};
use std::sync::Arc;

/// Stages sets and deletes over a commit tree's working root.
///
/// Writes copy the touched path at the staged version and leave the
/// commit tree untouched until the branch is applied. A branch whose
/// mutation failed part way is poisoned: its root can no longer be trusted,
/// so every later call fails and applying it is refused.
pub struct BranchTree {
    store: Arc<TreeStore>,
    pub(crate) orig_root: Option<Arc<NodePointer>>,
    pub(crate) root: Option<Arc<NodePointer>>,
    pub(crate) version: Version,
    pub(crate) updates: Vec<WalOp>,
    pub(crate) orphans: Vec<NodeId>,
    pub(crate) poisoned: Option<String>,
    log_updates: bool,
}

impl BranchTree {
    pub(crate) fn new(store: Arc<TreeStore>, root: Option<Arc<NodePointer>>, version: Version) -> Self {
        let log_updates = store.options().write_wal;
        Self {
            store,
            orig_root: root.clone(),
            root,
            version,
            updates: Vec::new(),
            orphans: Vec::new(),
            poisoned: None,
            log_updates,
        }
    }

    /// The version this branch stages.
    pub fn version(&self) -> Version {
        self.version
    }

    fn ensure_usable(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(StoreError::Invariant(format!("branch is poisoned: {reason}"))),
            None => Ok(()),
        }
    }

    fn poison(&mut self, e: &StoreError) {
        tracing::warn!(target: "iavl", version = self.version, error = %e, "branch mutation failed");
        self.poisoned = Some(e.to_string());
    }

    #[cfg(feature = "strict_iavl")]
    fn check(&self) -> Result<()> {
        super::verify::check_tree(&self.store, self.root.as_ref())
    }

    #[cfg(not(feature = "strict_iavl"))]
    fn check(&self) -> Result<()> {
        Ok(())
    }

    /// Sets `key` to `value`. Returns whether an existing value was replaced.
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<bool> {
        self.ensure_usable()?;
        let leaf = Arc::new(MemNode::leaf(key.into(), value.into(), self.version));
        let mut ctx = MutationContext::new(&self.store, self.version);
        let outcome = set_recursive(self.root.take(), Arc::clone(&leaf), &mut ctx);
        let orphans = ctx.orphans;
        let (root, updated) = match outcome {
            Ok(done) => done,
            Err(e) => {
                self.poison(&e);
                return Err(e);
            }
        };
        self.root = Some(root);
        self.orphans.extend(orphans);
        if self.log_updates {
            self.updates.push(WalOp::Set(leaf));
        }
        self.check()?;
        Ok(updated)
    }

    /// Removes `key`, returning the value it held.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_usable()?;
        let Some(root) = self.root.take() else {
            return Ok(None);
        };
        let mut ctx = MutationContext::new(&self.store, self.version);
        let outcome = remove_recursive(root, key, &mut ctx);
        let orphans = ctx.orphans;
        let removal = match outcome {
            Ok(removal) => removal,
            Err(e) => {
                self.poison(&e);
                return Err(e);
            }
        };
        self.root = removal.node;
        if removal.value.is_some() {
            self.orphans.extend(orphans);
            if self.log_updates {
                self.updates.push(WalOp::Delete(Bytes::copy_from_slice(key)));
            }
            self.check()?;
        }
        Ok(removal.value)
    }

    /// The value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_usable()?;
        read::get(&self.store, self.root.as_ref(), key)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.get(key).map(|v| v.is_some())
    }

    /// Number of keys.
    pub fn size(&self) -> Result<u64> {
        self.ensure_usable()?;
        read::size(&self.store, self.root.as_ref())
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
        self.ensure_usable()?;
        TreeIterator::new(
            Arc::clone(&self.store),
            self.root.as_ref(),
            start.map(Bytes::copy_from_slice),
            end.map(Bytes::copy_from_slice),
            ascending,
        )
    }

    /// Checks AVL balance, sizes, heights and key order over the whole branch.
    pub fn verify(&self) -> Result<()> {
        self.ensure_usable()?;
        super::verify::check_tree(&self.store, self.root.as_ref())
    }
}

impl std::fmt::Debug for BranchTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchTree")
            .field("version", &self.version)
            .field("updates", &self.updates.len())
            .field("orphans", &self.orphans.len())
            .field("poisoned", &self.poisoned.is_some())
            .finish()
    }
}
