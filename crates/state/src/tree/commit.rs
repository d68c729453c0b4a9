// Path: crates/state/src/tree/commit.rs

//! The authoritative head of one versioned tree.
//!
//! A [`CommitTree`] hands out [`BranchTree`]s over its working root,
//! accepts them back with [`CommitTree::apply`], and turns the working root
//! into a durable version with [`CommitTree::commit`]. Commits are
//! serialized by a write mutex; readers work from an immutable snapshot of
//! the last committed root and never take that mutex.
//!
//! A commit that fails before its version is persisted rolls the working
//! root back to the last committed one, so the caller can retry with a
//! fresh branch. Once `save_root` succeeds the commit can no longer fail.

use super::branch::BranchTree;
use super::export::{plan_import, ExportNode};
use super::iterator::TreeIterator;
use super::readonly::ReadOnlyTree;
use super::traverse::{commit_traverse, Evictor, Tally};
use crate::changeset::rewrite::write_changeset;
use crate::node::NodePointer;
use crate::proof::CommitmentProof;
use crate::store::{TreeStore, WalEntry, WalTail};
use crate::wal::WalWriter;
use bytes::Bytes;
use iavlx_storage::NodeId;
use iavlx_telemetry::time::CommitTimer;
use iavlx_telemetry::{error_metrics, storage_metrics};
use iavlx_types::error::ErrorCode;
use iavlx_types::hash::{empty_hash, short_hex, Hash};
use iavlx_types::{CommitId, Options, Result, StoreError, Version};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Working {
    hash: Hash,
    tally: Tally,
}

struct WriteState {
    root: Option<Arc<NodePointer>>,
    // The version the next commit produces.
    version: Version,
    pending_orphans: Vec<Vec<NodeId>>,
    working: Option<Working>,
    wal: Option<WalWriter>,
    closed: bool,
}

#[derive(Clone)]
struct Snapshot {
    root: Option<Arc<NodePointer>>,
    version: Version,
    hash: Hash,
}

fn same_root(a: Option<&Arc<NodePointer>>, b: Option<&Arc<NodePointer>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// One versioned IAVL+ tree backed by a [`TreeStore`].
pub struct CommitTree {
    store: Arc<TreeStore>,
    write: Mutex<WriteState>,
    snapshot: RwLock<Snapshot>,
    evictor: Evictor,
    label: String,
}

impl CommitTree {
    /// Opens the tree stored under `dir`, replaying any version that was
    /// logged to the WAL but not saved.
    pub fn open(dir: &Path, opts: Options) -> Result<Self> {
        let store = Arc::new(TreeStore::open(dir, opts)?);
        let tree = Self::from_store(store)?;
        tree.replay_wal()?;
        Ok(tree)
    }

    /// Builds a tree at `version` in the empty directory `dir` from a
    /// post-order export stream.
    pub fn import(
        dir: &Path,
        opts: Options,
        version: Version,
        nodes: impl IntoIterator<Item = ExportNode>,
    ) -> Result<Self> {
        let store = Arc::new(TreeStore::open(dir, opts)?);
        if store.latest_version() != 0 || !store.changesets().is_empty() {
            return Err(StoreError::Invariant(format!(
                "cannot import into non-empty tree {}",
                dir.display()
            )));
        }
        let (plan, hash) = plan_import(version, nodes)?;
        let nodes = plan.leaves.len() + plan.branches.len();
        let cs = write_changeset(store.dir(), plan, store.options().zero_copy)?;
        store.adopt(cs)?;
        let tree = Self::from_store(store)?;
        if tree.hash() != hash {
            return Err(StoreError::Invariant(format!(
                "imported root {} does not match the rebuilt hash {}",
                short_hex(&tree.hash()),
                short_hex(&hash)
            )));
        }
        tracing::info!(target: "iavl", dir = %dir.display(), version, nodes, "imported tree");
        Ok(tree)
    }

    fn from_store(store: Arc<TreeStore>) -> Result<Self> {
        let opts = store.options().clone();
        let latest = store.latest_version();
        let root = store.root_at(latest)?;
        let hash = match &root {
            Some(root) => root.resolve(&store)?.hash()?,
            None => empty_hash(),
        };
        let label = store
            .dir()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tree".into());
        let wal = if opts.write_wal {
            Some(WalWriter::new(opts.wal_sync_buffer, &label)?)
        } else {
            None
        };
        Ok(Self {
            write: Mutex::new(WriteState {
                root: root.clone(),
                version: latest + 1,
                pending_orphans: Vec::new(),
                working: None,
                wal,
                closed: false,
            }),
            snapshot: RwLock::new(Snapshot {
                root,
                version: latest,
                hash,
            }),
            evictor: Evictor::default(),
            label,
            store,
        })
    }

    fn replay_wal(&self) -> Result<()> {
        let Some(WalTail { version, entries }) = self.store.take_wal_tail() else {
            return Ok(());
        };
        let expected = self.working_version();
        if version != expected {
            return Err(StoreError::Invariant(format!(
                "logged version {version} does not follow saved version {}",
                expected - 1
            )));
        }
        let records = entries.len();
        let mut branch = self.branch();
        for entry in entries {
            match entry {
                WalEntry::Set(key, value) => {
                    branch.set(key, value)?;
                }
                WalEntry::Delete(key) => {
                    branch.delete(&key)?;
                }
            }
        }
        self.apply(branch)?;
        let id = self.commit()?;
        storage_metrics().inc_wal_replays();
        tracing::info!(
            target: "wal",
            version,
            records,
            hash = %short_hex(&id.hash),
            "replayed logged version"
        );
        Ok(())
    }

    /// The store backing this tree.
    pub fn store(&self) -> &Arc<TreeStore> {
        &self.store
    }

    /// The last committed version; zero before the first commit.
    pub fn version(&self) -> Version {
        self.snapshot.read().version
    }

    /// The version the next commit produces.
    pub fn working_version(&self) -> Version {
        self.write.lock().version
    }

    /// The root hash of the last committed version.
    pub fn hash(&self) -> Hash {
        self.snapshot.read().hash
    }

    /// Version and hash of the last commit.
    pub fn last_commit_id(&self) -> CommitId {
        let snap = self.snapshot.read();
        CommitId::new(snap.version, snap.hash.to_vec())
    }

    /// A branch over the working root, staging the next version.
    pub fn branch(&self) -> BranchTree {
        let st = self.write.lock();
        BranchTree::new(Arc::clone(&self.store), st.root.clone(), st.version)
    }

    /// Checks that `branch` could be applied now without applying it.
    pub fn check_branch(&self, branch: &BranchTree) -> Result<()> {
        let st = self.write.lock();
        Self::validate(&st, branch)
    }

    fn validate(st: &WriteState, branch: &BranchTree) -> Result<()> {
        if st.closed {
            return Err(StoreError::Closed);
        }
        if let Some(reason) = &branch.poisoned {
            return Err(StoreError::Invariant(format!("refusing poisoned branch: {reason}")));
        }
        if branch.version != st.version || !same_root(branch.orig_root.as_ref(), st.root.as_ref()) {
            return Err(StoreError::BranchStale(format!(
                "branch for version {} no longer matches the working root of version {}",
                branch.version, st.version
            )));
        }
        if st.working.is_some() {
            return Err(StoreError::Invariant(format!(
                "version {} was already hashed; commit before applying more changes",
                st.version
            )));
        }
        Ok(())
    }

    /// Installs the branch's root as the working root. Fails with
    /// [`StoreError::BranchStale`] when the working root moved since the
    /// branch was taken.
    pub fn apply(&self, branch: BranchTree) -> Result<()> {
        let mut st = self.write.lock();
        Self::validate(&st, &branch)?;
        let version = st.version;
        if let Some(wal) = st.wal.as_mut() {
            if !branch.updates.is_empty() {
                let kv = self.store.kv_log_for(version)?;
                wal.submit(kv, branch.updates)?;
            }
        }
        st.root = branch.root;
        if !branch.orphans.is_empty() {
            st.pending_orphans.push(branch.orphans);
        }
        Ok(())
    }

    /// The root hash the next commit will produce. The result is cached
    /// until the commit, and no branch can be applied in between.
    pub fn working_hash(&self) -> Result<Hash> {
        let mut st = self.write.lock();
        if st.closed {
            return Err(StoreError::Closed);
        }
        self.working(&mut st).map(|w| w.hash)
    }

    fn working(&self, st: &mut WriteState) -> Result<Working> {
        if let Some(working) = st.working {
            return Ok(working);
        }
        let mut tally = Tally::default();
        let hash = match &st.root {
            Some(root) => commit_traverse(&self.store, root, st.version, &mut tally)?,
            None => empty_hash(),
        };
        let working = Working { hash, tally };
        st.working = Some(working);
        Ok(working)
    }

    /// Persists the working root as the next version.
    pub fn commit(&self) -> Result<CommitId> {
        let _timer = CommitTimer::new(storage_metrics());
        let mut st = self.write.lock();
        if st.closed {
            return Err(StoreError::Closed);
        }
        let version = st.version;
        let hash = match self.persist(&mut st) {
            Ok(hash) => hash,
            Err(e) => {
                self.rollback(&mut st, &e);
                return Err(e);
            }
        };

        let orphans = std::mem::take(&mut st.pending_orphans);
        self.store.mark_orphans(version, orphans);
        st.working = None;
        st.version = version + 1;
        *self.snapshot.write() = Snapshot {
            root: st.root.clone(),
            version,
            hash,
        };
        self.store.notify_committed(version);
        if let Some(root) = &st.root {
            self.evictor.spawn(
                Arc::clone(root),
                self.store.saved_version(),
                self.store.options().evict_depth,
                &self.label,
            );
        }
        drop(st);

        storage_metrics().inc_commits_total();
        tracing::debug!(target: "iavl", tree = %self.label, version, hash = %short_hex(&hash), "committed");
        Ok(CommitId::new(version, hash.to_vec()))
    }

    /// Everything up to and including `save_root`.
    fn persist(&self, st: &mut WriteState) -> Result<Hash> {
        let version = st.version;
        if let Some(wal) = st.wal.as_mut() {
            wal.barrier()?;
        }
        let working = self.working(st)?;
        if st.wal.is_some() {
            self.store.write_commit_marker(version)?;
        }
        self.store.save_root(
            version,
            st.root.as_ref(),
            working.tally.leaves,
            working.tally.branches,
        )?;
        Ok(working.hash)
    }

    fn rollback(&self, st: &mut WriteState, cause: &StoreError) {
        let snap = self.snapshot.read().clone();
        st.root = snap.root;
        st.pending_orphans.clear();
        st.working = None;
        if st.wal.is_some() {
            if let Err(e) = self.store.discard_wal(st.version) {
                tracing::warn!(target: "wal", version = st.version, error = %e, "could not void logged updates");
            }
        }
        error_metrics().inc_error("commit", cause.code());
        tracing::warn!(
            target: "iavl",
            tree = %self.label,
            version = st.version,
            error = %cause,
            "commit failed; working tree reset to the last committed version"
        );
    }

    /// A read-only view of the last committed version.
    pub fn latest(&self) -> ReadOnlyTree {
        let snap = self.snapshot.read().clone();
        ReadOnlyTree::new(Arc::clone(&self.store), snap.root, snap.version, snap.hash)
    }

    /// A read-only view of a committed `version` that is still readable.
    pub fn get_immutable(&self, version: Version) -> Result<ReadOnlyTree> {
        let snap = self.snapshot.read().clone();
        if version == snap.version {
            return Ok(ReadOnlyTree::new(Arc::clone(&self.store), snap.root, snap.version, snap.hash));
        }
        if version > snap.version {
            return Err(StoreError::NotFound(format!(
                "version {version} is not committed; latest is {}",
                snap.version
            )));
        }
        let root = self.store.root_at(version)?;
        let hash = match &root {
            Some(root) => root.resolve(&self.store)?.hash()?,
            None => empty_hash(),
        };
        Ok(ReadOnlyTree::new(Arc::clone(&self.store), root, version, hash))
    }

    /// Whether `version` can be read with [`CommitTree::get_immutable`].
    pub fn version_exists(&self, version: Version) -> bool {
        version == self.version() || self.store.has_version(version)
    }

    /// The value of `key` at the last committed version.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.latest().get(key)
    }

    /// Whether `key` exists at the last committed version.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.latest().has(key)
    }

    /// Number of keys at the last committed version.
    pub fn size(&self) -> Result<u64> {
        self.latest().size()
    }

    /// Ascending iteration at the last committed version.
    pub fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<TreeIterator> {
        self.latest().iterator(start, end)
    }

    /// Descending iteration at the last committed version.
    pub fn reverse_iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<TreeIterator> {
        self.latest().reverse_iterator(start, end)
    }

    /// Proves `key` present at the last committed version.
    pub fn get_membership_proof(&self, key: &[u8]) -> Result<CommitmentProof> {
        self.latest().get_membership_proof(key)
    }

    /// Proves `key` absent at the last committed version.
    pub fn get_non_membership_proof(&self, key: &[u8]) -> Result<CommitmentProof> {
        self.latest().get_non_membership_proof(key)
    }

    /// Stops the WAL worker, waits for eviction and closes the store.
    pub fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        {
            let mut st = self.write.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            if let Some(mut wal) = st.wal.take() {
                if let Err(e) = wal.shutdown() {
                    errors.push(e);
                }
            }
        }
        self.evictor.wait();
        if let Err(e) = self.store.close() {
            errors.push(e);
        }
        StoreError::join(errors)
    }
}

impl Drop for CommitTree {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(target: "iavl", tree = %self.label, error = %e, "error closing tree");
        }
    }
}

impl std::fmt::Debug for CommitTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot.read();
        f.debug_struct("CommitTree")
            .field("tree", &self.label)
            .field("version", &snap.version)
            .field("hash", &short_hex(&snap.hash))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> CommitTree {
        CommitTree::open(dir, Options::for_testing()).unwrap()
    }

    fn write(tree: &CommitTree, pairs: &[(&'static [u8], &'static [u8])]) -> CommitId {
        let mut branch = tree.branch();
        for (k, v) in pairs {
            branch.set(Bytes::from_static(k), Bytes::from_static(v)).unwrap();
        }
        tree.apply(branch).unwrap();
        tree.commit().unwrap()
    }

    #[test]
    fn empty_commit_produces_the_empty_hash() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open(dir.path());
        assert_eq!(tree.version(), 0);
        let id = tree.commit().unwrap();
        assert_eq!(id.version, 1);
        assert_eq!(id.hash, empty_hash().to_vec());
        assert_eq!(tree.size().unwrap(), 0);
    }

    #[test]
    fn working_hash_matches_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open(dir.path());
        let mut branch = tree.branch();
        branch.set(&b"k"[..], &b"v"[..]).unwrap();
        tree.apply(branch).unwrap();
        let working = tree.working_hash().unwrap();
        assert_eq!(tree.working_hash().unwrap(), working);

        // Hashed versions accept no further changes.
        let mut late = tree.branch();
        late.set(&b"x"[..], &b"y"[..]).unwrap();
        assert!(matches!(tree.apply(late), Err(StoreError::Invariant(_))));

        let id = tree.commit().unwrap();
        assert_eq!(id.hash, working.to_vec());
        assert_eq!(tree.get(b"k").unwrap(), Some(Bytes::from_static(b"v")));
        assert!(!tree.has(b"x").unwrap());
    }

    #[test]
    fn stale_branches_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open(dir.path());
        let mut first = tree.branch();
        let mut second = tree.branch();
        first.set(&b"a"[..], &b"1"[..]).unwrap();
        second.set(&b"b"[..], &b"2"[..]).unwrap();
        tree.apply(first).unwrap();
        assert!(matches!(tree.apply(second), Err(StoreError::BranchStale(_))));
        tree.commit().unwrap();
        assert!(tree.has(b"a").unwrap());
        assert!(!tree.has(b"b").unwrap());
    }

    #[test]
    fn earlier_versions_stay_readable() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open(dir.path());
        let v1 = write(&tree, &[(b"a", b"1")]);
        let v2 = write(&tree, &[(b"a", b"2"), (b"b", b"2")]);
        let old = tree.get_immutable(1).unwrap();
        assert_eq!(old.commit_id(), v1);
        assert_eq!(old.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));
        assert!(!old.has(b"b").unwrap());
        assert_eq!(tree.last_commit_id(), v2);
        assert!(tree.version_exists(1));
        assert!(matches!(tree.get_immutable(3), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn reopen_restores_the_last_commit() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let tree = open(dir.path());
            write(&tree, &[(b"a", b"1")]);
            let id = write(&tree, &[(b"b", b"2")]);
            tree.close().unwrap();
            id
        };
        let tree = open(dir.path());
        assert_eq!(tree.last_commit_id(), id);
        assert_eq!(tree.working_version(), 3);
        assert_eq!(tree.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));
        tree.latest().verify().unwrap();
    }

    #[test]
    fn logged_version_is_replayed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let expected = {
            let tree = open(dir.path());
            write(&tree, &[(b"a", b"1"), (b"b", b"1")]);
            let mut branch = tree.branch();
            branch.set(&b"c"[..], &b"3"[..]).unwrap();
            branch.delete(b"a").unwrap();
            tree.apply(branch).unwrap();
            let hash = tree.working_hash().unwrap();
            // Stop after the commit marker, before the version is saved.
            tree.write.lock().wal.as_mut().unwrap().barrier().unwrap();
            tree.store.write_commit_marker(2).unwrap();
            tree.close().unwrap();
            hash
        };
        let tree = open(dir.path());
        assert_eq!(tree.version(), 2);
        assert_eq!(tree.hash(), expected);
        assert!(!tree.has(b"a").unwrap());
        assert_eq!(tree.get(b"c").unwrap(), Some(Bytes::from_static(b"3")));
    }

    fn sync_failure() -> StoreError {
        StoreError::Io(std::io::Error::other("fsync failed"))
    }

    #[test]
    fn failed_commit_keeps_the_last_version() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open(dir.path());
        let v1 = write(&tree, &[(b"a", b"1")]);

        let mut rejected = tree.branch();
        rejected.set(&b"a"[..], &b"rejected"[..]).unwrap();
        rejected.set(&b"r"[..], &b"x"[..]).unwrap();
        tree.apply(rejected).unwrap();
        tree.store.inject_sync_failure(sync_failure());
        assert!(matches!(tree.commit(), Err(StoreError::Io(_))));
        assert_eq!(tree.version(), 1);
        assert_eq!(tree.working_version(), 2);
        assert_eq!(tree.last_commit_id(), v1);
        assert_eq!(tree.hash().to_vec(), v1.hash);
        assert_eq!(tree.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));

        let v2 = write(&tree, &[(b"b", b"2")]);
        assert_eq!(v2.version, 2);
        assert!(!tree.has(b"r").unwrap());
        tree.close().unwrap();
        drop(tree);

        let tree = open(dir.path());
        assert_eq!(tree.last_commit_id(), v2);
        assert_eq!(tree.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));
        assert!(!tree.has(b"r").unwrap());
        tree.latest().verify().unwrap();
    }

    #[test]
    fn replay_after_a_failed_commit_uses_the_retry() {
        let dir = tempfile::tempdir().unwrap();
        let expected = {
            let tree = open(dir.path());
            write(&tree, &[(b"a", b"1")]);

            let mut rejected = tree.branch();
            rejected.set(&b"r"[..], &b"x"[..]).unwrap();
            tree.apply(rejected).unwrap();
            tree.store.inject_sync_failure(sync_failure());
            assert!(tree.commit().is_err());

            let mut retry = tree.branch();
            retry.set(&b"b"[..], &b"2"[..]).unwrap();
            tree.apply(retry).unwrap();
            let hash = tree.working_hash().unwrap();
            // Stop after the retry's commit marker, before it is saved.
            tree.write.lock().wal.as_mut().unwrap().barrier().unwrap();
            tree.store.write_commit_marker(2).unwrap();
            tree.close().unwrap();
            hash
        };
        let tree = open(dir.path());
        assert_eq!(tree.version(), 2);
        assert_eq!(tree.hash(), expected);
        assert!(!tree.has(b"r").unwrap());
        assert_eq!(tree.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn unmarked_updates_are_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let tree = open(dir.path());
            let id = write(&tree, &[(b"a", b"1")]);
            let mut branch = tree.branch();
            branch.set(&b"z"[..], &b"9"[..]).unwrap();
            tree.apply(branch).unwrap();
            tree.close().unwrap();
            id
        };
        let tree = open(dir.path());
        assert_eq!(tree.last_commit_id(), id);
        assert!(!tree.has(b"z").unwrap());
    }

    #[test]
    fn closed_tree_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open(dir.path());
        let branch = tree.branch();
        tree.close().unwrap();
        assert!(matches!(tree.apply(branch), Err(StoreError::Closed)));
        assert!(matches!(tree.commit(), Err(StoreError::Closed)));
        tree.close().unwrap();
    }
}
