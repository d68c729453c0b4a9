// Path: crates/state/src/changeset/mod.rs

//! Changesets: immutable-by-append groups of node files covering a
//! contiguous version range.
//!
//! A [`Changeset`] is a read view over one changeset directory. Readers
//! [`pin`](Changeset::pin) it while they hold nodes read from it; once the
//! store replaces it (a newer shared view, a sealed view or a compacted
//! rewrite) it is evicted and its files are released when the last pin
//! drops.

/// Rewrites node files for compaction and import.
pub(crate) mod rewrite;
/// The writer for the open changeset.
pub mod writer;

use crate::node::{BranchView, LeafView, Node, NodeLoc, NodePointer};
use bytes::Bytes;
use iavlx_storage::dir::{BRANCHES_FILE, INFO_FILE, KV_LOG_FILE, LEAVES_FILE, VERSIONS_FILE};
use iavlx_storage::{
    BranchLayout, ChangesetDir, ChangesetInfo, KvLogReader, LeafLayout, NodeId, NodeMmap, Record,
    StructMmap, VersionInfo,
};
use iavlx_telemetry::storage_metrics;
use iavlx_types::prelude::OptionExt;
use iavlx_types::{Result, StoreError, Version};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub use writer::ChangesetWriter;

/// The `info.dat` record of a changeset, shared between its writer and the
/// views opened over it.
pub struct InfoFile {
    state: Mutex<InfoState>,
}

struct InfoState {
    info: ChangesetInfo,
    file: File,
    dirty: bool,
}

impl InfoFile {
    /// Creates the file holding `info`.
    pub fn create(path: &Path, info: ChangesetInfo) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let this = Self {
            state: Mutex::new(InfoState {
                info,
                file,
                dirty: true,
            }),
        };
        this.flush()?;
        Ok(Arc::new(this))
    }

    /// Opens an existing file; a missing or short record falls back to
    /// `fallback`.
    pub fn open(path: &Path, fallback: ChangesetInfo) -> Result<Arc<Self>> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let mut raw = Vec::with_capacity(ChangesetInfo::SIZE);
        file.read_to_end(&mut raw)?;
        let (info, dirty) = if raw.len() >= ChangesetInfo::SIZE {
            (ChangesetInfo::decode(&raw)?, false)
        } else {
            (fallback, true)
        };
        Ok(Arc::new(Self {
            state: Mutex::new(InfoState { info, file, dirty }),
        }))
    }

    /// A copy of the current record.
    pub fn get(&self) -> ChangesetInfo {
        self.state.lock().info
    }

    /// Mutates the record in memory.
    pub fn update(&self, f: impl FnOnce(&mut ChangesetInfo)) {
        let mut state = self.state.lock();
        f(&mut state.info);
        state.dirty = true;
    }

    /// Writes the record back if it changed.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        let mut raw = Vec::with_capacity(ChangesetInfo::SIZE);
        state.info.encode(&mut raw);
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&raw)?;
        state.file.sync_data()?;
        state.dirty = false;
        Ok(())
    }
}

/// A read view over one changeset directory.
pub struct Changeset {
    name: ChangesetDir,
    dir: PathBuf,
    leaves: NodeMmap<LeafLayout>,
    branches: NodeMmap<BranchLayout>,
    versions: Vec<VersionInfo>,
    kv: KvLogReader,
    info: Arc<InfoFile>,
    owns_files: bool,
    refs: AtomicUsize,
    evicted: AtomicBool,
    disposed: AtomicBool,
    delete_on_dispose: AtomicBool,
    orphans_dirty: AtomicBool,
}

impl Changeset {
    /// Opens a changeset found on disk. Trailing version entries whose node
    /// ranges reach past the node files are dropped.
    pub fn open(root: &Path, name: ChangesetDir, zero_copy: bool) -> Result<Self> {
        let dir = name.path_in(root);
        let leaves = NodeMmap::open(&dir.join(LEAVES_FILE))?;
        let branches = NodeMmap::open(&dir.join(BRANCHES_FILE))?;
        let versions = load_versions(&dir, &leaves, &branches, name.start_version)?;
        let fallback = ChangesetInfo {
            start_version: name.start_version,
            end_version: versions.last().map_or(0, |v| v.version),
            ..ChangesetInfo::default()
        };
        let info = InfoFile::open(&dir.join(INFO_FILE), fallback)?;
        let end = versions.last().map_or(0, |v| v.version);
        if info.get().end_version != end || info.get().start_version != name.start_version {
            info.update(|i| {
                i.start_version = name.start_version;
                i.end_version = end;
            });
        }
        let kv = KvLogReader::open(&dir.join(KV_LOG_FILE), zero_copy)?;
        Ok(Self::from_parts(name, dir, leaves, branches, versions, kv, info, true))
    }

    /// Opens a view over files that another owner (the writer) is still
    /// appending to. The view sees what has been flushed.
    pub(crate) fn open_shared(
        root: &Path,
        name: ChangesetDir,
        versions: Vec<VersionInfo>,
        info: Arc<InfoFile>,
        zero_copy: bool,
        owns_files: bool,
    ) -> Result<Self> {
        let dir = name.path_in(root);
        let leaves = NodeMmap::open(&dir.join(LEAVES_FILE))?;
        let branches = NodeMmap::open(&dir.join(BRANCHES_FILE))?;
        let kv = KvLogReader::open(&dir.join(KV_LOG_FILE), zero_copy)?;
        Ok(Self::from_parts(
            name, dir, leaves, branches, versions, kv, info, owns_files,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        name: ChangesetDir,
        dir: PathBuf,
        leaves: NodeMmap<LeafLayout>,
        branches: NodeMmap<BranchLayout>,
        versions: Vec<VersionInfo>,
        kv: KvLogReader,
        info: Arc<InfoFile>,
        owns_files: bool,
    ) -> Self {
        Self {
            name,
            dir,
            leaves,
            branches,
            versions,
            kv,
            info,
            owns_files,
            refs: AtomicUsize::new(0),
            evicted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            delete_on_dispose: AtomicBool::new(false),
            orphans_dirty: AtomicBool::new(false),
        }
    }

    /// The directory name.
    pub fn name(&self) -> ChangesetDir {
        self.name
    }

    /// The directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// First version covered.
    pub fn start_version(&self) -> Version {
        self.name.start_version
    }

    /// Last version visible through this view, or `start_version - 1` when
    /// it holds none yet.
    pub fn end_version(&self) -> Version {
        self.versions
            .last()
            .map_or(self.name.start_version.saturating_sub(1), |v| v.version)
    }

    /// Version entries visible through this view.
    pub fn versions(&self) -> &[VersionInfo] {
        &self.versions
    }

    /// Whether `version` is visible through this view.
    pub fn contains_version(&self, version: Version) -> bool {
        self.version_info(version).is_some()
    }

    /// The entry for `version`.
    pub fn version_info(&self, version: Version) -> Option<&VersionInfo> {
        let idx = version.checked_sub(self.name.start_version)?;
        self.versions
            .get(usize::try_from(idx).ok()?)
            .filter(|v| v.version == version)
    }

    /// The current summary record.
    pub fn info(&self) -> ChangesetInfo {
        self.info.get()
    }

    /// Number of visible leaves.
    pub fn leaf_count(&self) -> u64 {
        self.leaves.len()
    }

    /// Number of visible branches.
    pub fn branch_count(&self) -> u64 {
        self.branches.len()
    }

    pub(crate) fn leaves(&self) -> &NodeMmap<LeafLayout> {
        &self.leaves
    }

    pub(crate) fn branches(&self) -> &NodeMmap<BranchLayout> {
        &self.branches
    }

    /// Reads a key record.
    pub fn read_k(&self, offset: u32) -> Result<Bytes> {
        self.kv.read_k(offset)
    }

    /// Reads a key/value record.
    pub fn read_kv(&self, offset: u32) -> Result<(Bytes, Bytes)> {
        self.kv.read_kv(offset)
    }

    pub(crate) fn kv(&self) -> &KvLogReader {
        &self.kv
    }

    /// Root location of `version`. `None` for an empty tree.
    pub fn root_of(&self, version: Version) -> Result<Option<NodeLoc>> {
        let info = self
            .version_info(version)
            .required(StoreError::NotFound(format!("version {version} in changeset {}", self.name)))?;
        if info.is_pruned() {
            return Err(StoreError::NotFound(format!("version {version} was pruned")));
        }
        if info.root_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(NodeLoc {
            id: info.root_id,
            file_idx: 0,
        }))
    }

    /// Takes a pin unless the view has been evicted.
    pub fn pin(self: &Arc<Self>) -> Option<PinGuard> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        if self.evicted.load(Ordering::SeqCst) {
            self.refs.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(PinGuard(Arc::clone(self)))
    }

    /// Outstanding pins.
    pub fn pins(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Stops new pins; existing ones stay valid until dropped.
    pub(crate) fn evict(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    /// Whether this view owns its files: true for sealed, compacted and
    /// reopened changesets, false for views over the open writer.
    pub fn owns_files(&self) -> bool {
        self.owns_files
    }

    /// Whether the files have been released.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Removes the directory when the view is disposed.
    pub(crate) fn delete_on_dispose(&self) {
        self.delete_on_dispose.store(true, Ordering::SeqCst);
    }

    /// Releases the files of an evicted, unpinned view. Returns false while
    /// pins remain.
    pub(crate) fn try_dispose(&self) -> Result<bool> {
        if !self.evicted.load(Ordering::SeqCst) || self.refs.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        let flushed = self.flush_orphans();
        self.close_files();
        if self.owns_files && self.delete_on_dispose.load(Ordering::SeqCst) {
            fs::remove_dir_all(&self.dir)?;
        }
        storage_metrics().inc_changesets_disposed();
        flushed.map(|_| true)
    }

    /// Unmaps every file.
    pub(crate) fn close_files(&self) {
        self.leaves.close();
        self.branches.close();
        self.kv.close();
    }

    /// Records `orphan_version` on node `id`. Returns false when the node was
    /// already orphaned.
    pub fn mark_orphan(&self, orphan_version: Version, id: NodeId) -> Result<bool> {
        let info = self
            .version_info(id.version())
            .required(StoreError::NotFound(format!("version of {id} in changeset {}", self.name)))?;
        let stored = if id.is_leaf() {
            let (pos, _) = self
                .leaves
                .find_by_id(id, &info.leaves)?
                .required(StoreError::NotFound(format!("leaf {id} in changeset {}", self.name)))?;
            self.leaves.mark_orphan(pos, orphan_version)?
        } else {
            let (pos, _) = self
                .branches
                .find_by_id(id, &info.branches)?
                .required(StoreError::NotFound(format!("branch {id} in changeset {}", self.name)))?;
            self.branches.mark_orphan(pos, orphan_version)?
        };
        if stored {
            self.info.update(|i| i.add_orphan(id.is_leaf(), orphan_version));
            self.orphans_dirty.store(true, Ordering::SeqCst);
        }
        Ok(stored)
    }

    /// Persists orphan marks and the summary record. Idempotent.
    pub fn flush_orphans(&self) -> Result<()> {
        if !self.orphans_dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.leaves.flush()?;
        self.branches.flush()?;
        self.info.flush()
    }

    /// Whether the orphan statistics justify a rewrite.
    pub fn ready_to_compact(&self, orphan_ratio: f64, orphan_version_target: Version) -> bool {
        let total = self.leaves.len() + self.branches.len();
        self.info
            .get()
            .ready_to_compact(total, orphan_ratio, orphan_version_target)
    }

    /// Resolves the location of a stored child reference of the branch at
    /// `pos`.
    pub(crate) fn child_loc(&self, layout: &BranchLayout, pos: u64, left: bool) -> Result<NodeLoc> {
        let (child, hint) = if left {
            (layout.left, layout.left_abs_offset)
        } else {
            (layout.right, layout.right_abs_offset)
        };
        if let Some(id) = child.as_id() {
            return Ok(NodeLoc { id, file_idx: hint });
        }
        let offset = child
            .offset()
            .required(StoreError::Decode(format!("child ref {child:?}")))?;
        if child.is_leaf() {
            let file_idx = u64::try_from(offset)
                .ok()
                .filter(|i| *i > 0)
                .required(StoreError::Decode(format!("leaf ref {offset} of {}", layout.id)))?;
            let leaf = self.leaves.get(file_idx - 1)?;
            Ok(NodeLoc {
                id: leaf.id,
                file_idx,
            })
        } else {
            let target = i64::try_from(pos)
                .ok()
                .and_then(|p| p.checked_add(offset))
                .and_then(|p| u64::try_from(p).ok())
                .required(StoreError::Decode(format!("branch ref {offset} of {}", layout.id)))?;
            let branch = self.branches.get(target)?;
            Ok(NodeLoc {
                id: branch.id,
                file_idx: target + 1,
            })
        }
    }
}

fn load_versions(
    dir: &Path,
    leaves: &NodeMmap<LeafLayout>,
    branches: &NodeMmap<BranchLayout>,
    start_version: Version,
) -> Result<Vec<VersionInfo>> {
    let view = StructMmap::<VersionInfo>::open(&dir.join(VERSIONS_FILE))?;
    let mut versions = Vec::with_capacity(usize::try_from(view.len()).unwrap_or(0));
    for entry in view.iter() {
        let info = entry?;
        let expected = start_version + u32::try_from(versions.len()).unwrap_or(u32::MAX);
        let fits = info.leaves.end_offset() <= leaves.len()
            && info.branches.end_offset() <= branches.len();
        if info.version != expected || !fits {
            tracing::warn!(
                target: "changeset",
                dir = %dir.display(),
                version = info.version,
                expected,
                "dropping incomplete trailing version entries"
            );
            break;
        }
        versions.push(info);
    }
    view.close();
    Ok(versions)
}

/// A pin on a changeset; the view cannot be released while it lives.
pub struct PinGuard(Arc<Changeset>);

impl PinGuard {
    /// Resolves a node stored in the pinned changeset.
    pub fn resolve(&self, loc: NodeLoc) -> Result<Node> {
        let info = self.version_info(loc.id.version()).required(StoreError::NotFound(format!(
            "version of {} in changeset {}",
            loc.id, self.name
        )))?;
        if loc.id.is_leaf() {
            let (_, layout) = self.leaves.resolve(loc.id, loc.file_idx, &info.leaves)?;
            Ok(Node::Leaf(LeafView {
                pin: self.clone(),
                layout,
            }))
        } else {
            let (pos, layout) = self
                .branches
                .resolve(loc.id, loc.file_idx, &info.branches)?;
            Ok(Node::Branch(BranchView {
                pin: self.clone(),
                pos,
                layout,
            }))
        }
    }

    /// A pointer to a child of the branch stored at `pos`.
    pub(crate) fn child_pointer(
        &self,
        layout: &BranchLayout,
        pos: u64,
        left: bool,
    ) -> Result<Arc<NodePointer>> {
        Ok(NodePointer::persisted(self.child_loc(layout, pos, left)?))
    }

    /// The pinned changeset.
    pub fn changeset(&self) -> &Arc<Changeset> {
        &self.0
    }
}

impl Clone for PinGuard {
    fn clone(&self) -> Self {
        self.0.refs.fetch_add(1, Ordering::SeqCst);
        PinGuard(Arc::clone(&self.0))
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.0.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Deref for PinGuard {
    type Target = Changeset;

    fn deref(&self) -> &Changeset {
        &self.0
    }
}
