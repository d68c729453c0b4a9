// Path: crates/state/src/changeset/writer.rs

//! Appends committed versions to the open changeset.
//!
//! Nodes of a version are written post-order, so the children of a branch
//! always precede it in the file. Children stored in the same changeset are
//! referenced relatively (a 1-based file index for leaves, a signed position
//! delta for branches); older children are referenced by id.

use super::{Changeset, InfoFile};
use crate::node::{NodeLoc, NodePointer};
use bytes::Bytes;
use iavlx_storage::dir::{BRANCHES_FILE, INFO_FILE, KV_LOG_FILE, LEAVES_FILE, VERSIONS_FILE};
use iavlx_storage::{
    BranchLayout, ChangesetDir, ChangesetInfo, KvLogWriter, LeafLayout, NodeId, NodeRef,
    NodeSetInfo, StructWriter, VersionInfo,
};
use iavlx_telemetry::storage_metrics;
use iavlx_types::prelude::OptionExt;
use iavlx_types::{Result, StoreError, Version};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
struct Tally {
    leaves: u32,
    branches: u32,
}

/// Writer for the changeset currently receiving versions.
pub struct ChangesetWriter {
    root: PathBuf,
    name: ChangesetDir,
    staged_version: Version,
    leaves: StructWriter<LeafLayout>,
    branches: StructWriter<BranchLayout>,
    versions: StructWriter<VersionInfo>,
    kv: Arc<Mutex<KvLogWriter>>,
    info: Arc<InfoFile>,
    version_infos: Vec<VersionInfo>,
    key_cache: HashMap<Bytes, u32>,
    pending_orphans: Vec<(Version, NodeId)>,
    shared: Option<Arc<Changeset>>,
    zero_copy: bool,
    sealed: bool,
}

impl ChangesetWriter {
    /// Creates the directory `<root>/<start_version>` and its files.
    pub fn create(root: &Path, start_version: Version, zero_copy: bool) -> Result<Self> {
        let name = ChangesetDir::new(start_version);
        let dir = name.path_in(root);
        fs::create_dir(&dir)?;
        let info = InfoFile::create(
            &dir.join(INFO_FILE),
            ChangesetInfo {
                start_version,
                end_version: start_version.saturating_sub(1),
                ..ChangesetInfo::default()
            },
        )?;
        tracing::debug!(target: "changeset", dir = %dir.display(), "opened changeset writer");
        Ok(Self {
            root: root.to_path_buf(),
            name,
            staged_version: start_version,
            leaves: StructWriter::create(&dir.join(LEAVES_FILE))?,
            branches: StructWriter::create(&dir.join(BRANCHES_FILE))?,
            versions: StructWriter::create(&dir.join(VERSIONS_FILE))?,
            kv: Arc::new(Mutex::new(KvLogWriter::create(&dir.join(KV_LOG_FILE))?)),
            info,
            version_infos: Vec::new(),
            key_cache: HashMap::new(),
            pending_orphans: Vec::new(),
            shared: None,
            zero_copy,
            sealed: false,
        })
    }

    /// The directory name.
    pub fn name(&self) -> ChangesetDir {
        self.name
    }

    /// First version of the changeset.
    pub fn start_version(&self) -> Version {
        self.name.start_version
    }

    /// The next version `save_root` accepts.
    pub fn staged_version(&self) -> Version {
        self.staged_version
    }

    /// Whether ids of `version` live in this changeset.
    pub fn covers(&self, version: Version) -> bool {
        version >= self.name.start_version
    }

    /// Number of versions saved so far.
    pub fn version_count(&self) -> usize {
        self.version_infos.len()
    }

    /// The KV log, shared with the WAL worker.
    pub fn kv_log(&self) -> Arc<Mutex<KvLogWriter>> {
        Arc::clone(&self.kv)
    }

    /// Bytes appended to node files and the KV log.
    pub fn size_bytes(&self) -> u64 {
        self.leaves.bytes() + self.branches.bytes() + self.kv.lock().len()
    }

    /// Persists every node of `version` reachable from `root` and appends the
    /// version entry. `leaf_count` and `branch_count` are the tallies from
    /// hashing and must match what gets written.
    pub fn save_root(
        &mut self,
        version: Version,
        root: Option<&Arc<NodePointer>>,
        leaf_count: u32,
        branch_count: u32,
    ) -> Result<()> {
        if self.sealed {
            return Err(StoreError::Invariant(format!(
                "changeset {} is sealed",
                self.name
            )));
        }
        if version != self.staged_version {
            return Err(StoreError::OutOfRange(format!(
                "save_root for version {version}, changeset {} expects {}",
                self.name, self.staged_version
            )));
        }
        let leaf_start = offset_u32(self.leaves.count())?;
        let branch_start = offset_u32(self.branches.count())?;
        let bytes_before = self.size_bytes();
        let mut tally = Tally::default();
        let root_id = match root {
            Some(ptr) => self.persist(ptr, version, &mut tally)?.id,
            None => NodeId::default(),
        };
        if tally.leaves != leaf_count || tally.branches != branch_count {
            return Err(StoreError::Invariant(format!(
                "version {version}: wrote {} leaves and {} branches, hashed {leaf_count} and {branch_count}",
                tally.leaves, tally.branches
            )));
        }
        let entry = VersionInfo {
            leaves: NodeSetInfo::dense(leaf_start, leaf_count),
            branches: NodeSetInfo::dense(branch_start, branch_count),
            root_id,
            version,
            flags: 0,
        };
        self.versions.append(&entry)?;
        self.version_infos.push(entry);
        self.staged_version = version + 1;
        self.info.update(|i| i.end_version = version);
        storage_metrics().inc_bytes_written_total(self.size_bytes().saturating_sub(bytes_before));
        Ok(())
    }

    fn persist(&mut self, ptr: &Arc<NodePointer>, version: Version, tally: &mut Tally) -> Result<NodeLoc> {
        let node = match ptr.mem() {
            Some(node) if node.id().map(|id| id.version()) == Some(version) => node,
            _ => {
                return ptr.loc().required(StoreError::Invariant(format!(
                    "node below version {version} was never persisted"
                )))
            }
        };
        let meta = node
            .meta()
            .required(StoreError::Invariant("persisting an unhashed node".into()))?;
        if node.is_leaf() {
            tally.leaves += 1;
            check_index(meta.id, tally.leaves)?;
            let key_offset = match node.wal_offset() {
                Some(offset) => offset,
                None => {
                    let value = node
                        .value()
                        .required(StoreError::Invariant("leaf without value".into()))?;
                    self.kv.lock().write_kv(node.key(), value)?
                }
            };
            self.key_cache.insert(node.key().clone(), key_offset);
            let pos = self.leaves.append(&LeafLayout {
                id: meta.id,
                key_offset,
                orphan_version: 0,
                hash: meta.hash,
            })?;
            let loc = NodeLoc {
                id: meta.id,
                file_idx: pos + 1,
            };
            ptr.set_loc(loc);
            return Ok(loc);
        }

        let left = self.persist(node.left_ptr()?, version, tally)?;
        let right = self.persist(node.right_ptr()?, version, tally)?;
        tally.branches += 1;
        check_index(meta.id, tally.branches)?;
        let pos = self.branches.count();
        let (left_ref, left_abs_offset) = self.child_ref(left, pos)?;
        let (right_ref, right_abs_offset) = self.child_ref(right, pos)?;
        let key_offset = match self.key_cache.get(node.key()) {
            Some(offset) => *offset,
            None => {
                let offset = self.kv.lock().write_k(node.key())?;
                self.key_cache.insert(node.key().clone(), offset);
                offset
            }
        };
        let size = u32::try_from(node.size())
            .map_err(|_| StoreError::OutOfRange(format!("subtree size {}", node.size())))?;
        self.branches.append(&BranchLayout {
            id: meta.id,
            left: left_ref,
            right: right_ref,
            left_abs_offset,
            right_abs_offset,
            key_offset,
            height: node.height(),
            size,
            orphan_version: 0,
            hash: meta.hash,
        })?;
        let loc = NodeLoc {
            id: meta.id,
            file_idx: pos + 1,
        };
        ptr.set_loc(loc);
        Ok(loc)
    }

    fn child_ref(&self, child: NodeLoc, parent_pos: u64) -> Result<(NodeRef, u64)> {
        if !self.covers(child.id.version()) {
            return Ok((NodeRef::from_id(child.id), child.file_idx));
        }
        let pos = self.local_position(child)?;
        let child_ref = if child.id.is_leaf() {
            NodeRef::relative(true, to_i64(pos)? + 1)?
        } else {
            NodeRef::relative(false, to_i64(pos)? - to_i64(parent_pos)?)?
        };
        Ok((child_ref, pos + 1))
    }

    fn local_position(&self, child: NodeLoc) -> Result<u64> {
        if child.file_idx > 0 {
            return Ok(child.file_idx - 1);
        }
        let idx = child.id.version() - self.name.start_version;
        self.version_infos
            .get(usize::try_from(idx).unwrap_or(usize::MAX))
            .and_then(|info| info.nodes(child.id.is_leaf()).position_of(child.id.index()))
            .map(u64::from)
            .required(StoreError::NotFound(format!(
                "child {} in changeset {}",
                child.id, self.name
            )))
    }

    /// Marks `id` orphaned at `orphan_version`, now if a shared view already
    /// shows the node, otherwise once the next view is published.
    pub fn mark_orphan(&mut self, orphan_version: Version, id: NodeId) -> Result<()> {
        if let Some(shared) = &self.shared {
            if shared.contains_version(id.version()) {
                shared.mark_orphan(orphan_version, id)?;
                return Ok(());
            }
        }
        self.pending_orphans.push((orphan_version, id));
        Ok(())
    }

    /// Publishes a view over everything saved so far.
    pub fn create_shared_reader(&mut self) -> Result<Arc<Changeset>> {
        self.flush()?;
        let reader = Arc::new(Changeset::open_shared(
            &self.root,
            self.name,
            self.version_infos.clone(),
            Arc::clone(&self.info),
            self.zero_copy,
            false,
        )?);
        self.apply_pending(&reader);
        self.shared = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// Syncs every file and returns the final, file-owning view. The writer
    /// accepts no further versions.
    pub fn seal(&mut self) -> Result<Arc<Changeset>> {
        self.sync()?;
        let reader = Arc::new(Changeset::open_shared(
            &self.root,
            self.name,
            self.version_infos.clone(),
            Arc::clone(&self.info),
            self.zero_copy,
            true,
        )?);
        self.apply_pending(&reader);
        reader.flush_orphans()?;
        self.shared = None;
        self.sealed = true;
        tracing::info!(
            target: "changeset",
            changeset = %self.name,
            versions = self.version_infos.len(),
            leaves = self.leaves.count(),
            branches = self.branches.count(),
            "sealed changeset"
        );
        storage_metrics().inc_changesets_sealed();
        Ok(reader)
    }

    fn apply_pending(&mut self, reader: &Changeset) {
        for (orphan_version, id) in std::mem::take(&mut self.pending_orphans) {
            if let Err(e) = reader.mark_orphan(orphan_version, id) {
                tracing::warn!(target: "changeset", %id, error = %e, "failed to mark orphan");
            }
        }
    }

    /// Pushes buffered records to the files.
    pub fn flush(&mut self) -> Result<()> {
        self.leaves.flush()?;
        self.branches.flush()?;
        self.versions.flush()?;
        self.kv.lock().flush()
    }

    /// Flushes and fsyncs every file.
    pub fn sync(&mut self) -> Result<()> {
        self.leaves.sync()?;
        self.branches.sync()?;
        self.versions.sync()?;
        self.kv.lock().sync()?;
        if let Some(shared) = &self.shared {
            shared.flush_orphans()?;
        }
        self.info.flush()
    }

    /// Syncs every file and applies orphan marks still waiting for a view,
    /// leaving the directory ready to be reopened as a regular changeset.
    pub fn finish(&mut self) -> Result<()> {
        self.sync()?;
        if self.pending_orphans.is_empty() {
            return Ok(());
        }
        let reader = Changeset::open_shared(
            &self.root,
            self.name,
            self.version_infos.clone(),
            Arc::clone(&self.info),
            self.zero_copy,
            false,
        )?;
        self.apply_pending(&reader);
        reader.flush_orphans()?;
        reader.close_files();
        Ok(())
    }

    /// Handles the background syncer can fsync.
    pub fn sync_handles(&self) -> Vec<Arc<File>> {
        vec![
            self.leaves.sync_handle(),
            self.branches.sync_handle(),
            self.versions.sync_handle(),
            self.kv.lock().sync_handle(),
        ]
    }
}

fn check_index(id: NodeId, expected: u32) -> Result<()> {
    if id.index() != expected {
        return Err(StoreError::Invariant(format!(
            "node {id} written at index {expected}"
        )));
    }
    Ok(())
}

fn offset_u32(count: u64) -> Result<u32> {
    u32::try_from(count).map_err(|_| StoreError::OutOfRange(format!("node file holds {count} records")))
}

fn to_i64(pos: u64) -> Result<i64> {
    i64::try_from(pos).map_err(|_| StoreError::OutOfRange(format!("position {pos}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{MemNode, NodeMeta};
    use iavlx_types::hash::sha256;

    fn hashed_leaf(key: &'static [u8], version: Version, index: u64) -> Arc<NodePointer> {
        let node = MemNode::leaf(Bytes::from_static(key), Bytes::from_static(b"v"), version);
        node.assign(NodeMeta {
            id: NodeId::new(true, u64::from(version), index).unwrap(),
            hash: sha256(key),
        })
        .unwrap();
        NodePointer::from_mem(node)
    }

    #[test]
    fn rejects_unexpected_versions_and_tallies() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ChangesetWriter::create(dir.path(), 4, false).unwrap();
        assert!(matches!(
            w.save_root(5, None, 0, 0),
            Err(StoreError::OutOfRange(_))
        ));
        let leaf = hashed_leaf(b"a", 4, 1);
        assert!(matches!(
            w.save_root(4, Some(&leaf), 2, 0),
            Err(StoreError::Invariant(_))
        ));
    }

    #[test]
    fn sealed_view_resolves_written_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ChangesetWriter::create(dir.path(), 1, false).unwrap();
        let leaf = hashed_leaf(b"a", 1, 1);
        w.save_root(1, Some(&leaf), 1, 0).unwrap();
        w.save_root(2, Some(&leaf), 0, 0).unwrap();
        let cs = w.seal().unwrap();
        assert_eq!(cs.end_version(), 2);
        let loc = cs.root_of(2).unwrap().unwrap();
        assert_eq!(loc, leaf.loc().unwrap());
        let pin = cs.pin().unwrap();
        let node = pin.resolve(loc).unwrap();
        assert_eq!(node.key_value().unwrap().0, Bytes::from_static(b"a"));
        assert!(w.save_root(3, None, 0, 0).is_err());
    }
}
