// Path: crates/state/src/changeset/rewrite.rs

//! Writes a complete changeset in one pass from a list of nodes.
//!
//! Compaction uses it to drop nodes no retained version can reach, and
//! import uses it to lay down an exported tree. Nodes keep their ids and are
//! stored sorted by (version, index); relative references are recomputed
//! against the new positions. The directory is assembled under a `.tmp`
//! name and renamed into place once every file is synced.

use super::{Changeset, InfoFile};
use crate::node::NodeLoc;
use bytes::Bytes;
use iavlx_storage::dir::{BRANCHES_FILE, INFO_FILE, KV_LOG_FILE, LEAVES_FILE, VERSIONS_FILE};
use iavlx_storage::{
    BranchLayout, ChangesetDir, ChangesetInfo, KvLogWriter, LeafLayout, NodeId, NodeRef,
    NodeSetInfo, StructWriter, VersionInfo,
};
use iavlx_types::hash::Hash;
use iavlx_types::{Result, StoreError, Version};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a rewritten node's key (and value, for leaves) comes from.
pub(crate) enum KeySource {
    /// An offset into the KV log copied verbatim.
    Offset(u32),
    /// A branch key written to the new log.
    Key(Bytes),
    /// A leaf key and value written to the new log.
    KeyValue(Bytes, Bytes),
}

/// One node to write.
pub(crate) struct RewriteNode {
    pub id: NodeId,
    pub hash: Hash,
    pub orphan_version: Version,
    pub key: KeySource,
    pub height: u8,
    pub size: u32,
    /// Left and right children of a branch.
    pub children: Option<(NodeLoc, NodeLoc)>,
}

/// The root of one version in the rewritten range.
pub(crate) struct RewriteRoot {
    pub version: Version,
    pub root_id: NodeId,
    pub pruned: bool,
}

/// Everything needed to write one changeset directory.
pub(crate) struct RewritePlan {
    pub name: ChangesetDir,
    pub end_version: Version,
    pub leaves: Vec<RewriteNode>,
    pub branches: Vec<RewriteNode>,
    /// One entry per version in `name.start_version..=end_version`.
    pub roots: Vec<RewriteRoot>,
    /// Copy this KV log byte for byte; every key source must be an offset.
    pub kv_source: Option<PathBuf>,
}

/// Writes `plan` under `root` and opens the result.
pub(crate) fn write_changeset(root: &Path, mut plan: RewritePlan, zero_copy: bool) -> Result<Arc<Changeset>> {
    let start_version = plan.name.start_version;
    let final_dir = plan.name.path_in(root);
    if final_dir.exists() {
        return Err(StoreError::Invariant(format!(
            "changeset {} already exists",
            plan.name
        )));
    }
    let tmp = root.join(format!("{}.tmp", plan.name));
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;

    plan.leaves.sort_by_key(|n| (n.id.wide_version(), n.id.index()));
    plan.branches.sort_by_key(|n| (n.id.wide_version(), n.id.index()));
    let leaf_positions = positions(&plan.leaves);
    let branch_positions = positions(&plan.branches);

    let mut kv = match &plan.kv_source {
        Some(src) => {
            fs::copy(src, tmp.join(KV_LOG_FILE))?;
            None
        }
        None => Some(KvLogWriter::create(&tmp.join(KV_LOG_FILE))?),
    };
    let mut key_cache: HashMap<Bytes, u32> = HashMap::new();
    let mut info = ChangesetInfo {
        start_version,
        end_version: plan.end_version,
        ..ChangesetInfo::default()
    };

    let mut leaves = StructWriter::<LeafLayout>::create(&tmp.join(LEAVES_FILE))?;
    for node in &plan.leaves {
        let key_offset = match (&node.key, kv.as_mut()) {
            (KeySource::Offset(offset), None) => *offset,
            (KeySource::KeyValue(key, value), Some(kv)) => {
                let offset = kv.write_kv(key, value)?;
                key_cache.insert(key.clone(), offset);
                offset
            }
            _ => return Err(key_source_mismatch(node.id)),
        };
        if node.orphan_version != 0 {
            info.add_orphan(true, node.orphan_version);
        }
        leaves.append(&LeafLayout {
            id: node.id,
            key_offset,
            orphan_version: node.orphan_version,
            hash: node.hash,
        })?;
    }

    let range = start_version..=plan.end_version;
    let mut branches = StructWriter::<BranchLayout>::create(&tmp.join(BRANCHES_FILE))?;
    for (pos, node) in plan.branches.iter().enumerate() {
        let pos = pos as u64;
        let (left, right) = node
            .children
            .ok_or_else(|| StoreError::Invariant(format!("branch {} without children", node.id)))?;
        let resolve_child = |child: NodeLoc| -> Result<(NodeRef, u64)> {
            let local = if child.id.is_leaf() {
                leaf_positions.get(&child.id)
            } else {
                branch_positions.get(&child.id)
            };
            match local {
                Some(&child_pos) if child.id.is_leaf() => {
                    Ok((NodeRef::relative(true, to_i64(child_pos)? + 1)?, child_pos + 1))
                }
                Some(&child_pos) => Ok((
                    NodeRef::relative(false, to_i64(child_pos)? - to_i64(pos)?)?,
                    child_pos + 1,
                )),
                None if range.contains(&child.id.version()) => Err(StoreError::Invariant(format!(
                    "branch {} keeps child {} that was dropped",
                    node.id, child.id
                ))),
                None => Ok((NodeRef::from_id(child.id), child.file_idx)),
            }
        };
        let (left_ref, left_abs_offset) = resolve_child(left)?;
        let (right_ref, right_abs_offset) = resolve_child(right)?;
        let key_offset = match (&node.key, kv.as_mut()) {
            (KeySource::Offset(offset), None) => *offset,
            (KeySource::Key(key), Some(kv)) => match key_cache.get(key) {
                Some(offset) => *offset,
                None => {
                    let offset = kv.write_k(key)?;
                    key_cache.insert(key.clone(), offset);
                    offset
                }
            },
            _ => return Err(key_source_mismatch(node.id)),
        };
        if node.orphan_version != 0 {
            info.add_orphan(false, node.orphan_version);
        }
        branches.append(&BranchLayout {
            id: node.id,
            left: left_ref,
            right: right_ref,
            left_abs_offset,
            right_abs_offset,
            key_offset,
            height: node.height,
            size: node.size,
            orphan_version: node.orphan_version,
            hash: node.hash,
        })?;
    }

    let mut versions = StructWriter::<VersionInfo>::create(&tmp.join(VERSIONS_FILE))?;
    let mut leaf_cursor = 0usize;
    let mut branch_cursor = 0usize;
    for expected in range.clone() {
        let root_entry = plan
            .roots
            .iter()
            .find(|r| r.version == expected)
            .ok_or_else(|| StoreError::Invariant(format!("no root recorded for version {expected}")))?;
        let leaf_set = version_range(&plan.leaves, &mut leaf_cursor, expected)?;
        let branch_set = version_range(&plan.branches, &mut branch_cursor, expected)?;
        let root_id = root_entry.root_id;
        let root_dropped = !root_id.is_empty()
            && range.contains(&root_id.version())
            && !leaf_positions.contains_key(&root_id)
            && !branch_positions.contains_key(&root_id);
        let flags = if root_entry.pruned || root_dropped {
            VersionInfo::PRUNED
        } else {
            0
        };
        versions.append(&VersionInfo {
            leaves: leaf_set,
            branches: branch_set,
            root_id,
            version: expected,
            flags,
        })?;
    }
    if leaf_cursor != plan.leaves.len() || branch_cursor != plan.branches.len() {
        return Err(StoreError::Invariant(format!(
            "nodes outside versions {start_version}..={} in changeset {}",
            plan.end_version, plan.name
        )));
    }

    leaves.sync()?;
    branches.sync()?;
    versions.sync()?;
    if let Some(kv) = kv.as_mut() {
        kv.sync()?;
    }
    InfoFile::create(&tmp.join(INFO_FILE), info)?;
    drop((leaves, branches, versions, kv));
    fs::rename(&tmp, &final_dir)?;
    Ok(Arc::new(Changeset::open(root, plan.name, zero_copy)?))
}

fn positions(nodes: &[RewriteNode]) -> HashMap<NodeId, u64> {
    nodes
        .iter()
        .enumerate()
        .map(|(pos, n)| (n.id, pos as u64))
        .collect()
}

/// The contiguous block of `version`'s nodes starting at `cursor`.
fn version_range(nodes: &[RewriteNode], cursor: &mut usize, version: Version) -> Result<NodeSetInfo> {
    let start = *cursor;
    let mut first_index = 0;
    let mut last_index = 0;
    while let Some(node) = nodes.get(*cursor) {
        if node.id.wide_version() != u64::from(version) {
            break;
        }
        if *cursor == start {
            first_index = node.id.index();
        }
        last_index = node.id.index();
        *cursor += 1;
    }
    let count = *cursor - start;
    let start_offset = u32::try_from(start)
        .map_err(|_| StoreError::OutOfRange(format!("node position {start}")))?;
    if count == 0 {
        return Ok(NodeSetInfo {
            start_offset,
            ..NodeSetInfo::default()
        });
    }
    Ok(NodeSetInfo {
        start_offset,
        start_index: first_index,
        end_index: last_index,
        count: u32::try_from(count).map_err(|_| StoreError::OutOfRange(format!("{count} nodes")))?,
    })
}

fn key_source_mismatch(id: NodeId) -> StoreError {
    StoreError::Invariant(format!("key source of {id} does not match the KV log mode"))
}

fn to_i64(pos: u64) -> Result<i64> {
    i64::try_from(pos).map_err(|_| StoreError::OutOfRange(format!("position {pos}")))
}
