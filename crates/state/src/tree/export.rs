// Path: crates/state/src/tree/export.rs

//! Post-order export of a committed tree and the matching import plan.
//!
//! Exported nodes keep the version they were created at, so an imported
//! tree hashes to the same root as the exported one.

use crate::changeset::rewrite::{KeySource, RewriteNode, RewritePlan, RewriteRoot};
use crate::node::hash::{branch_hash, leaf_hash};
use crate::node::{Node, NodeLoc, NodePointer};
use crate::store::TreeStore;
use bytes::Bytes;
use iavlx_storage::{ChangesetDir, NodeId};
use iavlx_types::hash::Hash;
use iavlx_types::prelude::OptionExt;
use iavlx_types::{Result, StoreError, Version};
use std::collections::HashMap;
use std::sync::Arc;

/// One exported node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportNode {
    /// Leaf key, or the smallest key of a branch's right subtree.
    pub key: Bytes,
    /// Leaf value; `None` for branches.
    pub value: Option<Bytes>,
    /// Version the node was created at.
    pub version: Version,
    /// Subtree height; zero for leaves.
    pub height: u8,
}

/// Yields the nodes of a tree in post-order: left subtree, right subtree,
/// then the node itself.
pub struct Exporter {
    store: Arc<TreeStore>,
    // A branch is pushed back once with `expanded` set after its children.
    stack: Vec<(Node, bool)>,
}

impl Exporter {
    pub(crate) fn new(store: Arc<TreeStore>, root: Option<&Arc<NodePointer>>) -> Result<Self> {
        let mut stack = Vec::new();
        if let Some(root) = root {
            stack.push((root.resolve(&store)?, false));
        }
        Ok(Self { store, stack })
    }

    fn step(&mut self) -> Result<Option<ExportNode>> {
        while let Some((node, expanded)) = self.stack.pop() {
            if node.is_leaf() {
                let (key, value) = node.key_value()?;
                return Ok(Some(ExportNode {
                    key,
                    value: Some(value),
                    version: node.version(),
                    height: 0,
                }));
            }
            if expanded {
                return Ok(Some(ExportNode {
                    key: node.key()?,
                    value: None,
                    version: node.version(),
                    height: node.height(),
                }));
            }
            let left = node.left()?.resolve(&self.store)?;
            let right = node.right()?.resolve(&self.store)?;
            self.stack.push((node, true));
            self.stack.push((right, false));
            self.stack.push((left, false));
        }
        Ok(None)
    }
}

impl Iterator for Exporter {
    type Item = Result<ExportNode>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(node) => node.map(Ok),
            Err(e) => {
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}

struct Built {
    id: NodeId,
    hash: Hash,
    height: u8,
    size: u64,
}

/// Rebuilds ids and hashes from a post-order node stream and lays the
/// nodes out as one changeset ending at `version`. Versions before
/// `version` are present only as pruned entries.
pub(crate) fn plan_import(
    version: Version,
    nodes: impl IntoIterator<Item = ExportNode>,
) -> Result<(RewritePlan, Hash)> {
    let mut counters: HashMap<Version, (u64, u64)> = HashMap::new();
    let mut stack: Vec<Built> = Vec::new();
    let mut leaves = Vec::new();
    let mut branches = Vec::new();
    let mut start_version = version;

    for node in nodes {
        if node.version == 0 || node.version > version {
            return Err(StoreError::Invariant(format!(
                "imported node at version {} outside 1..={version}",
                node.version
            )));
        }
        start_version = start_version.min(node.version);
        let counter = counters.entry(node.version).or_default();
        let built = if node.height == 0 {
            let value = node
                .value
                .required(StoreError::Invariant("imported leaf without a value".into()))?;
            counter.0 += 1;
            let id = NodeId::new(true, u64::from(node.version), counter.0)?;
            let hash = leaf_hash(node.version, &node.key, &value);
            leaves.push(RewriteNode {
                id,
                hash,
                orphan_version: 0,
                key: KeySource::KeyValue(node.key, value),
                height: 0,
                size: 1,
                children: None,
            });
            Built {
                id,
                hash,
                height: 0,
                size: 1,
            }
        } else {
            let (Some(right), Some(left)) = (stack.pop(), stack.pop()) else {
                return Err(StoreError::Invariant("imported branch without two children".into()));
            };
            let height = left.height.max(right.height) + 1;
            if height != node.height {
                return Err(StoreError::Invariant(format!(
                    "imported branch claims height {} but its children give {height}",
                    node.height
                )));
            }
            let size = left.size + right.size;
            counter.1 += 1;
            let id = NodeId::new(false, u64::from(node.version), counter.1)?;
            let hash = branch_hash(height, size, node.version, &left.hash, &right.hash);
            branches.push(RewriteNode {
                id,
                hash,
                orphan_version: 0,
                key: KeySource::Key(node.key),
                height,
                size: u32::try_from(size).map_err(|_| StoreError::OutOfRange(format!("subtree size {size}")))?,
                children: Some((
                    NodeLoc {
                        id: left.id,
                        file_idx: 0,
                    },
                    NodeLoc {
                        id: right.id,
                        file_idx: 0,
                    },
                )),
            });
            Built {
                id,
                hash,
                height,
                size,
            }
        };
        stack.push(built);
    }

    let root = stack.pop();
    if !stack.is_empty() {
        return Err(StoreError::Invariant(format!(
            "import stream left {} unattached subtrees",
            stack.len()
        )));
    }
    let (root_id, root_hash) = match root {
        Some(root) => (root.id, root.hash),
        None => (NodeId::default(), iavlx_types::hash::empty_hash()),
    };
    let roots = (start_version..=version)
        .map(|v| RewriteRoot {
            version: v,
            root_id: if v == version { root_id } else { NodeId::default() },
            pruned: v != version,
        })
        .collect();
    let plan = RewritePlan {
        name: ChangesetDir::compacted(start_version, version),
        end_version: version,
        leaves,
        branches,
        roots,
        kv_source: None,
    };
    Ok((plan, root_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &'static [u8], version: Version) -> ExportNode {
        ExportNode {
            key: Bytes::from_static(key),
            value: Some(Bytes::from_static(b"v")),
            version,
            height: 0,
        }
    }

    fn branch(key: &'static [u8], version: Version, height: u8) -> ExportNode {
        ExportNode {
            key: Bytes::from_static(key),
            value: None,
            version,
            height,
        }
    }

    #[test]
    fn plan_hashes_like_the_exported_tree() {
        let nodes = vec![leaf(b"a", 1), leaf(b"b", 2), branch(b"b", 2, 1)];
        let (plan, hash) = plan_import(3, nodes).unwrap();
        let expected = branch_hash(1, 2, 2, &leaf_hash(1, b"a", b"v"), &leaf_hash(2, b"b", b"v"));
        assert_eq!(hash, expected);
        assert_eq!(plan.name, ChangesetDir::compacted(1, 3));
        assert_eq!(plan.roots.len(), 3);
        assert!(plan.roots[0].pruned && plan.roots[1].pruned && !plan.roots[2].pruned);
        assert_eq!(plan.roots[2].root_id, NodeId::new(false, 2, 1).unwrap());
    }

    #[test]
    fn malformed_streams_are_rejected() {
        assert!(plan_import(2, vec![branch(b"a", 1, 1)]).is_err());
        assert!(plan_import(2, vec![leaf(b"a", 1), leaf(b"b", 1)]).is_err());
        assert!(plan_import(1, vec![leaf(b"a", 2)]).is_err());
        assert!(plan_import(2, vec![leaf(b"a", 1), leaf(b"b", 1), branch(b"b", 1, 2)]).is_err());
    }

    #[test]
    fn empty_stream_plans_an_empty_version() {
        let (plan, hash) = plan_import(4, Vec::new()).unwrap();
        assert_eq!(hash, iavlx_types::hash::empty_hash());
        assert_eq!(plan.roots.len(), 1);
        assert!(plan.roots[0].root_id.is_empty());
    }
}
