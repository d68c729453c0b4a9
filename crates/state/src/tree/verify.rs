// Path: crates/state/src/tree/verify.rs

//! Structural checks over a whole tree.

use crate::node::NodePointer;
use crate::store::TreeStore;
use bytes::Bytes;
use iavlx_types::{Result, StoreError};
use std::sync::Arc;

struct Subtree {
    height: u8,
    size: u64,
    min_key: Bytes,
}

/// Checks heights, sizes, AVL balance and the search-key laws of the tree
/// under `root`: every branch key is the smallest key of its right subtree
/// and leaves are strictly ordered.
pub(crate) fn check_tree(store: &TreeStore, root: Option<&Arc<NodePointer>>) -> Result<()> {
    match root {
        Some(root) => check(store, root, None, None).map(|_| ()),
        None => Ok(()),
    }
}

fn violation(msg: String) -> StoreError {
    StoreError::Invariant(msg)
}

fn check(store: &TreeStore, ptr: &NodePointer, lower: Option<&Bytes>, upper: Option<&Bytes>) -> Result<Subtree> {
    let node = ptr.resolve(store)?;
    let key = node.key()?;
    if lower.is_some_and(|l| key < *l) || upper.is_some_and(|u| key >= *u) {
        return Err(violation(format!("key {} outside its subtree range", hex::encode(&key))));
    }
    if node.is_leaf() {
        if node.size() != 1 {
            return Err(violation(format!("leaf {} has size {}", hex::encode(&key), node.size())));
        }
        return Ok(Subtree {
            height: 0,
            size: 1,
            min_key: key,
        });
    }
    let (left_ptr, right_ptr) = (node.left()?, node.right()?);
    let left = check(store, &left_ptr, lower, Some(&key))?;
    let right = check(store, &right_ptr, Some(&key), upper)?;
    if right.min_key != key {
        return Err(violation(format!(
            "branch key {} is not the minimum of its right subtree",
            hex::encode(&key)
        )));
    }
    let height = left.height.max(right.height) + 1;
    if node.height() != height || node.size() != left.size + right.size {
        return Err(violation(format!(
            "branch {} records height {} size {}, children give {} and {}",
            hex::encode(&key),
            node.height(),
            node.size(),
            height,
            left.size + right.size
        )));
    }
    if left.height.abs_diff(right.height) > 1 {
        return Err(violation(format!("branch {} is unbalanced", hex::encode(&key))));
    }
    Ok(Subtree {
        height,
        size: node.size(),
        min_key: left.min_key,
    })
}
