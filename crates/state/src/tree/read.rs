// Path: crates/state/src/tree/read.rs

//! Point reads shared by branches, read-only views and the proof builder.

use crate::node::NodePointer;
use crate::store::TreeStore;
use bytes::Bytes;
use iavlx_types::Result;
use std::cmp::Ordering;
use std::sync::Arc;

/// The value stored under `key`.
pub(crate) fn get(store: &TreeStore, root: Option<&Arc<NodePointer>>, key: &[u8]) -> Result<Option<Bytes>> {
    let Some(mut ptr) = root.cloned() else {
        return Ok(None);
    };
    loop {
        let node = ptr.resolve(store)?;
        if node.is_leaf() {
            if node.key()?.as_ref() != key {
                return Ok(None);
            }
            return node.key_value().map(|(_, value)| Some(value));
        }
        ptr = if key < node.key()?.as_ref() {
            node.left()?
        } else {
            node.right()?
        };
    }
}

/// The in-order position `key` has, or would have if inserted, together
/// with its value when present.
pub(crate) fn get_with_index(
    store: &TreeStore,
    root: Option<&Arc<NodePointer>>,
    key: &[u8],
) -> Result<(u64, Option<Bytes>)> {
    let Some(mut ptr) = root.cloned() else {
        return Ok((0, None));
    };
    let mut index = 0;
    loop {
        let node = ptr.resolve(store)?;
        if node.is_leaf() {
            let leaf_key = node.key()?;
            return match key.cmp(leaf_key.as_ref()) {
                Ordering::Equal => Ok((index, Some(node.key_value()?.1))),
                Ordering::Less => Ok((index, None)),
                Ordering::Greater => Ok((index + 1, None)),
            };
        }
        if key < node.key()?.as_ref() {
            ptr = node.left()?;
        } else {
            let left = node.left()?;
            index += left.resolve(store)?.size();
            ptr = node.right()?;
        }
    }
}

/// The key and value at in-order position `index`.
pub(crate) fn get_by_index(
    store: &TreeStore,
    root: Option<&Arc<NodePointer>>,
    mut index: u64,
) -> Result<Option<(Bytes, Bytes)>> {
    let Some(mut ptr) = root.cloned() else {
        return Ok(None);
    };
    loop {
        let node = ptr.resolve(store)?;
        if index >= node.size() {
            return Ok(None);
        }
        if node.is_leaf() {
            return node.key_value().map(Some);
        }
        let left = node.left()?;
        let left_size = left.resolve(store)?.size();
        ptr = if index < left_size {
            left
        } else {
            index -= left_size;
            node.right()?
        };
    }
}

/// Number of leaves under `root`.
pub(crate) fn size(store: &TreeStore, root: Option<&Arc<NodePointer>>) -> Result<u64> {
    match root {
        Some(ptr) => Ok(ptr.resolve(store)?.size()),
        None => Ok(0),
    }
}

/// Height of the tree under `root`; zero when empty.
pub(crate) fn height(store: &TreeStore, root: Option<&Arc<NodePointer>>) -> Result<u8> {
    match root {
        Some(ptr) => Ok(ptr.resolve(store)?.height()),
        None => Ok(0),
    }
}
