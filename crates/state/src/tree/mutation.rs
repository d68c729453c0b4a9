// Path: crates/state/src/tree/mutation.rs

//! Copy-on-write insert and remove with AVL rebalancing.
//!
//! Every node touched at the working version is either reused in place
//! (built earlier in the same version, unhashed and uniquely owned) or
//! copied. Copying a node that already has an id records that id as an
//! orphan of the working version.

use crate::node::{MemNode, Node, NodePointer};
use crate::store::TreeStore;
use bytes::Bytes;
use iavlx_storage::NodeId;
use iavlx_types::prelude::OptionExt;
use iavlx_types::{Result, StoreError, Version};
use std::cmp::Ordering;
use std::sync::Arc;

pub(crate) struct MutationContext<'a> {
    pub store: &'a TreeStore,
    pub version: Version,
    pub orphans: Vec<NodeId>,
}

impl<'a> MutationContext<'a> {
    pub(crate) fn new(store: &'a TreeStore, version: Version) -> Self {
        Self {
            store,
            version,
            orphans: Vec::new(),
        }
    }

    fn orphan(&mut self, node: &Node) {
        if let Some(id) = node.id() {
            self.orphans.push(id);
        }
    }
}

/// The outcome of removing a key from a subtree.
pub(crate) struct Removal {
    /// The removed value; `None` when the key was absent.
    pub value: Option<Bytes>,
    /// The replacement subtree; `None` when the subtree became empty.
    pub node: Option<Arc<NodePointer>>,
    /// A new smallest key the parent must adopt.
    pub promoted: Option<Bytes>,
}

/// Returns `node` ready for mutation at the working version.
fn mutate_branch(ptr: Arc<NodePointer>, node: Node, ctx: &mut MutationContext<'_>) -> Result<MemNode> {
    if let Node::Mem(mem) = &node {
        if mem.version() == ctx.version && mem.id().is_none() {
            drop(node);
            let shared = match Arc::try_unwrap(ptr) {
                Ok(owned) => match owned.take_staged(ctx.version) {
                    Ok(staged) => return Ok(staged),
                    Err(back) => Arc::new(back),
                },
                Err(shared) => shared,
            };
            return Ok(shared
                .mem()
                .required(StoreError::Invariant("staged node lost its body".into()))?
                .copy_at(ctx.version));
        }
    }
    ctx.orphan(&node);
    node.to_mem(ctx.version)
}

fn take_child(slot: &mut Option<Arc<NodePointer>>) -> Result<Arc<NodePointer>> {
    slot.take()
        .required(StoreError::Invariant("branch without child".into()))
}

/// Inserts or replaces `leaf`. Returns the new subtree and whether an
/// existing key was replaced.
pub(crate) fn set_recursive(
    ptr: Option<Arc<NodePointer>>,
    leaf: Arc<MemNode>,
    ctx: &mut MutationContext<'_>,
) -> Result<(Arc<NodePointer>, bool)> {
    let Some(ptr) = ptr else {
        return Ok((NodePointer::from_arc(leaf), false));
    };
    let node = ptr.resolve(ctx.store)?;
    if node.is_leaf() {
        let existing = node.key()?;
        let (key, left, right) = match leaf.key().as_ref().cmp(existing.as_ref()) {
            Ordering::Equal => {
                ctx.orphan(&node);
                return Ok((NodePointer::from_arc(leaf), true));
            }
            Ordering::Less => (existing, NodePointer::from_arc(leaf), ptr),
            Ordering::Greater => (leaf.key().clone(), ptr, NodePointer::from_arc(leaf)),
        };
        drop(node);
        let branch = MemNode::branch(key, ctx.version, 1, 2, left, right);
        return Ok((NodePointer::from_mem(branch), false));
    }

    let go_left = leaf.key().as_ref() < node.key()?.as_ref();
    let mut branch = mutate_branch(ptr, node, ctx)?;
    let slot = if go_left {
        &mut branch.left
    } else {
        &mut branch.right
    };
    let child = take_child(slot)?;
    let (child, updated) = set_recursive(Some(child), leaf, ctx)?;
    *slot = Some(child);
    if updated {
        return Ok((NodePointer::from_mem(branch), true));
    }
    update_height_size(&mut branch, ctx)?;
    Ok((NodePointer::from_mem(rebalance(branch, ctx)?), false))
}

/// Removes `key` from the subtree under `ptr`.
pub(crate) fn remove_recursive(
    ptr: Arc<NodePointer>,
    key: &[u8],
    ctx: &mut MutationContext<'_>,
) -> Result<Removal> {
    let node = ptr.resolve(ctx.store)?;
    if node.is_leaf() {
        let (leaf_key, value) = node.key_value()?;
        if leaf_key.as_ref() != key {
            drop(node);
            return Ok(unchanged(ptr));
        }
        ctx.orphan(&node);
        return Ok(Removal {
            value: Some(value),
            node: None,
            promoted: None,
        });
    }

    let node_key = node.key()?;
    if key < node_key.as_ref() {
        let removal = remove_recursive(node.left()?, key, ctx)?;
        if removal.value.is_none() {
            drop(node);
            return Ok(unchanged(ptr));
        }
        let Some(new_left) = removal.node else {
            // The left side emptied: the right child takes this node's
            // place and this node's key becomes the new minimum above.
            ctx.orphan(&node);
            return Ok(Removal {
                value: removal.value,
                node: Some(node.right()?),
                promoted: Some(node_key),
            });
        };
        let mut branch = mutate_branch(ptr, node, ctx)?;
        branch.left = Some(new_left);
        update_height_size(&mut branch, ctx)?;
        return Ok(Removal {
            value: removal.value,
            node: Some(NodePointer::from_mem(rebalance(branch, ctx)?)),
            promoted: removal.promoted,
        });
    }

    let removal = remove_recursive(node.right()?, key, ctx)?;
    if removal.value.is_none() {
        drop(node);
        return Ok(unchanged(ptr));
    }
    let Some(new_right) = removal.node else {
        ctx.orphan(&node);
        return Ok(Removal {
            value: removal.value,
            node: Some(node.left()?),
            promoted: None,
        });
    };
    let mut branch = mutate_branch(ptr, node, ctx)?;
    branch.right = Some(new_right);
    if let Some(promoted) = removal.promoted {
        branch.key = promoted;
    }
    update_height_size(&mut branch, ctx)?;
    Ok(Removal {
        value: removal.value,
        node: Some(NodePointer::from_mem(rebalance(branch, ctx)?)),
        promoted: None,
    })
}

fn unchanged(ptr: Arc<NodePointer>) -> Removal {
    Removal {
        value: None,
        node: Some(ptr),
        promoted: None,
    }
}

fn child_stats(branch: &MemNode, ctx: &MutationContext<'_>) -> Result<((u8, u64), (u8, u64))> {
    let left = branch.left_ptr()?.resolve(ctx.store)?;
    let right = branch.right_ptr()?.resolve(ctx.store)?;
    Ok(((left.height(), left.size()), (right.height(), right.size())))
}

fn update_height_size(branch: &mut MemNode, ctx: &MutationContext<'_>) -> Result<()> {
    let ((lh, ls), (rh, rs)) = child_stats(branch, ctx)?;
    branch.height = lh.max(rh) + 1;
    branch.size = ls + rs;
    Ok(())
}

fn balance_of_mem(branch: &MemNode, ctx: &MutationContext<'_>) -> Result<i16> {
    let ((lh, _), (rh, _)) = child_stats(branch, ctx)?;
    Ok(i16::from(lh) - i16::from(rh))
}

fn balance_of(node: &Node, ctx: &MutationContext<'_>) -> Result<i16> {
    if node.is_leaf() {
        return Ok(0);
    }
    let left = node.left()?.resolve(ctx.store)?;
    let right = node.right()?.resolve(ctx.store)?;
    Ok(i16::from(left.height()) - i16::from(right.height()))
}

fn rebalance(mut branch: MemNode, ctx: &mut MutationContext<'_>) -> Result<MemNode> {
    let balance = balance_of_mem(&branch, ctx)?;
    if balance > 1 {
        let left_ptr = take_child(&mut branch.left)?;
        let left = left_ptr.resolve(ctx.store)?;
        let left_ptr = if balance_of(&left, ctx)? < 0 {
            let staged = mutate_branch(left_ptr, left, ctx)?;
            NodePointer::from_mem(rotate_left(staged, ctx)?)
        } else {
            drop(left);
            left_ptr
        };
        branch.left = Some(left_ptr);
        return rotate_right(branch, ctx);
    }
    if balance < -1 {
        let right_ptr = take_child(&mut branch.right)?;
        let right = right_ptr.resolve(ctx.store)?;
        let right_ptr = if balance_of(&right, ctx)? > 0 {
            let staged = mutate_branch(right_ptr, right, ctx)?;
            NodePointer::from_mem(rotate_right(staged, ctx)?)
        } else {
            drop(right);
            right_ptr
        };
        branch.right = Some(right_ptr);
        return rotate_left(branch, ctx);
    }
    Ok(branch)
}

// Rotations keep every key in place: a branch key is the minimum of its
// right subtree, which neither rotation changes.

fn rotate_right(mut branch: MemNode, ctx: &mut MutationContext<'_>) -> Result<MemNode> {
    let left_ptr = take_child(&mut branch.left)?;
    let left = left_ptr.resolve(ctx.store)?;
    let mut pivot = mutate_branch(left_ptr, left, ctx)?;
    branch.left = pivot.right.take();
    update_height_size(&mut branch, ctx)?;
    pivot.right = Some(NodePointer::from_mem(branch));
    update_height_size(&mut pivot, ctx)?;
    Ok(pivot)
}

fn rotate_left(mut branch: MemNode, ctx: &mut MutationContext<'_>) -> Result<MemNode> {
    let right_ptr = take_child(&mut branch.right)?;
    let right = right_ptr.resolve(ctx.store)?;
    let mut pivot = mutate_branch(right_ptr, right, ctx)?;
    branch.right = pivot.left.take();
    update_height_size(&mut branch, ctx)?;
    pivot.left = Some(NodePointer::from_mem(branch));
    update_height_size(&mut pivot, ctx)?;
    Ok(pivot)
}
