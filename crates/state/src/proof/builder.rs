// Path: crates/state/src/proof/builder.rs
//! Store-aware proof construction: descends from a root through node
//! pointers, resolving persisted nodes lazily, and records one inner op per
//! branch on the way down.

use super::{CommitmentProof, ExistenceProof, HashOp, InnerOp, LeafOp, NonExistenceProof};
use crate::node::hash::header;
use crate::node::NodePointer;
use crate::store::TreeStore;
use crate::tree::read;
use iavlx_types::error::ProofError;
use iavlx_types::hash::HASH_LEN;
use iavlx_types::varint::put_bytes;
use iavlx_types::Result;
use std::sync::Arc;

/// Builds an existence proof for `key`, or `None` when it is absent.
pub(crate) fn existence_proof(
    store: &TreeStore,
    root: Option<&Arc<NodePointer>>,
    key: &[u8],
) -> Result<Option<ExistenceProof>> {
    let Some(mut ptr) = root.cloned() else {
        return Ok(None);
    };
    let mut path = Vec::new();
    loop {
        let node = ptr.resolve(store)?;
        if node.is_leaf() {
            let (leaf_key, value) = node.key_value()?;
            if leaf_key.as_ref() != key {
                return Ok(None);
            }
            path.reverse();
            return Ok(Some(ExistenceProof {
                key: leaf_key.to_vec(),
                value: value.to_vec(),
                leaf: LeafOp::iavl(header(0, 1, node.version())),
                path,
            }));
        }
        let mut prefix = header(node.height(), node.size(), node.version());
        let mut suffix = Vec::with_capacity(HASH_LEN + 1);
        let left = node.left()?;
        let right = node.right()?;
        ptr = if key < node.key()?.as_ref() {
            prefix.push(HASH_LEN as u8);
            put_bytes(&mut suffix, &right.resolve(store)?.hash()?);
            left
        } else {
            put_bytes(&mut prefix, &left.resolve(store)?.hash()?);
            prefix.push(HASH_LEN as u8);
            right
        };
        path.push(InnerOp {
            hash: HashOp::Sha256,
            prefix,
            suffix,
        });
    }
}

/// A membership proof for `key`; fails when the key is absent.
pub(crate) fn membership_proof(
    store: &TreeStore,
    root: Option<&Arc<NodePointer>>,
    key: &[u8],
) -> Result<CommitmentProof> {
    existence_proof(store, root, key)?
        .map(CommitmentProof::Exist)
        .ok_or_else(|| ProofError::Unavailable(format!("key {} is absent", hex::encode(key))).into())
}

/// A non-membership proof for `key` built from its in-order neighbors;
/// fails when the key is present.
pub(crate) fn non_membership_proof(
    store: &TreeStore,
    root: Option<&Arc<NodePointer>>,
    key: &[u8],
) -> Result<CommitmentProof> {
    let (index, value) = read::get_with_index(store, root, key)?;
    if value.is_some() {
        return Err(ProofError::Unavailable(format!("key {} is present", hex::encode(key))).into());
    }
    let neighbor = |at: Option<u64>| -> Result<Option<ExistenceProof>> {
        let Some(at) = at else {
            return Ok(None);
        };
        match read::get_by_index(store, root, at)? {
            Some((neighbor_key, _)) => existence_proof(store, root, &neighbor_key),
            None => Ok(None),
        }
    };
    Ok(CommitmentProof::NonExist(NonExistenceProof {
        key: key.to_vec(),
        left: neighbor(index.checked_sub(1))?,
        right: neighbor(Some(index))?,
    }))
}
