// Path: crates/state/src/proof/mod.rs
//! ICS-23 style proofs over legacy IAVL hashes.
//!
//! A leaf op carries the zigzag header of the leaf; an inner op carries the
//! branch header and the sibling hash as a prefix/suffix pair around the
//! child hash, so any ICS-23 verifier configured with the IAVL spec can
//! check these proofs. The verifier here is pure and stateless.

pub(crate) mod builder;

use iavlx_types::error::ProofError;
use iavlx_types::hash::{empty_hash, sha256, Hash, HASH_LEN};
use iavlx_types::varint::read_uvarint;
use parity_scale_codec::{Decode, Encode};

/// Hash applied to a key, a value or a whole preimage.
#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOp {
    /// Use the data as is.
    NoHash,
    /// SHA-256.
    Sha256,
}

/// How lengths are encoded in a leaf preimage.
#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthOp {
    /// No length prefix.
    NoPrefix,
    /// Protobuf-style varint length prefix.
    VarProto,
}

/// How a leaf hash is formed from its key and value.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct LeafOp {
    /// Hash over the whole preimage.
    pub hash: HashOp,
    /// Hash applied to the key first.
    pub prehash_key: HashOp,
    /// Hash applied to the value first.
    pub prehash_value: HashOp,
    /// Length prefix of the (pre-hashed) key and value.
    pub length: LengthOp,
    /// Bytes preceding the key.
    pub prefix: Vec<u8>,
}

impl LeafOp {
    /// The IAVL leaf op behind the given leaf header.
    pub fn iavl(prefix: Vec<u8>) -> Self {
        Self {
            hash: HashOp::Sha256,
            prehash_key: HashOp::NoHash,
            prehash_value: HashOp::Sha256,
            length: LengthOp::VarProto,
            prefix,
        }
    }
}

/// One step from a child hash to its parent hash:
/// `parent = sha256(prefix || child || suffix)`.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct InnerOp {
    /// Hash over the preimage.
    pub hash: HashOp,
    /// Bytes before the child hash.
    pub prefix: Vec<u8>,
    /// Bytes after the child hash.
    pub suffix: Vec<u8>,
}

/// Proves that `key` maps to `value`.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ExistenceProof {
    /// The proven key.
    pub key: Vec<u8>,
    /// The proven value.
    pub value: Vec<u8>,
    /// How the leaf is hashed.
    pub leaf: LeafOp,
    /// Inner steps ordered from the leaf's parent up to the root.
    pub path: Vec<InnerOp>,
}

/// Proves that `key` is absent by exhibiting its neighbors.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct NonExistenceProof {
    /// The missing key.
    pub key: Vec<u8>,
    /// The largest key below `key`, if any.
    pub left: Option<ExistenceProof>,
    /// The smallest key above `key`, if any.
    pub right: Option<ExistenceProof>,
}

/// A membership or non-membership proof.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub enum CommitmentProof {
    /// The key is present.
    Exist(ExistenceProof),
    /// The key is absent.
    NonExist(NonExistenceProof),
}

impl CommitmentProof {
    /// SCALE-encodes the proof.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode()
    }

    /// Decodes a SCALE-encoded proof.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, ProofError> {
        Self::decode(&mut bytes).map_err(|e| ProofError::Deserialization(e.to_string()))
    }
}

/// Which side of its parent the proven child hangs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildSide {
    Left,
    Right,
}

struct Header {
    height: u64,
    size: u64,
}

fn read_header(bytes: &[u8]) -> Result<(Header, &[u8]), ProofError> {
    let mut cursor = bytes;
    let mut next = || {
        read_uvarint(&mut cursor)
            .map(unzigzag)
            .map_err(|e| ProofError::InvalidExistence(format!("bad node header: {e}")))
    };
    let height = next()?;
    let size = next()?;
    let version = next()?;
    if height < 0 || size < 1 || version < 0 {
        return Err(ProofError::InvalidExistence(format!(
            "header height {height} size {size} version {version}"
        )));
    }
    Ok((
        Header {
            height: height.unsigned_abs(),
            size: size.unsigned_abs(),
        },
        cursor,
    ))
}

fn unzigzag(raw: u64) -> i64 {
    ((raw >> 1) as i64) ^ -((raw & 1) as i64)
}

const HASH_PREFIX: u8 = HASH_LEN as u8;

/// Splits an inner op into its header bytes and the side of the child.
fn parse_inner(op: &InnerOp) -> Result<(&[u8], ChildSide), ProofError> {
    if op.hash != HashOp::Sha256 {
        return Err(ProofError::InvalidExistence("inner op must hash with SHA-256".into()));
    }
    let (header, rest) = read_header(&op.prefix)?;
    if header.height == 0 || header.size < 2 {
        return Err(ProofError::InvalidExistence("inner op header describes a leaf".into()));
    }
    let header_len = op.prefix.len() - rest.len();
    let header_bytes = op.prefix.get(..header_len).unwrap_or_default();
    let side = match (rest, op.suffix.as_slice()) {
        ([HASH_PREFIX], [HASH_PREFIX, sibling @ ..]) if sibling.len() == HASH_LEN => ChildSide::Left,
        ([HASH_PREFIX, sibling @ .., HASH_PREFIX], []) if sibling.len() == HASH_LEN => ChildSide::Right,
        _ => {
            return Err(ProofError::InvalidExistence(
                "inner op is not an IAVL branch step".into(),
            ))
        }
    };
    Ok((header_bytes, side))
}

fn check_leaf_op(op: &LeafOp) -> Result<(), ProofError> {
    if *op != LeafOp::iavl(op.prefix.clone()) {
        return Err(ProofError::InvalidExistence("leaf op does not match the IAVL spec".into()));
    }
    let (header, rest) = read_header(&op.prefix)?;
    if header.height != 0 || header.size != 1 || !rest.is_empty() {
        return Err(ProofError::InvalidExistence("leaf prefix is not a leaf header".into()));
    }
    Ok(())
}

fn apply_hash(op: HashOp, data: &[u8]) -> Vec<u8> {
    match op {
        HashOp::NoHash => data.to_vec(),
        HashOp::Sha256 => sha256(data).to_vec(),
    }
}

fn apply_length(op: LengthOp, data: &[u8], out: &mut Vec<u8>) -> Result<(), ProofError> {
    if op == LengthOp::VarProto {
        prost::encode_length_delimiter(data.len(), out)
            .map_err(|e| ProofError::InvalidExistence(e.to_string()))?;
    }
    out.extend_from_slice(data);
    Ok(())
}

/// Hash of the leaf described by `op` over `key` and `value`.
pub fn hash_leaf(op: &LeafOp, key: &[u8], value: &[u8]) -> Result<Hash, ProofError> {
    let mut preimage = op.prefix.clone();
    apply_length(op.length, &apply_hash(op.prehash_key, key), &mut preimage)?;
    apply_length(op.length, &apply_hash(op.prehash_value, value), &mut preimage)?;
    match op.hash {
        HashOp::Sha256 => Ok(sha256(&preimage)),
        HashOp::NoHash => Err(ProofError::InvalidExistence("leaf op without a hash".into())),
    }
}

fn hash_inner(op: &InnerOp, child: &Hash) -> Hash {
    let mut preimage = Vec::with_capacity(op.prefix.len() + HASH_LEN + op.suffix.len());
    preimage.extend_from_slice(&op.prefix);
    preimage.extend_from_slice(child);
    preimage.extend_from_slice(&op.suffix);
    sha256(&preimage)
}

/// The root an existence proof commits to, after checking its ops follow
/// the IAVL layout.
pub fn compute_root_from_existence(proof: &ExistenceProof) -> Result<Hash, ProofError> {
    check_leaf_op(&proof.leaf)?;
    let mut current = hash_leaf(&proof.leaf, &proof.key, &proof.value)?;
    for op in &proof.path {
        parse_inner(op)?;
        current = hash_inner(op, &current);
    }
    Ok(current)
}

fn sides(path: &[InnerOp]) -> Result<Vec<ChildSide>, ProofError> {
    path.iter().map(|op| parse_inner(op).map(|(_, side)| side)).collect()
}

/// Whether the two paths (leaf to root) reach adjacent leaves, `left`
/// immediately before `right`.
fn are_neighbors(left: &[InnerOp], right: &[InnerOp]) -> Result<bool, ProofError> {
    let common = left
        .iter()
        .rev()
        .zip(right.iter().rev())
        .take_while(|(l, r)| l == r)
        .count();
    let (Some(left_rest), Some(right_rest)) = (
        left.get(..left.len() - common),
        right.get(..right.len() - common),
    ) else {
        return Ok(false);
    };
    let (Some((top_left, below_left)), Some((top_right, below_right))) =
        (left_rest.split_last(), right_rest.split_last())
    else {
        return Ok(false);
    };
    let (left_header, left_side) = parse_inner(top_left)?;
    let (right_header, right_side) = parse_inner(top_right)?;
    if left_header != right_header || left_side != ChildSide::Left || right_side != ChildSide::Right {
        return Ok(false);
    }
    // Below the split the left leaf is the rightmost of its subtree and the
    // right leaf the leftmost of its.
    Ok(sides(below_left)?.iter().all(|s| *s == ChildSide::Right)
        && sides(below_right)?.iter().all(|s| *s == ChildSide::Left))
}

/// The root a non-existence proof commits to, after checking neighbor
/// order and adjacency.
pub fn compute_root_from_non_existence(proof: &NonExistenceProof) -> Result<Hash, ProofError> {
    let key = proof.key.as_slice();
    match (&proof.left, &proof.right) {
        (None, None) => Ok(empty_hash()),
        (Some(left), None) => {
            if left.key.as_slice() >= key {
                return Err(ProofError::InvalidNonExistence("left neighbor is not below the key".into()));
            }
            if !sides(&left.path)?.iter().all(|s| *s == ChildSide::Right) {
                return Err(ProofError::InvalidNonExistence("left neighbor is not the last key".into()));
            }
            compute_root_from_existence(left)
        }
        (None, Some(right)) => {
            if right.key.as_slice() <= key {
                return Err(ProofError::InvalidNonExistence("right neighbor is not above the key".into()));
            }
            if !sides(&right.path)?.iter().all(|s| *s == ChildSide::Left) {
                return Err(ProofError::InvalidNonExistence("right neighbor is not the first key".into()));
            }
            compute_root_from_existence(right)
        }
        (Some(left), Some(right)) => {
            if left.key.as_slice() >= key || right.key.as_slice() <= key {
                return Err(ProofError::InvalidNonExistence("neighbors do not bracket the key".into()));
            }
            let left_root = compute_root_from_existence(left)?;
            if compute_root_from_existence(right)? != left_root {
                return Err(ProofError::RootMismatch);
            }
            if !are_neighbors(&left.path, &right.path)? {
                return Err(ProofError::InvalidNonExistence("neighbors are not adjacent".into()));
            }
            Ok(left_root)
        }
    }
}

/// The root any proof commits to.
pub fn compute_root(proof: &CommitmentProof) -> Result<Hash, ProofError> {
    match proof {
        CommitmentProof::Exist(p) => compute_root_from_existence(p),
        CommitmentProof::NonExist(p) => compute_root_from_non_existence(p),
    }
}

/// Verifies `proof` against `root` for `key`: membership with
/// `expected_value`, or absence when it is `None`. Returns `Ok(false)` when
/// the proof is about something else and an error when it is malformed or
/// commits to a different root.
pub fn verify_proof(
    root: &[u8],
    key: &[u8],
    expected_value: Option<&[u8]>,
    proof: &CommitmentProof,
) -> Result<bool, ProofError> {
    if root.len() != HASH_LEN {
        return Err(ProofError::InvalidHashLength {
            expected: HASH_LEN,
            got: root.len(),
        });
    }
    match (expected_value, proof) {
        (Some(value), CommitmentProof::Exist(p)) => {
            if p.key != key || p.value != value {
                return Ok(false);
            }
        }
        (None, CommitmentProof::NonExist(p)) => {
            if p.key != key {
                return Ok(false);
            }
        }
        _ => return Ok(false),
    }
    if compute_root(proof)?.as_slice() != root {
        return Err(ProofError::RootMismatch);
    }
    Ok(true)
}

/// Whether `proof` shows `key` holding `value` under `root`.
pub fn verify_membership(root: &[u8], key: &[u8], value: &[u8], proof: &CommitmentProof) -> bool {
    matches!(verify_proof(root, key, Some(value), proof), Ok(true))
}

/// Whether `proof` shows `key` absent under `root`.
pub fn verify_non_membership(root: &[u8], key: &[u8], proof: &CommitmentProof) -> bool {
    matches!(verify_proof(root, key, None, proof), Ok(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::hash::{branch_hash, header, leaf_hash};

    fn leaf_proof(key: &[u8], value: &[u8], version: u32) -> ExistenceProof {
        ExistenceProof {
            key: key.to_vec(),
            value: value.to_vec(),
            leaf: LeafOp::iavl(header(0, 1, version)),
            path: Vec::new(),
        }
    }

    fn step(left_child: bool, sibling: &Hash) -> InnerOp {
        let mut prefix = header(1, 2, 1);
        let mut suffix = Vec::new();
        if left_child {
            prefix.push(HASH_PREFIX);
            suffix.push(HASH_PREFIX);
            suffix.extend_from_slice(sibling);
        } else {
            prefix.push(HASH_PREFIX);
            prefix.extend_from_slice(sibling);
            prefix.push(HASH_PREFIX);
        }
        InnerOp {
            hash: HashOp::Sha256,
            prefix,
            suffix,
        }
    }

    #[test]
    fn leaf_op_matches_node_hashing() {
        let proof = leaf_proof(b"k", b"v", 4);
        assert_eq!(compute_root_from_existence(&proof).unwrap(), leaf_hash(4, b"k", b"v"));
    }

    #[test]
    fn two_leaf_tree_proofs() {
        let (ha, hb) = (leaf_hash(1, b"a", b"1"), leaf_hash(1, b"b", b"2"));
        let root = branch_hash(1, 2, 1, &ha, &hb);

        let mut a = leaf_proof(b"a", b"1", 1);
        a.path.push(step(true, &hb));
        let mut b = leaf_proof(b"b", b"2", 1);
        b.path.push(step(false, &ha));
        let exist = CommitmentProof::Exist(a.clone());
        assert!(verify_membership(&root, b"a", b"1", &exist));
        assert!(!verify_membership(&root, b"a", b"2", &exist));
        assert!(verify_membership(&root, b"b", b"2", &CommitmentProof::Exist(b.clone())));

        let between = CommitmentProof::NonExist(NonExistenceProof {
            key: b"ab".to_vec(),
            left: Some(a.clone()),
            right: Some(b.clone()),
        });
        assert!(verify_non_membership(&root, b"ab", &between));

        let after = CommitmentProof::NonExist(NonExistenceProof {
            key: b"c".to_vec(),
            left: Some(b),
            right: None,
        });
        assert!(verify_non_membership(&root, b"c", &after));

        // "a" is not the last key, so it cannot witness absence above it.
        let bogus = CommitmentProof::NonExist(NonExistenceProof {
            key: b"ab".to_vec(),
            left: Some(a),
            right: None,
        });
        assert!(matches!(
            verify_proof(&root, b"ab", None, &bogus),
            Err(ProofError::InvalidNonExistence(_))
        ));
    }

    #[test]
    fn wrong_root_is_reported() {
        let proof = CommitmentProof::Exist(leaf_proof(b"k", b"v", 1));
        assert!(matches!(
            verify_proof(&[0u8; 32], b"k", Some(b"v"), &proof),
            Err(ProofError::RootMismatch)
        ));
        assert!(matches!(
            verify_proof(&[0u8; 3], b"k", Some(b"v"), &proof),
            Err(ProofError::InvalidHashLength { expected: 32, got: 3 })
        ));
    }

    #[test]
    fn empty_tree_absence() {
        let proof = CommitmentProof::NonExist(NonExistenceProof {
            key: b"x".to_vec(),
            left: None,
            right: None,
        });
        assert!(verify_non_membership(&empty_hash(), b"x", &proof));
        let decoded = CommitmentProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(decoded, proof);
        assert!(CommitmentProof::from_bytes(&[0xff]).is_err());
    }
}
