// Path: crates/storage/src/id.rs

//! 64-bit node identifiers and the child references stored in branches.
//!
//! A [`NodeId`] packs `is_leaf`, the version that created the node and its
//! 1-based index among that version's leaves or branches. A [`NodeRef`]
//! is either a `NodeId` (bit 63 clear) or a relative pointer into the same
//! changeset (bit 63 set) carrying a leaf flag, a sign bit and a 61-bit
//! magnitude.

use iavlx_types::{StoreError, Version};
use std::fmt;

const REL_FLAG: u64 = 1 << 63;
const LEAF_FLAG: u64 = 1 << 62;
const SIGN_FLAG: u64 = 1 << 61;
const VERSION_SHIFT: u32 = 23;
const INDEX_BITS: u32 = 23;
const VERSION_BITS: u32 = 39;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const VERSION_MASK: u64 = (1 << VERSION_BITS) - 1;
const OFFSET_MASK: u64 = SIGN_FLAG - 1;

/// Largest version representable in a [`NodeId`].
pub const MAX_VERSION: u64 = VERSION_MASK;
/// Largest per-version index representable in a [`NodeId`].
pub const MAX_INDEX: u64 = INDEX_MASK;
/// Largest magnitude of a relative offset.
pub const MAX_REL_OFFSET: i64 = OFFSET_MASK as i64;

/// Identifies one persisted node by kind, creating version and index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(u64);

impl NodeId {
    /// Packs a node id, failing when any field exceeds its bit window.
    pub fn new(is_leaf: bool, version: u64, index: u64) -> Result<Self, StoreError> {
        if version > MAX_VERSION {
            return Err(StoreError::OutOfRange(format!(
                "node version {version} exceeds {MAX_VERSION}"
            )));
        }
        if index == 0 || index > MAX_INDEX {
            return Err(StoreError::OutOfRange(format!(
                "node index {index} outside 1..={MAX_INDEX}"
            )));
        }
        let leaf = if is_leaf { LEAF_FLAG } else { 0 };
        Ok(Self(leaf | (version << VERSION_SHIFT) | index))
    }

    /// Reinterprets a raw stored value as an id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw little-endian payload.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True for the zero value, which stands for "no node".
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether this id names a leaf.
    pub const fn is_leaf(self) -> bool {
        self.0 & LEAF_FLAG != 0
    }

    /// The full 39-bit version field.
    pub const fn wide_version(self) -> u64 {
        (self.0 >> VERSION_SHIFT) & VERSION_MASK
    }

    /// The creating version. Engine versions are 32-bit; wider values saturate.
    pub fn version(self) -> Version {
        Version::try_from(self.wide_version()).unwrap_or(Version::MAX)
    }

    /// The 1-based index among the version's leaves or branches.
    pub const fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_leaf() { 'L' } else { 'B' };
        write!(f, "{kind}{}.{}", self.wide_version(), self.index())
    }
}

/// A child reference as stored in a [`crate::BranchLayout`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeRef(u64);

impl NodeRef {
    /// An absolute reference to `id`.
    pub const fn from_id(id: NodeId) -> Self {
        Self(id.0)
    }

    /// A relative pointer. For branch children `offset` is the signed distance
    /// between child and parent positions; for leaf children it is the 1-based
    /// leaf position.
    pub fn relative(is_leaf: bool, offset: i64) -> Result<Self, StoreError> {
        let magnitude = offset.unsigned_abs();
        if magnitude > OFFSET_MASK {
            return Err(StoreError::OutOfRange(format!(
                "relative offset {offset} exceeds 61 bits"
            )));
        }
        let leaf = if is_leaf { LEAF_FLAG } else { 0 };
        let sign = if offset < 0 { SIGN_FLAG } else { 0 };
        Ok(Self(REL_FLAG | leaf | sign | magnitude))
    }

    /// Reinterprets a raw stored value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw little-endian payload.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is a relative pointer.
    pub const fn is_relative(self) -> bool {
        self.0 & REL_FLAG != 0
    }

    /// Whether the referenced node is a leaf.
    pub const fn is_leaf(self) -> bool {
        self.0 & LEAF_FLAG != 0
    }

    /// The absolute id, if this is not a relative pointer.
    pub const fn as_id(self) -> Option<NodeId> {
        if self.is_relative() {
            None
        } else {
            Some(NodeId(self.0))
        }
    }

    /// The signed offset, if this is a relative pointer.
    pub const fn offset(self) -> Option<i64> {
        if !self.is_relative() {
            return None;
        }
        let magnitude = (self.0 & OFFSET_MASK) as i64;
        if self.0 & SIGN_FLAG != 0 {
            Some(-magnitude)
        } else {
            Some(magnitude)
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.as_id(), self.offset()) {
            (Some(id), _) => write!(f, "Abs({id})"),
            (None, Some(off)) => {
                let kind = if self.is_leaf() { "leaf" } else { "branch" };
                write!(f, "Rel({kind}, {off})")
            }
            (None, None) => write!(f, "Invalid({:#x})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_fields_roundtrip() {
        let id = NodeId::new(true, 42, 7).unwrap();
        assert!(id.is_leaf());
        assert_eq!(id.version(), 42);
        assert_eq!(id.index(), 7);
        assert_eq!(id.raw() >> 63, 0);

        let branch = NodeId::new(false, MAX_VERSION, MAX_INDEX).unwrap();
        assert!(!branch.is_leaf());
        assert_eq!(branch.wide_version(), MAX_VERSION);
        assert_eq!(branch.index() as u64, MAX_INDEX);
        assert_eq!(branch.to_string(), format!("B{MAX_VERSION}.{MAX_INDEX}"));
    }

    #[test]
    fn index_window_is_enforced() {
        // 2^23 - 1 is the last valid index; 2^23 overflows.
        assert!(NodeId::new(true, 1, (1 << 23) - 1).is_ok());
        assert!(matches!(
            NodeId::new(true, 1, 1 << 23),
            Err(StoreError::OutOfRange(_))
        ));
        assert!(matches!(
            NodeId::new(false, 1, 0),
            Err(StoreError::OutOfRange(_))
        ));
        assert!(matches!(
            NodeId::new(false, MAX_VERSION + 1, 1),
            Err(StoreError::OutOfRange(_))
        ));
    }

    #[test]
    fn relative_pointers_carry_sign_and_kind() {
        let back = NodeRef::relative(false, -5).unwrap();
        assert!(back.is_relative());
        assert!(!back.is_leaf());
        assert_eq!(back.offset(), Some(-5));
        assert_eq!(back.as_id(), None);

        let leaf = NodeRef::relative(true, 12).unwrap();
        assert!(leaf.is_leaf());
        assert_eq!(leaf.offset(), Some(12));

        let zero = NodeRef::relative(false, 0).unwrap();
        assert_eq!(zero.raw() & SIGN_FLAG, 0);
        assert_eq!(zero.offset(), Some(0));

        assert!(NodeRef::relative(false, MAX_REL_OFFSET).is_ok());
        assert!(NodeRef::relative(false, -MAX_REL_OFFSET).is_ok());
        assert!(matches!(
            NodeRef::relative(true, MAX_REL_OFFSET + 1),
            Err(StoreError::OutOfRange(_))
        ));
    }

    #[test]
    fn absolute_refs_unwrap_to_ids() {
        let id = NodeId::new(false, 9, 3).unwrap();
        let r = NodeRef::from_id(id);
        assert!(!r.is_relative());
        assert_eq!(r.as_id(), Some(id));
        assert_eq!(r.offset(), None);
    }

    proptest::proptest! {
        #[test]
        fn packed_fields_survive_any_valid_input(
            leaf in proptest::bool::ANY,
            version in 1..=MAX_VERSION,
            index in 1..=MAX_INDEX,
            offset in -MAX_REL_OFFSET..=MAX_REL_OFFSET,
        ) {
            let id = NodeId::new(leaf, version, index).unwrap();
            proptest::prop_assert_eq!(id.is_leaf(), leaf);
            proptest::prop_assert_eq!(id.wide_version(), version);
            proptest::prop_assert_eq!(u64::from(id.index()), index);
            proptest::prop_assert_eq!(NodeId::from_raw(id.raw()), id);

            let rel = NodeRef::relative(leaf, offset).unwrap();
            proptest::prop_assert_eq!(rel.offset(), Some(offset));
            proptest::prop_assert_eq!(rel.is_leaf(), leaf);
        }
    }
}
