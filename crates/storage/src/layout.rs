// Path: crates/storage/src/layout.rs

//! Fixed-size little-endian records stored in changeset files.
//!
//! Every record implements [`Record`]; encoding always produces exactly
//! `SIZE` bytes so a file of records can be addressed by position.

use crate::id::{NodeId, NodeRef};
use iavlx_types::hash::Hash;
use iavlx_types::varint::take;
use iavlx_types::{StoreError, Version};

/// A fixed-size record that lives in a flat array file.
pub trait Record: Sized + Copy + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Appends exactly `SIZE` bytes to `out`.
    fn encode(&self, out: &mut Vec<u8>);
    /// Decodes a record from the first `SIZE` bytes of `bytes`.
    fn decode(bytes: &[u8]) -> Result<Self, StoreError>;
}

/// A node record: addressable by id and carrying an in-place orphan field.
pub trait NodeRecord: Record {
    /// Byte offset of the `orphan_version` field inside the record.
    const ORPHAN_FIELD: usize;
    /// The node's id.
    fn id(&self) -> NodeId;
    /// The version at which the node was orphaned, or zero.
    fn orphan_version(&self) -> Version;
}

struct Fields<'a>(&'a [u8]);

impl<'a> Fields<'a> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], StoreError> {
        let raw = take(&mut self.0, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8, StoreError> {
        Ok(u8::from_le_bytes(self.bytes::<1>()?))
    }
    fn u32(&mut self) -> Result<u32, StoreError> {
        Ok(u32::from_le_bytes(self.bytes::<4>()?))
    }
    fn u64(&mut self) -> Result<u64, StoreError> {
        Ok(u64::from_le_bytes(self.bytes::<8>()?))
    }
    fn skip(&mut self, n: usize) -> Result<(), StoreError> {
        take(&mut self.0, n).map(|_| ())
    }
}

/// A persisted leaf: 48 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeafLayout {
    /// The leaf's id.
    pub id: NodeId,
    /// Offset of the KV (or WAL-set) record holding key and value.
    pub key_offset: u32,
    /// Version at which this leaf was superseded, or zero while live.
    pub orphan_version: Version,
    /// The leaf hash.
    pub hash: Hash,
}

impl Record for LeafLayout {
    const SIZE: usize = 48;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.raw().to_le_bytes());
        out.extend_from_slice(&self.key_offset.to_le_bytes());
        out.extend_from_slice(&self.orphan_version.to_le_bytes());
        out.extend_from_slice(&self.hash);
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut f = Fields(bytes);
        Ok(Self {
            id: NodeId::from_raw(f.u64()?),
            key_offset: f.u32()?,
            orphan_version: f.u32()?,
            hash: f.bytes::<32>()?,
        })
    }
}

impl NodeRecord for LeafLayout {
    const ORPHAN_FIELD: usize = 12;

    fn id(&self) -> NodeId {
        self.id
    }
    fn orphan_version(&self) -> Version {
        self.orphan_version
    }
}

/// A persisted branch: 88 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BranchLayout {
    /// The branch's id.
    pub id: NodeId,
    /// Left child reference.
    pub left: NodeRef,
    /// Right child reference.
    pub right: NodeRef,
    /// 1-based position hint of the left child in its own changeset, or zero.
    pub left_abs_offset: u64,
    /// 1-based position hint of the right child in its own changeset, or zero.
    pub right_abs_offset: u64,
    /// Offset of the record holding the branch key.
    pub key_offset: u32,
    /// Subtree height.
    pub height: u8,
    /// Number of leaves below this branch.
    pub size: u32,
    /// Version at which this branch was superseded, or zero while live.
    pub orphan_version: Version,
    /// The branch hash.
    pub hash: Hash,
}

impl Record for BranchLayout {
    const SIZE: usize = 88;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.raw().to_le_bytes());
        out.extend_from_slice(&self.left.raw().to_le_bytes());
        out.extend_from_slice(&self.right.raw().to_le_bytes());
        out.extend_from_slice(&self.left_abs_offset.to_le_bytes());
        out.extend_from_slice(&self.right_abs_offset.to_le_bytes());
        out.extend_from_slice(&self.key_offset.to_le_bytes());
        out.push(self.height);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.orphan_version.to_le_bytes());
        out.extend_from_slice(&self.hash);
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut f = Fields(bytes);
        let id = NodeId::from_raw(f.u64()?);
        let left = NodeRef::from_raw(f.u64()?);
        let right = NodeRef::from_raw(f.u64()?);
        let left_abs_offset = f.u64()?;
        let right_abs_offset = f.u64()?;
        let key_offset = f.u32()?;
        let height = f.u8()?;
        f.skip(3)?;
        Ok(Self {
            id,
            left,
            right,
            left_abs_offset,
            right_abs_offset,
            key_offset,
            height,
            size: f.u32()?,
            orphan_version: f.u32()?,
            hash: f.bytes::<32>()?,
        })
    }
}

impl NodeRecord for BranchLayout {
    const ORPHAN_FIELD: usize = 52;

    fn id(&self) -> NodeId {
        self.id
    }
    fn orphan_version(&self) -> Version {
        self.orphan_version
    }
}

/// Bounds of one version's nodes inside a leaf or branch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeSetInfo {
    /// Position of the version's first node in the file.
    pub start_offset: u32,
    /// Index of the first node (1 when dense, 0 when empty).
    pub start_index: u32,
    /// Index of the last node.
    pub end_index: u32,
    /// Number of nodes stored for the version.
    pub count: u32,
}

impl NodeSetInfo {
    /// A dense 1..=count range starting at `start_offset`.
    pub fn dense(start_offset: u32, count: u32) -> Self {
        if count == 0 {
            return Self {
                start_offset,
                ..Self::default()
            };
        }
        Self {
            start_offset,
            start_index: 1,
            end_index: count,
            count,
        }
    }

    /// True when every index in `start_index..=end_index` is present, which
    /// allows direct position arithmetic.
    pub fn is_dense(&self) -> bool {
        self.count > 0 && self.end_index.checked_sub(self.start_index) == Some(self.count - 1)
    }

    /// Direct position of `index` for dense ranges.
    pub fn position_of(&self, index: u32) -> Option<u32> {
        if self.is_dense() && index >= self.start_index && index <= self.end_index {
            Some(self.start_offset + (index - self.start_index))
        } else {
            None
        }
    }

    /// One past the last position of the range.
    pub fn end_offset(&self) -> u64 {
        u64::from(self.start_offset) + u64::from(self.count)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start_offset.to_le_bytes());
        out.extend_from_slice(&self.start_index.to_le_bytes());
        out.extend_from_slice(&self.end_index.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    fn decode(f: &mut Fields<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            start_offset: f.u32()?,
            start_index: f.u32()?,
            end_index: f.u32()?,
            count: f.u32()?,
        })
    }
}

/// Per-version index entry: 48 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionInfo {
    /// Leaf range of the version.
    pub leaves: NodeSetInfo,
    /// Branch range of the version.
    pub branches: NodeSetInfo,
    /// Root id, or the empty id for an empty tree.
    pub root_id: NodeId,
    /// The version this entry describes.
    pub version: Version,
    /// `VersionInfo::PRUNED` when compaction dropped the version's root.
    pub flags: u32,
}

impl VersionInfo {
    /// The version's root is no longer readable.
    pub const PRUNED: u32 = 1;

    /// Whether the version's root was dropped by compaction.
    pub fn is_pruned(&self) -> bool {
        self.flags & Self::PRUNED != 0
    }

    /// The node range of the requested kind.
    pub fn nodes(&self, is_leaf: bool) -> &NodeSetInfo {
        if is_leaf {
            &self.leaves
        } else {
            &self.branches
        }
    }
}

impl Record for VersionInfo {
    const SIZE: usize = 48;

    fn encode(&self, out: &mut Vec<u8>) {
        self.leaves.encode(out);
        self.branches.encode(out);
        out.extend_from_slice(&self.root_id.raw().to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut f = Fields(bytes);
        Ok(Self {
            leaves: NodeSetInfo::decode(&mut f)?,
            branches: NodeSetInfo::decode(&mut f)?,
            root_id: NodeId::from_raw(f.u64()?),
            version: f.u32()?,
            flags: f.u32()?,
        })
    }
}

/// Mutable per-changeset summary: 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangesetInfo {
    /// First version stored.
    pub start_version: Version,
    /// Last version stored.
    pub end_version: Version,
    /// Number of orphaned leaves.
    pub leaf_orphans: u32,
    /// Number of orphaned branches.
    pub branch_orphans: u32,
    /// Sum of orphan versions over orphaned leaves.
    pub leaf_orphan_version_total: u64,
    /// Sum of orphan versions over orphaned branches.
    pub branch_orphan_version_total: u64,
}

impl ChangesetInfo {
    /// Records one orphan of the given kind.
    pub fn add_orphan(&mut self, is_leaf: bool, orphan_version: Version) {
        if is_leaf {
            self.leaf_orphans += 1;
            self.leaf_orphan_version_total += u64::from(orphan_version);
        } else {
            self.branch_orphans += 1;
            self.branch_orphan_version_total += u64::from(orphan_version);
        }
    }

    /// Total orphaned nodes.
    pub fn orphans(&self) -> u64 {
        u64::from(self.leaf_orphans) + u64::from(self.branch_orphans)
    }

    /// Whether a changeset holding `total_nodes` nodes is worth rewriting:
    /// the orphan ratio reaches `orphan_ratio_target` and the average orphan
    /// version is at or below `orphan_version_target`.
    pub fn ready_to_compact(
        &self,
        total_nodes: u64,
        orphan_ratio_target: f64,
        orphan_version_target: Version,
    ) -> bool {
        let orphans = self.orphans();
        if orphans == 0 || total_nodes == 0 {
            return false;
        }
        let ratio = orphans as f64 / total_nodes as f64;
        let average =
            (self.leaf_orphan_version_total + self.branch_orphan_version_total) / orphans;
        ratio >= orphan_ratio_target && average <= u64::from(orphan_version_target)
    }
}

impl Record for ChangesetInfo {
    const SIZE: usize = 32;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start_version.to_le_bytes());
        out.extend_from_slice(&self.end_version.to_le_bytes());
        out.extend_from_slice(&self.leaf_orphans.to_le_bytes());
        out.extend_from_slice(&self.branch_orphans.to_le_bytes());
        out.extend_from_slice(&self.leaf_orphan_version_total.to_le_bytes());
        out.extend_from_slice(&self.branch_orphan_version_total.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut f = Fields(bytes);
        Ok(Self {
            start_version: f.u32()?,
            end_version: f.u32()?,
            leaf_orphans: f.u32()?,
            branch_orphans: f.u32()?,
            leaf_orphan_version_total: f.u64()?,
            branch_orphan_version_total: f.u64()?,
        })
    }
}

const _: () = assert!(LeafLayout::SIZE == 48);
const _: () = assert!(BranchLayout::SIZE == 88);
const _: () = assert!(VersionInfo::SIZE == 48);
const _: () = assert!(ChangesetInfo::SIZE == 32);

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<T: Record>(rec: &T) -> Vec<u8> {
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        assert_eq!(buf.len(), T::SIZE);
        buf
    }

    #[test]
    fn branch_fields_land_at_fixed_offsets() {
        let layout = BranchLayout {
            id: NodeId::new(false, 3, 2).unwrap(),
            left: NodeRef::relative(false, -1).unwrap(),
            right: NodeRef::relative(true, 4).unwrap(),
            left_abs_offset: 10,
            right_abs_offset: 11,
            key_offset: 0xAABBCCDD,
            height: 2,
            size: 3,
            orphan_version: 9,
            hash: [7u8; 32],
        };
        let buf = encoded(&layout);
        assert_eq!(&buf[40..44], &0xAABBCCDDu32.to_le_bytes());
        assert_eq!(buf[44], 2);
        assert_eq!(&buf[48..52], &3u32.to_le_bytes());
        assert_eq!(&buf[52..56], &9u32.to_le_bytes());
        assert_eq!(&buf[56..88], &[7u8; 32]);
        assert_eq!(BranchLayout::decode(&buf).unwrap(), layout);
    }

    #[test]
    fn leaf_orphan_field_offset() {
        let layout = LeafLayout {
            id: NodeId::new(true, 1, 1).unwrap(),
            key_offset: 5,
            orphan_version: 0x01020304,
            hash: [1u8; 32],
        };
        let buf = encoded(&layout);
        let at = LeafLayout::ORPHAN_FIELD;
        assert_eq!(&buf[at..at + 4], &0x01020304u32.to_le_bytes());
        assert_eq!(LeafLayout::decode(&buf).unwrap(), layout);
    }

    #[test]
    fn short_input_is_a_decode_error() {
        assert!(matches!(
            LeafLayout::decode(&[0u8; 47]),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn dense_ranges_map_indices_to_positions() {
        let set = NodeSetInfo::dense(100, 5);
        assert!(set.is_dense());
        assert_eq!(set.position_of(1), Some(100));
        assert_eq!(set.position_of(5), Some(104));
        assert_eq!(set.position_of(6), None);

        let sparse = NodeSetInfo {
            start_offset: 0,
            start_index: 2,
            end_index: 9,
            count: 3,
        };
        assert!(!sparse.is_dense());
        assert_eq!(sparse.position_of(2), None);
        assert!(!NodeSetInfo::dense(7, 0).is_dense());
    }

    #[test]
    fn compaction_threshold_uses_ratio_and_average_version() {
        let mut info = ChangesetInfo::default();
        assert!(!info.ready_to_compact(10, 0.5, 100));
        for v in [2, 4, 6, 8, 10, 12] {
            info.add_orphan(v % 4 == 0, v);
        }
        assert_eq!(info.orphans(), 6);
        // ratio 0.6, average orphan version 7
        assert!(info.ready_to_compact(10, 0.6, 7));
        assert!(!info.ready_to_compact(10, 0.7, 7));
        assert!(!info.ready_to_compact(10, 0.6, 6));
    }
}
