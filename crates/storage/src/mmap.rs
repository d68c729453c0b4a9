// Path: crates/storage/src/mmap.rs

//! Memory-mapped views over flat record files.
//!
//! A view maps the file as it exists when opened; records appended later
//! become visible through a fresh view. Records are decoded by copy, so no
//! reference into the mapping outlives the call that produced it. The only
//! in-place mutation is the compare-to-zero store of a node's orphan version.

use crate::id::NodeId;
use crate::layout::{NodeRecord, NodeSetInfo, Record};
use iavlx_types::{StoreError, Version};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

enum MapState {
    Empty,
    Mapped(MmapMut),
    Closed,
}

/// A read view (with in-place orphan updates) over an array of `T`.
pub struct StructMmap<T: Record> {
    path: PathBuf,
    state: RwLock<MapState>,
    count: u64,
    _marker: PhantomData<T>,
}

impl<T: Record> StructMmap<T> {
    /// Maps the whole file. A trailing partial record is ignored.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let count = len / T::SIZE as u64;
        if len % T::SIZE as u64 != 0 {
            tracing::debug!(
                target: "changeset",
                path = %path.display(),
                partial = len % T::SIZE as u64,
                "ignoring partial trailing record"
            );
        }
        let state = if count == 0 {
            MapState::Empty
        } else {
            MapState::Mapped(map_file(&file)?)
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            count,
            _marker: PhantomData,
        })
    }

    /// Number of complete records visible through this view.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Whether the view holds no records.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decodes the record at 0-based position `pos`.
    pub fn get(&self, pos: u64) -> Result<T, StoreError> {
        let state = self.state.read();
        match &*state {
            MapState::Mapped(map) => {
                let bytes = record_range::<T>(pos, self.count)
                    .and_then(|range| map.get(range))
                    .ok_or_else(|| self.out_of_range(pos))?;
                T::decode(bytes)
            }
            MapState::Empty => Err(self.out_of_range(pos)),
            MapState::Closed => Err(self.closed()),
        }
    }

    /// Stores `value` into the little-endian u32 at `field` inside record `pos`
    /// if it currently reads zero. Returns whether the store happened.
    pub fn store_u32_if_zero(&self, pos: u64, field: usize, value: u32) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let count = self.count;
        match &mut *state {
            MapState::Mapped(map) => {
                let start = record_range::<T>(pos, count)
                    .map(|r| r.start + field)
                    .ok_or_else(|| self.out_of_range(pos))?;
                let slot = map
                    .get_mut(start..start + 4)
                    .ok_or_else(|| self.out_of_range(pos))?;
                let mut current = [0u8; 4];
                current.copy_from_slice(slot);
                if u32::from_le_bytes(current) != 0 {
                    return Ok(false);
                }
                slot.copy_from_slice(&value.to_le_bytes());
                Ok(true)
            }
            MapState::Empty => Err(self.out_of_range(pos)),
            MapState::Closed => Err(self.closed()),
        }
    }

    /// Msyncs the mapping.
    pub fn flush(&self) -> Result<(), StoreError> {
        if let MapState::Mapped(map) = &*self.state.read() {
            map.flush()?;
        }
        Ok(())
    }

    /// Unmaps the file. Later accesses fail with `Disposed`.
    pub fn close(&self) {
        *self.state.write() = MapState::Closed;
    }

    /// Iterates every record in file order.
    pub fn iter(&self) -> impl Iterator<Item = Result<T, StoreError>> + '_ {
        (0..self.count).map(move |pos| self.get(pos))
    }

    fn out_of_range(&self, pos: u64) -> StoreError {
        StoreError::OutOfRange(format!(
            "record {pos} beyond {} in {}",
            self.count,
            self.path.display()
        ))
    }

    fn closed(&self) -> StoreError {
        StoreError::Disposed(self.path.display().to_string())
    }
}

fn record_range<T: Record>(pos: u64, count: u64) -> Option<std::ops::Range<usize>> {
    if pos >= count {
        return None;
    }
    let start = usize::try_from(pos).ok()?.checked_mul(T::SIZE)?;
    Some(start..start + T::SIZE)
}

fn map_file(file: &File) -> Result<MmapMut, StoreError> {
    // SAFETY: changeset files are only appended to by the owning writer. The
    // one in-place mutation is the orphan column, written by
    // `store_u32_if_zero` from the cleanup thread or under the tree's writer
    // lock, so those stores never race each other. The lock taken there is
    // per view: other views of the same file may read the record while its
    // orphan field goes from zero to a version, and nothing but the cleanup
    // thread acts on that field.
    let map = unsafe { MmapMut::map_mut(file)? };
    Ok(map)
}

/// A [`StructMmap`] of node records addressable by [`NodeId`].
pub struct NodeMmap<T: NodeRecord> {
    inner: StructMmap<T>,
}

impl<T: NodeRecord> NodeMmap<T> {
    /// Maps a node file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            inner: StructMmap::open(path)?,
        })
    }

    /// The underlying record view.
    pub fn records(&self) -> &StructMmap<T> {
        &self.inner
    }

    /// Number of visible nodes.
    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    /// Whether the file holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Decodes the node at position `pos`.
    pub fn get(&self, pos: u64) -> Result<T, StoreError> {
        self.inner.get(pos)
    }

    /// Locates `id` among the nodes of its version described by `set`.
    /// Dense ranges resolve arithmetically; sparse (compacted) ranges are
    /// binary-searched by index.
    pub fn find_by_id(&self, id: NodeId, set: &NodeSetInfo) -> Result<Option<(u64, T)>, StoreError> {
        if let Some(pos) = set.position_of(id.index()) {
            let pos = u64::from(pos);
            if pos < self.len() {
                let record = self.get(pos)?;
                if record.id() == id {
                    return Ok(Some((pos, record)));
                }
            }
        }
        let mut lo = u64::from(set.start_offset);
        let mut hi = set.end_offset().min(self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = self.get(mid)?;
            match record.id().index().cmp(&id.index()) {
                std::cmp::Ordering::Equal if record.id() == id => return Ok(Some((mid, record))),
                std::cmp::Ordering::Equal => return Ok(None),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// Resolves `id`, trying the 1-based `file_idx` hint first.
    pub fn resolve(&self, id: NodeId, file_idx: u64, set: &NodeSetInfo) -> Result<(u64, T), StoreError> {
        if file_idx > 0 && file_idx <= self.len() {
            let pos = file_idx - 1;
            let record = self.get(pos)?;
            if record.id() == id {
                return Ok((pos, record));
            }
        }
        self.find_by_id(id, set)?
            .ok_or_else(|| StoreError::NotFound(format!("node {id} in {}", self.inner.path().display())))
    }

    /// Writes `orphan_version` into node `pos` unless it is already orphaned.
    pub fn mark_orphan(&self, pos: u64, orphan_version: Version) -> Result<bool, StoreError> {
        self.inner
            .store_u32_if_zero(pos, T::ORPHAN_FIELD, orphan_version)
    }

    /// Msyncs the mapping.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush()
    }

    /// Unmaps the file.
    pub fn close(&self) {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LeafLayout;
    use crate::writer::StructWriter;

    fn leaf(version: u64, index: u64) -> LeafLayout {
        LeafLayout {
            id: NodeId::new(true, version, index).unwrap(),
            key_offset: index as u32,
            orphan_version: 0,
            hash: [index as u8; 32],
        }
    }

    fn write_leaves(path: &Path, leaves: &[LeafLayout]) {
        let mut w = StructWriter::create(path).unwrap();
        for l in leaves {
            w.append(l).unwrap();
        }
        w.sync().unwrap();
    }

    #[test]
    fn view_sees_only_records_present_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaves.dat");
        let mut w = StructWriter::create(&path).unwrap();
        w.append(&leaf(1, 1)).unwrap();
        w.flush().unwrap();
        let early = StructMmap::<LeafLayout>::open(&path).unwrap();
        w.append(&leaf(1, 2)).unwrap();
        w.flush().unwrap();
        let late = StructMmap::<LeafLayout>::open(&path).unwrap();

        assert_eq!(early.len(), 1);
        assert_eq!(late.len(), 2);
        assert!(matches!(early.get(1), Err(StoreError::OutOfRange(_))));
        assert_eq!(late.get(1).unwrap(), leaf(1, 2));
    }

    #[test]
    fn empty_file_opens_without_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("branches.dat");
        write_leaves(&path, &[]);
        let view = StructMmap::<LeafLayout>::open(&path).unwrap();
        assert!(view.is_empty());
        assert!(view.get(0).is_err());
        view.flush().unwrap();
    }

    #[test]
    fn find_by_id_handles_dense_and_sparse_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaves.dat");
        // version 1: indices 1..=3 (dense); version 2: indices 2, 5, 9 (sparse)
        let leaves = [leaf(1, 1), leaf(1, 2), leaf(1, 3), leaf(2, 2), leaf(2, 5), leaf(2, 9)];
        write_leaves(&path, &leaves);
        let nodes = NodeMmap::<LeafLayout>::open(&path).unwrap();

        let v1 = NodeSetInfo::dense(0, 3);
        let v2 = NodeSetInfo {
            start_offset: 3,
            start_index: 2,
            end_index: 9,
            count: 3,
        };
        let (pos, found) = nodes.find_by_id(leaves[2].id, &v1).unwrap().unwrap();
        assert_eq!((pos, found), (2, leaves[2]));
        let (pos, _) = nodes.find_by_id(leaves[5].id, &v2).unwrap().unwrap();
        assert_eq!(pos, 5);
        let (pos, _) = nodes.find_by_id(leaves[4].id, &v2).unwrap().unwrap();
        assert_eq!(pos, 4);
        let missing = NodeId::new(true, 2, 4).unwrap();
        assert!(nodes.find_by_id(missing, &v2).unwrap().is_none());

        // A stale hint falls back to the lookup.
        let (pos, _) = nodes.resolve(leaves[3].id, 1, &v2).unwrap();
        assert_eq!(pos, 3);
        assert!(matches!(
            nodes.resolve(missing, 0, &v2),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn orphan_mark_is_compare_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaves.dat");
        write_leaves(&path, &[leaf(1, 1)]);
        let nodes = NodeMmap::<LeafLayout>::open(&path).unwrap();
        assert!(nodes.mark_orphan(0, 7).unwrap());
        assert!(!nodes.mark_orphan(0, 9).unwrap());
        nodes.flush().unwrap();
        assert_eq!(nodes.get(0).unwrap().orphan_version, 7);

        // A second view of the same file observes the store.
        let again = NodeMmap::<LeafLayout>::open(&path).unwrap();
        assert_eq!(again.get(0).unwrap().orphan_version, 7);

        nodes.close();
        assert!(matches!(nodes.get(0), Err(StoreError::Disposed(_))));
    }
}
