// Path: crates/storage/src/writer.rs

//! Buffered appenders for record files.
//!
//! Records go through a `BufWriter`; only what has been flushed is visible
//! to a [`crate::StructMmap`] opened afterwards.

use crate::layout::Record;
use iavlx_types::StoreError;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const WRITE_BUFFER: usize = 256 * 1024;

/// Appends fixed-size records to a flat file.
pub struct StructWriter<T: Record> {
    path: PathBuf,
    out: BufWriter<File>,
    sync_handle: Arc<File>,
    count: u64,
    scratch: Vec<u8>,
    _marker: PhantomData<T>,
}

impl<T: Record> StructWriter<T> {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let sync_handle = Arc::new(file.try_clone()?);
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::with_capacity(WRITE_BUFFER, file),
            sync_handle,
            count: 0,
            scratch: Vec::with_capacity(T::SIZE),
            _marker: PhantomData,
        })
    }

    /// Appends `record` and returns its 0-based position.
    pub fn append(&mut self, record: &T) -> Result<u64, StoreError> {
        self.scratch.clear();
        record.encode(&mut self.scratch);
        if self.scratch.len() != T::SIZE {
            return Err(StoreError::Invariant(format!(
                "record encoded to {} bytes, expected {}",
                self.scratch.len(),
                T::SIZE
            )));
        }
        self.out.write_all(&self.scratch)?;
        let pos = self.count;
        self.count += 1;
        Ok(pos)
    }

    /// Number of records appended so far, flushed or not.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Bytes appended so far.
    pub fn bytes(&self) -> u64 {
        self.count * T::SIZE as u64
    }

    /// Pushes buffered records to the file.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.out.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        self.sync_handle.sync_data()?;
        Ok(())
    }

    /// A handle the background syncer can fsync independently.
    pub fn sync_handle(&self) -> Arc<File> {
        Arc::clone(&self.sync_handle)
    }

    /// The file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ChangesetInfo;

    #[test]
    fn only_flushed_records_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.dat");
        let mut w = StructWriter::<ChangesetInfo>::create(&path).unwrap();
        let info = ChangesetInfo {
            start_version: 1,
            end_version: 2,
            ..ChangesetInfo::default()
        };
        assert_eq!(w.append(&info).unwrap(), 0);
        assert_eq!(w.append(&info).unwrap(), 1);
        assert_eq!(w.count(), 2);
        assert_eq!(w.bytes(), 64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        w.sync().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);
    }
}
