// Path: crates/storage/src/kvlog.rs

//! The append-only key/value log of a changeset.
//!
//! Every record starts with a one-byte tag followed by uvarint-prefixed byte
//! strings, except the commit marker which carries a little-endian u32
//! version. Node layouts refer to records by their starting offset. The same
//! log carries the write-ahead records of the versions being built: WAL-set
//! records double as the leaf record of the node they create.

use bytes::Bytes;
use iavlx_types::varint::{put_bytes, read_uvarint, take};
use iavlx_types::{StoreError, Version};
use memmap2::Mmap;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Key-only record, used for branch keys.
pub const TAG_KEY: u8 = 0x01;
/// Key and value of a leaf.
pub const TAG_KEY_VALUE: u8 = 0x02;
/// WAL record of a set; also readable as a leaf record.
pub const TAG_WAL_SET: u8 = 0x03;
/// WAL record of a delete.
pub const TAG_WAL_DELETE: u8 = 0x04;
/// End of the WAL records of one version.
pub const TAG_COMMIT: u8 = 0x05;

const WRITE_BUFFER: usize = 256 * 1024;

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvRecord {
    /// A branch key.
    Key(Bytes),
    /// A leaf key and value.
    KeyValue {
        /// The key.
        key: Bytes,
        /// The value.
        value: Bytes,
    },
    /// A logged set.
    WalSet {
        /// The key.
        key: Bytes,
        /// The value.
        value: Bytes,
    },
    /// A logged delete.
    WalDelete {
        /// The key.
        key: Bytes,
    },
    /// All WAL records of `version` precede this marker.
    Commit(Version),
}

/// One update handed to [`KvLogWriter::write_updates`].
#[derive(Debug, Clone, Copy)]
pub enum KvUpdate<'a> {
    /// A set of `key` to `value`.
    Set {
        /// The key.
        key: &'a [u8],
        /// The value.
        value: &'a [u8],
    },
    /// A delete of `key`.
    Delete {
        /// The key.
        key: &'a [u8],
    },
}

/// Appends records to `kv.log`.
pub struct KvLogWriter {
    out: BufWriter<File>,
    sync_handle: Arc<File>,
    len: u64,
    records: u64,
    scratch: Vec<u8>,
}

impl KvLogWriter {
    /// Creates (or truncates) the log at `path`.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let sync_handle = Arc::new(file.try_clone()?);
        Ok(Self {
            out: BufWriter::with_capacity(WRITE_BUFFER, file),
            sync_handle,
            len: 0,
            records: 0,
            scratch: Vec::new(),
        })
    }

    /// Appends a key-only record.
    pub fn write_k(&mut self, key: &[u8]) -> Result<u32, StoreError> {
        self.scratch.clear();
        self.scratch.push(TAG_KEY);
        put_bytes(&mut self.scratch, key);
        self.append_scratch()
    }

    /// Appends a key/value record.
    pub fn write_kv(&mut self, key: &[u8], value: &[u8]) -> Result<u32, StoreError> {
        self.encode_pair(TAG_KEY_VALUE, key, value);
        self.append_scratch()
    }

    /// Appends WAL records. Returns, per update, the offset of a set record
    /// (usable as a leaf `key_offset`) or `None` for deletes.
    pub fn write_updates(&mut self, updates: &[KvUpdate<'_>]) -> Result<Vec<Option<u32>>, StoreError> {
        let mut offsets = Vec::with_capacity(updates.len());
        for update in updates {
            match update {
                KvUpdate::Set { key, value } => {
                    self.encode_pair(TAG_WAL_SET, key, value);
                    offsets.push(Some(self.append_scratch()?));
                }
                KvUpdate::Delete { key } => {
                    self.scratch.clear();
                    self.scratch.push(TAG_WAL_DELETE);
                    put_bytes(&mut self.scratch, key);
                    self.append_scratch()?;
                    offsets.push(None);
                }
            }
        }
        Ok(offsets)
    }

    /// Appends the commit marker of `version`.
    pub fn write_commit(&mut self, version: Version) -> Result<u64, StoreError> {
        let offset = self.len;
        self.scratch.clear();
        self.scratch.push(TAG_COMMIT);
        self.scratch.extend_from_slice(&version.to_le_bytes());
        self.out.write_all(&self.scratch)?;
        self.len += self.scratch.len() as u64;
        self.records += 1;
        Ok(offset)
    }

    /// Current log length in bytes, flushed or not.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records appended since creation.
    pub fn records(&self) -> u64 {
        self.records
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

    fn encode_pair(&mut self, tag: u8, key: &[u8], value: &[u8]) {
        self.scratch.clear();
        self.scratch.push(tag);
        put_bytes(&mut self.scratch, key);
        put_bytes(&mut self.scratch, value);
    }

    fn append_scratch(&mut self) -> Result<u32, StoreError> {
        let offset = u32::try_from(self.len).map_err(|_| {
            StoreError::OutOfRange(format!("kv log offset {} exceeds u32", self.len))
        })?;
        self.out.write_all(&self.scratch)?;
        self.len += self.scratch.len() as u64;
        self.records += 1;
        Ok(offset)
    }
}

/// Reads records from a mapped `kv.log`.
pub struct KvLogReader {
    map: RwLock<Option<Arc<Mmap>>>,
    len: u64,
    zero_copy: bool,
}

impl KvLogReader {
    /// Maps the log as it currently exists on disk.
    pub fn open(path: &Path, zero_copy: bool) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let map = if len == 0 {
            None
        } else {
            // SAFETY: the log is append-only; bytes below `len` never change.
            Some(Arc::new(unsafe { Mmap::map(&file)? }))
        };
        tracing::trace!(target: "changeset", path = %path.display(), len, "mapped kv log");
        Ok(Self {
            map: RwLock::new(map),
            len,
            zero_copy,
        })
    }

    /// Visible length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the visible log is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the key of a key, key/value or WAL-set record.
    pub fn read_k(&self, offset: u32) -> Result<Bytes, StoreError> {
        match self.read_record(u64::from(offset))?.0 {
            KvRecord::Key(key) | KvRecord::KeyValue { key, .. } | KvRecord::WalSet { key, .. } => Ok(key),
            other => Err(unexpected(offset, &other)),
        }
    }

    /// Reads the key and value of a key/value or WAL-set record.
    pub fn read_kv(&self, offset: u32) -> Result<(Bytes, Bytes), StoreError> {
        match self.read_record(u64::from(offset))?.0 {
            KvRecord::KeyValue { key, value } | KvRecord::WalSet { key, value } => Ok((key, value)),
            other => Err(unexpected(offset, &other)),
        }
    }

    /// Decodes the record at `offset`, returning it with the next offset.
    pub fn read_record(&self, offset: u64) -> Result<(KvRecord, u64), StoreError> {
        let map = self
            .map
            .read()
            .clone()
            .ok_or_else(|| StoreError::Decode(format!("kv offset {offset} in an empty or closed log")))?;
        let start = usize::try_from(offset)
            .ok()
            .filter(|s| (*s as u64) < self.len)
            .ok_or_else(|| StoreError::Decode(format!("kv offset {offset} beyond log end {}", self.len)))?;
        let full = map.get(start..).unwrap_or_default();
        let mut cursor = full;
        let tag = *take(&mut cursor, 1)?.first().unwrap_or(&0);
        let record = match tag {
            TAG_KEY => KvRecord::Key(self.field(&map, full, &mut cursor, offset)?),
            TAG_KEY_VALUE | TAG_WAL_SET => {
                let key = self.field(&map, full, &mut cursor, offset)?;
                let value = self.field(&map, full, &mut cursor, offset)?;
                if tag == TAG_KEY_VALUE {
                    KvRecord::KeyValue { key, value }
                } else {
                    KvRecord::WalSet { key, value }
                }
            }
            TAG_WAL_DELETE => KvRecord::WalDelete {
                key: self.field(&map, full, &mut cursor, offset)?,
            },
            TAG_COMMIT => {
                if cursor.len() < 4 {
                    return Err(StoreError::Truncated {
                        offset,
                        needed: (4 - cursor.len()) as u64,
                    });
                }
                let raw = take(&mut cursor, 4)?;
                let mut version = [0u8; 4];
                version.copy_from_slice(raw);
                KvRecord::Commit(Version::from_le_bytes(version))
            }
            other => {
                return Err(StoreError::Decode(format!(
                    "unexpected kv tag {other:#04x} at offset {offset}"
                )))
            }
        };
        let consumed = (full.len() - cursor.len()) as u64;
        Ok((record, offset + consumed))
    }

    /// Iterates records starting at `offset` until the end of the visible log.
    pub fn scan(&self, offset: u64) -> KvScan<'_> {
        KvScan {
            reader: self,
            offset,
            done: false,
        }
    }

    /// Releases the mapping; later reads fail.
    pub fn close(&self) {
        self.map.write().take();
    }

    fn field(
        &self,
        map: &Arc<Mmap>,
        full: &[u8],
        cursor: &mut &[u8],
        offset: u64,
    ) -> Result<Bytes, StoreError> {
        let len = read_uvarint(cursor)?;
        let len = usize::try_from(len)
            .map_err(|_| StoreError::Decode(format!("length {len} at offset {offset}")))?;
        if cursor.len() < len {
            return Err(StoreError::Truncated {
                offset,
                needed: (len - cursor.len()) as u64,
            });
        }
        let field_start = offset as usize + (full.len() - cursor.len());
        let bytes = take(cursor, len)?;
        if self.zero_copy {
            Ok(Bytes::from_owner(MapSlice {
                map: Arc::clone(map),
                start: field_start,
                end: field_start + len,
            }))
        } else {
            Ok(Bytes::copy_from_slice(bytes))
        }
    }
}

fn unexpected(offset: u32, record: &KvRecord) -> StoreError {
    StoreError::Decode(format!("unexpected record at kv offset {offset}: {record:?}"))
}

/// A window into a shared mapping that keeps the mapping alive.
struct MapSlice {
    map: Arc<Mmap>,
    start: usize,
    end: usize,
}

impl AsRef<[u8]> for MapSlice {
    fn as_ref(&self) -> &[u8] {
        self.map.get(self.start..self.end).unwrap_or_default()
    }
}

/// Sequential iterator over log records; yields `(offset, record)`.
pub struct KvScan<'a> {
    reader: &'a KvLogReader,
    offset: u64,
    done: bool,
}

impl Iterator for KvScan<'_> {
    type Item = Result<(u64, KvRecord), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.reader.len() {
            return None;
        }
        match self.reader.read_record(self.offset) {
            Ok((record, next)) => {
                let at = self.offset;
                self.offset = next;
                Some(Ok((at, record)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sample(path: &Path) -> (u32, u32, Vec<Option<u32>>, u64) {
        let mut w = KvLogWriter::create(path).unwrap();
        let k = w.write_k(b"branch-key").unwrap();
        let kv = w.write_kv(b"leaf", b"value").unwrap();
        let wal = w
            .write_updates(&[
                KvUpdate::Set {
                    key: b"a",
                    value: b"1",
                },
                KvUpdate::Delete { key: b"b" },
            ])
            .unwrap();
        let commit = w.write_commit(7).unwrap();
        w.sync().unwrap();
        (k, kv, wal, commit)
    }

    #[test]
    fn records_are_readable_at_their_offsets() {
        for zero_copy in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("kv.log");
            let (k, kv, wal, _) = write_sample(&path);
            let r = KvLogReader::open(&path, zero_copy).unwrap();

            assert_eq!(k, 0);
            assert_eq!(r.read_k(k).unwrap(), Bytes::from_static(b"branch-key"));
            assert_eq!(r.read_k(kv).unwrap(), Bytes::from_static(b"leaf"));
            let (key, value) = r.read_kv(kv).unwrap();
            assert_eq!((&key[..], &value[..]), (&b"leaf"[..], &b"value"[..]));

            let set_offset = wal[0].unwrap();
            let (key, value) = r.read_kv(set_offset).unwrap();
            assert_eq!((&key[..], &value[..]), (&b"a"[..], &b"1"[..]));
            assert_eq!(wal[1], None);
            assert!(matches!(r.read_kv(k), Err(StoreError::Decode(_))));
        }
    }

    #[test]
    fn scan_yields_every_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.log");
        let (_, _, _, commit) = write_sample(&path);
        let r = KvLogReader::open(&path, false).unwrap();
        let records: Vec<_> = r.scan(0).map(|res| res.unwrap()).collect();
        assert_eq!(records.len(), 5);
        assert!(matches!(records[3].1, KvRecord::WalDelete { .. }));
        assert_eq!(records[4], (commit, KvRecord::Commit(7)));
    }

    #[test]
    fn out_of_range_and_truncated_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.log");
        let mut w = KvLogWriter::create(&path).unwrap();
        w.write_kv(b"key", b"a-long-value").unwrap();
        w.sync().unwrap();
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 4]).unwrap();

        let r = KvLogReader::open(&path, false).unwrap();
        assert!(matches!(r.read_kv(0), Err(StoreError::Truncated { offset: 0, needed: 4 })));
        assert!(matches!(r.read_k(10_000), Err(StoreError::Decode(_))));

        std::fs::write(&path, [0x7fu8, 0x00]).unwrap();
        let r = KvLogReader::open(&path, false).unwrap();
        assert!(matches!(r.read_record(0), Err(StoreError::Decode(_))));
    }

    #[test]
    fn zero_copy_bytes_outlive_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.log");
        let (_, kv, _, _) = write_sample(&path);
        let r = KvLogReader::open(&path, true).unwrap();
        let (_, value) = r.read_kv(kv).unwrap();
        r.close();
        assert_eq!(&value[..], b"value");
        assert!(r.read_kv(kv).is_err());
    }
}
