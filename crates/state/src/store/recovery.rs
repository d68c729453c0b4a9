// Path: crates/state/src/store/recovery.rs

//! Reconstructs a tree directory on open: picks one directory per start
//! version, opens the changesets and extracts the write-ahead records of a
//! version that was logged but never saved.

use crate::changeset::Changeset;
use bytes::Bytes;
use iavlx_storage::{ChangesetDir, KvLogReader, KvRecord};
use iavlx_types::{Result, StoreError, Version};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// One logged update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEntry {
    /// A set of key to value.
    Set(Bytes, Bytes),
    /// A delete of key.
    Delete(Bytes),
}

/// The updates of the version after the last saved one, recovered from the
/// KV log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalTail {
    /// The version the updates belong to.
    pub version: Version,
    /// Updates in the order they were applied.
    pub entries: Vec<WalEntry>,
}

/// The on-disk state found by [`load`].
pub(crate) struct Loaded {
    pub changesets: BTreeMap<Version, Arc<Changeset>>,
    pub latest: Version,
    pub wal_tail: Option<WalTail>,
}

/// Opens every changeset under `root`.
pub(crate) fn load(root: &Path, zero_copy: bool) -> Result<Loaded> {
    let mut changesets = BTreeMap::new();
    for name in select_dirs(root)?.into_values() {
        let cs = Changeset::open(root, name, zero_copy)?;
        changesets.insert(name.start_version, Arc::new(cs));
    }

    let mut wal_tail = None;
    let last = changesets.iter().next_back().map(|(start, cs)| (*start, Arc::clone(cs)));
    if let Some((start, last)) = last {
        if last.versions().is_empty() {
            // A writer that logged updates but never saved a version.
            wal_tail = scan_tail(last.kv(), start.saturating_sub(1), true)?;
            changesets.remove(&start);
            last.close_files();
            fs::remove_dir_all(last.dir())?;
            tracing::info!(
                target: "wal",
                changeset = %last.name(),
                recovered = wal_tail.is_some(),
                "removed changeset without saved versions"
            );
        } else {
            wal_tail = scan_tail(last.kv(), last.end_version(), false)?;
        }
    }

    // The first changeset may start past version 1 when the tree was
    // imported; every later one must continue its predecessor.
    let mut expected: Option<Version> = None;
    for cs in changesets.values() {
        if let Some(expected) = expected.filter(|e| *e != cs.start_version()) {
            return Err(StoreError::Invariant(format!(
                "changeset {} does not continue version {}",
                cs.name(),
                expected.saturating_sub(1)
            )));
        }
        expected = Some(cs.end_version() + 1);
    }
    Ok(Loaded {
        latest: expected.map_or(0, |e| e - 1),
        changesets,
        wal_tail,
    })
}

/// Lists changeset directories, keeping the newest compaction of every
/// start version and deleting superseded or half-written ones.
fn select_dirs(root: &Path) -> Result<BTreeMap<Version, ChangesetDir>> {
    let mut chosen: BTreeMap<Version, ChangesetDir> = BTreeMap::new();
    let mut stale = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.ends_with(".tmp") {
            stale.push(entry.path());
            continue;
        }
        let Some(parsed) = ChangesetDir::parse(name) else {
            continue;
        };
        match chosen.get(&parsed.start_version) {
            Some(current) if current.compacted_at >= parsed.compacted_at => {
                stale.push(parsed.path_in(root));
            }
            Some(current) => {
                stale.push(current.path_in(root));
                chosen.insert(parsed.start_version, parsed);
            }
            None => {
                chosen.insert(parsed.start_version, parsed);
            }
        }
    }
    for path in stale {
        tracing::info!(target: "changeset", dir = %path.display(), "removing superseded changeset directory");
        fs::remove_dir_all(&path)?;
    }
    Ok(chosen)
}

/// Collects the updates logged for `saved + 1`: the records after the last
/// commit marker of `saved` (or from the start of the log) up to the marker
/// of `saved + 1` that follows it. A failed commit is voided by repeating
/// the marker of `saved`, so the whole log is scanned and every such marker
/// restarts collection and forgets a batch found earlier. Without a closing
/// marker nothing is recovered.
pub(crate) fn scan_tail(kv: &KvLogReader, saved: Version, from_start: bool) -> Result<Option<WalTail>> {
    let target = saved + 1;
    let mut collecting = from_start;
    let mut entries = Vec::new();
    let mut found = None;
    for item in kv.scan(0) {
        let (offset, record) = match item {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(target: "wal", error = %e, "stopping at unreadable log tail");
                break;
            }
        };
        match record {
            KvRecord::Commit(v) if v == saved => {
                collecting = true;
                entries.clear();
                found = None;
            }
            KvRecord::Commit(v) if v == target && collecting => {
                tracing::debug!(target: "wal", version = v, offset, records = entries.len(), "found logged version");
                collecting = false;
                found = Some(WalTail {
                    version: target,
                    entries: std::mem::take(&mut entries),
                });
            }
            KvRecord::WalSet { key, value } if collecting => entries.push(WalEntry::Set(key, value)),
            KvRecord::WalDelete { key } if collecting => entries.push(WalEntry::Delete(key)),
            _ => {}
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iavlx_storage::{KvLogWriter, KvUpdate};

    fn log(path: &Path, f: impl FnOnce(&mut KvLogWriter)) -> KvLogReader {
        let mut w = KvLogWriter::create(path).unwrap();
        f(&mut w);
        w.sync().unwrap();
        KvLogReader::open(path, false).unwrap()
    }

    #[test]
    fn collects_records_between_markers() {
        let dir = tempfile::tempdir().unwrap();
        let kv = log(&dir.path().join("kv.log"), |w| {
            w.write_updates(&[KvUpdate::Set { key: b"a", value: b"1" }]).unwrap();
            w.write_commit(4).unwrap();
            w.write_kv(b"leaf", b"x").unwrap();
            w.write_updates(&[
                KvUpdate::Set { key: b"b", value: b"2" },
                KvUpdate::Delete { key: b"a" },
            ])
            .unwrap();
            w.write_commit(5).unwrap();
            w.write_updates(&[KvUpdate::Set { key: b"c", value: b"3" }]).unwrap();
        });
        let tail = scan_tail(&kv, 4, false).unwrap().unwrap();
        assert_eq!(tail.version, 5);
        assert_eq!(
            tail.entries,
            vec![
                WalEntry::Set(Bytes::from_static(b"b"), Bytes::from_static(b"2")),
                WalEntry::Delete(Bytes::from_static(b"a")),
            ]
        );
        // Records after the last marker are never replayed.
        assert_eq!(scan_tail(&kv, 5, false).unwrap(), None);
    }

    #[test]
    fn voided_batches_are_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let kv = log(&dir.path().join("kv.log"), |w| {
            w.write_commit(4).unwrap();
            w.write_updates(&[KvUpdate::Set { key: b"a", value: b"1" }]).unwrap();
            w.write_commit(5).unwrap();
            // The commit of 5 failed and was voided; the retry follows.
            w.write_commit(4).unwrap();
            w.write_updates(&[KvUpdate::Set { key: b"b", value: b"2" }]).unwrap();
            w.write_commit(5).unwrap();
        });
        let tail = scan_tail(&kv, 4, false).unwrap().unwrap();
        assert_eq!(tail.version, 5);
        assert_eq!(
            tail.entries,
            vec![WalEntry::Set(Bytes::from_static(b"b"), Bytes::from_static(b"2"))]
        );

        // A voided batch without a retry leaves nothing to replay.
        let kv = log(&dir.path().join("kv2.log"), |w| {
            w.write_commit(4).unwrap();
            w.write_updates(&[KvUpdate::Set { key: b"a", value: b"1" }]).unwrap();
            w.write_commit(5).unwrap();
            w.write_commit(4).unwrap();
            w.write_updates(&[KvUpdate::Set { key: b"b", value: b"2" }]).unwrap();
        });
        assert_eq!(scan_tail(&kv, 4, false).unwrap(), None);
    }

    #[test]
    fn voided_batches_of_a_fresh_log_are_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let kv = log(&dir.path().join("kv.log"), |w| {
            w.write_updates(&[KvUpdate::Set { key: b"a", value: b"1" }]).unwrap();
            w.write_commit(1).unwrap();
            w.write_commit(0).unwrap();
            w.write_updates(&[KvUpdate::Delete { key: b"a" }]).unwrap();
            w.write_commit(1).unwrap();
        });
        let tail = scan_tail(&kv, 0, true).unwrap().unwrap();
        assert_eq!(tail.entries, vec![WalEntry::Delete(Bytes::from_static(b"a"))]);
    }

    #[test]
    fn scans_from_the_start_of_a_fresh_log() {
        let dir = tempfile::tempdir().unwrap();
        let kv = log(&dir.path().join("kv.log"), |w| {
            w.write_updates(&[KvUpdate::Set { key: b"a", value: b"1" }]).unwrap();
            w.write_commit(1).unwrap();
        });
        let tail = scan_tail(&kv, 0, true).unwrap().unwrap();
        assert_eq!(tail.version, 1);
        assert_eq!(tail.entries.len(), 1);
    }

    #[test]
    fn select_dirs_prefers_the_newest_compaction() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1", "1.9", "1.4", "10", "3.tmp", "LOCK-not-a-dir"] {
            if name.starts_with("LOCK") {
                fs::write(dir.path().join(name), b"").unwrap();
            } else {
                fs::create_dir(dir.path().join(name)).unwrap();
            }
        }
        let chosen = select_dirs(dir.path()).unwrap();
        assert_eq!(
            chosen.values().copied().collect::<Vec<_>>(),
            vec![ChangesetDir::compacted(1, 9), ChangesetDir::new(10)]
        );
        assert!(!dir.path().join("1").exists());
        assert!(!dir.path().join("1.4").exists());
        assert!(!dir.path().join("3.tmp").exists());
    }
}
