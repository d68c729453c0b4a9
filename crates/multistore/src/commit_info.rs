// Path: crates/multistore/src/commit_info.rs

//! Per-version commit info files under `<dir>/commit_info/<version>`.
//!
//! Layout: `version u32 LE`, `timestamp u64 LE` (unix nanos), `count u32 LE`,
//! then `count` length-prefixed store names followed by `count`
//! length-prefixed store hashes, both in name order.

use iavlx_types::varint::{put_bytes, read_bytes, take};
use iavlx_types::{CommitId, CommitInfo, Result, StoreError, StoreInfo, Version};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub(crate) const COMMIT_INFO_DIR: &str = "commit_info";

fn info_dir(root: &Path) -> PathBuf {
    root.join(COMMIT_INFO_DIR)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(take(cursor, 4)?);
    Ok(u32::from_le_bytes(raw))
}

fn read_u64(cursor: &mut &[u8]) -> Result<u64> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(take(cursor, 8)?);
    Ok(u64::from_le_bytes(raw))
}

/// Serializes `info` with its store infos sorted by name.
pub fn encode(info: &CommitInfo) -> Result<Vec<u8>> {
    let mut infos: Vec<&StoreInfo> = info.store_infos.iter().collect();
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    let count = u32::try_from(infos.len())
        .map_err(|_| StoreError::OutOfRange(format!("{} store infos", infos.len())))?;

    let mut out = Vec::with_capacity(16 + infos.len() * 48);
    out.extend_from_slice(&info.version.to_le_bytes());
    out.extend_from_slice(&info.timestamp_nanos.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    for si in &infos {
        put_bytes(&mut out, si.name.as_bytes());
    }
    for si in &infos {
        put_bytes(&mut out, &si.commit_id.hash);
    }
    Ok(out)
}

/// Parses a commit info file body.
pub fn decode(mut bytes: &[u8]) -> Result<CommitInfo> {
    let cursor = &mut bytes;
    let version = read_u32(cursor)?;
    let timestamp_nanos = read_u64(cursor)?;
    let count = read_u32(cursor)?;
    let mut names = Vec::new();
    for _ in 0..count {
        let name = read_bytes(cursor)?;
        let name = std::str::from_utf8(name)
            .map_err(|e| StoreError::Decode(format!("store name: {e}")))?;
        names.push(name.to_owned());
    }
    let mut store_infos = Vec::with_capacity(names.len());
    for name in names {
        let hash = read_bytes(cursor)?;
        store_infos.push(StoreInfo {
            name,
            commit_id: CommitId::new(version, hash.to_vec()),
        });
    }
    if !cursor.is_empty() {
        return Err(StoreError::Decode(format!(
            "{} trailing bytes after commit info {version}",
            cursor.len()
        )));
    }
    Ok(CommitInfo {
        version,
        timestamp_nanos,
        store_infos,
    })
}

/// Writes and fsyncs the commit info of `info.version`.
pub(crate) fn write(root: &Path, info: &CommitInfo) -> Result<()> {
    let dir = info_dir(root);
    fs::create_dir_all(&dir)?;
    let body = encode(info)?;
    let tmp = dir.join(format!("{}.tmp", info.version));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(info.version.to_string()))?;
    Ok(())
}

/// Reads the commit info of `version`.
pub(crate) fn load(root: &Path, version: Version) -> Result<CommitInfo> {
    let path = info_dir(root).join(version.to_string());
    let body = match fs::read(&path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(format!("commit info for version {version}")))
        }
        Err(e) => return Err(e.into()),
    };
    let info = decode(&body)?;
    if info.version != version {
        return Err(StoreError::Decode(format!(
            "commit info file {} holds version {}",
            path.display(),
            info.version
        )));
    }
    Ok(info)
}

/// Versions with a commit info file, ascending.
pub(crate) fn versions(root: &Path) -> Result<Vec<Version>> {
    let dir = info_dir(root);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(version) = entry.file_name().to_str().and_then(|n| n.parse::<Version>().ok()) {
            versions.push(version);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

/// The highest-numbered commit info, if any.
pub(crate) fn load_latest(root: &Path) -> Result<Option<CommitInfo>> {
    match versions(root)?.last() {
        Some(version) => load(root, *version).map(Some),
        None => Ok(None),
    }
}

/// Deletes commit info files of versions before `first_retained`.
pub(crate) fn prune(root: &Path, first_retained: Version) -> Result<usize> {
    let dir = info_dir(root);
    let mut removed = 0;
    for version in versions(root)?.into_iter().take_while(|v| *v < first_retained) {
        fs::remove_file(dir.join(version.to_string()))?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: Version) -> CommitInfo {
        CommitInfo {
            version,
            timestamp_nanos: 1_700_000_000_000_000_000,
            store_infos: vec![
                StoreInfo {
                    name: "bank".into(),
                    commit_id: CommitId::new(version, vec![2; 32]),
                },
                StoreInfo {
                    name: "acc".into(),
                    commit_id: CommitId::new(version, vec![1; 32]),
                },
            ],
        }
    }

    #[test]
    fn header_layout_is_fixed() {
        let body = encode(&sample(7)).unwrap();
        assert_eq!(&body[..4], &7u32.to_le_bytes());
        assert_eq!(&body[12..16], &2u32.to_le_bytes());
        // Names come first, sorted.
        assert_eq!(&body[16..20], b"\x03acc");
        let decoded = decode(&body).unwrap();
        assert_eq!(decoded.store_infos[0].name, "acc");
        assert_eq!(decoded.store_infos[1].commit_id.hash, vec![2; 32]);
        assert_eq!(decoded.hash(), sample(7).hash());
    }

    #[test]
    fn truncated_files_are_rejected() {
        let body = encode(&sample(3)).unwrap();
        assert!(decode(&body[..body.len() - 1]).is_err());
        let mut longer = body.clone();
        longer.push(0);
        assert!(decode(&longer).is_err());
    }

    #[test]
    fn latest_and_prune_follow_file_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_latest(dir.path()).unwrap().is_none());
        for v in [1, 2, 10] {
            write(dir.path(), &sample(v)).unwrap();
        }
        fs::write(info_dir(dir.path()).join("notes"), b"x").unwrap();
        assert_eq!(load_latest(dir.path()).unwrap().unwrap().version, 10);
        assert_eq!(prune(dir.path(), 3).unwrap(), 2);
        assert_eq!(versions(dir.path()).unwrap(), vec![10]);
        assert!(matches!(load(dir.path(), 1), Err(StoreError::NotFound(_))));
    }
}
