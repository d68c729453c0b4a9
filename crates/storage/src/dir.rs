// Path: crates/storage/src/dir.rs

//! Changeset directory naming: `<start_version>` for changesets written by
//! the commit path, `<start_version>.<compacted_at>` for compaction output.

use iavlx_types::Version;
use std::fmt;
use std::path::{Path, PathBuf};

/// Append-only key/value log.
pub const KV_LOG_FILE: &str = "kv.log";
/// Array of `LeafLayout`.
pub const LEAVES_FILE: &str = "leaves.dat";
/// Array of `BranchLayout`.
pub const BRANCHES_FILE: &str = "branches.dat";
/// Array of `VersionInfo`.
pub const VERSIONS_FILE: &str = "versions.dat";
/// A single `ChangesetInfo`.
pub const INFO_FILE: &str = "info.dat";

/// The parsed name of a changeset directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangesetDir {
    /// First version the changeset covers.
    pub start_version: Version,
    /// Latest tree version at the time the changeset was compacted.
    pub compacted_at: Option<Version>,
}

impl ChangesetDir {
    /// An uncompacted changeset starting at `start_version`.
    pub fn new(start_version: Version) -> Self {
        Self {
            start_version,
            compacted_at: None,
        }
    }

    /// A compacted changeset.
    pub fn compacted(start_version: Version, compacted_at: Version) -> Self {
        Self {
            start_version,
            compacted_at: Some(compacted_at),
        }
    }

    /// Parses a directory name; returns `None` for anything else.
    pub fn parse(name: &str) -> Option<Self> {
        match name.split_once('.') {
            None => name.parse().ok().map(Self::new),
            Some((start, at)) => {
                let start = start.parse().ok()?;
                let at = at.parse().ok()?;
                Some(Self::compacted(start, at))
            }
        }
    }

    /// The directory path under `root`.
    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(self.to_string())
    }
}

impl fmt::Display for ChangesetDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.compacted_at {
            None => write!(f, "{}", self.start_version),
            Some(at) => write!(f, "{}.{}", self.start_version, at),
        }
    }
}
