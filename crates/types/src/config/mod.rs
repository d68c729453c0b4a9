// Path: crates/types/src/config/mod.rs

//! Tuning knobs for a tree store and the multi-store that hosts it.
use serde::{Deserialize, Serialize};

/// Engine options shared by every tree in a multi-store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Options {
    /// Fsync the KV log inline whenever a commit marker is written.
    #[serde(default = "default_true")]
    pub fsync_wal: bool,
    /// Seal the current changeset once its node files and KV log reach this many bytes.
    #[serde(default = "default_changeset_max_target")]
    pub changeset_max_target: u64,
    /// Nodes at this depth or deeper drop their in-memory copy after commit.
    #[serde(default = "default_evict_depth")]
    pub evict_depth: u8,
    /// Publish a shared reader over the open changeset every N versions.
    /// Zero publishes only when the changeset is sealed.
    #[serde(default = "default_reader_update_interval")]
    pub reader_update_interval: u32,
    /// Log updates into the KV log as branches are applied.
    #[serde(default = "default_true")]
    pub write_wal: bool,
    /// Compaction rewrites the KV log with live records only. When false the
    /// log is carried over byte for byte and key offsets are preserved.
    #[serde(default = "default_true")]
    pub compact_wal: bool,
    /// Never compact changesets.
    #[serde(default)]
    pub disable_compaction: bool,
    /// Persisted keys and values alias the KV log mapping instead of being copied.
    #[serde(default)]
    pub zero_copy: bool,
    /// Capacity of the WAL update channel. Negative writes the WAL inline.
    #[serde(default = "default_wal_sync_buffer")]
    pub wal_sync_buffer: i32,
    /// Minimum fraction of orphaned nodes before a changeset is compacted.
    #[serde(default = "default_compaction_orphan_ratio")]
    pub compaction_orphan_ratio: f64,
    /// Orphans must be, on average, at least this many versions old.
    #[serde(default = "default_compaction_orphan_age")]
    pub compaction_orphan_age: u32,
    /// Number of recent versions compaction keeps readable. Zero keeps all.
    #[serde(default)]
    pub retain_versions: u32,
    /// Minimum wall-clock seconds between compaction passes.
    #[serde(default = "default_min_compaction_seconds")]
    pub min_compaction_seconds: u32,
    /// Run a compaction pass every N committed versions.
    #[serde(default = "default_compact_after_versions")]
    pub compact_after_versions: u32,
}

fn default_true() -> bool {
    true
}
fn default_changeset_max_target() -> u64 {
    128 * 1024 * 1024
}
fn default_evict_depth() -> u8 {
    12
}
fn default_reader_update_interval() -> u32 {
    1
}
fn default_wal_sync_buffer() -> i32 {
    64
}
fn default_compaction_orphan_ratio() -> f64 {
    0.6
}
fn default_compaction_orphan_age() -> u32 {
    10
}
fn default_min_compaction_seconds() -> u32 {
    60
}
fn default_compact_after_versions() -> u32 {
    100
}

impl Default for Options {
    fn default() -> Self {
        Self {
            fsync_wal: true,
            changeset_max_target: default_changeset_max_target(),
            evict_depth: default_evict_depth(),
            reader_update_interval: default_reader_update_interval(),
            write_wal: true,
            compact_wal: true,
            disable_compaction: false,
            zero_copy: false,
            wal_sync_buffer: default_wal_sync_buffer(),
            compaction_orphan_ratio: default_compaction_orphan_ratio(),
            compaction_orphan_age: default_compaction_orphan_age(),
            retain_versions: 0,
            min_compaction_seconds: default_min_compaction_seconds(),
            compact_after_versions: default_compact_after_versions(),
        }
    }
}

impl Options {
    /// Options suited to unit tests: small changesets, no inline fsync and
    /// compaction checks on every version.
    pub fn for_testing() -> Self {
        Self {
            fsync_wal: false,
            changeset_max_target: 64 * 1024,
            min_compaction_seconds: 0,
            compact_after_versions: 1,
            ..Self::default()
        }
    }

    /// Whether compaction can ever drop a node under these options.
    pub fn compaction_enabled(&self) -> bool {
        !self.disable_compaction && self.retain_versions > 0
    }

    /// The oldest version compaction must keep readable once `latest` is
    /// committed. Zero means every version is kept.
    pub fn first_retained_version(&self, latest: u32) -> u32 {
        if self.retain_versions == 0 {
            0
        } else {
            (latest + 1).saturating_sub(self.retain_versions)
        }
    }
}
