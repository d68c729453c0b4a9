// Path: crates/telemetry/src/sinks.rs
//! Defines abstract traits for metrics reporting, decoupling core logic from the backend.

use once_cell::sync::OnceCell;

// --- Static Sink Access ---

/// A no-op sink for use in tests or when telemetry is disabled.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// A lazily-initialized static reference to the global `MetricsSink` implementation.
pub static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

/// Returns a static reference to the configured storage metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn storage_metrics() -> &'static dyn StorageMetricsSink {
    match SINK.get() {
        Some(sink) => sink.as_storage(),
        None => &NOP_SINK,
    }
}

/// Returns a static reference to the configured error metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn error_metrics() -> &'static dyn ErrorMetricsSink {
    match SINK.get() {
        Some(sink) => sink.as_error(),
        None => &NOP_SINK,
    }
}

// --- Trait Definitions ---

/// A sink for metrics related to tree commits and changeset persistence.
pub trait StorageMetricsSink: Send + Sync + std::fmt::Debug {
    /// Observes the wall time of one tree commit.
    fn observe_commit_duration(&self, duration_secs: f64);
    /// Increments the total number of tree commits.
    fn inc_commits_total(&self);
    /// Increments the total number of bytes appended to changeset files.
    fn inc_bytes_written_total(&self, bytes: u64);
    /// Increments the total number of nodes marked as orphans.
    fn inc_orphans_marked(&self, count: u64);
    /// Increments the number of changesets sealed.
    fn inc_changesets_sealed(&self);
    /// Increments the number of changesets rewritten by compaction.
    fn inc_changesets_compacted(&self);
    /// Increments the number of changesets whose files were released.
    fn inc_changesets_disposed(&self);
    /// Increments the number of in-memory nodes released by eviction.
    fn inc_nodes_evicted(&self, count: u64);
    /// Increments the number of WAL records appended.
    fn inc_wal_records(&self, count: u64);
    /// Increments the number of versions recovered from the WAL on open.
    fn inc_wal_replays(&self);
}
impl StorageMetricsSink for NopSink {
    fn observe_commit_duration(&self, _duration_secs: f64) {}
    fn inc_commits_total(&self) {}
    fn inc_bytes_written_total(&self, _bytes: u64) {}
    fn inc_orphans_marked(&self, _count: u64) {}
    fn inc_changesets_sealed(&self) {}
    fn inc_changesets_compacted(&self) {}
    fn inc_changesets_disposed(&self) {}
    fn inc_nodes_evicted(&self, _count: u64) {}
    fn inc_wal_records(&self, _count: u64) {}
    fn inc_wal_replays(&self) {}
}

/// A sink for tracking errors by kind and variant.
pub trait ErrorMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments a counter for a specific error type.
    fn inc_error(&self, kind: &'static str, variant: &'static str);
}
impl ErrorMetricsSink for NopSink {
    fn inc_error(&self, _kind: &'static str, _variant: &'static str) {}
}

/// A unified sink that implements all domain-specific traits, providing a single
/// point of implementation for metrics backends like Prometheus.
pub trait MetricsSink: StorageMetricsSink + ErrorMetricsSink {
    /// Views this sink as a storage sink.
    fn as_storage(&self) -> &dyn StorageMetricsSink;
    /// Views this sink as an error sink.
    fn as_error(&self) -> &dyn ErrorMetricsSink;
}

// Blanket implementation to allow any type that implements all sub-traits
// to be used as a `MetricsSink`.
impl<T> MetricsSink for T
where
    T: StorageMetricsSink + ErrorMetricsSink,
{
    fn as_storage(&self) -> &dyn StorageMetricsSink {
        self
    }
    fn as_error(&self) -> &dyn ErrorMetricsSink {
        self
    }
}
