// Path: crates/telemetry/src/prometheus.rs
//! A concrete implementation of the metrics sinks using the Prometheus crate.

use crate::sinks::*;
use once_cell::sync::OnceCell;
use prometheus::{
    exponential_buckets, register_histogram, register_int_counter, register_int_counter_vec,
    Histogram, IntCounter, IntCounterVec,
};

// --- Metric Statics ---
// Collectors are initialized exactly once by `install`.

static COMMIT_DURATION_SECONDS: OnceCell<Histogram> = OnceCell::new();
static COMMITS_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static BYTES_WRITTEN_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static ORPHANS_MARKED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static CHANGESETS_SEALED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static CHANGESETS_COMPACTED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static CHANGESETS_DISPOSED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static NODES_EVICTED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static WAL_RECORDS_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static WAL_REPLAYS_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static ERRORS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();

/// Prometheus-backed implementation of every sink trait.
#[derive(Debug, Clone, Copy)]
pub struct PrometheusSink;

static PROMETHEUS_SINK: PrometheusSink = PrometheusSink;

/// Updates a collector if `install()` has run; otherwise the sample is dropped.
macro_rules! with_metric {
    ($metric:ident, |$m:ident| $body:expr) => {
        if let Some($m) = $metric.get() {
            $body;
        }
    };
}

impl StorageMetricsSink for PrometheusSink {
    fn observe_commit_duration(&self, duration_secs: f64) {
        with_metric!(COMMIT_DURATION_SECONDS, |m| m.observe(duration_secs));
    }
    fn inc_commits_total(&self) {
        with_metric!(COMMITS_TOTAL, |m| m.inc());
    }
    fn inc_bytes_written_total(&self, bytes: u64) {
        with_metric!(BYTES_WRITTEN_TOTAL, |m| m.inc_by(bytes));
    }
    fn inc_orphans_marked(&self, count: u64) {
        with_metric!(ORPHANS_MARKED_TOTAL, |m| m.inc_by(count));
    }
    fn inc_changesets_sealed(&self) {
        with_metric!(CHANGESETS_SEALED_TOTAL, |m| m.inc());
    }
    fn inc_changesets_compacted(&self) {
        with_metric!(CHANGESETS_COMPACTED_TOTAL, |m| m.inc());
    }
    fn inc_changesets_disposed(&self) {
        with_metric!(CHANGESETS_DISPOSED_TOTAL, |m| m.inc());
    }
    fn inc_nodes_evicted(&self, count: u64) {
        with_metric!(NODES_EVICTED_TOTAL, |m| m.inc_by(count));
    }
    fn inc_wal_records(&self, count: u64) {
        with_metric!(WAL_RECORDS_TOTAL, |m| m.inc_by(count));
    }
    fn inc_wal_replays(&self) {
        with_metric!(WAL_REPLAYS_TOTAL, |m| m.inc());
    }
}

impl ErrorMetricsSink for PrometheusSink {
    fn inc_error(&self, kind: &'static str, variant: &'static str) {
        with_metric!(ERRORS_TOTAL, |m| m.with_label_values(&[kind, variant]).inc());
    }
}

fn counter(cell: &OnceCell<IntCounter>, name: &str, help: &str) -> Result<(), prometheus::Error> {
    let collector = register_int_counter!(name, help)?;
    // A second install keeps the collector from the first one.
    let _ = cell.set(collector);
    Ok(())
}

/// Registers all collectors with the default registry and installs the
/// Prometheus sink as the global sink. Call once at process startup.
pub fn install() -> Result<&'static dyn MetricsSink, prometheus::Error> {
    let histogram = register_histogram!(
        "iavlx_commit_duration_seconds",
        "Wall time of a single tree commit.",
        exponential_buckets(0.0005, 2.0, 16)?
    )?;
    let _ = COMMIT_DURATION_SECONDS.set(histogram);
    counter(&COMMITS_TOTAL, "iavlx_commits_total", "Total tree commits.")?;
    counter(
        &BYTES_WRITTEN_TOTAL,
        "iavlx_bytes_written_total",
        "Total bytes appended to changeset files.",
    )?;
    counter(
        &ORPHANS_MARKED_TOTAL,
        "iavlx_orphans_marked_total",
        "Total nodes marked as orphans.",
    )?;
    counter(
        &CHANGESETS_SEALED_TOTAL,
        "iavlx_changesets_sealed_total",
        "Total changesets sealed.",
    )?;
    counter(
        &CHANGESETS_COMPACTED_TOTAL,
        "iavlx_changesets_compacted_total",
        "Total changesets rewritten by compaction.",
    )?;
    counter(
        &CHANGESETS_DISPOSED_TOTAL,
        "iavlx_changesets_disposed_total",
        "Total changesets whose files were released.",
    )?;
    counter(
        &NODES_EVICTED_TOTAL,
        "iavlx_nodes_evicted_total",
        "Total in-memory nodes released by eviction.",
    )?;
    counter(
        &WAL_RECORDS_TOTAL,
        "iavlx_wal_records_total",
        "Total WAL records appended.",
    )?;
    counter(
        &WAL_REPLAYS_TOTAL,
        "iavlx_wal_replays_total",
        "Total versions recovered from the WAL.",
    )?;
    let errors = register_int_counter_vec!(
        "iavlx_errors_total",
        "Errors observed by the engine, by kind and variant.",
        &["kind", "variant"]
    )?;
    let _ = ERRORS_TOTAL.set(errors);

    let sink: &'static dyn MetricsSink = &PROMETHEUS_SINK;
    let _ = SINK.set(sink);
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_routes_samples_to_the_registry() {
        install().unwrap();
        crate::storage_metrics().inc_commits_total();
        crate::storage_metrics().inc_bytes_written_total(48);
        crate::error_metrics().inc_error("store", "STORE_IO_ERROR");
        {
            let _timer = crate::time::CommitTimer::new(crate::storage_metrics());
        }

        let families = prometheus::gather();
        let find = |name: &str| families.iter().any(|f| f.get_name() == name);
        assert!(find("iavlx_commits_total"));
        assert!(find("iavlx_commit_duration_seconds"));
        assert!(find("iavlx_errors_total"));
        assert_eq!(COMMITS_TOTAL.get().unwrap().get(), 1);
        assert_eq!(BYTES_WRITTEN_TOTAL.get().unwrap().get(), 48);

        // Registering the same collectors twice is a registry error.
        assert!(install().is_err());
    }
}
