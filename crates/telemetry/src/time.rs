// Path: crates/telemetry/src/time.rs
use crate::sinks::StorageMetricsSink;
use std::time::Instant;

/// Reports the lifetime of a commit to the storage sink when dropped.
pub struct CommitTimer<'a> {
    sink: &'a dyn StorageMetricsSink,
    start: Instant,
}

impl<'a> CommitTimer<'a> {
    /// Starts timing against `sink`.
    pub fn new(sink: &'a dyn StorageMetricsSink) -> Self {
        Self {
            sink,
            start: Instant::now(),
        }
    }
}

impl Drop for CommitTimer<'_> {
    fn drop(&mut self) {
        self.sink
            .observe_commit_duration(self.start.elapsed().as_secs_f64());
    }
}
