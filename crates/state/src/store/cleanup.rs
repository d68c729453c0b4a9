// Path: crates/state/src/store/cleanup.rs

//! The cleanup worker: marks orphans, releases retired changesets once
//! their last pin drops, and compacts sealed changesets. All three run on
//! one thread, so orphan marking never races a rewrite of the same files.

use super::StoreShared;
use crate::changeset::rewrite::{write_changeset, KeySource, RewriteNode, RewritePlan, RewriteRoot};
use crate::changeset::Changeset;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use iavlx_storage::dir::KV_LOG_FILE;
use iavlx_storage::{ChangesetDir, NodeId};
use iavlx_telemetry::{error_metrics, storage_metrics};
use iavlx_types::error::ErrorCode;
use iavlx_types::{Result, StoreError, Version};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) enum CleanupMsg {
    MarkOrphans {
        version: Version,
        orphans: Vec<Vec<NodeId>>,
    },
    Dispose(Arc<Changeset>),
    Committed(Version),
    Barrier(Sender<()>),
}

/// Handle to the cleanup thread.
pub(crate) struct CleanupWorker {
    tx: Mutex<Option<Sender<CleanupMsg>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupWorker {
    pub(crate) fn spawn(shared: Arc<StoreShared>) -> Result<Self> {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("iavl-cleanup-{}", shared.label))
            .spawn(move || Cleanup::new(shared).run(rx))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn send(&self, msg: CleanupMsg) -> Result<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| StoreError::Invariant("cleanup worker stopped".into())),
            None => Err(StoreError::Closed),
        }
    }

    /// Returns once every message sent before the call has been handled.
    pub(crate) fn barrier(&self) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(CleanupMsg::Barrier(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| StoreError::Invariant("cleanup worker stopped".into()))
    }

    /// Drains the queue and joins the thread.
    pub(crate) fn shutdown(&self) -> Result<()> {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            handle
                .join()
                .map_err(|_| StoreError::Invariant("cleanup worker panicked".into()))?;
        }
        Ok(())
    }
}

struct Cleanup {
    shared: Arc<StoreShared>,
    pending: Vec<Arc<Changeset>>,
    last_pass: Option<Instant>,
    last_pass_version: Version,
}

impl Cleanup {
    fn new(shared: Arc<StoreShared>) -> Self {
        Self {
            shared,
            pending: Vec::new(),
            last_pass: None,
            last_pass_version: 0,
        }
    }

    fn run(mut self, rx: Receiver<CleanupMsg>) {
        loop {
            match rx.recv_timeout(RETRY_INTERVAL) {
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.retry_disposals();
        }
        self.retry_disposals();
        if !self.pending.is_empty() {
            tracing::debug!(
                target: "cleanup",
                pinned = self.pending.len(),
                "changesets still pinned at shutdown"
            );
        }
    }

    fn handle(&mut self, msg: CleanupMsg) {
        match msg {
            CleanupMsg::MarkOrphans { version, orphans } => self.mark_orphans(version, orphans),
            CleanupMsg::Dispose(cs) => self.pending.push(cs),
            CleanupMsg::Committed(version) => {
                if self.compaction_due(version) {
                    self.last_pass = Some(Instant::now());
                    self.last_pass_version = version;
                    self.compact(version);
                }
            }
            CleanupMsg::Barrier(reply) => {
                self.retry_disposals();
                let _ = reply.send(());
            }
        }
    }

    fn mark_orphans(&self, version: Version, orphans: Vec<Vec<NodeId>>) {
        let mut marked = 0u64;
        for id in orphans.into_iter().flatten() {
            match self.shared.mark_orphan(version, id) {
                Ok(()) => marked += 1,
                Err(e) => {
                    error_metrics().inc_error("cleanup", e.code());
                    tracing::warn!(target: "cleanup", %id, version, error = %e, "failed to mark orphan");
                }
            }
        }
        storage_metrics().inc_orphans_marked(marked);
    }

    fn retry_disposals(&mut self) {
        self.pending.retain(|cs| match cs.try_dispose() {
            Ok(disposed) => !disposed,
            Err(e) => {
                error_metrics().inc_error("cleanup", e.code());
                tracing::warn!(target: "cleanup", changeset = %cs.name(), error = %e, "failed to dispose changeset");
                false
            }
        });
    }

    fn compaction_due(&self, version: Version) -> bool {
        let opts = &self.shared.opts;
        if !opts.compaction_enabled() {
            return false;
        }
        if version.saturating_sub(self.last_pass_version) < opts.compact_after_versions.max(1) {
            return false;
        }
        self.last_pass.map_or(true, |at| {
            at.elapsed() >= Duration::from_secs(u64::from(opts.min_compaction_seconds))
        })
    }

    fn compact(&mut self, latest: Version) {
        let shared = Arc::clone(&self.shared);
        let opts = &shared.opts;
        let first_retained = opts.first_retained_version(latest);
        let age_target = latest
            .saturating_sub(opts.compaction_orphan_age)
            .min(first_retained);
        let writer_start = shared.writer.lock().as_ref().map(|w| w.start_version());
        for cs in shared.snapshot() {
            if let Err(e) = cs.flush_orphans() {
                tracing::warn!(target: "cleanup", changeset = %cs.name(), error = %e, "failed to flush orphans");
            }
            if Some(cs.start_version()) == writer_start || !cs.owns_files() {
                continue;
            }
            if !cs.ready_to_compact(opts.compaction_orphan_ratio, age_target) {
                continue;
            }
            if let Err(e) = self.compact_one(&cs, first_retained, latest) {
                error_metrics().inc_error("cleanup", e.code());
                tracing::error!(
                    target: "cleanup",
                    changeset = %cs.name(),
                    error = %e,
                    "compaction failed"
                );
            }
        }
    }

    fn compact_one(&mut self, cs: &Arc<Changeset>, first_retained: Version, latest: Version) -> Result<()> {
        let Some(pin) = cs.pin() else {
            return Ok(());
        };
        let before = cs.leaf_count() + cs.branch_count();
        let plan = plan_compaction(&pin, first_retained, latest, self.shared.opts.compact_wal)?;
        let kept = (plan.leaves.len() + plan.branches.len()) as u64;
        if kept == before {
            return Ok(());
        }
        let compacted = write_changeset(&self.shared.dir, plan, self.shared.opts.zero_copy)?;
        drop(pin);
        tracing::info!(
            target: "cleanup",
            from = %cs.name(),
            to = %compacted.name(),
            nodes_before = before,
            nodes_after = kept,
            "compacted changeset"
        );
        storage_metrics().inc_changesets_compacted();
        if let Some(old) = self.shared.install(compacted) {
            old.evict();
            old.delete_on_dispose();
            self.pending.push(old);
        }
        Ok(())
    }
}

/// Lists the nodes of `cs` still reachable from a version at or after
/// `first_retained`. A node orphaned at `o` is absent from every version
/// from `o` on, so it is kept only while `o > first_retained`.
pub(crate) fn plan_compaction(
    cs: &Changeset,
    first_retained: Version,
    compacted_at: Version,
    compact_wal: bool,
) -> Result<RewritePlan> {
    let keep = |orphan_version: Version| orphan_version == 0 || orphan_version > first_retained;
    let mut leaves = Vec::new();
    let mut branches = Vec::new();
    let mut roots = Vec::with_capacity(cs.versions().len());
    for info in cs.versions() {
        for pos in u64::from(info.leaves.start_offset)..info.leaves.end_offset() {
            let leaf = cs.leaves().get(pos)?;
            if !keep(leaf.orphan_version) {
                continue;
            }
            let key = if compact_wal {
                let (key, value) = cs.read_kv(leaf.key_offset)?;
                KeySource::KeyValue(key, value)
            } else {
                KeySource::Offset(leaf.key_offset)
            };
            leaves.push(RewriteNode {
                id: leaf.id,
                hash: leaf.hash,
                orphan_version: leaf.orphan_version,
                key,
                height: 0,
                size: 1,
                children: None,
            });
        }
        for pos in u64::from(info.branches.start_offset)..info.branches.end_offset() {
            let branch = cs.branches().get(pos)?;
            if !keep(branch.orphan_version) {
                continue;
            }
            let key = if compact_wal {
                KeySource::Key(cs.read_k(branch.key_offset)?)
            } else {
                KeySource::Offset(branch.key_offset)
            };
            let children = (
                cs.child_loc(&branch, pos, true)?,
                cs.child_loc(&branch, pos, false)?,
            );
            branches.push(RewriteNode {
                id: branch.id,
                hash: branch.hash,
                orphan_version: branch.orphan_version,
                key,
                height: branch.height,
                size: branch.size,
                children: Some(children),
            });
        }
        roots.push(RewriteRoot {
            version: info.version,
            root_id: info.root_id,
            pruned: info.is_pruned(),
        });
    }
    Ok(RewritePlan {
        name: ChangesetDir::compacted(cs.start_version(), compacted_at),
        end_version: cs.end_version(),
        leaves,
        branches,
        roots,
        kv_source: (!compact_wal).then(|| cs.dir().join(KV_LOG_FILE)),
    })
}
