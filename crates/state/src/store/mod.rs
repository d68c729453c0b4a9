// Path: crates/state/src/store/mod.rs

//! The per-tree changeset registry.
//!
//! A [`TreeStore`] maps start versions to changeset views, routes node
//! lookups to the view covering the node's version, owns the writer of the
//! open changeset and decides when to publish a fresh shared view or seal
//! the writer. Two background threads support it: a syncer that fsyncs
//! written files and a cleanup worker that marks orphans, disposes retired
//! views and compacts sealed changesets.

mod cleanup;
mod recovery;
mod sync;

pub use recovery::{WalEntry, WalTail};

use crate::changeset::{Changeset, ChangesetWriter, PinGuard};
use crate::node::{Node, NodeLoc, NodePointer};
use cleanup::{CleanupMsg, CleanupWorker};
use fs2::FileExt;
use iavlx_storage::{KvLogWriter, NodeId};
use iavlx_telemetry::error_metrics;
use iavlx_types::error::ErrorCode;
use iavlx_types::prelude::OptionExt;
use iavlx_types::{Options, Result, StoreError, Version};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use sync::SyncWorker;

const LOCK_FILE: &str = "LOCK";
// A view can be replaced between lookup and pin; the replacement is
// installed before the old view is evicted, so a retry finds it.
const PIN_ATTEMPTS: usize = 3;

/// State shared between the store handle and its cleanup worker.
pub(crate) struct StoreShared {
    pub(crate) dir: PathBuf,
    pub(crate) label: String,
    pub(crate) opts: Options,
    // Lock order: `writer` before `changesets`.
    pub(crate) writer: Mutex<Option<ChangesetWriter>>,
    changesets: RwLock<BTreeMap<Version, Arc<Changeset>>>,
    saved_version: AtomicU32,
    latest_version: AtomicU32,
    closed: AtomicBool,
    // Set when a staged version could not be written out; the writer can no
    // longer be trusted until the directory is reopened.
    failed: Mutex<Option<String>>,
}

impl StoreShared {
    fn changeset_for(&self, version: Version) -> Result<Arc<Changeset>> {
        self.changesets
            .read()
            .range(..=version)
            .next_back()
            .map(|(_, cs)| cs)
            .filter(|cs| cs.contains_version(version))
            .cloned()
            .required(StoreError::NotFound(format!("version {version}")))
    }

    fn with_pinned<T>(&self, version: Version, f: impl Fn(&PinGuard) -> Result<T>) -> Result<T> {
        for _ in 0..PIN_ATTEMPTS {
            let cs = self.changeset_for(version)?;
            if let Some(pin) = cs.pin() {
                return f(&pin);
            }
        }
        Err(StoreError::Disposed(format!("changeset holding version {version}")))
    }

    /// Installs `cs` under its start version and returns the view it replaced.
    pub(crate) fn install(&self, cs: Arc<Changeset>) -> Option<Arc<Changeset>> {
        self.changesets.write().insert(cs.start_version(), cs)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Changeset>> {
        self.changesets.read().values().cloned().collect()
    }

    /// Records that `id` stopped being reachable at `orphan_version`.
    pub(crate) fn mark_orphan(&self, orphan_version: Version, id: NodeId) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            if let Some(w) = writer.as_mut().filter(|w| w.covers(id.version())) {
                return w.mark_orphan(orphan_version, id);
            }
        }
        self.with_pinned(id.version(), |pin| pin.mark_orphan(orphan_version, id).map(|_| ()))
    }
}

/// The changeset registry of one tree directory.
pub struct TreeStore {
    shared: Arc<StoreShared>,
    syncer: SyncWorker,
    cleanup: CleanupWorker,
    wal_tail: Mutex<Option<WalTail>>,
    _lock: File,
}

impl TreeStore {
    /// Opens (or creates) the tree directory `dir`, taking an exclusive
    /// lock on it.
    pub fn open(dir: &Path, opts: Options) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|e| {
            StoreError::Io(io::Error::new(
                e.kind(),
                format!("tree directory {} is in use: {e}", dir.display()),
            ))
        })?;

        let loaded = recovery::load(dir, opts.zero_copy)?;
        let label = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tree".into());
        tracing::info!(
            target: "iavl",
            dir = %dir.display(),
            changesets = loaded.changesets.len(),
            latest = loaded.latest,
            wal_tail = loaded.wal_tail.as_ref().map(|t| t.version),
            "opened tree store"
        );
        let shared = Arc::new(StoreShared {
            dir: dir.to_path_buf(),
            label: label.clone(),
            opts,
            writer: Mutex::new(None),
            changesets: RwLock::new(loaded.changesets),
            saved_version: AtomicU32::new(loaded.latest),
            latest_version: AtomicU32::new(loaded.latest),
            closed: AtomicBool::new(false),
            failed: Mutex::new(None),
        });
        Ok(Self {
            syncer: SyncWorker::spawn(&label)?,
            cleanup: CleanupWorker::spawn(Arc::clone(&shared))?,
            shared,
            wal_tail: Mutex::new(loaded.wal_tail),
            _lock: lock,
        })
    }

    /// The tree directory.
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// The options the store was opened with.
    pub fn options(&self) -> &Options {
        &self.shared.opts
    }

    /// The last version written by `save_root`.
    pub fn latest_version(&self) -> Version {
        self.shared.latest_version.load(Ordering::Acquire)
    }

    /// The last version readable through a published changeset view.
    pub fn saved_version(&self) -> Version {
        self.shared.saved_version.load(Ordering::Acquire)
    }

    /// Takes the logged-but-unsaved version found on open, once.
    pub fn take_wal_tail(&self) -> Option<WalTail> {
        self.wal_tail.lock().take()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Reads the node stored at `loc`.
    pub fn resolve(&self, loc: NodeLoc) -> Result<Node> {
        self.ensure_open()?;
        self.shared
            .with_pinned(loc.id.version(), |pin| pin.resolve(loc))
    }

    /// The root of a published `version`; `None` for an empty tree.
    pub fn root_at(&self, version: Version) -> Result<Option<Arc<NodePointer>>> {
        self.ensure_open()?;
        if version == 0 {
            return Ok(None);
        }
        let loc = self.shared.with_pinned(version, |pin| pin.root_of(version))?;
        Ok(loc.map(NodePointer::persisted))
    }

    /// Whether `version` can be read through a published view.
    pub fn has_version(&self, version: Version) -> bool {
        self.shared
            .changeset_for(version)
            .map(|cs| cs.version_info(version).is_some_and(|v| !v.is_pruned()))
            .unwrap_or(false)
    }

    /// The published changeset views, ordered by start version.
    pub fn changesets(&self) -> Vec<Arc<Changeset>> {
        self.shared.snapshot()
    }

    fn ensure_writer<'a>(
        &self,
        slot: &'a mut Option<ChangesetWriter>,
        version: Version,
    ) -> Result<&'a mut ChangesetWriter> {
        if slot.is_none() {
            *slot = Some(ChangesetWriter::create(
                &self.shared.dir,
                version,
                self.shared.opts.zero_copy,
            )?);
        }
        let writer = slot
            .as_mut()
            .required(StoreError::Invariant("changeset writer missing".into()))?;
        if writer.staged_version() != version {
            return Err(StoreError::OutOfRange(format!(
                "version {version} is not staged; changeset {} expects {}",
                writer.name(),
                writer.staged_version()
            )));
        }
        Ok(writer)
    }

    /// The KV log receiving records of `version`.
    pub(crate) fn kv_log_for(&self, version: Version) -> Result<Arc<Mutex<KvLogWriter>>> {
        self.ensure_open()?;
        let mut slot = self.shared.writer.lock();
        Ok(self.ensure_writer(&mut slot, version)?.kv_log())
    }

    /// Appends the commit marker closing the WAL records of `version`.
    pub(crate) fn write_commit_marker(&self, version: Version) -> Result<()> {
        let kv = self.kv_log_for(version)?;
        let mut kv = kv.lock();
        kv.write_commit(version)?;
        if self.shared.opts.fsync_wal {
            kv.sync()
        } else {
            kv.flush()
        }
    }

    /// Persists `version`, then publishes a new view or seals the
    /// changeset as configured.
    ///
    /// A background fsync failure of an earlier version fails this call
    /// before anything is staged. A flush, fsync or seal failure after
    /// staging fails it too and leaves the store refusing further versions
    /// until it is reopened.
    pub(crate) fn save_root(
        &self,
        version: Version,
        root: Option<&Arc<NodePointer>>,
        leaf_count: u32,
        branch_count: u32,
    ) -> Result<()> {
        self.ensure_open()?;
        self.ensure_healthy()?;
        self.syncer.take_failure()?;
        let opts = &self.shared.opts;
        let mut slot = self.shared.writer.lock();
        let writer = self.ensure_writer(&mut slot, version)?;
        writer.save_root(version, root, leaf_count, branch_count)?;

        let flushed = writer.flush().and_then(|()| {
            if opts.fsync_wal {
                writer.kv_log().lock().sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = flushed {
            return Err(self.fail("flush", version, e));
        }
        self.shared.latest_version.store(version, Ordering::Release);
        self.syncer.enqueue(writer.sync_handles());

        let interval = opts.reader_update_interval as usize;
        if writer.size_bytes() >= opts.changeset_max_target {
            let sealed = match writer.seal() {
                Ok(sealed) => sealed,
                Err(e) => return Err(self.fail("seal", version, e)),
            };
            *slot = None;
            self.publish(sealed, version);
        } else if interval > 0 && writer.version_count() % interval == 0 {
            match writer.create_shared_reader() {
                Ok(reader) => self.publish(reader, version),
                Err(e) => report("publish", version, &e),
            }
        }
        Ok(())
    }

    fn ensure_healthy(&self) -> Result<()> {
        match self.shared.failed.lock().as_ref() {
            Some(reason) => Err(StoreError::Invariant(format!(
                "tree store {} stopped accepting versions after {reason}; reopen to recover",
                self.shared.label
            ))),
            None => Ok(()),
        }
    }

    fn fail(&self, step: &str, version: Version, e: StoreError) -> StoreError {
        report(step, version, &e);
        *self.shared.failed.lock() = Some(format!("{step} of version {version} failed: {e}"));
        e
    }

    /// Voids the WAL records logged so far for `version` by repeating the
    /// previous commit marker; replay restarts collection at every marker.
    pub(crate) fn discard_wal(&self, version: Version) -> Result<()> {
        self.ensure_open()?;
        // The writer may already have staged `version` when a later step
        // failed, so the log is taken without checking the staged version.
        let Some(kv) = self.shared.writer.lock().as_ref().map(ChangesetWriter::kv_log) else {
            return Ok(());
        };
        let mut kv = kv.lock();
        kv.write_commit(version.saturating_sub(1))?;
        kv.flush()
    }

    fn publish(&self, cs: Arc<Changeset>, version: Version) {
        if let Some(old) = self.shared.install(cs) {
            self.retire(old);
        }
        self.shared.saved_version.store(version, Ordering::Release);
    }

    fn retire(&self, old: Arc<Changeset>) {
        old.evict();
        match old.try_dispose() {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.cleanup.send(CleanupMsg::Dispose(old)) {
                    tracing::warn!(target: "iavl", error = %e, "could not queue changeset disposal");
                }
            }
            Err(e) => {
                tracing::warn!(target: "iavl", changeset = %old.name(), error = %e, "failed to dispose changeset");
            }
        }
    }

    /// Installs an imported changeset into an empty store and makes its
    /// last version the latest.
    pub(crate) fn adopt(&self, cs: Arc<Changeset>) -> Result<()> {
        self.ensure_open()?;
        let writer = self.shared.writer.lock();
        if writer.is_some() || !self.shared.changesets.read().is_empty() {
            return Err(StoreError::Invariant(format!(
                "cannot import into non-empty tree {}",
                self.shared.dir.display()
            )));
        }
        let end = cs.end_version();
        self.shared.install(cs);
        drop(writer);
        self.shared.latest_version.store(end, Ordering::Release);
        self.shared.saved_version.store(end, Ordering::Release);
        Ok(())
    }

    /// Queues orphan marks for the nodes superseded by `version`.
    pub(crate) fn mark_orphans(&self, version: Version, orphans: Vec<Vec<NodeId>>) {
        if orphans.iter().all(Vec::is_empty) {
            return;
        }
        if let Err(e) = self.cleanup.send(CleanupMsg::MarkOrphans { version, orphans }) {
            tracing::warn!(target: "iavl", version, error = %e, "dropping orphan marks");
        }
    }

    /// Tells the cleanup worker `version` is committed so it can consider
    /// compaction.
    pub(crate) fn notify_committed(&self, version: Version) {
        if let Err(e) = self.cleanup.send(CleanupMsg::Committed(version)) {
            tracing::debug!(target: "iavl", version, error = %e, "cleanup worker unavailable");
        }
    }

    /// Waits until the cleanup worker has handled everything queued so far.
    pub fn flush_cleanup(&self) -> Result<()> {
        self.cleanup.barrier()
    }

    /// Waits for background fsyncs and reports the first failure since the
    /// last call.
    pub fn flush_sync(&self) -> Result<()> {
        self.syncer.barrier()
    }

    #[cfg(test)]
    pub(crate) fn inject_sync_failure(&self, e: StoreError) {
        self.syncer.record_failure(e);
    }

    /// Stops the workers, syncs the open changeset and releases every file.
    /// Errors from each step are collected rather than short-circuited.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut errors = Vec::new();
        if let Err(e) = self.cleanup.shutdown() {
            errors.push(e);
        }
        if let Some(mut writer) = self.shared.writer.lock().take() {
            if let Err(e) = writer.finish() {
                errors.push(e);
            }
        }
        if let Err(e) = self.syncer.shutdown() {
            errors.push(e);
        }
        let mut map = self.shared.changesets.write();
        for cs in map.values() {
            if let Err(e) = cs.flush_orphans() {
                errors.push(e);
            }
            cs.close_files();
        }
        map.clear();
        drop(map);
        tracing::info!(target: "iavl", dir = %self.shared.dir.display(), "closed tree store");
        StoreError::join(errors)
    }
}

fn report(step: &str, version: Version, e: &StoreError) {
    error_metrics().inc_error("iavl", e.code());
    tracing::error!(target: "iavl", step, version, error = %e, "post-save step failed");
}

impl Drop for TreeStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(target: "iavl", error = %e, "error closing tree store");
        }
    }
}

#[cfg(test)]
mod tests;
