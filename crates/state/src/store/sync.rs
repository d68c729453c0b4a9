// Path: crates/state/src/store/sync.rs

//! A single background thread that fsyncs changeset files after each
//! saved version, so the commit path only pays for buffered writes. The
//! first failure is kept until the next save or barrier collects it.

use crossbeam_channel::{unbounded, Receiver, Sender};
use iavlx_types::{Result, StoreError};
use parking_lot::Mutex;
use std::fs::File;
use std::sync::Arc;
use std::thread::JoinHandle;

enum SyncMsg {
    Files(Vec<Arc<File>>),
    Barrier(Sender<Result<()>>),
}

/// Handle to the sync thread.
pub(crate) struct SyncWorker {
    tx: Mutex<Option<Sender<SyncMsg>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<StoreError>>>,
}

impl SyncWorker {
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = unbounded();
        let failure = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&failure);
        let handle = std::thread::Builder::new()
            .name(format!("iavl-sync-{name}"))
            .spawn(move || run(rx, &slot))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            failure,
        })
    }

    /// Returns the first fsync failure recorded so far without waiting for
    /// queued files.
    pub(crate) fn take_failure(&self) -> Result<()> {
        self.failure.lock().take().map_or(Ok(()), Err)
    }

    #[cfg(test)]
    pub(crate) fn record_failure(&self, e: StoreError) {
        self.failure.lock().get_or_insert(e);
    }

    /// Queues `files` for fsync.
    pub(crate) fn enqueue(&self, files: Vec<Arc<File>>) {
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.send(SyncMsg::Files(files)).is_err() {
                tracing::warn!(target: "iavl", "sync worker is gone; files left unsynced");
            }
        }
    }

    /// Waits for everything queued so far and returns the first failure
    /// since the previous barrier.
    pub(crate) fn barrier(&self) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        {
            let tx = self.tx.lock();
            let Some(tx) = tx.as_ref() else {
                return Err(StoreError::Closed);
            };
            tx.send(SyncMsg::Barrier(reply_tx))
                .map_err(|_| StoreError::Invariant("sync worker stopped".into()))?;
        }
        reply_rx
            .recv()
            .map_err(|_| StoreError::Invariant("sync worker stopped".into()))?
    }

    /// Drains the queue and joins the thread.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let pending = self.barrier();
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            handle
                .join()
                .map_err(|_| StoreError::Invariant("sync worker panicked".into()))?;
        }
        match pending {
            Err(StoreError::Closed) => Ok(()),
            other => other,
        }
    }
}

fn run(rx: Receiver<SyncMsg>, failure: &Mutex<Option<StoreError>>) {
    while let Ok(first) = rx.recv() {
        // Coalesce whatever queued up behind the first message.
        let mut batch = vec![first];
        batch.extend(rx.try_iter());
        let mut files: Vec<Arc<File>> = Vec::new();
        for msg in batch {
            match msg {
                SyncMsg::Files(more) => {
                    for file in more {
                        if !files.iter().any(|f| Arc::ptr_eq(f, &file)) {
                            files.push(file);
                        }
                    }
                }
                SyncMsg::Barrier(reply) => {
                    sync_all(&mut files, failure);
                    let _ = reply.send(failure.lock().take().map_or(Ok(()), Err));
                }
            }
        }
        sync_all(&mut files, failure);
    }
}

fn sync_all(files: &mut Vec<Arc<File>>, failure: &Mutex<Option<StoreError>>) {
    for file in files.drain(..) {
        if let Err(e) = file.sync_data() {
            tracing::warn!(target: "iavl", error = %e, "background fsync failed");
            failure.lock().get_or_insert(StoreError::Io(e));
        }
    }
}
