// Path: crates/state/src/wal.rs

//! Logs applied updates into the open changeset's KV log.
//!
//! Each applied branch becomes one batch. Sets carry the leaf they created
//! so the leaf can later point at its logged record instead of writing the
//! key and value a second time. Batches are written inline or handed to a
//! worker thread through a bounded channel; either way errors surface at the
//! next [`WalWriter::barrier`].

use crate::node::MemNode;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use iavlx_storage::{KvLogWriter, KvUpdate};
use iavlx_telemetry::storage_metrics;
use iavlx_types::prelude::OptionExt;
use iavlx_types::{Result, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// One logged update.
#[derive(Debug, Clone)]
pub(crate) enum WalOp {
    Set(Arc<MemNode>),
    Delete(Bytes),
}

enum WalMsg {
    Batch {
        kv: Arc<Mutex<KvLogWriter>>,
        ops: Vec<WalOp>,
    },
    Barrier(Sender<Result<()>>),
}

enum Mode {
    Inline { failure: Option<StoreError> },
    Worker {
        tx: Option<Sender<WalMsg>>,
        handle: Option<JoinHandle<()>>,
    },
}

pub(crate) struct WalWriter {
    mode: Mode,
}

impl WalWriter {
    /// A negative `buffer` writes inline; otherwise it is the channel capacity.
    pub(crate) fn new(buffer: i32, label: &str) -> Result<Self> {
        let Ok(capacity) = usize::try_from(buffer) else {
            return Ok(Self {
                mode: Mode::Inline { failure: None },
            });
        };
        let (tx, rx) = bounded(capacity);
        let handle = std::thread::Builder::new()
            .name(format!("iavl-wal-{label}"))
            .spawn(move || run(rx))?;
        Ok(Self {
            mode: Mode::Worker {
                tx: Some(tx),
                handle: Some(handle),
            },
        })
    }

    /// Logs `ops` into `kv`. Blocks while the channel is full.
    pub(crate) fn submit(&mut self, kv: Arc<Mutex<KvLogWriter>>, ops: Vec<WalOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        match &mut self.mode {
            Mode::Inline { failure } => {
                if failure.is_none() {
                    if let Err(e) = write_ops(&kv, &ops) {
                        tracing::warn!(target: "wal", error = %e, "inline WAL write failed");
                        *failure = Some(e);
                    }
                }
                Ok(())
            }
            Mode::Worker { tx, .. } => tx
                .as_ref()
                .required(StoreError::Closed)?
                .send(WalMsg::Batch { kv, ops })
                .map_err(|_| StoreError::Invariant("WAL worker stopped".into())),
        }
    }

    /// Waits for every submitted batch and returns the first failure since
    /// the previous barrier.
    pub(crate) fn barrier(&mut self) -> Result<()> {
        match &mut self.mode {
            Mode::Inline { failure } => failure.take().map_or(Ok(()), Err),
            Mode::Worker { tx, .. } => {
                let (reply_tx, reply_rx) = bounded(1);
                tx.as_ref()
                    .required(StoreError::Closed)?
                    .send(WalMsg::Barrier(reply_tx))
                    .map_err(|_| StoreError::Invariant("WAL worker stopped".into()))?;
                reply_rx
                    .recv()
                    .map_err(|_| StoreError::Invariant("WAL worker stopped".into()))?
            }
        }
    }

    /// Drains outstanding batches and stops the worker.
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        let pending = self.barrier();
        if let Mode::Worker { tx, handle } = &mut self.mode {
            tx.take();
            if let Some(handle) = handle.take() {
                handle
                    .join()
                    .map_err(|_| StoreError::Invariant("WAL worker panicked".into()))?;
            }
        }
        match pending {
            Err(StoreError::Closed) => Ok(()),
            other => other,
        }
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(target: "wal", error = %e, "WAL writer stopped with an error");
        }
    }
}

fn run(rx: Receiver<WalMsg>) {
    let mut failure: Option<StoreError> = None;
    for msg in rx {
        match msg {
            // After a failure the rest of the version is skipped; the
            // commit that reads the failure rolls the version back.
            WalMsg::Batch { kv, ops } => {
                if failure.is_none() {
                    if let Err(e) = write_ops(&kv, &ops) {
                        tracing::warn!(target: "wal", error = %e, "WAL write failed");
                        failure = Some(e);
                    }
                }
            }
            WalMsg::Barrier(reply) => {
                let _ = reply.send(failure.take().map_or(Ok(()), Err));
            }
        }
    }
}

fn write_ops(kv: &Mutex<KvLogWriter>, ops: &[WalOp]) -> Result<()> {
    let mut updates = Vec::with_capacity(ops.len());
    for op in ops {
        updates.push(match op {
            WalOp::Set(leaf) => KvUpdate::Set {
                key: &leaf.key()[..],
                value: &leaf
                    .value()
                    .required(StoreError::Invariant("logged set without a value".into()))?[..],
            },
            WalOp::Delete(key) => KvUpdate::Delete { key: &key[..] },
        });
    }
    let offsets = kv.lock().write_updates(&updates)?;
    for (op, offset) in ops.iter().zip(offsets) {
        if let (WalOp::Set(leaf), Some(offset)) = (op, offset) {
            leaf.set_wal_offset(offset);
        }
    }
    storage_metrics().inc_wal_records(ops.len() as u64);
    Ok(())
}
