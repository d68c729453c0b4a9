// Path: crates/state/src/tree/traverse.rs

//! Commit hashing and post-commit eviction.

use crate::node::hash::{branch_hash, leaf_hash};
use crate::node::{NodeMeta, NodePointer};
use crate::store::TreeStore;
use iavlx_storage::NodeId;
use iavlx_telemetry::storage_metrics;
use iavlx_types::hash::Hash;
use iavlx_types::prelude::OptionExt;
use iavlx_types::{Result, StoreError, Version};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Nodes created at the hashed version, by kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tally {
    pub leaves: u32,
    pub branches: u32,
}

/// Hashes the subtree under `ptr`, assigning ids to every node created at
/// `version` in post-order. Leaves and branches are numbered separately
/// from 1. Nodes of earlier versions contribute their stored hash.
pub(crate) fn commit_traverse(
    store: &TreeStore,
    ptr: &NodePointer,
    version: Version,
    tally: &mut Tally,
) -> Result<Hash> {
    let mem = match ptr.mem() {
        Some(mem) if mem.version() == version => mem,
        Some(mem) => {
            return mem
                .hash()
                .required(StoreError::Invariant(format!("{mem:?} predates {version} but is unhashed")))
        }
        None => return ptr.resolve(store)?.hash(),
    };
    if mem.is_leaf() {
        tally.leaves += 1;
        let id = NodeId::new(true, u64::from(version), u64::from(tally.leaves))?;
        let value = mem
            .value()
            .required(StoreError::Invariant("leaf without value".into()))?;
        let hash = leaf_hash(version, mem.key(), value);
        mem.assign(NodeMeta { id, hash })?;
        return Ok(hash);
    }
    let left = commit_traverse(store, mem.left_ptr()?, version, tally)?;
    let right = commit_traverse(store, mem.right_ptr()?, version, tally)?;
    tally.branches += 1;
    let id = NodeId::new(false, u64::from(version), u64::from(tally.branches))?;
    let hash = branch_hash(mem.height(), mem.size(), version, &left, &right);
    mem.assign(NodeMeta { id, hash })?;
    Ok(hash)
}

/// Drops in-memory nodes at or below a depth once they are readable from
/// disk. At most one pass runs at a time; a request made while one is
/// running is skipped.
#[derive(Default)]
pub(crate) struct Evictor {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Evictor {
    pub(crate) fn spawn(&self, root: Arc<NodePointer>, saved: Version, depth: u8, label: &str) {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "iavl", "eviction pass already running");
            return;
        }
        let running = RunningFlag(Arc::clone(&self.running));
        let spawned = std::thread::Builder::new()
            .name(format!("iavl-evict-{label}"))
            .spawn(move || {
                let _running = running;
                let evicted = evict(&root, 0, depth, saved);
                storage_metrics().inc_nodes_evicted(evicted);
                tracing::trace!(target: "iavl", evicted, saved, "eviction pass done");
            });
        match spawned {
            Ok(handle) => {
                if let Some(previous) = self.handle.lock().replace(handle) {
                    join_pass(previous);
                }
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                tracing::warn!(target: "iavl", error = %e, "could not start eviction pass");
            }
        }
    }

    /// Waits for the running pass, if any.
    pub(crate) fn wait(&self) {
        if let Some(handle) = self.handle.lock().take() {
            join_pass(handle);
        }
    }
}

/// Clears the running flag when a pass ends, including by panic.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn join_pass(handle: JoinHandle<()>) {
    if let Err(payload) = handle.join() {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        tracing::warn!(target: "iavl", %reason, "eviction pass panicked");
    }
}

fn evict(ptr: &NodePointer, depth: u8, evict_depth: u8, saved: Version) -> u64 {
    // Pointers without a body have no bodies below them either.
    let Some(mem) = ptr.mem() else {
        return 0;
    };
    let mut evicted = 0;
    if let (Some(left), Some(right)) = (&mem.left, &mem.right) {
        let next = depth.saturating_add(1);
        evicted += evict(left, next, evict_depth, saved);
        evicted += evict(right, next, evict_depth, saved);
    }
    if depth >= evict_depth && mem.version() <= saved && ptr.evict() {
        evicted += 1;
    }
    evicted
}
