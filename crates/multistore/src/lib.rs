// Path: crates/multistore/src/lib.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! # iavlx Multi-Store
//!
//! A set of named stores that advance one version per block. IAVL stores
//! are [`iavlx_state::CommitTree`]s under `<dir>/stores/<name>/`; their roots
//! are combined into a [`iavlx_types::CommitInfo`] whose hash is the
//! multi-store root and which is persisted as `<dir>/commit_info/<version>`.
//! Transient and memory stores ride along without being hashed.

mod branch;
/// Encoding and persistence of per-version commit info files.
pub mod commit_info;
mod mem;
mod store;

pub use branch::{KvStore, MultiStoreBranch};
pub use mem::MemStore;
pub use store::{MultiStore, StoreType};

use iavlx_types::{Options, Result};
use std::path::Path;

/// Opens the multi-store rooted at `dir`. Stores are mounted on the result
/// before [`MultiStore::load_latest_version`] reconstructs them from disk.
pub fn open_multistore(dir: &Path, opts: Options) -> Result<MultiStore> {
    MultiStore::open(dir, opts)
}
