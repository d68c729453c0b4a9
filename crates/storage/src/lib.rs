// Path: crates/storage/src/lib.rs
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

//! # iavlx Storage
//!
//! Persistence primitives for changesets: 64-bit node identifiers and
//! relative references, the fixed-size little-endian node layouts, flat
//! record files read through `memmap2` and appended through buffered
//! writers, and the variable-length key/value log that doubles as the
//! write-ahead log.

/// Changeset directory naming and file names.
pub mod dir;
/// Node identifiers and stored child references.
pub mod id;
/// The append-only key/value log.
pub mod kvlog;
/// Fixed-size on-disk records.
pub mod layout;
/// Memory-mapped read views over record files.
pub mod mmap;
/// Buffered appenders for record files.
pub mod writer;

pub use dir::ChangesetDir;
pub use id::{NodeId, NodeRef};
pub use kvlog::{KvLogReader, KvLogWriter, KvRecord, KvUpdate};
pub use layout::{BranchLayout, ChangesetInfo, LeafLayout, NodeSetInfo, Record, VersionInfo};
pub use mmap::{NodeMmap, StructMmap};
pub use writer::StructWriter;
