// Path: crates/state/src/lib.rs
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

//! # iavlx State
//!
//! Versioned, persistent IAVL+ trees. A [`CommitTree`] owns the latest
//! committed root and a [`TreeStore`] of rolling changesets; callers stage
//! writes on a [`BranchTree`], apply it back, and commit to produce a new
//! version whose Merkle root is byte-compatible with the legacy IAVL hash.
//!
//! Persisted nodes are addressed by [`iavlx_storage::NodeId`] and resolved
//! lazily through memory-mapped changeset files; the in-memory working tree
//! shares structure with the committed one and is evicted below a
//! configurable depth once its changeset becomes readable.

/// Changeset readers, the open-changeset writer and the compaction rewriter.
pub mod changeset;
/// In-memory nodes, node pointers and the uniform node view.
pub mod node;
/// ICS-23 style membership and non-membership proofs.
pub mod proof;
/// The changeset registry and its background workers.
pub mod store;
/// Branches, the commit tree, iteration and export/import.
pub mod tree;
mod wal;

pub use node::{MemNode, Node, NodeLoc, NodePointer};
pub use proof::{CommitmentProof, ExistenceProof, NonExistenceProof};
pub use store::TreeStore;
pub use tree::branch::BranchTree;
pub use tree::commit::CommitTree;
pub use tree::export::{ExportNode, Exporter};
pub use tree::iterator::TreeIterator;
pub use tree::readonly::ReadOnlyTree;
