// Path: crates/types/src/lib.rs
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
#![deny(missing_docs)]

//! # iavlx Types
//!
//! Shared vocabulary for the iavlx storage engine: the error taxonomy,
//! engine options, commit identifiers and the canonical hashing and varint
//! helpers every other crate in the workspace builds on.

/// Commit identifiers and the multi-store commit info hash.
pub mod commit;
/// Engine configuration.
pub mod config;
/// Error types with stable machine-readable codes.
pub mod error;
/// SHA-256 helpers and hash constants.
pub mod hash;
/// A curated set of commonly used traits and types.
pub mod prelude;
/// Unsigned and zigzag varint encoding.
pub mod varint;

/// A committed tree version.
pub type Version = u32;

pub use commit::{CommitId, CommitInfo, StoreInfo};
pub use config::Options;
pub use error::{ErrorCode, ProofError, StoreError};
pub use hash::Hash;

/// Convenience alias used throughout the engine.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
