// Path: crates/types/src/error/mod.rs

//! Core error types for the iavlx storage engine.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors raised by the tree engine, its persistence layer and the multi-store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A record could not be decoded: corrupt varint, bad length prefix or
    /// an unexpected kind tag.
    #[error("Decode error: {0}")]
    Decode(String),
    /// A record extends past the end of its file.
    #[error("Truncated record at offset {offset}: needed {needed} more bytes")]
    Truncated {
        /// Byte offset of the record start.
        offset: u64,
        /// How many bytes were missing.
        needed: u64,
    },
    /// An identifier, offset or version fell outside its representable window.
    #[error("Out of range: {0}")]
    OutOfRange(String),
    /// A version, node or changeset is unknown.
    #[error("Not found: {0}")]
    NotFound(String),
    /// A branch was created against a root that is no longer current.
    #[error("Branch is stale: {0}")]
    BranchStale(String),
    /// An operation reached a changeset whose files were already released.
    #[error("Changeset disposed: {0}")]
    Disposed(String),
    /// A store with the same name is already mounted.
    #[error("Store already mounted: {0}")]
    AlreadyMounted(String),
    /// The tree or store has been closed.
    #[error("Store is closed")]
    Closed,
    /// An underlying filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An internal consistency check failed. Never auto-repaired.
    #[error("Invariant violated: {0}")]
    Invariant(String),
    /// A Merkle proof could not be built or verified.
    #[error("Proof error: {0}")]
    Proof(#[from] ProofError),
    /// Several independent failures collected while shutting down.
    #[error("{}", join_errors(.0))]
    Joined(Vec<StoreError>),
}

fn join_errors(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StoreError {
    /// Folds a list of errors into `Ok(())`, the single error, or `Joined`.
    pub fn join(mut errors: Vec<StoreError>) -> Result<(), StoreError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(StoreError::Joined(errors)),
        }
    }
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "STORE_DECODE_ERROR",
            Self::Truncated { .. } => "STORE_TRUNCATED",
            Self::OutOfRange(_) => "STORE_OUT_OF_RANGE",
            Self::NotFound(_) => "STORE_NOT_FOUND",
            Self::BranchStale(_) => "STORE_BRANCH_STALE",
            Self::Disposed(_) => "STORE_DISPOSED",
            Self::AlreadyMounted(_) => "STORE_ALREADY_MOUNTED",
            Self::Closed => "STORE_CLOSED",
            Self::Io(_) => "STORE_IO_ERROR",
            Self::Invariant(_) => "STORE_INVARIANT_VIOLATED",
            Self::Proof(e) => e.code(),
            Self::Joined(_) => "STORE_MULTIPLE_ERRORS",
        }
    }
}

/// Errors related to the construction or verification of Merkle proofs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    /// An error occurred during proof deserialization.
    #[error("Proof deserialization failed: {0}")]
    Deserialization(String),
    /// The recomputed root hash from the proof did not match the trusted root.
    #[error("Root hash mismatch")]
    RootMismatch,
    /// A proof of non-existence was structurally invalid.
    #[error("Invalid non-existence proof: {0}")]
    InvalidNonExistence(String),
    /// A proof of existence was structurally invalid.
    #[error("Invalid existence proof: {0}")]
    InvalidExistence(String),
    /// The key is present, so no non-membership proof exists (or vice versa).
    #[error("Proof unavailable: {0}")]
    Unavailable(String),
    /// A proof's hash length was invalid.
    #[error("Invalid hash length: expected {expected}, got {got}")]
    InvalidHashLength {
        /// The expected length in bytes.
        expected: usize,
        /// The actual length in bytes.
        got: usize,
    },
}

impl ErrorCode for ProofError {
    fn code(&self) -> &'static str {
        match self {
            Self::Deserialization(_) => "PROOF_DESERIALIZATION_FAILED",
            Self::RootMismatch => "PROOF_ROOT_MISMATCH",
            Self::InvalidNonExistence(_) => "PROOF_INVALID_NON_EXISTENCE",
            Self::InvalidExistence(_) => "PROOF_INVALID_EXISTENCE",
            Self::Unavailable(_) => "PROOF_UNAVAILABLE",
            Self::InvalidHashLength { .. } => "PROOF_INVALID_HASH_LENGTH",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_collapses_single_error() {
        assert!(StoreError::join(Vec::new()).is_ok());
        let single = StoreError::join(vec![StoreError::Closed]).unwrap_err();
        assert!(matches!(single, StoreError::Closed));
        let many = StoreError::join(vec![
            StoreError::Closed,
            StoreError::NotFound("version 3".into()),
        ])
        .unwrap_err();
        assert_eq!(many.code(), "STORE_MULTIPLE_ERRORS");
        assert_eq!(many.to_string(), "Store is closed; Not found: version 3");
    }

    #[test]
    fn proof_errors_keep_their_code() {
        let err: StoreError = ProofError::RootMismatch.into();
        assert_eq!(err.code(), "PROOF_ROOT_MISMATCH");
    }
}
