// Path: crates/state/src/tree/mod.rs

//! Tree-level operations over node pointers: the copy-on-write mutation
//! engine, commit hashing, point reads, iteration and the public tree
//! handles built on them.

pub mod branch;
pub mod commit;
pub mod export;
pub mod iterator;
pub(crate) mod mutation;
pub(crate) mod read;
pub mod readonly;
pub(crate) mod traverse;
pub(crate) mod verify;
