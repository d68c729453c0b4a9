// Path: crates/multistore/src/branch.rs

//! Cached writes over every mounted store, applied back as one unit.

use crate::mem::MemBranch;
use bytes::Bytes;
use iavlx_state::BranchTree;
use iavlx_types::{Result, StoreError, Version};
use std::collections::HashMap;
use std::sync::Arc;

/// Key/value access shared by every kind of mounted store.
pub trait KvStore {
    /// The value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Whether `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.get(key).map(|v| v.is_some())
    }

    /// Sets `key` to `value`; returns whether a value was replaced.
    fn set(&mut self, key: Bytes, value: Bytes) -> Result<bool>;

    /// Removes `key`, returning the value it held.
    fn delete(&mut self, key: &[u8]) -> Result<Option<Bytes>>;
}

impl KvStore for BranchTree {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        BranchTree::get(self, key)
    }

    fn set(&mut self, key: Bytes, value: Bytes) -> Result<bool> {
        BranchTree::set(self, key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        BranchTree::delete(self, key)
    }
}

impl KvStore for MemBranch {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(MemBranch::get(self, key))
    }

    fn set(&mut self, key: Bytes, value: Bytes) -> Result<bool> {
        Ok(MemBranch::set(self, key, value))
    }

    fn delete(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(MemBranch::delete(self, key))
    }
}

#[derive(Debug)]
pub(crate) enum StoreBranch {
    Iavl(BranchTree),
    Mem(MemBranch),
}

/// A branch of every mounted store, staging the next multi-store version.
#[derive(Debug)]
pub struct MultiStoreBranch {
    pub(crate) version: Version,
    pub(crate) branches: Vec<StoreBranch>,
    pub(crate) index: Arc<HashMap<String, usize>>,
}

impl MultiStoreBranch {
    /// The version this branch stages.
    pub fn version(&self) -> Version {
        self.version
    }

    fn slot(&mut self, name: &str) -> Result<&mut StoreBranch> {
        self.index
            .get(name)
            .and_then(|i| self.branches.get_mut(*i))
            .ok_or_else(|| StoreError::NotFound(format!("store {name} is not mounted")))
    }

    /// Key/value access to the store mounted as `name`.
    pub fn kv_store(&mut self, name: &str) -> Result<&mut dyn KvStore> {
        Ok(match self.slot(name)? {
            StoreBranch::Iavl(branch) => branch,
            StoreBranch::Mem(branch) => branch,
        })
    }

    /// The full tree branch of the IAVL store mounted as `name`, for
    /// iteration and verification.
    pub fn iavl(&mut self, name: &str) -> Result<&mut BranchTree> {
        match self.slot(name)? {
            StoreBranch::Iavl(branch) => Ok(branch),
            StoreBranch::Mem(_) => Err(StoreError::NotFound(format!("store {name} is not an IAVL store"))),
        }
    }
}
