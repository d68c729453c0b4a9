// Path: crates/multistore/src/store.rs

//! The multi-store: named trees committed together per block.

use crate::branch::{MultiStoreBranch, StoreBranch};
use crate::commit_info;
use crate::mem::{MemBranch, MemStore};
use iavlx_state::CommitTree;
use iavlx_telemetry::error_metrics;
use iavlx_types::error::ErrorCode;
use iavlx_types::hash::{short_hex, Hash};
use iavlx_types::{CommitId, CommitInfo, Options, Result, StoreError, StoreInfo, Version};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const STORES_DIR: &str = "stores";

/// How a mounted store keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreType {
    /// A persistent IAVL tree; its root is part of the commit info.
    Iavl,
    /// In memory, emptied after every commit.
    Transient,
    /// In memory, kept across commits.
    Memory,
}

enum Backend {
    Iavl(CommitTree),
    Mem(Arc<MemStore>),
}

struct Mounted {
    name: String,
    backend: Backend,
}

#[derive(Default)]
struct CommitState {
    version: Version,
    last_commit_info: Option<CommitInfo>,
    working: Option<CommitInfo>,
}

/// A named collection of stores sharing one version.
///
/// Stores are declared with [`MultiStore::mount`] and opened by
/// [`MultiStore::load_latest_version`]. Each block stages its writes on a
/// [`MultiStoreBranch`], applies it, and commits every tree at once.
pub struct MultiStore {
    dir: PathBuf,
    opts: Options,
    pending: Vec<(String, StoreType)>,
    stores: Vec<Mounted>,
    index: Arc<HashMap<String, usize>>,
    state: Mutex<CommitState>,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl MultiStore {
    /// Prepares a multi-store rooted at `dir`. Nothing is opened until
    /// [`MultiStore::load_latest_version`].
    pub fn open(dir: &Path, opts: Options) -> Result<Self> {
        fs::create_dir_all(dir.join(STORES_DIR))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            opts,
            pending: Vec::new(),
            stores: Vec::new(),
            index: Arc::default(),
            state: Mutex::default(),
        })
    }

    /// Declares a store. Names are unique across all store types.
    pub fn mount(&mut self, name: &str, store_type: StoreType) -> Result<()> {
        if !self.stores.is_empty() {
            return Err(StoreError::Invariant(format!(
                "cannot mount {name} after the stores were loaded"
            )));
        }
        if self.pending.iter().any(|(n, _)| n == name) {
            return Err(StoreError::AlreadyMounted(name.to_owned()));
        }
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StoreError::Invariant(format!("invalid store name {name:?}")));
        }
        self.pending.push((name.to_owned(), store_type));
        Ok(())
    }

    /// Opens every mounted store at the latest committed version.
    ///
    /// Every IAVL tree must be at the version of the newest commit info.
    /// Trees that are all one version ahead finished a commit whose info
    /// file was never written; that file is rebuilt from their roots.
    pub fn load_latest_version(&mut self) -> Result<()> {
        if !self.stores.is_empty() {
            return Err(StoreError::Invariant("stores already loaded".into()));
        }
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let opened: Vec<Result<Mounted>> = pending
            .par_iter()
            .map(|(name, store_type)| {
                let backend = match store_type {
                    StoreType::Iavl => {
                        let dir = self.dir.join(STORES_DIR).join(name);
                        Backend::Iavl(CommitTree::open(&dir, self.opts.clone())?)
                    }
                    StoreType::Transient => Backend::Mem(Arc::new(MemStore::new(true))),
                    StoreType::Memory => Backend::Mem(Arc::new(MemStore::new(false))),
                };
                Ok(Mounted {
                    name: name.clone(),
                    backend,
                })
            })
            .collect();
        let stores = opened.into_iter().collect::<Result<Vec<_>>>()?;

        let mut info = commit_info::load_latest(&self.dir)?;
        let version = info.as_ref().map_or(0, |ci| ci.version);
        let tree_versions: Vec<(&str, Version)> = stores
            .iter()
            .filter_map(|m| match &m.backend {
                Backend::Iavl(tree) => Some((m.name.as_str(), tree.version())),
                Backend::Mem(_) => None,
            })
            .collect();
        let ahead = !tree_versions.is_empty() && tree_versions.iter().all(|(_, v)| *v == version + 1);
        if ahead {
            let rebuilt = CommitInfo {
                version: version + 1,
                timestamp_nanos: now_nanos(),
                store_infos: store_infos(&stores),
            };
            commit_info::write(&self.dir, &rebuilt)?;
            tracing::warn!(
                target: "multistore",
                version = rebuilt.version,
                "rebuilt missing commit info from committed trees"
            );
            info = Some(rebuilt);
        } else if let Some((name, v)) = tree_versions.iter().find(|(_, v)| *v != version) {
            return Err(StoreError::Invariant(format!(
                "store {name} is at version {v}, commit info at {version}"
            )));
        }

        let version = info.as_ref().map_or(0, |ci| ci.version);
        self.index = Arc::new(
            stores
                .iter()
                .enumerate()
                .map(|(i, m)| (m.name.clone(), i))
                .collect(),
        );
        self.stores = stores;
        *self.state.lock() = CommitState {
            version,
            last_commit_info: info,
            working: None,
        };
        tracing::info!(
            target: "multistore",
            dir = %self.dir.display(),
            stores = self.stores.len(),
            version,
            "loaded multi-store"
        );
        Ok(())
    }

    /// The last committed version.
    pub fn version(&self) -> Version {
        self.state.lock().version
    }

    /// The id of the last commit; zero before the first commit.
    pub fn last_commit_id(&self) -> CommitId {
        self.state
            .lock()
            .last_commit_info
            .as_ref()
            .map(CommitInfo::commit_id)
            .unwrap_or_default()
    }

    /// The commit info of the last commit.
    pub fn last_commit_info(&self) -> Option<CommitInfo> {
        self.state.lock().last_commit_info.clone()
    }

    /// The stored commit info of `version`.
    pub fn commit_info(&self, version: Version) -> Result<CommitInfo> {
        commit_info::load(&self.dir, version)
    }

    /// The IAVL tree mounted as `name`.
    pub fn tree(&self, name: &str) -> Result<&CommitTree> {
        match self.mounted(name)?.backend {
            Backend::Iavl(ref tree) => Ok(tree),
            Backend::Mem(_) => Err(StoreError::NotFound(format!("store {name} is not an IAVL store"))),
        }
    }

    /// The in-memory store mounted as `name`.
    pub fn mem_store(&self, name: &str) -> Result<&Arc<MemStore>> {
        match self.mounted(name)?.backend {
            Backend::Mem(ref store) => Ok(store),
            Backend::Iavl(_) => Err(StoreError::NotFound(format!("store {name} is an IAVL store"))),
        }
    }

    fn mounted(&self, name: &str) -> Result<&Mounted> {
        self.index
            .get(name)
            .and_then(|i| self.stores.get(*i))
            .ok_or_else(|| StoreError::NotFound(format!("store {name} is not mounted")))
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.stores.is_empty() && !self.pending.is_empty() {
            return Err(StoreError::Invariant("load_latest_version was not called".into()));
        }
        Ok(())
    }

    /// A branch over every store, staging the next version.
    pub fn cache_multistore(&self) -> Result<MultiStoreBranch> {
        self.ensure_loaded()?;
        let state = self.state.lock();
        let branches = self
            .stores
            .iter()
            .map(|m| match &m.backend {
                Backend::Iavl(tree) => StoreBranch::Iavl(tree.branch()),
                Backend::Mem(store) => StoreBranch::Mem(MemBranch::new(Arc::clone(store))),
            })
            .collect();
        Ok(MultiStoreBranch {
            version: state.version + 1,
            branches,
            index: Arc::clone(&self.index),
        })
    }

    /// Alias of [`MultiStore::cache_multistore`].
    pub fn branch(&self) -> Result<MultiStoreBranch> {
        self.cache_multistore()
    }

    /// Applies every store's branch. All tree branches are checked before
    /// any is applied, so a stale branch leaves every store untouched.
    pub fn apply(&self, branch: MultiStoreBranch) -> Result<()> {
        let state = self.state.lock();
        if branch.version != state.version + 1 || !Arc::ptr_eq(&branch.index, &self.index) {
            return Err(StoreError::BranchStale(format!(
                "multi-store branch for version {} applied at version {}",
                branch.version,
                state.version + 1
            )));
        }
        if state.working.is_some() {
            return Err(StoreError::Invariant(format!(
                "version {} was already hashed; commit before applying more changes",
                state.version + 1
            )));
        }
        for (mounted, sb) in self.stores.iter().zip(&branch.branches) {
            if let (Backend::Iavl(tree), StoreBranch::Iavl(b)) = (&mounted.backend, sb) {
                tree.check_branch(b)?;
            }
        }
        for (mounted, sb) in self.stores.iter().zip(branch.branches) {
            match (&mounted.backend, sb) {
                (Backend::Iavl(tree), StoreBranch::Iavl(b)) => tree.apply(b)?,
                (Backend::Mem(store), StoreBranch::Mem(b)) => store.write(b.writes),
                _ => {
                    return Err(StoreError::Invariant(format!(
                        "branch layout does not match store {}",
                        mounted.name
                    )))
                }
            }
        }
        drop(state);
        Ok(())
    }

    fn working_info(&self, state: &mut CommitState) -> Result<CommitInfo> {
        if let Some(info) = &state.working {
            return Ok(info.clone());
        }
        let version = state.version + 1;
        let trees: Vec<(&str, &CommitTree)> = self
            .stores
            .iter()
            .filter_map(|m| match &m.backend {
                Backend::Iavl(tree) => Some((m.name.as_str(), tree)),
                Backend::Mem(_) => None,
            })
            .collect();
        let hashed: Vec<Result<StoreInfo>> = trees
            .par_iter()
            .map(|(name, tree)| {
                let hash = tree.working_hash()?;
                Ok(StoreInfo {
                    name: (*name).to_owned(),
                    commit_id: CommitId::new(version, hash.to_vec()),
                })
            })
            .collect();
        let info = CommitInfo {
            version,
            timestamp_nanos: now_nanos(),
            store_infos: hashed.into_iter().collect::<Result<Vec<_>>>()?,
        };
        state.working = Some(info.clone());
        Ok(info)
    }

    /// The root the next commit will produce. Hashes every tree in
    /// parallel; the result is cached until the commit.
    pub fn working_hash(&self) -> Result<Hash> {
        self.ensure_loaded()?;
        let mut state = self.state.lock();
        self.working_info(&mut state).map(|info| info.hash())
    }

    /// Commits every store at the next version.
    ///
    /// Trees commit in parallel. If any fails, the multi-store version does
    /// not advance and the error is returned; trees that already committed
    /// stay one version ahead and must be reconciled by the caller.
    pub fn commit(&self) -> Result<CommitId> {
        self.ensure_loaded()?;
        let mut state = self.state.lock();
        let info = self.working_info(&mut state)?;
        let version = info.version;

        let results: Vec<Result<()>> = self
            .stores
            .par_iter()
            .map(|m| match &m.backend {
                Backend::Iavl(tree) => {
                    let id = tree.commit()?;
                    if id.version != version {
                        return Err(StoreError::Invariant(format!(
                            "store {} committed version {}, expected {version}",
                            m.name, id.version
                        )));
                    }
                    Ok(())
                }
                Backend::Mem(_) => Ok(()),
            })
            .collect();
        let errors: Vec<StoreError> = results.into_iter().filter_map(|r| r.err()).collect();
        if let Err(e) = StoreError::join(errors) {
            state.working = None;
            error_metrics().inc_error("multistore", e.code());
            tracing::error!(target: "multistore", version, error = %e, "multi-store commit failed");
            return Err(e);
        }

        commit_info::write(&self.dir, &info)?;
        for m in &self.stores {
            if let Backend::Mem(store) = &m.backend {
                store.on_commit();
            }
        }
        let id = info.commit_id();
        state.version = version;
        state.last_commit_info = Some(info);
        state.working = None;
        drop(state);

        self.prune_commit_infos(version);
        tracing::debug!(target: "multistore", version, hash = %short_hex(&id.hash), "committed multi-store");
        Ok(id)
    }

    fn prune_commit_infos(&self, latest: Version) {
        let first_retained = self.opts.first_retained_version(latest);
        if first_retained == 0 {
            return;
        }
        match commit_info::prune(&self.dir, first_retained) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(target: "multistore", removed, first_retained, "pruned commit infos"),
            Err(e) => tracing::warn!(target: "multistore", error = %e, "failed to prune commit infos"),
        }
    }

    /// Closes every tree, collecting their errors.
    pub fn close(&self) -> Result<()> {
        let errors = self
            .stores
            .iter()
            .filter_map(|m| match &m.backend {
                Backend::Iavl(tree) => tree.close().err(),
                Backend::Mem(_) => None,
            })
            .collect();
        StoreError::join(errors)
    }
}

fn store_infos(stores: &[Mounted]) -> Vec<StoreInfo> {
    stores
        .iter()
        .filter_map(|m| match &m.backend {
            Backend::Iavl(tree) => Some(StoreInfo {
                name: m.name.clone(),
                commit_id: tree.last_commit_id(),
            }),
            Backend::Mem(_) => None,
        })
        .collect()
}

impl std::fmt::Debug for MultiStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiStore")
            .field("dir", &self.dir)
            .field("stores", &self.index.len())
            .field("version", &self.version())
            .finish()
    }
}
