// Path: crates/multistore/tests/multistore_e2e.rs

use bytes::Bytes;
use iavlx_multistore::{open_multistore, MultiStore, StoreType};
use iavlx_types::hash::empty_hash;
use iavlx_types::{Options, StoreError};
use std::path::Path;

fn load(dir: &Path) -> MultiStore {
    let mut ms = open_multistore(dir, Options::for_testing()).unwrap();
    ms.mount("bank", StoreType::Iavl).unwrap();
    ms.mount("acc", StoreType::Iavl).unwrap();
    ms.mount("tx", StoreType::Transient).unwrap();
    ms.mount("params", StoreType::Memory).unwrap();
    ms.load_latest_version().unwrap();
    ms
}

fn b(s: &'static str) -> Bytes {
    Bytes::from_static(s.as_bytes())
}

#[test]
fn duplicate_mounts_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut ms = MultiStore::open(dir.path(), Options::for_testing()).unwrap();
    ms.mount("bank", StoreType::Iavl).unwrap();
    assert!(matches!(
        ms.mount("bank", StoreType::Memory),
        Err(StoreError::AlreadyMounted(_))
    ));
    ms.load_latest_version().unwrap();
    assert!(ms.mount("late", StoreType::Iavl).is_err());
}

#[test]
fn commit_hashes_every_tree_and_persists_commit_info() {
    let dir = tempfile::tempdir().unwrap();
    let ms = load(dir.path());
    assert!(ms.last_commit_id().is_zero());

    let mut branch = ms.cache_multistore().unwrap();
    assert_eq!(branch.version(), 1);
    branch.kv_store("bank").unwrap().set(b("alice"), b("10")).unwrap();
    branch.kv_store("acc").unwrap().set(b("alice"), b("acct")).unwrap();
    branch.kv_store("tx").unwrap().set(b("fee"), b("1")).unwrap();
    branch.kv_store("params").unwrap().set(b("max"), b("5")).unwrap();
    assert!(branch.kv_store("missing").is_err());
    ms.apply(branch).unwrap();
    assert_eq!(ms.mem_store("tx").unwrap().get(b"fee"), Some(b("1")));

    let working = ms.working_hash().unwrap();
    let id = ms.commit().unwrap();
    assert_eq!(id.version, 1);
    assert_eq!(id.hash, working.to_vec());
    assert_eq!(ms.last_commit_id(), id);

    let info = ms.commit_info(1).unwrap();
    assert_eq!(info.commit_id(), id);
    let names: Vec<&str> = info.store_infos.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["acc", "bank"]);
    assert_eq!(info.store_infos[1].commit_id, ms.tree("bank").unwrap().last_commit_id());

    // Transient stores empty on commit; memory stores do not.
    assert!(ms.mem_store("tx").unwrap().is_empty());
    assert_eq!(ms.mem_store("params").unwrap().get(b"max"), Some(b("5")));
    assert_eq!(ms.tree("bank").unwrap().get(b"alice").unwrap(), Some(b("10")));
}

#[test]
fn reload_restores_the_last_commit() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let ms = load(dir.path());
        for round in 0..3u8 {
            let mut branch = ms.cache_multistore().unwrap();
            branch
                .kv_store("bank")
                .unwrap()
                .set(b("k"), Bytes::from(vec![round]))
                .unwrap();
            ms.apply(branch).unwrap();
            ms.commit().unwrap();
        }
        let id = ms.last_commit_id();
        ms.close().unwrap();
        id
    };
    let ms = load(dir.path());
    assert_eq!(ms.version(), 3);
    assert_eq!(ms.last_commit_id(), id);
    assert_eq!(ms.tree("bank").unwrap().get(b"k").unwrap(), Some(Bytes::from(vec![2u8])));
    // Untouched trees still advance with the multi-store.
    assert_eq!(ms.tree("acc").unwrap().version(), 3);
    assert_eq!(ms.tree("acc").unwrap().hash(), empty_hash());
}

#[test]
fn stale_branch_touches_no_store() {
    let dir = tempfile::tempdir().unwrap();
    let ms = load(dir.path());
    let mut first = ms.cache_multistore().unwrap();
    let mut second = ms.cache_multistore().unwrap();
    first.kv_store("bank").unwrap().set(b("a"), b("1")).unwrap();
    second.kv_store("acc").unwrap().set(b("b"), b("2")).unwrap();
    second.kv_store("bank").unwrap().set(b("c"), b("3")).unwrap();
    ms.apply(first).unwrap();
    assert!(matches!(ms.apply(second), Err(StoreError::BranchStale(_))));
    ms.commit().unwrap();
    assert!(!ms.tree("acc").unwrap().has(b"b").unwrap());
    assert!(!ms.tree("bank").unwrap().has(b"c").unwrap());
}

#[test]
fn missing_commit_info_is_rebuilt_from_trees() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let ms = load(dir.path());
        let mut branch = ms.cache_multistore().unwrap();
        branch.kv_store("acc").unwrap().set(b("x"), b("y")).unwrap();
        ms.apply(branch).unwrap();
        let id = ms.commit().unwrap();
        ms.close().unwrap();
        id
    };
    std::fs::remove_file(dir.path().join("commit_info").join("1")).unwrap();
    let ms = load(dir.path());
    assert_eq!(ms.version(), 1);
    assert_eq!(ms.last_commit_id(), id);
    assert!(ms.commit_info(1).is_ok());
}

#[test]
fn old_commit_infos_are_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let mut ms = MultiStore::open(
        dir.path(),
        Options {
            retain_versions: 2,
            ..Options::for_testing()
        },
    )
    .unwrap();
    ms.mount("bank", StoreType::Iavl).unwrap();
    ms.load_latest_version().unwrap();
    for _ in 0..4 {
        ms.commit().unwrap();
    }
    assert!(matches!(ms.commit_info(1), Err(StoreError::NotFound(_))));
    assert!(matches!(ms.commit_info(2), Err(StoreError::NotFound(_))));
    assert!(ms.commit_info(3).is_ok());
    assert!(ms.commit_info(4).is_ok());
}
