// Path: crates/state/tests/compaction_e2e.rs

//! Orphan accounting and compaction across sealed changesets.

use bytes::Bytes;
use iavlx_state::CommitTree;
use iavlx_types::{Options, StoreError};
use std::path::Path;

// One changeset per version, compaction considered after every commit.
fn sealing(retain_versions: u32) -> Options {
    Options {
        changeset_max_target: 1,
        retain_versions,
        compaction_orphan_age: 0,
        compaction_orphan_ratio: 0.01,
        ..Options::for_testing()
    }
}

fn bump(tree: &CommitTree, round: u8) {
    let mut branch = tree.branch();
    branch.set(&b"hot"[..], vec![round]).unwrap();
    if round == 1 {
        branch.set(&b"cold"[..], &b"c"[..]).unwrap();
    }
    tree.apply(branch).unwrap();
    tree.commit().unwrap();
}

fn names(tree: &CommitTree) -> Vec<String> {
    tree.store()
        .changesets()
        .iter()
        .map(|cs| cs.name().to_string())
        .collect()
}

#[test]
fn orphans_are_counted_per_changeset() {
    let dir = tempfile::tempdir().unwrap();
    let tree = CommitTree::open(dir.path(), sealing(0)).unwrap();
    for round in 1..=4 {
        bump(&tree, round);
    }
    tree.store().flush_cleanup().unwrap();
    let changesets = tree.store().changesets();
    assert_eq!(changesets.len(), 4);

    // Version 1 wrote two leaves and a branch; the hot leaf and the branch
    // were replaced by version 2.
    let first = changesets[0].info();
    assert_eq!(first.leaf_orphans, 1);
    assert_eq!(first.branch_orphans, 1);
    let last = changesets[3].info();
    assert_eq!(last.leaf_orphans + last.branch_orphans, 0);

    // Nothing is dropped without a retention window.
    assert!(names(&tree).iter().all(|name| !name.contains('.')));
    for version in 1..=4 {
        assert!(tree.version_exists(version));
    }
}

#[test]
fn compaction_drops_versions_outside_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let tree = CommitTree::open(dir.path(), sealing(2)).unwrap();
    for round in 1..=6 {
        bump(&tree, round);
    }
    tree.store().flush_cleanup().unwrap();

    assert!(names(&tree).iter().any(|name| name.contains('.')), "{:?}", names(&tree));
    assert!(matches!(tree.get_immutable(1), Err(StoreError::NotFound(_))));
    let kept = tree.get_immutable(5).unwrap();
    assert_eq!(kept.get(b"hot").unwrap(), Some(Bytes::from(vec![5u8])));
    assert_eq!(kept.get(b"cold").unwrap(), Some(Bytes::from_static(b"c")));
    assert_eq!(tree.get(b"hot").unwrap(), Some(Bytes::from(vec![6u8])));
    tree.latest().verify().unwrap();

    let id = tree.last_commit_id();
    tree.close().unwrap();
    drop(tree);
    reopen_and_check(dir.path(), id.hash);
}

fn reopen_and_check(dir: &Path, hash: Vec<u8>) {
    let tree = CommitTree::open(dir, sealing(2)).unwrap();
    assert_eq!(tree.hash().to_vec(), hash);
    assert_eq!(tree.get(b"cold").unwrap(), Some(Bytes::from_static(b"c")));
    bump(&tree, 7);
    assert_eq!(tree.get(b"hot").unwrap(), Some(Bytes::from(vec![7u8])));
}

#[test]
fn disabled_compaction_keeps_every_version() {
    let dir = tempfile::tempdir().unwrap();
    let opts = Options {
        disable_compaction: true,
        ..sealing(2)
    };
    let tree = CommitTree::open(dir.path(), opts).unwrap();
    for round in 1..=5 {
        bump(&tree, round);
    }
    tree.store().flush_cleanup().unwrap();
    assert!(names(&tree).iter().all(|name| !name.contains('.')));
    let first = tree.get_immutable(1).unwrap();
    assert_eq!(first.get(b"hot").unwrap(), Some(Bytes::from(vec![1u8])));
}
