use super::*;
use crate::node::{MemNode, NodeMeta};
use bytes::Bytes;
use iavlx_storage::KvUpdate;
use iavlx_types::hash::sha256;

fn meta(is_leaf: bool, version: Version, index: u64) -> NodeMeta {
    let id = NodeId::new(is_leaf, u64::from(version), index).unwrap();
    NodeMeta {
        id,
        hash: sha256(&id.raw().to_le_bytes()),
    }
}

fn leaf(key: &'static [u8], version: Version, index: u64) -> Arc<NodePointer> {
    let node = MemNode::leaf(Bytes::from_static(key), Bytes::from_static(b"val"), version);
    node.assign(meta(true, version, index)).unwrap();
    NodePointer::from_mem(node)
}

fn branch(
    key: &'static [u8],
    version: Version,
    index: u64,
    left: Arc<NodePointer>,
    right: Arc<NodePointer>,
) -> Arc<NodePointer> {
    let node = MemNode::branch(Bytes::from_static(key), version, 1, 2, left, right);
    node.assign(meta(false, version, index)).unwrap();
    NodePointer::from_mem(node)
}

/// Version 1 holds leaf a; version 2 is (a b).
fn save_two(store: &TreeStore) -> (Arc<NodePointer>, Arc<NodePointer>) {
    let a = leaf(b"a", 1, 1);
    store.save_root(1, Some(&a), 1, 0).unwrap();
    let b = leaf(b"b", 2, 1);
    let root = branch(b"b", 2, 1, Arc::clone(&a), b);
    store.save_root(2, Some(&root), 1, 1).unwrap();
    (a, root)
}

#[test]
fn saved_versions_resolve_and_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    let (_, root) = save_two(&store);
    assert_eq!(store.latest_version(), 2);
    assert_eq!(store.saved_version(), 2);

    let loaded = store.root_at(2).unwrap().unwrap();
    assert_eq!(loaded.id(), root.id());
    let node = loaded.resolve(&store).unwrap();
    let left = node.left().unwrap().resolve(&store).unwrap();
    assert_eq!(left.key_value().unwrap().0, Bytes::from_static(b"a"));
    store.close().unwrap();
    assert!(matches!(store.root_at(2), Err(StoreError::Closed)));
    drop(store);

    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    assert_eq!(store.latest_version(), 2);
    assert!(store.has_version(1));
    assert!(!store.has_version(3));
    let v1 = store.root_at(1).unwrap().unwrap().resolve(&store).unwrap();
    assert_eq!(v1.key().unwrap(), Bytes::from_static(b"a"));
    assert!(store.take_wal_tail().is_none());
}

#[test]
fn seals_once_the_size_target_is_reached() {
    let dir = tempfile::tempdir().unwrap();
    let opts = Options {
        changeset_max_target: 1,
        ..Options::for_testing()
    };
    let store = TreeStore::open(dir.path(), opts).unwrap();
    save_two(&store);
    let names: Vec<String> = store.changesets().iter().map(|cs| cs.name().to_string()).collect();
    assert_eq!(names, vec!["1", "2"]);
    assert!(store.changesets().iter().all(|cs| cs.owns_files()));
    store.flush_sync().unwrap();
    // Version 2 references leaf a across changesets.
    let root = store.root_at(2).unwrap().unwrap().resolve(&store).unwrap();
    let left = root.left().unwrap();
    assert_eq!(left.loc().unwrap().id, meta(true, 1, 1).id);
    assert_eq!(left.resolve(&store).unwrap().key().unwrap(), Bytes::from_static(b"a"));
}

#[test]
fn unpublished_versions_are_not_readable() {
    let dir = tempfile::tempdir().unwrap();
    let opts = Options {
        reader_update_interval: 0,
        ..Options::for_testing()
    };
    let store = TreeStore::open(dir.path(), opts).unwrap();
    save_two(&store);
    assert_eq!(store.latest_version(), 2);
    assert_eq!(store.saved_version(), 0);
    assert!(matches!(store.root_at(1), Err(StoreError::NotFound(_))));
}

#[test]
fn logged_but_unsaved_version_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
        let kv = store.kv_log_for(1).unwrap();
        kv.lock()
            .write_updates(&[
                KvUpdate::Set { key: b"a", value: b"1" },
                KvUpdate::Delete { key: b"z" },
            ])
            .unwrap();
        store.write_commit_marker(1).unwrap();
        store.close().unwrap();
    }
    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    assert_eq!(store.latest_version(), 0);
    assert!(!dir.path().join("1").exists());
    let tail = store.take_wal_tail().unwrap();
    assert_eq!(tail.version, 1);
    assert_eq!(
        tail.entries,
        vec![
            WalEntry::Set(Bytes::from_static(b"a"), Bytes::from_static(b"1")),
            WalEntry::Delete(Bytes::from_static(b"z")),
        ]
    );
    assert!(store.take_wal_tail().is_none());
}

#[test]
fn second_open_of_a_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let _store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    assert!(matches!(
        TreeStore::open(dir.path(), Options::for_testing()),
        Err(StoreError::Io(_))
    ));
}

#[test]
fn orphan_marks_reach_their_changeset() {
    let dir = tempfile::tempdir().unwrap();
    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    let (a, root) = save_two(&store);
    let c = leaf(b"c", 3, 1);
    let v3 = branch(b"c", 3, 1, a, c);
    store.save_root(3, Some(&v3), 1, 1).unwrap();
    store.mark_orphans(3, vec![vec![root.id().unwrap()], vec![meta(true, 2, 1).id]]);
    store.flush_cleanup().unwrap();

    let info = store.changesets()[0].info();
    assert_eq!(info.branch_orphans, 1);
    assert_eq!(info.leaf_orphans, 1);
    assert_eq!(info.orphans(), 2);
    store.close().unwrap();
    drop(store);

    // Marks and the summary survive a reopen.
    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    assert_eq!(store.changesets()[0].info().orphans(), 2);
}

#[test]
fn out_of_order_save_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    let a = leaf(b"a", 1, 1);
    store.save_root(1, Some(&a), 1, 0).unwrap();
    assert!(matches!(
        store.save_root(3, None, 0, 0),
        Err(StoreError::OutOfRange(_))
    ));
    store.save_root(2, None, 0, 0).unwrap();
    assert!(store.root_at(2).unwrap().is_none());
}

#[test]
fn background_sync_failure_fails_the_next_save() {
    let dir = tempfile::tempdir().unwrap();
    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    let a = leaf(b"a", 1, 1);
    store.save_root(1, Some(&a), 1, 0).unwrap();

    store
        .syncer
        .record_failure(StoreError::Io(io::Error::other("fsync failed")));
    let b = leaf(b"b", 2, 1);
    assert!(matches!(
        store.save_root(2, Some(&b), 1, 0),
        Err(StoreError::Io(_))
    ));
    // Nothing was staged, so the same version can be saved again.
    assert_eq!(store.latest_version(), 1);
    store.save_root(2, Some(&b), 1, 0).unwrap();
    assert_eq!(store.latest_version(), 2);
    store.flush_sync().unwrap();
}

#[test]
fn failed_write_out_stops_further_saves() {
    let dir = tempfile::tempdir().unwrap();
    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    let a = leaf(b"a", 1, 1);
    store.save_root(1, Some(&a), 1, 0).unwrap();

    let err = store.fail("flush", 2, StoreError::Io(io::Error::other("short write")));
    assert!(matches!(err, StoreError::Io(_)));
    assert!(matches!(
        store.save_root(2, None, 0, 0),
        Err(StoreError::Invariant(_))
    ));
    // Reads of saved versions keep working.
    assert!(store.root_at(1).unwrap().is_some());
    store.close().unwrap();
    drop(store);

    let store = TreeStore::open(dir.path(), Options::for_testing()).unwrap();
    assert_eq!(store.latest_version(), 1);
    store.save_root(2, None, 0, 0).unwrap();
}
