// Path: crates/state/tests/properties.rs

//! Randomized operation sequences checked against a `BTreeMap` model.

use iavlx_state::proof::{verify_membership, verify_non_membership};
use iavlx_state::CommitTree;
use iavlx_types::Options;
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

fn key() -> impl Strategy<Value = Vec<u8>> {
    // A small alphabet so sequences revisit keys.
    prop::collection::vec(0u8..8, 1..4)
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (key(), prop::collection::vec(any::<u8>(), 0..8)).prop_map(|(k, v)| Op::Set(k, v)),
        1 => key().prop_map(Op::Delete),
    ]
}

fn batches() -> impl Strategy<Value = Vec<Vec<Op>>> {
    prop::collection::vec(prop::collection::vec(op(), 0..24), 1..5)
}

fn run(tree: &CommitTree, model: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: &[Op]) {
    let mut branch = tree.branch();
    for op in ops {
        match op {
            Op::Set(k, v) => {
                let replaced = branch.set(k.clone(), v.clone()).unwrap();
                assert_eq!(replaced, model.insert(k.clone(), v.clone()).is_some());
            }
            Op::Delete(k) => {
                let removed = branch.delete(k).unwrap().map(|b| b.to_vec());
                assert_eq!(removed, model.remove(k));
            }
        }
    }
    branch.verify().unwrap();
    tree.apply(branch).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn committed_state_matches_the_model(batches in batches()) {
        let dir = tempfile::tempdir().unwrap();
        let tree = CommitTree::open(dir.path(), Options::for_testing()).unwrap();
        let mut model = BTreeMap::new();
        for ops in &batches {
            run(&tree, &mut model, ops);
            tree.commit().unwrap();

            let latest = tree.latest();
            latest.verify().unwrap();
            prop_assert_eq!(latest.size().unwrap(), model.len() as u64);
            let listed: Vec<(Vec<u8>, Vec<u8>)> = latest
                .iterator(None, None)
                .unwrap()
                .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())).unwrap())
                .collect();
            let expected: Vec<(Vec<u8>, Vec<u8>)> =
                model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            prop_assert_eq!(listed, expected);
        }
    }

    #[test]
    fn proofs_verify_for_every_queried_key(batches in batches(), queries in prop::collection::vec(key(), 1..12)) {
        let dir = tempfile::tempdir().unwrap();
        let tree = CommitTree::open(dir.path(), Options::for_testing()).unwrap();
        let mut model = BTreeMap::new();
        for ops in &batches {
            run(&tree, &mut model, ops);
            tree.commit().unwrap();
        }
        let root = tree.hash();
        for query in &queries {
            match model.get(query) {
                Some(value) => {
                    let proof = tree.get_membership_proof(query).unwrap();
                    prop_assert!(verify_membership(&root, query, value, &proof));
                }
                None => {
                    let proof = tree.get_non_membership_proof(query).unwrap();
                    prop_assert!(verify_non_membership(&root, query, &proof));
                }
            }
        }
    }

    #[test]
    fn hash_ignores_how_a_version_is_batched(ops in prop::collection::vec(op(), 1..40), split in 0usize..40) {
        let split = split.min(ops.len());
        let mut hashes = Vec::new();
        for chunks in [vec![&ops[..]], vec![&ops[..split], &ops[split..]]] {
            let dir = tempfile::tempdir().unwrap();
            let tree = CommitTree::open(dir.path(), Options::for_testing()).unwrap();
            let mut model = BTreeMap::new();
            for chunk in chunks {
                run(&tree, &mut model, chunk);
            }
            hashes.push(tree.commit().unwrap().hash);
        }
        prop_assert_eq!(&hashes[0], &hashes[1]);
    }

    #[test]
    fn hash_depends_on_the_version(pairs in prop::collection::btree_map(key(), key(), 1..16)) {
        let dir = tempfile::tempdir().unwrap();
        let tree = CommitTree::open(dir.path(), Options::for_testing()).unwrap();
        tree.commit().unwrap();
        let mut branch = tree.branch();
        for (k, v) in &pairs {
            branch.set(k.clone(), v.clone()).unwrap();
        }
        tree.apply(branch).unwrap();
        let late = tree.commit().unwrap().hash;

        let dir = tempfile::tempdir().unwrap();
        let tree = CommitTree::open(dir.path(), Options::for_testing()).unwrap();
        let mut branch = tree.branch();
        for (k, v) in &pairs {
            branch.set(k.clone(), v.clone()).unwrap();
        }
        tree.apply(branch).unwrap();
        let early = tree.commit().unwrap().hash;
        prop_assert_ne!(early, late);
    }
}
