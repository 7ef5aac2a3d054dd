//! Integration tests for multi-valued trees under transactions
//!
//! These tests verify:
//! - tree contents agree with an ordered map model after random writes
//! - tree height always covers the entry count for the configured fanout
//! - rolling back restores entries, height and page usage

use pinstore_storage::{IndexTree, Storage, StorageConfig, Txn};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, u8),
    Remove(u8, u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..6, 0u8..8).prop_map(|(k, v)| Op::Insert(k, v)),
        1 => (0u8..6, 0u8..8).prop_map(|(k, v)| Op::Remove(k, v)),
    ]
}

type Model = BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>;

fn small_store() -> Arc<Storage> {
    Storage::new(StorageConfig {
        tree_fanout: 3,
        max_pages: None,
    })
}

fn apply(storage: &Arc<Storage>, ops: &[Op], model: &mut Model, txn: &Txn) {
    let map = storage.class_map();
    for op in ops {
        match *op {
            Op::Insert(k, v) => {
                let fresh = model.entry(vec![k]).or_default().insert(vec![v]);
                assert_eq!(storage.trees().insert(map, &[k], &[v], txn).unwrap(), fresh);
            }
            Op::Remove(k, v) => {
                let present = model.get_mut(&vec![k]).map_or(false, |vs| vs.remove(&vec![v]));
                let res = storage.trees().remove(map, &[k], &[v], txn);
                if present {
                    res.unwrap();
                } else {
                    assert!(res.unwrap_err().is_not_found());
                }
            }
        }
        assert!(storage.trees().count(map) <= storage.trees().capacity(map.height().max(1)));
    }
    model.retain(|_, vs| !vs.is_empty());
}

fn flatten(model: &Model) -> Vec<(Vec<u8>, Vec<u8>)> {
    model
        .iter()
        .flat_map(|(k, vs)| vs.iter().map(move |v| (k.clone(), v.clone())))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tree_matches_model(ops in prop::collection::vec(op_strategy(), 0..80)) {
        let storage = small_store();
        let mut model = Model::new();
        let txn = storage.begin();
        apply(&storage, &ops, &mut model, &txn);
        txn.commit().unwrap();

        let map = storage.class_map();
        prop_assert_eq!(storage.trees().scan(map), flatten(&model));
        for (k, vs) in &model {
            prop_assert_eq!(storage.trees().key_count(map, k), vs.len());
        }
    }

    #[test]
    fn prop_rollback_restores_tree(
        setup in prop::collection::vec(op_strategy(), 1..40),
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let storage = small_store();
        let mut model = Model::new();
        let txn = storage.begin();
        apply(&storage, &setup, &mut model, &txn);
        txn.commit().unwrap();

        let map = storage.class_map();
        let before = storage.trees().scan(map);
        let height = map.height();
        let pages = storage.pages().in_use();

        let txn = storage.begin();
        apply(&storage, &ops, &mut model.clone(), &txn);
        txn.rollback();

        prop_assert_eq!(storage.trees().scan(map), before);
        prop_assert_eq!(map.height(), height);
        prop_assert_eq!(storage.pages().in_use(), pages);
    }
}

#[test]
fn test_nested_minis_unwind_in_order() {
    let storage = small_store();
    let map = storage.class_map();
    let txn = storage.begin();
    storage.trees().insert(map, b"a", b"1", &txn).unwrap();
    let outer = txn.mini();
    storage.trees().insert(map, b"b", b"1", &txn).unwrap();
    {
        let _inner = txn.mini();
        for v in 0..10u8 {
            storage.trees().insert(map, b"c", &[v], &txn).unwrap();
        }
        assert!(map.height() > 1);
        assert_eq!(txn.depth(), 2);
    }
    assert_eq!(txn.depth(), 1);
    assert_eq!(map.height(), 1);
    outer.commit();
    txn.commit().unwrap();
    assert_eq!(
        storage.trees().scan(map),
        vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"1".to_vec())]
    );
}
