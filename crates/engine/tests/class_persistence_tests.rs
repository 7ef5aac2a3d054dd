//! Integration tests for persisted class state
//!
//! These tests verify:
//! - classes and their indexes survive reopening the classifier
//! - a corrupted index descriptor blocks only its own class
//! - class trees reattach through their persisted handle
//! - dropping a class purges its index and rolls back cleanly
//! - a class reloaded mid-transaction still sees rollback of its new root
//! - the classifier configuration loads from a TOML file

use pinstore_core::{Condition, Error, IndexSeg, PropertyId, SearchKey, Value, ValueType};
use pinstore_engine::{ClassSpec, Classifier, ClassifierConfig, CLASS_TREE_FACTORY};
use pinstore_storage::{IndexTree, Storage};
use std::sync::Arc;
use tempfile::TempDir;

const COLOR: PropertyId = PropertyId(300);
const SIZE: PropertyId = PropertyId(301);

fn by_size(color: &str) -> ClassSpec {
    ClassSpec::new(Condition::Eq(COLOR, color.into())).with_segment(IndexSeg::new(SIZE, ValueType::Int))
}

fn populate(storage: &Arc<Storage>, classifier: &Classifier, n: i64) {
    let txn = storage.begin();
    for i in 0..n {
        let color = if i % 2 == 0 { "red" } else { "blue" };
        let pin = storage
            .pins()
            .create([(COLOR, Value::from(color)), (SIZE, Value::Int(i))], &txn)
            .unwrap();
        classifier.pin_inserted(&pin, &txn).unwrap();
    }
    txn.commit().unwrap();
}

#[test]
fn test_reopen_keeps_classes_and_indexes() {
    let storage = Storage::in_memory();
    let (red, blue) = {
        let classifier = Classifier::new(storage.clone(), ClassifierConfig::default()).unwrap();
        let txn = storage.begin();
        let red = classifier.define_class(by_size("red"), &txn).unwrap();
        let blue = classifier.define_class(by_size("blue"), &txn).unwrap();
        txn.commit().unwrap();
        populate(&storage, &classifier, 30);
        (red, blue)
    };

    let classifier = Classifier::open(storage.clone(), ClassifierConfig::default()).unwrap();
    assert_eq!(classifier.class_ids(), vec![red, blue]);
    for cid in [red, blue] {
        let info = classifier.get_class_info(cid).unwrap();
        assert_eq!(info.cardinality, 15);
        assert!(info.materialized);
    }

    // writes after reopening continue the same index
    populate(&storage, &classifier, 2);
    assert_eq!(classifier.get_class_info(red).unwrap().cardinality, 16);
}

#[test]
fn test_corrupt_descriptor_is_isolated() {
    let storage = Storage::in_memory();
    let classifier = Classifier::new(storage.clone(), ClassifierConfig::default()).unwrap();
    let txn = storage.begin();
    let red = classifier.define_class(by_size("red"), &txn).unwrap();
    let blue = classifier.define_class(by_size("blue"), &txn).unwrap();
    txn.commit().unwrap();
    populate(&storage, &classifier, 20);

    let owner = classifier.get_class(red).unwrap().owner();
    drop(classifier);
    let txn = storage.begin();
    let mut pin = storage.pins().get(owner).unwrap();
    pin.set(PropertyId::INDEX_INFO, Value::Bytes(vec![1, 0, 0]));
    storage.pins().put(pin, &txn).unwrap();
    txn.commit().unwrap();

    let classifier = Classifier::open(storage.clone(), ClassifierConfig::default()).unwrap();
    let err = classifier.get_class(red).unwrap_err();
    assert!(matches!(err, Error::Corruption { cid, .. } if cid == red), "{:?}", err);
    assert_eq!(classifier.get_class_info(blue).unwrap().cardinality, 10);

    let txn = storage.begin();
    let stats = classifier.rebuild_all(&txn).unwrap();
    txn.commit().unwrap();
    assert_eq!(stats.skipped, vec![red]);
    assert_eq!(classifier.get_class_info(blue).unwrap().cardinality, 10);
}

#[test]
fn test_tree_handle_reconnects() {
    let storage = Storage::in_memory();
    let classifier = Classifier::new(storage.clone(), ClassifierConfig::default()).unwrap();
    let txn = storage.begin();
    let red = classifier.define_class(by_size("red"), &txn).unwrap();
    txn.commit().unwrap();
    populate(&storage, &classifier, 6);

    let class = classifier.get_class(red).unwrap();
    let tree = class.tree().unwrap();
    let handle = tree.persist();
    assert_eq!(handle.factory, CLASS_TREE_FACTORY);

    let connected = storage.trees().connect(&handle).unwrap();
    assert_eq!(connected.anchor(), tree.anchor());
    let key = SearchKey::single(&IndexSeg::new(SIZE, ValueType::Int), &Value::Int(4))
        .unwrap()
        .unwrap();
    assert_eq!(storage.trees().values(&*connected, key.as_bytes()).len(), 1);
}

#[test]
fn test_drop_class_purges_and_rolls_back() {
    let storage = Storage::in_memory();
    let classifier = Classifier::new(storage.clone(), ClassifierConfig::default()).unwrap();
    let txn = storage.begin();
    let red = classifier.define_class(by_size("red"), &txn).unwrap();
    let listed = classifier
        .define_class(ClassSpec::new(Condition::Exists(SIZE)).indexed(), &txn)
        .unwrap();
    txn.commit().unwrap();
    populate(&storage, &classifier, 8);
    let tree_anchor = {
        let class = classifier.get_class(red).unwrap();
        class.tree().unwrap().anchor().unwrap()
    };

    // rolled back: everything is still there
    let txn = storage.begin();
    classifier.drop_class(red, &txn).unwrap();
    classifier.drop_class(listed, &txn).unwrap();
    assert!(classifier.class_ids().is_empty());
    txn.rollback();
    assert_eq!(classifier.class_ids(), vec![red, listed]);
    assert_eq!(classifier.get_class_info(red).unwrap().cardinality, 4);
    assert_eq!(classifier.members(listed).unwrap().len(), 8);

    let txn = storage.begin();
    classifier.drop_class(red, &txn).unwrap();
    classifier.drop_class(listed, &txn).unwrap();
    txn.commit().unwrap();
    assert!(classifier.class_ids().is_empty());
    assert!(!storage.trees().exists(tree_anchor));
    assert_eq!(storage.trees().key_count(storage.class_map(), &listed.to_key()), 0);
    assert!(classifier.get_class(red).unwrap_err().is_not_found());
}

#[test]
fn test_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pinstore.toml");
    std::fs::write(
        &path,
        "class_cache_capacity = 8\nbulk_memory_budget = 4096\nactive_stores = 2\n\n[storage]\ntree_fanout = 4\n",
    )
    .unwrap();
    let config = ClassifierConfig::from_file(&path).unwrap();
    assert_eq!(config.class_cache_capacity, 8);
    assert_eq!(config.per_store_budget(), 2048);
    assert_eq!(config.storage.tree_fanout, 4);

    // a small fanout forces multi-level trees; counts stay exact
    let storage = Storage::new(config.storage);
    let classifier = Classifier::new(storage.clone(), config).unwrap();
    let txn = storage.begin();
    let red = classifier.define_class(by_size("red"), &txn).unwrap();
    txn.commit().unwrap();
    populate(&storage, &classifier, 60);
    assert_eq!(classifier.get_class_info(red).unwrap().cardinality, 30);
    let class = classifier.get_class(red).unwrap();
    assert!(class.tree().unwrap().height() > 1);
}

#[test]
fn test_reloaded_class_follows_root_rollback() {
    let storage = Storage::in_memory();
    let config = ClassifierConfig {
        class_cache_capacity: 1,
        ..Default::default()
    };
    let classifier = Classifier::new(storage.clone(), config).unwrap();
    let txn = storage.begin();
    let red = classifier.define_class(by_size("red"), &txn).unwrap();
    let blue = classifier.define_class(by_size("blue"), &txn).unwrap();
    txn.commit().unwrap();

    let txn = storage.begin();
    let pin = storage
        .pins()
        .create([(COLOR, Value::from("red")), (SIZE, Value::Int(1))], &txn)
        .unwrap();
    classifier.pin_inserted(&pin, &txn).unwrap();
    assert!(classifier.get_class(red).unwrap().tree().unwrap().anchor().is_some());
    // loading the other class pushes the first out of the cache
    classifier.get_class(blue).unwrap();
    let reloaded = classifier.get_class(red).unwrap();
    assert!(reloaded.tree().unwrap().anchor().is_some());
    drop(reloaded);
    txn.rollback();

    assert!(classifier.get_class(red).unwrap().tree().unwrap().anchor().is_none());
    assert_eq!(storage.pages().in_use(), 0);
    populate(&storage, &classifier, 4);
    assert_eq!(classifier.get_class_info(red).unwrap().cardinality, 2);
    assert_eq!(classifier.get_class_info(blue).unwrap().cardinality, 2);
}
