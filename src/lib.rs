//! pinstore - predicate classification and index maintenance for pin stores
//!
//! A pin is a record of typed properties. A class is a predicate over
//! those properties, optionally with a composite index over some of
//! them. pinstore routes every pin to the classes it belongs to and keeps
//! each class index in step with pin writes.
//!
//! # Quick Start
//!
//! ```
//! use pinstore::{ClassSpec, Classifier, ClassifierConfig, Condition, PropertyId, Storage, Value};
//!
//! let storage = Storage::in_memory();
//! let classifier = Classifier::new(storage.clone(), ClassifierConfig::default())?;
//!
//! let color = PropertyId(300);
//! let txn = storage.begin();
//! let red = classifier.define_class(ClassSpec::new(Condition::Eq(color, "red".into())).indexed(), &txn)?;
//!
//! let pin = storage.pins().create([(color, Value::from("red"))], &txn)?;
//! classifier.pin_inserted(&pin, &txn)?;
//! txn.commit()?;
//!
//! assert_eq!(classifier.members(red)?, vec![pin.id()]);
//! # Ok::<(), pinstore::Error>(())
//! ```
//!
//! # Architecture
//!
//! - `pinstore-core`: values, pins, predicates, index keys, errors
//! - `pinstore-storage`: pin store, index trees, transactions
//! - `pinstore-engine`: classification, incremental and bulk maintenance

pub use pinstore_core::*;
pub use pinstore_engine::*;
pub use pinstore_storage::{IndexTree, Storage, StorageConfig, TreeFactory, TreeHandle, Txn};
