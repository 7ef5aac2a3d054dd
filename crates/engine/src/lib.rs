//! Classification and index maintenance for pinstore
//!
//! This crate decides which classes a pin belongs to and keeps every
//! class index in step with pin writes:
//! - Classifier: class lifecycle, routing and per-write maintenance
//! - PropertyTrie: routes a pin's property set to candidate classes
//! - Incremental maintenance: phase-driven index updates (`maintain`)
//! - Bulk builds: `rebuild_all` and `classify_all` under a memory budget
//! - ClassIndexTree: one class's composite index as a storage tree
//!
//! Storage, pins and transactions come from `pinstore-storage`; values,
//! predicates and keys from `pinstore-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actions;
pub mod bulk;
pub mod cache;
pub mod class;
pub mod classifier;
pub mod config;
pub mod index_tree;
pub mod maintain;
pub mod registry;
pub mod result;
pub mod spill;
pub mod trie;

pub use actions::{ActionKind, ClassAction, ClassActions};
pub use bulk::BuildStats;
pub use cache::ClassCache;
pub use class::{Class, ClassFlags, ClassInfo, ClassSpec, IndexDescriptor, Window};
pub use classifier::Classifier;
pub use config::ClassifierConfig;
pub use index_tree::{ClassIndexTree, ClassTreeFactory, TreeState, CLASS_TREE_FACTORY};
pub use maintain::{IndexOp, Phase, PhaseMask};
pub use registry::{ClassRef, NotifyMask};
pub use result::ClassResult;
pub use spill::ExternalRefBuffer;
pub use trie::PropertyTrie;
