//! Storage layer for pinstore
//!
//! This crate implements the substrate the classification engine writes to:
//! - PinStore: pins addressed by id, with a property secondary index
//! - PageAllocator: page ids for tree roots and levels
//! - TreeManager: multi-valued ordered trees keyed by anchor page
//! - IndexTree / TreeFactory: the contract between a tree and its owner
//! - SharedTree: the store-owned class map
//! - Txn / MiniTxn: undo-log transactions with nested savepoints

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod index;
pub mod page;
pub mod pins;
pub mod shared_tree;
pub mod storage;
pub mod tree;
pub mod tree_manager;
pub mod txn;

pub use config::StorageConfig;
pub use index::PropertyIndex;
pub use page::PageAllocator;
pub use pins::PinStore;
pub use shared_tree::{SharedTree, SHARED_TREE_FACTORY};
pub use storage::Storage;
pub use tree::{IndexTree, LockMode, TreeFactory, TreeGuard, TreeHandle};
pub use tree_manager::{TreeData, TreeManager};
pub use txn::{MiniTxn, Txn, TxnStatus};
