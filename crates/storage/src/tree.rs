//! The Tree contract
//!
//! `TreeManager` owns key storage for every index; what it does not own is
//! the bookkeeping of *where* an index lives. That belongs to the index's
//! owner (a class, the class map) and is reached through `IndexTree`:
//!
//! - `start_page` lazily creates the tree and returns its anchor page
//! - `add_root_page` / `remove_root_page` report height changes
//! - `lock` hands out a shared or exclusive guard for key mutation
//! - `persist` produces a `TreeHandle` a registered `TreeFactory` can turn
//!   back into the same tree, so an index can be reattached from its
//!   handle alone
//! - `destroy` drops the tree's keys and releases its pages

use crate::txn::Txn;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use pinstore_core::{PageId, Result};
use std::sync::Arc;

/// Lock mode for [`IndexTree::lock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers
    Shared,
    /// Writers and structural changes
    Exclusive,
}

/// RAII guard returned by [`IndexTree::lock`]; unlocks on drop
pub enum TreeGuard<'a> {
    /// Shared access
    Shared(RwLockReadGuard<'a, ()>),
    /// Exclusive access
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl TreeGuard<'_> {
    /// Mode the guard was taken in
    pub fn mode(&self) -> LockMode {
        match self {
            TreeGuard::Shared(_) => LockMode::Shared,
            TreeGuard::Exclusive(_) => LockMode::Exclusive,
        }
    }
}

/// Serialized reference to a tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeHandle {
    /// Id of the factory that can reattach the tree
    pub factory: u8,
    /// Factory-specific payload
    pub payload: Vec<u8>,
}

/// Owner-side view of one index tree
pub trait IndexTree: Send + Sync {
    /// Anchor page, creating the tree on first use
    fn start_page(&self, txn: &Txn) -> Result<PageId>;

    /// Anchor page if the tree exists
    fn anchor(&self) -> Option<PageId>;

    /// Current root page if the tree exists
    fn root(&self) -> Option<PageId>;

    /// Number of levels; 0 when the tree does not exist
    fn height(&self) -> u16;

    /// A new root was pushed above the current one
    fn add_root_page(&self, page: PageId, txn: &Txn) -> Result<()>;

    /// The root `page` was removed; `new_root` takes its place
    fn remove_root_page(&self, page: PageId, new_root: PageId, txn: &Txn) -> Result<()>;

    /// Lock the tree for key access
    fn lock(&self, mode: LockMode) -> TreeGuard<'_>;

    /// Handle from which the tree's factory can reattach it
    fn persist(&self) -> TreeHandle;

    /// Drop all keys and forget the tree
    fn destroy(&self, txn: &Txn) -> Result<()>;
}

/// Reattaches trees from their handles
pub trait TreeFactory: Send + Sync {
    /// Factory id written into handles
    fn factory_id(&self) -> u8;

    /// Rebuild a tree from a handle payload
    fn connect(&self, payload: &[u8]) -> Result<Arc<dyn IndexTree>>;
}
