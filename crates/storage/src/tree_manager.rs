//! Generic multi-valued tree manager
//!
//! Stores the keys of every index, addressed by the index's anchor page:
//! `DashMap<anchor, TreeData>`, where each tree is an ordered map from key
//! bytes to the set of stored values under that key. Keys and values are
//! opaque byte strings compared bytewise.
//!
//! # Height Bookkeeping
//!
//! Each level of the tree holds up to `fanout` times the entries of the
//! level below, so a tree of height `h` holds at most `fanout^h` entries.
//! When an insert crosses that bound the manager allocates a page and
//! reports it through `IndexTree::add_root_page`; when a removal drops
//! the count to what `h - 1` levels can hold, the top page is released
//! through `IndexTree::remove_root_page`. The owner persists root and
//! height; the manager only keeps the page chain for release.
//!
//! Every mutation records undo into the caller's transaction.

use crate::page::PageAllocator;
use crate::tree::{IndexTree, LockMode, TreeFactory, TreeHandle};
use crate::txn::{Txn, UndoRecord};
use dashmap::DashMap;
use parking_lot::RwLock;
use pinstore_core::{Error, PageId, Result};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

/// Keys of one tree
#[derive(Debug, Clone, Default)]
pub struct TreeData {
    entries: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
    count: usize,
    levels: Vec<PageId>,
}

impl TreeData {
    fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        let inserted = self
            .entries
            .entry(key.to_vec())
            .or_default()
            .insert(value.to_vec());
        if inserted {
            self.count += 1;
        }
        inserted
    }

    fn remove(&mut self, key: &[u8], value: &[u8]) -> bool {
        let Some(values) = self.entries.get_mut(key) else {
            return false;
        };
        let removed = values.remove(value);
        if values.is_empty() {
            self.entries.remove(key);
        }
        if removed {
            self.count -= 1;
        }
        removed
    }
}

/// Owner of all index keys
pub struct TreeManager {
    trees: DashMap<PageId, TreeData>,
    factories: RwLock<FxHashMap<u8, Arc<dyn TreeFactory>>>,
    pages: Arc<PageAllocator>,
    fanout: usize,
}

impl TreeManager {
    /// Create a manager allocating level pages from `pages`
    pub fn new(pages: Arc<PageAllocator>, fanout: usize) -> Self {
        Self {
            trees: DashMap::new(),
            factories: RwLock::new(FxHashMap::default()),
            pages,
            fanout: fanout.max(2),
        }
    }

    /// Entries a tree of `height` levels can hold
    pub fn capacity(&self, height: u16) -> usize {
        self.fanout
            .checked_pow(height as u32)
            .unwrap_or(usize::MAX)
    }

    // ========================================================================
    // Factories
    // ========================================================================

    /// Register a factory; replaces any factory with the same id
    pub fn register_factory(&self, factory: Arc<dyn TreeFactory>) {
        self.factories.write().insert(factory.factory_id(), factory);
    }

    /// Reattach a tree from its handle
    pub fn connect(&self, handle: &TreeHandle) -> Result<Arc<dyn IndexTree>> {
        let factory = self
            .factories
            .read()
            .get(&handle.factory)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("tree factory {}", handle.factory)))?;
        factory.connect(&handle.payload)
    }

    // ========================================================================
    // Tree lifecycle
    // ========================================================================

    /// Create an empty tree at `anchor`
    pub fn create(&self, anchor: PageId, txn: &Txn) -> Result<()> {
        if self.trees.contains_key(&anchor) {
            return Err(Error::AlreadyExists(format!("tree at {}", anchor)));
        }
        txn.record(UndoRecord::TreeCreate { anchor })?;
        self.trees.insert(anchor, TreeData::default());
        Ok(())
    }

    /// Check whether a tree exists at `anchor`
    pub fn exists(&self, anchor: PageId) -> bool {
        self.trees.contains_key(&anchor)
    }

    /// Drop the tree at `anchor` and free its pages
    pub fn drop_tree(&self, anchor: PageId, txn: &Txn) -> Result<()> {
        let Some((_, data)) = self.trees.remove(&anchor) else {
            return Err(Error::not_found(format!("tree at {}", anchor)));
        };
        let pages: Vec<PageId> = data.levels.iter().copied().collect();
        txn.record(UndoRecord::TreeDrop { anchor, data })?;
        for page in pages.into_iter().rev() {
            self.pages.free(page, txn)?;
        }
        self.pages.free(anchor, txn)
    }

    // ========================================================================
    // Key operations
    // ========================================================================

    fn anchor_of(&self, tree: &dyn IndexTree) -> Result<PageId> {
        tree.anchor()
            .ok_or_else(|| Error::not_found("tree has no root page"))
    }

    /// Insert `value` under `key`; returns false if the pair was present
    pub fn insert(&self, tree: &dyn IndexTree, key: &[u8], value: &[u8], txn: &Txn) -> Result<bool> {
        let anchor = tree.start_page(txn)?;
        let _guard = tree.lock(LockMode::Exclusive);
        let (inserted, count) = {
            let mut data = self
                .trees
                .get_mut(&anchor)
                .ok_or_else(|| Error::not_found(format!("tree at {}", anchor)))?;
            let inserted = data.insert(key, value);
            (inserted, data.count)
        };
        if !inserted {
            return Ok(false);
        }
        txn.record(UndoRecord::TreeInsert {
            anchor,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        let height = tree.height().max(1);
        if count > self.capacity(height) {
            let page = self.pages.allocate(txn)?;
            self.push_level(anchor, page, txn)?;
            trace!(target: "pinstore::tree", %anchor, %page, height = height + 1, "grow");
            tree.add_root_page(page, txn)?;
        }
        Ok(true)
    }

    /// Remove `value` from `key`; `NotFound` if the pair is absent
    pub fn remove(&self, tree: &dyn IndexTree, key: &[u8], value: &[u8], txn: &Txn) -> Result<()> {
        let anchor = self.anchor_of(tree)?;
        let _guard = tree.lock(LockMode::Exclusive);
        let (removed, count) = match self.trees.get_mut(&anchor) {
            Some(mut data) => {
                let removed = data.remove(key, value);
                (removed, data.count)
            }
            None => (false, 0),
        };
        if !removed {
            return Err(Error::not_found("index entry"));
        }
        txn.record(UndoRecord::TreeRemove {
            anchor,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        let height = tree.height();
        if height > 1 && count <= self.capacity(height - 1) {
            if let Some((page, new_root)) = self.pop_level(anchor, txn)? {
                trace!(target: "pinstore::tree", %anchor, %page, height = height - 1, "shrink");
                tree.remove_root_page(page, new_root, txn)?;
                self.pages.free(page, txn)?;
            }
        }
        Ok(())
    }

    /// Replace `old` with `new` under `key`; `NotFound` if `old` is absent
    pub fn update(
        &self,
        tree: &dyn IndexTree,
        key: &[u8],
        old: &[u8],
        new: &[u8],
        txn: &Txn,
    ) -> Result<()> {
        let anchor = self.anchor_of(tree)?;
        let _guard = tree.lock(LockMode::Exclusive);
        let mut data = self
            .trees
            .get_mut(&anchor)
            .ok_or_else(|| Error::not_found(format!("tree at {}", anchor)))?;
        if !data.remove(key, old) {
            return Err(Error::not_found("index entry"));
        }
        data.insert(key, new);
        drop(data);
        txn.record(UndoRecord::TreeRemove {
            anchor,
            key: key.to_vec(),
            value: old.to_vec(),
        })?;
        txn.record(UndoRecord::TreeInsert {
            anchor,
            key: key.to_vec(),
            value: new.to_vec(),
        })
    }

    /// Values stored under `key`, ascending
    pub fn values(&self, tree: &dyn IndexTree, key: &[u8]) -> Vec<Vec<u8>> {
        let Some(anchor) = tree.anchor() else {
            return Vec::new();
        };
        let _guard = tree.lock(LockMode::Shared);
        self.trees
            .get(&anchor)
            .and_then(|d| d.entries.get(key).map(|v| v.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// All (key, value) pairs in key order
    pub fn scan(&self, tree: &dyn IndexTree) -> Vec<(Vec<u8>, Vec<u8>)> {
        let Some(anchor) = tree.anchor() else {
            return Vec::new();
        };
        let _guard = tree.lock(LockMode::Shared);
        self.trees
            .get(&anchor)
            .map(|d| {
                d.entries
                    .iter()
                    .flat_map(|(k, vs)| vs.iter().map(move |v| (k.clone(), v.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of (key, value) pairs
    pub fn count(&self, tree: &dyn IndexTree) -> usize {
        tree.anchor()
            .and_then(|a| self.trees.get(&a).map(|d| d.count))
            .unwrap_or(0)
    }

    /// Number of values under `key`
    pub fn key_count(&self, tree: &dyn IndexTree, key: &[u8]) -> usize {
        tree.anchor()
            .and_then(|a| {
                self.trees
                    .get(&a)
                    .and_then(|d| d.entries.get(key).map(|v| v.len()))
            })
            .unwrap_or(0)
    }

    // ========================================================================
    // Levels
    // ========================================================================

    fn push_level(&self, anchor: PageId, page: PageId, txn: &Txn) -> Result<()> {
        txn.record(UndoRecord::LevelPush { anchor })?;
        if let Some(mut data) = self.trees.get_mut(&anchor) {
            data.levels.push(page);
        }
        Ok(())
    }

    fn pop_level(&self, anchor: PageId, txn: &Txn) -> Result<Option<(PageId, PageId)>> {
        let popped = self.trees.get_mut(&anchor).and_then(|mut data| {
            let page = data.levels.pop()?;
            let new_root = data.levels.last().copied().unwrap_or(anchor);
            Some((page, new_root))
        });
        if let Some((page, _)) = popped {
            txn.record(UndoRecord::LevelPop { anchor, page })?;
        }
        Ok(popped)
    }

    // ========================================================================
    // Undo (no transaction)
    // ========================================================================

    pub(crate) fn undo_insert(&self, anchor: PageId, key: &[u8], value: &[u8]) {
        if let Some(mut data) = self.trees.get_mut(&anchor) {
            data.remove(key, value);
        }
    }

    pub(crate) fn undo_remove(&self, anchor: PageId, key: &[u8], value: &[u8]) {
        if let Some(mut data) = self.trees.get_mut(&anchor) {
            data.insert(key, value);
        }
    }

    pub(crate) fn undo_create(&self, anchor: PageId) {
        self.trees.remove(&anchor);
    }

    pub(crate) fn undo_drop(&self, anchor: PageId, data: TreeData) {
        self.trees.insert(anchor, data);
    }

    pub(crate) fn undo_level_push(&self, anchor: PageId) {
        if let Some(mut data) = self.trees.get_mut(&anchor) {
            data.levels.pop();
        }
    }

    pub(crate) fn undo_level_pop(&self, anchor: PageId, page: PageId) {
        if let Some(mut data) = self.trees.get_mut(&anchor) {
            data.levels.push(page);
        }
    }
}
