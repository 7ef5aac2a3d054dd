//! Storage: pages, pins and index trees behind one handle
//!
//! `Storage` is always held in an `Arc`; transactions keep a clone so
//! their undo log can be replayed against it on rollback.

use crate::config::StorageConfig;
use crate::page::PageAllocator;
use crate::pins::PinStore;
use crate::shared_tree::SharedTree;
use crate::tree_manager::TreeManager;
use crate::txn::{Txn, UndoRecord};
use std::sync::Arc;

/// Storage handle
pub struct Storage {
    config: StorageConfig,
    pages: Arc<PageAllocator>,
    pins: PinStore,
    trees: TreeManager,
    class_map: SharedTree,
}

impl Storage {
    /// Open an empty store
    pub fn new(config: StorageConfig) -> Arc<Self> {
        let pages = Arc::new(PageAllocator::new(config.max_pages));
        Arc::new_cyclic(|weak| Storage {
            trees: TreeManager::new(pages.clone(), config.tree_fanout),
            pins: PinStore::new(),
            class_map: SharedTree::new(weak.clone()),
            pages,
            config,
        })
    }

    /// Open an empty store with default configuration
    pub fn in_memory() -> Arc<Self> {
        Self::new(StorageConfig::default())
    }

    /// Begin a write transaction
    pub fn begin(self: &Arc<Self>) -> Txn {
        Txn::new(self.clone())
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Page allocator
    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    /// Pin store
    pub fn pins(&self) -> &PinStore {
        &self.pins
    }

    /// Tree manager
    pub fn trees(&self) -> &TreeManager {
        &self.trees
    }

    /// Shared class map tree
    pub fn class_map(&self) -> &SharedTree {
        &self.class_map
    }

    pub(crate) fn undo(&self, rec: UndoRecord) {
        match rec {
            UndoRecord::TreeInsert { anchor, key, value } => {
                self.trees.undo_insert(anchor, &key, &value)
            }
            UndoRecord::TreeRemove { anchor, key, value } => {
                self.trees.undo_remove(anchor, &key, &value)
            }
            UndoRecord::TreeCreate { anchor } => self.trees.undo_create(anchor),
            UndoRecord::TreeDrop { anchor, data } => self.trees.undo_drop(anchor, data),
            UndoRecord::LevelPush { anchor } => self.trees.undo_level_push(anchor),
            UndoRecord::LevelPop { anchor, page } => self.trees.undo_level_pop(anchor, page),
            UndoRecord::PageAlloc(page) => self.pages.release(page),
            UndoRecord::PageFree(page) => self.pages.reclaim(page),
            UndoRecord::PinWrite { id, before } => {
                self.pins.restore(id, before);
            }
            UndoRecord::Hook(hook) => hook(),
        }
    }
}
