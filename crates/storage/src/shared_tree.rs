//! Store-owned tree with no owning pin
//!
//! The shared class map (membership lists of classes without index
//! segments, keyed by class id) lives in a `SharedTree`. Its root and
//! height are kept by the store itself rather than persisted on a pin.

use crate::storage::Storage;
use crate::tree::{IndexTree, LockMode, TreeGuard, TreeHandle};
use crate::txn::Txn;
use parking_lot::{Mutex, RwLock};
use pinstore_core::{Error, PageId, Result};
use std::sync::{Arc, Weak};

/// Factory id of shared trees
pub const SHARED_TREE_FACTORY: u8 = 0;

#[derive(Debug, Clone, Copy)]
struct Placement {
    anchor: PageId,
    root: PageId,
    height: u16,
}

/// Tree whose placement is owned by the store
pub struct SharedTree {
    storage: Weak<Storage>,
    placement: Mutex<Option<Placement>>,
    lock: RwLock<()>,
}

impl SharedTree {
    pub(crate) fn new(storage: Weak<Storage>) -> Self {
        Self {
            storage,
            placement: Mutex::new(None),
            lock: RwLock::new(()),
        }
    }

    fn storage(&self) -> Result<Arc<Storage>> {
        self.storage
            .upgrade()
            .ok_or_else(|| Error::invalid("storage dropped"))
    }

    fn restore(&self, placement: Option<Placement>) {
        *self.placement.lock() = placement;
    }
}

impl IndexTree for SharedTree {
    fn start_page(&self, txn: &Txn) -> Result<PageId> {
        if let Some(p) = *self.placement.lock() {
            return Ok(p.anchor);
        }
        let _guard = self.lock.write();
        let mut placement = self.placement.lock();
        if let Some(p) = *placement {
            return Ok(p.anchor);
        }
        let storage = self.storage()?;
        let mini = txn.mini();
        let anchor = storage.pages().allocate(txn)?;
        storage.trees().create(anchor, txn)?;
        let weak = self.storage.clone();
        txn.on_rollback(move || {
            if let Some(s) = weak.upgrade() {
                s.class_map().restore(None);
            }
        })?;
        mini.commit();
        *placement = Some(Placement {
            anchor,
            root: anchor,
            height: 1,
        });
        Ok(anchor)
    }

    fn anchor(&self) -> Option<PageId> {
        self.placement.lock().map(|p| p.anchor)
    }

    fn root(&self) -> Option<PageId> {
        self.placement.lock().map(|p| p.root)
    }

    fn height(&self) -> u16 {
        self.placement.lock().map(|p| p.height).unwrap_or(0)
    }

    fn add_root_page(&self, page: PageId, txn: &Txn) -> Result<()> {
        let mut placement = self.placement.lock();
        let p = placement
            .as_mut()
            .ok_or_else(|| Error::invalid("class map has no root"))?;
        let before = *p;
        p.root = page;
        p.height += 1;
        drop(placement);
        let weak = self.storage.clone();
        txn.on_rollback(move || {
            if let Some(s) = weak.upgrade() {
                s.class_map().restore(Some(before));
            }
        })
    }

    fn remove_root_page(&self, _page: PageId, new_root: PageId, txn: &Txn) -> Result<()> {
        let mut placement = self.placement.lock();
        let p = placement
            .as_mut()
            .ok_or_else(|| Error::invalid("class map has no root"))?;
        let before = *p;
        p.root = new_root;
        p.height = p.height.saturating_sub(1).max(1);
        drop(placement);
        let weak = self.storage.clone();
        txn.on_rollback(move || {
            if let Some(s) = weak.upgrade() {
                s.class_map().restore(Some(before));
            }
        })
    }

    fn lock(&self, mode: LockMode) -> TreeGuard<'_> {
        match mode {
            LockMode::Shared => TreeGuard::Shared(self.lock.read()),
            LockMode::Exclusive => TreeGuard::Exclusive(self.lock.write()),
        }
    }

    fn persist(&self) -> TreeHandle {
        TreeHandle {
            factory: SHARED_TREE_FACTORY,
            payload: Vec::new(),
        }
    }

    fn destroy(&self, txn: &Txn) -> Result<()> {
        let before = *self.placement.lock();
        let Some(p) = before else {
            return Ok(());
        };
        let storage = self.storage()?;
        storage.trees().drop_tree(p.anchor, txn)?;
        *self.placement.lock() = None;
        let weak = self.storage.clone();
        txn.on_rollback(move || {
            if let Some(s) = weak.upgrade() {
                s.class_map().restore(before);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_start_and_rollback() {
        let storage = Storage::in_memory();
        assert!(storage.class_map().anchor().is_none());
        let txn = storage.begin();
        storage
            .trees()
            .insert(storage.class_map(), b"k", b"v", &txn)
            .unwrap();
        assert!(storage.class_map().anchor().is_some());
        txn.rollback();
        assert!(storage.class_map().anchor().is_none());
        assert_eq!(storage.pages().in_use(), 0);
    }

    #[test]
    fn test_destroy_and_recreate() {
        let storage = Storage::in_memory();
        let txn = storage.begin();
        let map = storage.class_map();
        storage.trees().insert(map, b"k", b"v", &txn).unwrap();
        map.destroy(&txn).unwrap();
        assert_eq!(storage.trees().count(map), 0);
        storage.trees().insert(map, b"k", b"w", &txn).unwrap();
        assert_eq!(storage.trees().values(map, b"k"), vec![b"w".to_vec()]);
        txn.commit().unwrap();
    }
}
