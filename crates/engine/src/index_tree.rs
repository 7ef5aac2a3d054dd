//! Per-class index tree
//!
//! `ClassIndexTree` adapts one class's composite index to the storage
//! layer's `IndexTree` contract. The tree's placement (root, anchor,
//! height, key format) is persisted as the `INDEX_INFO` property of the
//! class's owning pin and cached here.
//!
//! # Root Creation
//!
//! The tree does not exist until its first key is written. `start_page`
//! creates it under the tree's exclusive lock, re-checking after the lock
//! is acquired so concurrent first writers allocate only once. Page
//! allocation, tree creation and the descriptor write happen inside a
//! mini-transaction; the in-memory descriptor is published only after the
//! mini-transaction commits, and reverts if the enclosing transaction
//! rolls back.
//!
//! # Shared State
//!
//! The descriptor and the tree lock live in a [`TreeState`] held by the
//! class's registry entry, not by the tree. A class evicted from the cache
//! and loaded again mid-transaction gets a new `ClassIndexTree` over the
//! same state, so rollback hooks registered through the old instance still
//! reach it.

use crate::class::IndexDescriptor;
use crate::classifier::Classifier;
use parking_lot::{Mutex, RwLock};
use pinstore_core::{ClassId, Error, PageId, PinId, PropertyId, Result, Value};
use pinstore_storage::{IndexTree, LockMode, Storage, TreeFactory, TreeGuard, TreeHandle, Txn};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Factory id of class index trees
pub const CLASS_TREE_FACTORY: u8 = 1;

/// Placement and lock of one class's index
#[derive(Debug)]
pub struct TreeState {
    desc: Mutex<Option<IndexDescriptor>>,
    lock: RwLock<()>,
}

impl TreeState {
    /// State seeded with a persisted descriptor
    pub fn new(desc: Option<IndexDescriptor>) -> Self {
        Self {
            desc: Mutex::new(desc),
            lock: RwLock::new(()),
        }
    }

    /// Current placement
    pub fn descriptor(&self) -> Option<IndexDescriptor> {
        self.desc.lock().clone()
    }
}

/// Index tree of one class
pub struct ClassIndexTree {
    cid: ClassId,
    owner: PinId,
    format: Vec<u8>,
    storage: Weak<Storage>,
    state: Arc<TreeState>,
}

impl fmt::Debug for ClassIndexTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassIndexTree")
            .field("cid", &self.cid)
            .field("owner", &self.owner)
            .field("desc", &*self.state.desc.lock())
            .finish()
    }
}

impl ClassIndexTree {
    /// Attach to a class's index
    ///
    /// `desc` is the descriptor read from the owning pin, if the tree has
    /// been created. A descriptor whose key format differs from `format`
    /// is reported as corruption.
    pub fn open(
        cid: ClassId,
        owner: PinId,
        format: Vec<u8>,
        storage: &Arc<Storage>,
        desc: Option<IndexDescriptor>,
    ) -> Result<Self> {
        Self::open_shared(cid, owner, format, storage, Arc::new(TreeState::new(desc)))
    }

    /// Attach to a class's index over state shared with other handles
    pub fn open_shared(
        cid: ClassId,
        owner: PinId,
        format: Vec<u8>,
        storage: &Arc<Storage>,
        state: Arc<TreeState>,
    ) -> Result<Self> {
        if let Some(d) = state.desc.lock().as_ref() {
            if d.format != format {
                return Err(Error::Corruption {
                    cid,
                    reason: "index key format does not match class segments".into(),
                });
            }
            if !storage.trees().exists(d.anchor) {
                return Err(Error::Corruption {
                    cid,
                    reason: format!("index anchor {} has no tree", d.anchor),
                });
            }
        }
        Ok(Self {
            cid,
            owner,
            format,
            storage: Arc::downgrade(storage),
            state,
        })
    }

    /// Class the tree belongs to
    pub fn cid(&self) -> ClassId {
        self.cid
    }

    /// Cached placement; `None` before the first key is written
    pub fn descriptor(&self) -> Option<IndexDescriptor> {
        self.state.descriptor()
    }

    fn storage(&self) -> Result<Arc<Storage>> {
        self.storage
            .upgrade()
            .ok_or_else(|| Error::invalid("storage dropped"))
    }

    /// Write `desc` onto the owning pin, or clear it
    fn persist_descriptor(&self, desc: Option<&IndexDescriptor>, txn: &Txn) -> Result<()> {
        let storage = self.storage()?;
        let mut pin = storage.pins().get(self.owner).ok_or_else(|| {
            Error::not_found(format!("owner pin {} of class {}", self.owner, self.cid))
        })?;
        match desc {
            Some(d) => pin.set(PropertyId::INDEX_INFO, Value::Bytes(d.encode())),
            None => pin.remove(PropertyId::INDEX_INFO),
        };
        storage.pins().put(pin, txn)
    }

    /// Persist and publish a new placement, reverting on rollback
    fn publish(&self, next: Option<IndexDescriptor>, txn: &Txn) -> Result<()> {
        let before = self.descriptor();
        self.persist_descriptor(next.as_ref(), txn)?;
        *self.state.desc.lock() = next;
        let state = Arc::clone(&self.state);
        txn.on_rollback(move || *state.desc.lock() = before)
    }

    /// `anchor` if its tree exists; a placement naming a missing tree is
    /// corruption
    fn live_anchor(&self, storage: &Storage, anchor: PageId) -> Result<PageId> {
        if storage.trees().exists(anchor) {
            Ok(anchor)
        } else {
            Err(Error::Corruption {
                cid: self.cid,
                reason: format!("index anchor {} has no tree", anchor),
            })
        }
    }

    fn current(&self) -> Result<IndexDescriptor> {
        self.descriptor()
            .ok_or_else(|| Error::invalid(format!("index of class {} has no root", self.cid)))
    }
}

impl IndexTree for ClassIndexTree {
    fn start_page(&self, txn: &Txn) -> Result<PageId> {
        let storage = self.storage()?;
        if let Some(anchor) = self.anchor() {
            return self.live_anchor(&storage, anchor);
        }
        let _guard = self.state.lock.write();
        if let Some(anchor) = self.anchor() {
            return self.live_anchor(&storage, anchor);
        }

        let mini = txn.mini();
        let anchor = storage.pages().allocate(txn)?;
        storage.trees().create(anchor, txn)?;
        let fresh = IndexDescriptor::new(anchor, self.format.clone());
        self.persist_descriptor(Some(&fresh), txn)?;
        let state = Arc::clone(&self.state);
        txn.on_rollback(move || *state.desc.lock() = None)?;
        mini.commit();

        *self.state.desc.lock() = Some(fresh);
        debug!(target: "pinstore::tree", cid = %self.cid, %anchor, "index root allocated");
        Ok(anchor)
    }

    fn anchor(&self) -> Option<PageId> {
        self.state.desc.lock().as_ref().map(|d| d.anchor)
    }

    fn root(&self) -> Option<PageId> {
        self.state.desc.lock().as_ref().map(|d| d.root)
    }

    fn height(&self) -> u16 {
        self.state.desc.lock().as_ref().map(|d| d.height).unwrap_or(0)
    }

    fn add_root_page(&self, page: PageId, txn: &Txn) -> Result<()> {
        let mut next = self.current()?;
        next.root = page;
        next.height += 1;
        debug!(target: "pinstore::tree", cid = %self.cid, %page, height = next.height, "root added");
        self.publish(Some(next), txn)
    }

    fn remove_root_page(&self, page: PageId, new_root: PageId, txn: &Txn) -> Result<()> {
        let mut next = self.current()?;
        if next.root != page {
            return Err(Error::invalid(format!(
                "class {}: removing page {} but root is {}",
                self.cid, page, next.root
            )));
        }
        next.root = new_root;
        next.height = next.height.saturating_sub(1).max(1);
        debug!(target: "pinstore::tree", cid = %self.cid, %page, height = next.height, "root removed");
        self.publish(Some(next), txn)
    }

    fn lock(&self, mode: LockMode) -> TreeGuard<'_> {
        match mode {
            LockMode::Shared => TreeGuard::Shared(self.state.lock.read()),
            LockMode::Exclusive => TreeGuard::Exclusive(self.state.lock.write()),
        }
    }

    fn persist(&self) -> TreeHandle {
        TreeHandle {
            factory: CLASS_TREE_FACTORY,
            payload: self.cid.to_key().to_vec(),
        }
    }

    fn destroy(&self, txn: &Txn) -> Result<()> {
        let _guard = self.state.lock.write();
        let Some(desc) = self.descriptor() else {
            return Ok(());
        };
        self.storage()?.trees().drop_tree(desc.anchor, txn)?;
        debug!(target: "pinstore::tree", cid = %self.cid, anchor = %desc.anchor, "index destroyed");
        self.publish(None, txn)
    }
}

/// Reattaches class index trees from a class id
pub struct ClassTreeFactory {
    classifier: Weak<Classifier>,
}

impl ClassTreeFactory {
    pub(crate) fn new(classifier: Weak<Classifier>) -> Self {
        Self { classifier }
    }
}

impl TreeFactory for ClassTreeFactory {
    fn factory_id(&self) -> u8 {
        CLASS_TREE_FACTORY
    }

    fn connect(&self, payload: &[u8]) -> Result<Arc<dyn IndexTree>> {
        let bytes: [u8; 4] = payload
            .try_into()
            .map_err(|_| Error::Serialization(format!("class tree handle of {} bytes", payload.len())))?;
        let cid = ClassId(u32::from_be_bytes(bytes));
        let classifier = self
            .classifier
            .upgrade()
            .ok_or_else(|| Error::invalid("classifier dropped"))?;
        let class = classifier.get_class(cid)?;
        match class.tree() {
            Some(tree) => Ok(Arc::clone(tree) as Arc<dyn IndexTree>),
            None => Err(Error::not_found(format!("class {} has no index tree", cid))),
        }
    }
}
