//! Registry entries for classes
//!
//! A `ClassRef` is the lightweight, always-resident part of a class: what
//! the trie routes to and what a `ClassResult` holds. The decoded class
//! (spec, index tree) lives in the class cache and may be evicted; the
//! `ClassRef` lives as long as the class is registered.

use crate::actions::ClassActions;
use crate::class::{ClassFlags, IndexDescriptor};
use crate::index_tree::TreeState;
use crate::trie::PropertyTrie;
use parking_lot::{RwLock, RwLockReadGuard};
use pinstore_core::{ClassId, Condition, EvalContext, PinId, PropertyId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Which membership events a class wants reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NotifyMask(u32);

impl NotifyMask {
    /// No notifications
    pub const NONE: NotifyMask = NotifyMask(0);
    /// A pin entered the class
    pub const ENTER: NotifyMask = NotifyMask(0x1);
    /// A member pin changed
    pub const UPDATE: NotifyMask = NotifyMask(0x2);
    /// A pin left the class
    pub const LEAVE: NotifyMask = NotifyMask(0x4);
    /// Every event
    pub const ALL: NotifyMask = NotifyMask(0x7);

    /// Raw bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Build from raw bits
    pub fn from_bits(bits: u32) -> Self {
        NotifyMask(bits & Self::ALL.0)
    }

    /// Check whether all bits of `other` are set
    pub fn contains(&self, other: NotifyMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two masks
    pub fn union(self, other: NotifyMask) -> NotifyMask {
        NotifyMask(self.0 | other.0)
    }

    /// Check if no bit is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Registered class as seen by routing and classification
pub struct ClassRef {
    cid: ClassId,
    owner: PinId,
    cond: Arc<Condition>,
    flags: ClassFlags,
    nsegs: u16,
    notify: AtomicU32,
    materialized: AtomicBool,
    actions: RwLock<Option<Arc<ClassActions>>>,
    derived: RwLock<Option<Box<PropertyTrie>>>,
    tree: OnceLock<Arc<TreeState>>,
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRef")
            .field("cid", &self.cid)
            .field("owner", &self.owner)
            .field("flags", &self.flags)
            .field("nsegs", &self.nsegs)
            .field("notify", &self.notify_mask())
            .finish()
    }
}

impl ClassRef {
    /// Create an entry; not yet materialized
    pub fn new(
        cid: ClassId,
        owner: PinId,
        cond: Arc<Condition>,
        flags: ClassFlags,
        nsegs: u16,
    ) -> Self {
        Self {
            cid,
            owner,
            cond,
            flags,
            nsegs,
            notify: AtomicU32::new(0),
            materialized: AtomicBool::new(false),
            actions: RwLock::new(None),
            derived: RwLock::new(None),
            tree: OnceLock::new(),
        }
    }

    /// Class id
    pub fn cid(&self) -> ClassId {
        self.cid
    }

    /// Pin the class is defined by
    pub fn owner(&self) -> PinId {
        self.owner
    }

    /// Predicate
    pub fn condition(&self) -> &Arc<Condition> {
        &self.cond
    }

    /// Definition flags
    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    /// Number of index segments; 0 for membership-only classes
    pub fn segment_count(&self) -> u16 {
        self.nsegs
    }

    /// True if the class maintains an index or a membership list
    pub fn is_indexed(&self) -> bool {
        self.nsegs > 0 || self.flags.contains(ClassFlags::INDEXED)
    }

    /// Index placement shared by every loaded copy of the class
    ///
    /// The first load seeds it with the descriptor `seed` returns; later
    /// loads see the live placement, uncommitted changes included.
    pub(crate) fn tree_state(&self, seed: impl FnOnce() -> Option<IndexDescriptor>) -> Arc<TreeState> {
        Arc::clone(self.tree.get_or_init(|| Arc::new(TreeState::new(seed()))))
    }

    /// Evaluate the predicate
    pub fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        self.cond.evaluate(ctx)
    }

    /// Current notification mask
    pub fn notify_mask(&self) -> NotifyMask {
        NotifyMask::from_bits(self.notify.load(Ordering::Acquire))
    }

    /// Add notification bits
    pub fn enable(&self, mask: NotifyMask) {
        self.notify.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    /// Clear notification bits
    pub fn disable(&self, mask: NotifyMask) {
        self.notify.fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    /// True once the class's index has been built and committed
    pub fn is_materialized(&self) -> bool {
        self.materialized.load(Ordering::Acquire)
    }

    pub(crate) fn set_materialized(&self, value: bool) {
        self.materialized.store(value, Ordering::Release);
    }

    /// Action hooks, if any
    pub fn actions(&self) -> Option<Arc<ClassActions>> {
        self.actions.read().clone()
    }

    /// Replace the action hooks
    pub fn set_actions(&self, actions: Option<ClassActions>) {
        *self.actions.write() = actions.filter(|a| !a.is_empty()).map(Arc::new);
    }

    /// True if any action hook is installed
    pub fn has_actions(&self) -> bool {
        self.actions.read().is_some()
    }

    /// Sub-registry of classes derived from this one
    pub fn derived(&self) -> RwLockReadGuard<'_, Option<Box<PropertyTrie>>> {
        self.derived.read()
    }

    /// True if at least one class is derived from this one
    pub fn has_derived(&self) -> bool {
        self.derived
            .read()
            .as_ref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }

    pub(crate) fn add_derived(&self, class: &Arc<ClassRef>, dnf: &[Vec<PropertyId>]) {
        self.derived
            .write()
            .get_or_insert_with(Default::default)
            .add(class, dnf);
    }

    pub(crate) fn remove_derived(&self, cid: ClassId, dnf: &[Vec<PropertyId>]) {
        let mut derived = self.derived.write();
        if let Some(trie) = derived.as_mut() {
            trie.remove(cid, dnf);
            if trie.is_empty() {
                *derived = None;
            }
        }
    }
}
