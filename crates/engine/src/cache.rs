//! Bounded cache of decoded classes
//!
//! Classes are decoded from their owning pins on first use and kept in a
//! `DashMap`. When the cache grows past its capacity, entries are evicted
//! in load order, skipping any entry a caller still holds (`Arc` strong
//! count above one).

use crate::class::Class;
use dashmap::DashMap;
use parking_lot::Mutex;
use pinstore_core::ClassId;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Cache of decoded classes
#[derive(Debug)]
pub struct ClassCache {
    entries: DashMap<ClassId, Arc<Class>>,
    order: Mutex<VecDeque<ClassId>>,
    capacity: usize,
}

impl ClassCache {
    /// Create a cache holding about `capacity` unreferenced classes
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Cached class
    pub fn get(&self, cid: ClassId) -> Option<Arc<Class>> {
        self.entries.get(&cid).map(|e| Arc::clone(e.value()))
    }

    /// Insert a freshly loaded class
    ///
    /// If another caller loaded the same class first, that entry wins and
    /// is returned.
    pub fn insert(&self, class: Arc<Class>) -> Arc<Class> {
        let cid = class.cid();
        let (stored, fresh) = match self.entries.entry(cid) {
            dashmap::mapref::entry::Entry::Occupied(e) => (Arc::clone(e.get()), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Arc::clone(&class));
                (class, true)
            }
        };
        if fresh {
            self.order.lock().push_back(cid);
            self.evict();
        }
        stored
    }

    /// Forget a class
    pub fn remove(&self, cid: ClassId) -> Option<Arc<Class>> {
        let removed = self.entries.remove(&cid).map(|(_, c)| c);
        if removed.is_some() {
            self.order.lock().retain(|c| *c != cid);
        }
        removed
    }

    /// Evict unreferenced classes until the cache fits its capacity
    fn evict(&self) {
        let mut order = self.order.lock();
        let mut scanned = 0;
        while self.entries.len() > self.capacity && scanned < order.len() {
            let Some(cid) = order.pop_front() else {
                break;
            };
            let evicted = self
                .entries
                .remove_if(&cid, |_, class| Arc::strong_count(class) == 1)
                .is_some();
            if evicted {
                trace!(target: "pinstore::cache", cid = %cid, "evicted");
            } else if self.entries.contains_key(&cid) {
                order.push_back(cid);
                scanned += 1;
            }
        }
    }

    /// Number of cached classes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached class
    pub fn clear(&self) {
        self.entries.clear();
        self.order.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassFlags, ClassSpec};
    use crate::registry::ClassRef;
    use pinstore_core::{Condition, PinId};

    fn class(cid: u32) -> Arc<Class> {
        let r = Arc::new(ClassRef::new(
            ClassId(cid),
            PinId(cid as u64),
            Arc::new(Condition::True),
            ClassFlags::NONE,
            0,
        ));
        Arc::new(Class::new(r, ClassSpec::new(Condition::True), None))
    }

    #[test]
    fn test_evicts_in_load_order() {
        let cache = ClassCache::new(2);
        cache.insert(class(1));
        cache.insert(class(2));
        cache.insert(class(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(ClassId(1)).is_none());
        assert!(cache.get(ClassId(3)).is_some());
    }

    #[test]
    fn test_referenced_entries_survive() {
        let cache = ClassCache::new(1);
        let held = cache.insert(class(1));
        // both entries are referenced while the second insert runs
        cache.insert(class(2));
        assert_eq!(cache.len(), 2);

        cache.insert(class(3));
        assert!(cache.get(ClassId(1)).is_some());
        assert!(cache.get(ClassId(2)).is_none());

        drop(held);
        cache.insert(class(4));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(ClassId(4)).is_some());
    }

    #[test]
    fn test_first_loader_wins() {
        let cache = ClassCache::new(4);
        let first = cache.insert(class(1));
        let second = cache.insert(class(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.remove(ClassId(1)).is_some());
        assert!(cache.is_empty());
    }
}
