//! Pin store
//!
//! Holds the pin population in a `BTreeMap<PinId, Pin>` behind a
//! `parking_lot::RwLock`, so full scans visit pins in id order. Pin ids
//! are allocated monotonically; addresses come from a separate slot
//! counter and change when a pin is relocated.
//!
//! Deletion leaves a tombstone (`Pin::is_deleted`). Scans skip tombstones.
//! The property index is updated under the same write lock as the data.

use crate::index::PropertyIndex;
use crate::txn::{Txn, UndoRecord};
use parking_lot::RwLock;
use pinstore_core::{Error, PageId, Pin, PinAddr, PinId, PropertyId, Result, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Slots per simulated data page
const SLOTS_PER_PAGE: u64 = 64;

/// Data pages are numbered from here so they never collide with tree pages
const DATA_PAGE_BASE: u64 = 1 << 30;

/// Store of all pins
#[derive(Debug)]
pub struct PinStore {
    pins: RwLock<BTreeMap<PinId, Pin>>,
    props: RwLock<PropertyIndex>,
    next_id: AtomicU64,
    next_slot: AtomicU64,
}

impl Default for PinStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PinStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            pins: RwLock::new(BTreeMap::new()),
            props: RwLock::new(PropertyIndex::new()),
            next_id: AtomicU64::new(1),
            next_slot: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh address
    pub fn allocate_addr(&self) -> PinAddr {
        let n = self.next_slot.fetch_add(1, Ordering::SeqCst);
        PinAddr::new(
            PageId((DATA_PAGE_BASE + n / SLOTS_PER_PAGE) as u32),
            (n % SLOTS_PER_PAGE) as u16,
        )
    }

    /// Create and store a new pin
    pub fn create(
        &self,
        props: impl IntoIterator<Item = (PropertyId, Value)>,
        txn: &Txn,
    ) -> Result<Pin> {
        let id = PinId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut pin = Pin::new(id, self.allocate_addr());
        for (p, v) in props {
            pin.set(p, v);
        }
        self.put(pin.clone(), txn)?;
        Ok(pin)
    }

    /// Insert or replace a pin
    pub fn put(&self, pin: Pin, txn: &Txn) -> Result<()> {
        let id = pin.id();
        let before = self.pins.read().get(&id).cloned();
        txn.record(UndoRecord::PinWrite { id, before })?;
        self.restore(id, Some(pin));
        Ok(())
    }

    /// Write `pin` without recording undo; returns the previous state
    pub(crate) fn restore(&self, id: PinId, pin: Option<Pin>) -> Option<Pin> {
        let mut pins = self.pins.write();
        let mut props = self.props.write();
        let before = match pin {
            Some(p) => pins.insert(id, p),
            None => pins.remove(&id),
        };
        if let Some(old) = &before {
            for p in old.property_ids() {
                props.remove(p, id);
            }
        }
        if let Some(new) = pins.get(&id) {
            if !new.is_deleted() {
                for p in new.property_ids() {
                    props.insert(p, id);
                }
            }
        }
        before
    }

    /// Mark a pin deleted; returns its last live state
    pub fn delete(&self, id: PinId, txn: &Txn) -> Result<Pin> {
        let mut pin = self.get(id).ok_or_else(|| Error::not_found(id.to_string()))?;
        let live = pin.clone();
        pin.set_deleted(true);
        self.put(pin, txn)?;
        Ok(live)
    }

    /// Move a pin to a fresh address; returns the relocated pin
    pub fn relocate(&self, id: PinId, txn: &Txn) -> Result<Pin> {
        let mut pin = self.get(id).ok_or_else(|| Error::not_found(id.to_string()))?;
        pin.set_addr(self.allocate_addr());
        self.put(pin.clone(), txn)?;
        Ok(pin)
    }

    /// Get a live pin
    pub fn get(&self, id: PinId) -> Option<Pin> {
        self.pins
            .read()
            .get(&id)
            .filter(|p| !p.is_deleted())
            .cloned()
    }

    /// Get a live pin projected onto `props`
    pub fn project(&self, id: PinId, props: &[PropertyId]) -> Option<Pin> {
        self.pins
            .read()
            .get(&id)
            .filter(|p| !p.is_deleted())
            .map(|p| p.project(props))
    }

    /// Up to `limit` live pins with id greater than `after`, in id order
    pub fn scan_batch(&self, after: Option<PinId>, limit: usize) -> Vec<Pin> {
        use std::ops::Bound;
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.pins
            .read()
            .range((lower, Bound::Unbounded))
            .map(|(_, p)| p)
            .filter(|p| !p.is_deleted())
            .take(limit)
            .cloned()
            .collect()
    }

    /// All live pins in id order
    pub fn scan_live(&self) -> Vec<Pin> {
        self.scan_batch(None, usize::MAX)
    }

    /// Ids of live pins carrying every property in `props`
    ///
    /// `None` when `props` is empty (no restriction possible).
    pub fn with_properties(&self, props: &[PropertyId]) -> Option<Vec<PinId>> {
        self.props.read().intersect(props)
    }

    /// Number of live pins
    pub fn len(&self) -> usize {
        self.pins.read().values().filter(|p| !p.is_deleted()).count()
    }

    /// Check if there are no live pins
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    const A: PropertyId = PropertyId(300);
    const B: PropertyId = PropertyId(301);

    #[test]
    fn test_create_get_delete() {
        let storage = Storage::in_memory();
        let txn = storage.begin();
        let pin = storage.pins().create([(A, Value::Int(1))], &txn).unwrap();
        assert_eq!(storage.pins().get(pin.id()).unwrap(), pin);
        storage.pins().delete(pin.id(), &txn).unwrap();
        assert!(storage.pins().get(pin.id()).is_none());
        assert!(storage.pins().is_empty());
        assert_eq!(storage.pins().with_properties(&[A]).unwrap(), Vec::<PinId>::new());
        txn.commit().unwrap();
    }

    #[test]
    fn test_ids_monotonic_and_scan_order() {
        let storage = Storage::in_memory();
        let txn = storage.begin();
        let ids: Vec<PinId> = (0..5)
            .map(|i| storage.pins().create([(A, Value::Int(i))], &txn).unwrap().id())
            .collect();
        let scanned: Vec<PinId> = storage.pins().scan_live().iter().map(Pin::id).collect();
        assert_eq!(scanned, ids);
        let batch = storage.pins().scan_batch(Some(ids[1]), 2);
        assert_eq!(batch.iter().map(Pin::id).collect::<Vec<_>>(), ids[2..4].to_vec());
        txn.commit().unwrap();
    }

    #[test]
    fn test_rollback_restores_property_index() {
        let storage = Storage::in_memory();
        let txn = storage.begin();
        storage
            .pins()
            .create([(A, Value::Int(1)), (B, Value::Int(2))], &txn)
            .unwrap();
        assert_eq!(storage.pins().with_properties(&[A, B]).unwrap().len(), 1);
        txn.rollback();
        assert!(storage.pins().is_empty());
        assert_eq!(storage.pins().with_properties(&[A]).unwrap().len(), 0);
    }

    #[test]
    fn test_relocate_changes_addr() {
        let storage = Storage::in_memory();
        let txn = storage.begin();
        let pin = storage.pins().create([(A, Value::Int(1))], &txn).unwrap();
        let moved = storage.pins().relocate(pin.id(), &txn).unwrap();
        assert_ne!(moved.addr(), pin.addr());
        assert_eq!(moved.id(), pin.id());
        txn.commit().unwrap();
    }
}
