//! Secondary property index of the pin store
//!
//! Maps PropertyId → Set<PinId> so targeted class builds can visit only
//! the pins carrying every property of a DNF clause instead of scanning
//! the whole population: O(posting size) instead of O(total pins).

use pinstore_core::{PinId, PropertyId};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Secondary index: PropertyId → Pins
#[derive(Debug, Default)]
pub struct PropertyIndex {
    index: FxHashMap<PropertyId, BTreeSet<PinId>>,
}

impl PropertyIndex {
    /// Create a new empty PropertyIndex
    pub fn new() -> Self {
        Self {
            index: FxHashMap::default(),
        }
    }

    /// Add a pin to a property's posting
    pub fn insert(&mut self, prop: PropertyId, pin: PinId) {
        self.index.entry(prop).or_default().insert(pin);
    }

    /// Remove a pin from a property's posting
    ///
    /// Empty postings are removed to avoid accumulating empty sets.
    pub fn remove(&mut self, prop: PropertyId, pin: PinId) {
        if let Some(pins) = self.index.get_mut(&prop) {
            pins.remove(&pin);
            if pins.is_empty() {
                self.index.remove(&prop);
            }
        }
    }

    /// Pins carrying a property
    pub fn get(&self, prop: PropertyId) -> Option<&BTreeSet<PinId>> {
        self.index.get(&prop)
    }

    /// Pins carrying every property in `props`, ascending
    ///
    /// Intersects starting from the smallest posting. An empty `props`
    /// yields `None`, meaning "no restriction".
    pub fn intersect(&self, props: &[PropertyId]) -> Option<Vec<PinId>> {
        if props.is_empty() {
            return None;
        }
        let mut postings = Vec::with_capacity(props.len());
        for p in props {
            match self.index.get(p) {
                Some(set) => postings.push(set),
                None => return Some(Vec::new()),
            }
        }
        postings.sort_by_key(|s| s.len());
        let (first, rest) = postings.split_first()?;
        Some(
            first
                .iter()
                .filter(|id| rest.iter().all(|s| s.contains(id)))
                .copied()
                .collect(),
        )
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of indexed properties
    pub fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PropertyId = PropertyId(300);
    const B: PropertyId = PropertyId(301);
    const C: PropertyId = PropertyId(302);

    #[test]
    fn test_insert_and_get() {
        let mut index = PropertyIndex::new();
        index.insert(A, PinId(1));
        index.insert(A, PinId(2));
        let pins = index.get(A).unwrap();
        assert_eq!(pins.len(), 2);
        assert!(pins.contains(&PinId(1)));
    }

    #[test]
    fn test_remove_cleans_up() {
        let mut index = PropertyIndex::new();
        index.insert(A, PinId(1));
        index.remove(A, PinId(1));
        assert!(index.get(A).is_none());
        assert!(index.is_empty());
        // removing again is harmless
        index.remove(A, PinId(1));
    }

    #[test]
    fn test_intersect() {
        let mut index = PropertyIndex::new();
        for id in 1..=10 {
            index.insert(A, PinId(id));
        }
        for id in [2, 4, 6] {
            index.insert(B, PinId(id));
        }
        assert_eq!(
            index.intersect(&[A, B]).unwrap(),
            vec![PinId(2), PinId(4), PinId(6)]
        );
        assert_eq!(index.intersect(&[A, C]).unwrap(), Vec::<PinId>::new());
        assert!(index.intersect(&[]).is_none());
    }
}
