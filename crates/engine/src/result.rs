//! Result of classifying one pin

use crate::registry::{ClassRef, NotifyMask};
use pinstore_core::ClassId;
use std::sync::Arc;

/// Classes matched by one classification, sorted by class id
#[derive(Debug, Clone, Default)]
pub struct ClassResult {
    classes: Vec<Arc<ClassRef>>,
    n_indices: usize,
    n_actions: usize,
    notify: NotifyMask,
}

impl ClassResult {
    /// Empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class; returns false if it was already present
    pub fn insert(&mut self, class: &Arc<ClassRef>) -> bool {
        match self.position(class.cid()) {
            Ok(_) => false,
            Err(at) => {
                if class.is_indexed() {
                    self.n_indices += 1;
                }
                if class.has_actions() {
                    self.n_actions += 1;
                }
                self.notify = self.notify.union(class.notify_mask());
                self.classes.insert(at, Arc::clone(class));
                true
            }
        }
    }

    fn position(&self, cid: ClassId) -> std::result::Result<usize, usize> {
        self.classes.binary_search_by_key(&cid, |c| c.cid())
    }

    /// Check membership
    pub fn contains(&self, cid: ClassId) -> bool {
        self.position(cid).is_ok()
    }

    /// Look up a matched class
    pub fn get(&self, cid: ClassId) -> Option<&Arc<ClassRef>> {
        self.position(cid).ok().map(|i| &self.classes[i])
    }

    /// Matched classes in class id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClassRef>> + '_ {
        self.classes.iter()
    }

    /// Matched class ids in order
    pub fn ids(&self) -> Vec<ClassId> {
        self.classes.iter().map(|c| c.cid()).collect()
    }

    /// Number of matched classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Check if nothing matched
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Matched classes that maintain an index or membership list
    pub fn index_count(&self) -> usize {
        self.n_indices
    }

    /// Matched classes with action hooks
    pub fn action_count(&self) -> usize {
        self.n_actions
    }

    /// Union of the matched classes' notification masks
    pub fn notify_mask(&self) -> NotifyMask {
        self.notify
    }
}
