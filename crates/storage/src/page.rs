//! Page allocator
//!
//! Hands out `PageId`s for tree roots and tree levels. Freed pages are
//! reused LIFO. An optional limit makes allocation fail with
//! `ResourceExhausted`, which the engine propagates without retry.

use crate::txn::{Txn, UndoRecord};
use parking_lot::Mutex;
use pinstore_core::{Error, PageId, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Allocator of page ids
#[derive(Debug)]
pub struct PageAllocator {
    next: AtomicU32,
    free: Mutex<Vec<PageId>>,
    limit: Option<u32>,
}

impl PageAllocator {
    /// Create an allocator; `limit` caps the number of pages ever handed out
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            next: AtomicU32::new(0),
            free: Mutex::new(Vec::new()),
            limit,
        }
    }

    /// Allocate a page inside a transaction
    pub fn allocate(&self, txn: &Txn) -> Result<PageId> {
        let page = self.allocate_raw()?;
        if let Err(e) = txn.record(UndoRecord::PageAlloc(page)) {
            self.release(page);
            return Err(e);
        }
        Ok(page)
    }

    /// Return a page to the free list inside a transaction
    pub fn free(&self, page: PageId, txn: &Txn) -> Result<()> {
        txn.record(UndoRecord::PageFree(page))?;
        self.release(page);
        Ok(())
    }

    pub(crate) fn allocate_raw(&self) -> Result<PageId> {
        if let Some(p) = self.free.lock().pop() {
            return Ok(p);
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.limit {
            if id >= limit {
                self.next.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::ResourceExhausted(format!(
                    "page limit {} reached",
                    limit
                )));
            }
        }
        Ok(PageId(id))
    }

    pub(crate) fn release(&self, page: PageId) {
        self.free.lock().push(page);
    }

    /// Undo of a free: take the page back out of the free list
    pub(crate) fn reclaim(&self, page: PageId) {
        let mut free = self.free.lock();
        if let Some(pos) = free.iter().rposition(|p| *p == page) {
            free.remove(pos);
        }
    }

    /// Pages currently in use
    pub fn in_use(&self) -> usize {
        self.next.load(Ordering::SeqCst) as usize - self.free.lock().len()
    }
}
