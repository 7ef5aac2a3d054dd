//! Write transactions with nested mini-transactions
//!
//! A `Txn` records an undo entry for every mutation it makes through the
//! storage layer. Nothing is buffered: writes are applied immediately and
//! rolled back by replaying the undo log in reverse.
//!
//! ## Mini-Transactions
//!
//! `Txn::mini()` opens a nested savepoint. The returned `MiniTxn` rolls back
//! everything recorded after the savepoint when dropped, unless
//! `MiniTxn::commit` was called, in which case its records merge into the
//! parent. The index layer uses this to publish a newly allocated root page
//! atomically with the descriptor write that makes it reachable.
//!
//! ## Callbacks
//!
//! - `on_commit`: runs after the outermost commit. Callbacks registered
//!   inside a mini-transaction that rolls back are discarded.
//! - `on_rollback`: runs when the record it was registered after is undone,
//!   either by a mini-transaction rollback or by the whole transaction.

use crate::storage::Storage;
use crate::tree_manager::TreeData;
use parking_lot::Mutex;
use pinstore_core::{Error, PageId, Pin, PinId, Result};
use std::sync::Arc;
use tracing::debug;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Accepting writes
    Active,
    /// A failure was observed; commit will roll back instead
    RollbackOnly,
    /// Committed
    Committed,
    /// Rolled back
    Aborted,
}

type Hook = Box<dyn FnOnce() + Send>;

pub(crate) enum UndoRecord {
    TreeInsert {
        anchor: PageId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    TreeRemove {
        anchor: PageId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    TreeCreate {
        anchor: PageId,
    },
    TreeDrop {
        anchor: PageId,
        data: TreeData,
    },
    LevelPush {
        anchor: PageId,
    },
    LevelPop {
        anchor: PageId,
        page: PageId,
    },
    PageAlloc(PageId),
    PageFree(PageId),
    PinWrite {
        id: PinId,
        before: Option<Pin>,
    },
    Hook(Hook),
}

struct TxnState {
    status: TxnStatus,
    undo: Vec<UndoRecord>,
    savepoints: Vec<usize>,
    /// Commit hooks tagged with the savepoint depth they were registered at
    on_commit: Vec<(usize, Hook)>,
}

/// A write transaction over a [`Storage`]
pub struct Txn {
    storage: Arc<Storage>,
    state: Mutex<TxnState>,
}

impl Txn {
    pub(crate) fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            state: Mutex::new(TxnState {
                status: TxnStatus::Active,
                undo: Vec::new(),
                savepoints: Vec::new(),
                on_commit: Vec::new(),
            }),
        }
    }

    /// Storage this transaction writes to
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Current status
    pub fn status(&self) -> TxnStatus {
        self.state.lock().status
    }

    /// Number of undo records; grows with every mutation
    pub fn undo_len(&self) -> usize {
        self.state.lock().undo.len()
    }

    /// Mini-transaction nesting depth
    pub fn depth(&self) -> usize {
        self.state.lock().savepoints.len()
    }

    pub(crate) fn record(&self, rec: UndoRecord) -> Result<()> {
        let mut st = self.state.lock();
        match st.status {
            TxnStatus::Active | TxnStatus::RollbackOnly => {
                st.undo.push(rec);
                Ok(())
            }
            other => Err(Error::invalid(format!("transaction is {:?}", other))),
        }
    }

    /// Mark the transaction as unable to commit
    pub fn mark_rollback_only(&self) {
        let mut st = self.state.lock();
        if st.status == TxnStatus::Active {
            st.status = TxnStatus::RollbackOnly;
        }
    }

    /// True once the transaction can no longer commit
    pub fn is_regressed(&self) -> bool {
        !matches!(self.status(), TxnStatus::Active)
    }

    /// Register a callback for successful commit of the whole transaction
    pub fn on_commit(&self, hook: impl FnOnce() + Send + 'static) {
        let mut st = self.state.lock();
        let level = st.savepoints.len();
        st.on_commit.push((level, Box::new(hook)));
    }

    /// Register a callback to run if everything recorded so far is undone
    pub fn on_rollback(&self, hook: impl FnOnce() + Send + 'static) -> Result<()> {
        self.record(UndoRecord::Hook(Box::new(hook)))
    }

    /// Open a nested mini-transaction
    pub fn mini(&self) -> MiniTxn<'_> {
        let mut st = self.state.lock();
        let mark = st.undo.len();
        st.savepoints.push(mark);
        MiniTxn {
            txn: self,
            mark,
            done: false,
        }
    }

    /// Commit; runs commit callbacks in registration order
    pub fn commit(self) -> Result<()> {
        let hooks = {
            let mut st = self.state.lock();
            if st.status == TxnStatus::RollbackOnly {
                drop(st);
                self.rollback_to(0);
                self.state.lock().status = TxnStatus::Aborted;
                return Err(Error::invalid("transaction marked rollback-only"));
            }
            st.status = TxnStatus::Committed;
            st.undo.clear();
            st.savepoints.clear();
            std::mem::take(&mut st.on_commit)
        };
        debug!(target: "pinstore::txn", hooks = hooks.len(), "commit");
        for (_, hook) in hooks {
            hook();
        }
        Ok(())
    }

    /// Roll back every recorded mutation
    pub fn rollback(self) {
        self.abort();
    }

    fn abort(&self) {
        let status = self.status();
        if matches!(status, TxnStatus::Committed | TxnStatus::Aborted) {
            return;
        }
        self.rollback_to(0);
        let mut st = self.state.lock();
        st.status = TxnStatus::Aborted;
        st.on_commit.clear();
        st.savepoints.clear();
    }

    fn rollback_to(&self, mark: usize) {
        let records = {
            let mut st = self.state.lock();
            // Commit hooks opened at or below the depth being unwound go too
            let level = st.savepoints.len();
            st.on_commit.retain(|(l, _)| *l < level);
            if mark >= st.undo.len() {
                return;
            }
            st.undo.split_off(mark)
        };
        debug!(target: "pinstore::txn", records = records.len(), mark, "rollback");
        for rec in records.into_iter().rev() {
            self.storage.undo(rec);
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Nested savepoint; rolls back on drop unless committed
pub struct MiniTxn<'a> {
    txn: &'a Txn,
    mark: usize,
    done: bool,
}

impl<'a> MiniTxn<'a> {
    /// Enclosing transaction
    pub fn txn(&self) -> &'a Txn {
        self.txn
    }

    /// Keep the mini-transaction's writes as part of the parent
    pub fn commit(mut self) {
        self.done = true;
        let mut st = self.txn.state.lock();
        let level = st.savepoints.len();
        st.savepoints.pop();
        for (l, _) in st.on_commit.iter_mut() {
            if *l == level {
                *l = level - 1;
            }
        }
    }

    /// Undo the mini-transaction's writes
    pub fn rollback(self) {
        // Drop does the work
    }
}

impl Drop for MiniTxn<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.txn.rollback_to(self.mark);
        self.txn.state.lock().savepoints.pop();
    }
}
