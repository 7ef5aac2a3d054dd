//! Class action hooks
//!
//! A class may carry statements to run when a pin enters it, changes while
//! a member, or leaves it. Hooks run inside the caller's transaction, in
//! class id order, and stop at the first failure.

use crate::result::ClassResult;
use pinstore_core::{ClassId, Error, Pin, Result};
use pinstore_storage::Txn;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Membership event a hook reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Pin entered the class
    Enter,
    /// Member pin changed
    Update,
    /// Pin left the class
    Leave,
}

/// One action statement
pub trait ClassAction: Send + Sync {
    /// Run the action for `pin`
    fn run(&self, cid: ClassId, pin: &Pin, txn: &Txn) -> Result<()>;
}

impl<F> ClassAction for F
where
    F: Fn(ClassId, &Pin, &Txn) -> Result<()> + Send + Sync,
{
    fn run(&self, cid: ClassId, pin: &Pin, txn: &Txn) -> Result<()> {
        self(cid, pin, txn)
    }
}

/// Hook lists of one class
#[derive(Clone, Default)]
pub struct ClassActions {
    /// Run when a pin enters the class
    pub on_enter: Vec<Arc<dyn ClassAction>>,
    /// Run when a member pin changes
    pub on_update: Vec<Arc<dyn ClassAction>>,
    /// Run when a pin leaves the class
    pub on_leave: Vec<Arc<dyn ClassAction>>,
}

impl fmt::Debug for ClassActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassActions")
            .field("on_enter", &self.on_enter.len())
            .field("on_update", &self.on_update.len())
            .field("on_leave", &self.on_leave.len())
            .finish()
    }
}

impl ClassActions {
    /// Hooks for `kind`
    pub fn for_kind(&self, kind: ActionKind) -> &[Arc<dyn ClassAction>] {
        match kind {
            ActionKind::Enter => &self.on_enter,
            ActionKind::Update => &self.on_update,
            ActionKind::Leave => &self.on_leave,
        }
    }

    /// True if no hook is installed
    pub fn is_empty(&self) -> bool {
        self.on_enter.is_empty() && self.on_update.is_empty() && self.on_leave.is_empty()
    }
}

/// Run the `kind` hooks of every class in `result` for `pin`
///
/// Stops at the first failing hook. If the transaction has regressed by
/// then, the failure is reported as a constraint violation.
pub fn fire_actions(kind: ActionKind, pin: &Pin, result: &ClassResult, txn: &Txn) -> Result<()> {
    if result.action_count() == 0 {
        return Ok(());
    }
    for class in result.iter() {
        let Some(actions) = class.actions() else {
            continue;
        };
        for action in actions.for_kind(kind) {
            if let Err(e) = action.run(class.cid(), pin, txn) {
                warn!(target: "pinstore::classify", cid = %class.cid(), pin = %pin.id(), ?kind, error = %e, "class action failed");
                if txn.is_regressed() {
                    return Err(Error::ConstraintViolation(format!(
                        "{:?} action of class {} failed: {}",
                        kind,
                        class.cid(),
                        e
                    )));
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassFlags;
    use crate::registry::ClassRef;
    use parking_lot::Mutex;
    use pinstore_core::{Condition, PinAddr, PageId, PinId};
    use pinstore_storage::Storage;

    fn class_with(cid: u32, actions: ClassActions) -> Arc<ClassRef> {
        let r = ClassRef::new(ClassId(cid), PinId(1), Arc::new(Condition::True), ClassFlags::NONE, 0);
        r.set_actions(Some(actions));
        Arc::new(r)
    }

    fn pin() -> Pin {
        Pin::new(PinId(9), PinAddr::new(PageId(0), 0))
    }

    #[test]
    fn test_hooks_run_in_class_order_and_stop_on_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = |log: &Arc<Mutex<Vec<u32>>>| {
            let log = log.clone();
            Arc::new(move |cid: ClassId, _: &Pin, _: &Txn| -> Result<()> {
                log.lock().push(cid.0);
                Ok(())
            }) as Arc<dyn ClassAction>
        };
        let failing: Arc<dyn ClassAction> =
            Arc::new(|_: ClassId, _: &Pin, _: &Txn| -> Result<()> { Err(Error::invalid("nope")) });

        let mut result = ClassResult::new();
        result.insert(&class_with(
            2,
            ClassActions {
                on_enter: vec![failing],
                ..Default::default()
            },
        ));
        result.insert(&class_with(
            1,
            ClassActions {
                on_enter: vec![record(&log)],
                ..Default::default()
            },
        ));
        result.insert(&class_with(
            3,
            ClassActions {
                on_enter: vec![record(&log)],
                ..Default::default()
            },
        ));
        assert_eq!(result.action_count(), 3);

        let storage = Storage::in_memory();
        let txn = storage.begin();
        let err = fire_actions(ActionKind::Enter, &pin(), &result, &txn).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(*log.lock(), vec![1]);

        // other kinds have no hooks
        fire_actions(ActionKind::Leave, &pin(), &result, &txn).unwrap();
    }

    #[test]
    fn test_failure_after_regression_is_constraint_violation() {
        let regress: Arc<dyn ClassAction> = Arc::new(|_: ClassId, _: &Pin, txn: &Txn| -> Result<()> {
            txn.mark_rollback_only();
            Err(Error::invalid("rejected"))
        });
        let mut result = ClassResult::new();
        result.insert(&class_with(
            1,
            ClassActions {
                on_update: vec![regress],
                ..Default::default()
            },
        ));
        let storage = Storage::in_memory();
        let txn = storage.begin();
        let err = fire_actions(ActionKind::Update, &pin(), &result, &txn).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn test_empty_actions_are_not_installed() {
        let r = class_with(1, ClassActions::default());
        assert!(!r.has_actions());
    }
}
