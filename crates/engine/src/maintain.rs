//! Incremental index maintenance
//!
//! [`apply`] moves one class's stored entries for one pin from the pin's
//! old state to its new state. Membership-only classes keep a list of
//! refs in the shared class map under the class id; families keep a
//! composite index in their `ClassIndexTree`.
//!
//! # Phases
//!
//! Family maintenance is a state machine over a [`PhaseMask`]. The
//! initial mask depends on the change:
//!
//! | Change | Initial mask |
//! |---|---|
//! | pin enters the class | `INSERT` |
//! | pin leaves the class | `DELETE \| DELNULLS` |
//! | ref changed, key values equal | `UPDATE` |
//! | scalar segment changed | `INSERT \| DELETE \| DELNULLS`, plus `UPDATE` if the ref changed |
//! | collection segment changed | `UPDCOLL`, plus `UPDATE` if the ref changed |
//!
//! Phases run in a fixed order (Insert, Delete, Update, UpdateCollection,
//! DeleteNulls) and each clears its own bit:
//!
//! | Phase | Writes |
//! |---|---|
//! | Insert | new tuples missing from the old set, with the new ref |
//! | Delete | old tuples without null sentinels missing from the new set |
//! | Update | tuples in both sets, old ref replaced by the new ref |
//! | UpdateCollection | element delta of the one changed collection segment; otherwise re-arms `INSERT \| DELETE \| DELNULLS` |
//! | DeleteNulls | old tuples with null sentinels missing from the new set |
//!
//! The loop ends when the mask is empty.
//!
//! # Key Tuples
//!
//! A pin contributes the Cartesian product of its per-segment values: a
//! collection contributes each element, a scalar itself, an absent value
//! a null. Tuples that cannot be typed, and tuples `SearchKey::build`
//! declines (all null, or null in a segment that does not order nulls),
//! are skipped.

use crate::class::{Class, Window};
use pinstore_core::{
    ClassId, Error, EvalContext, IndexSeg, Pin, PinId, PinRef, RefFlags, Result, SearchKey, Timestamp, Value,
};
use pinstore_storage::{IndexTree, Storage, Txn};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Direction of a single-pin index operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexOp {
    /// Add the pin's entries
    Insert,
    /// Remove the pin's entries
    Delete,
}

/// One step of family maintenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Write tuples the pin gained
    Insert,
    /// Remove tuples the pin lost
    Delete,
    /// Repoint unchanged tuples at the pin's new ref
    Update,
    /// Apply the element delta of a collection segment
    UpdateCollection,
    /// Remove lost tuples carrying null sentinels
    DeleteNulls,
}

impl Phase {
    const ORDER: [Phase; 5] = [
        Phase::Insert,
        Phase::Delete,
        Phase::Update,
        Phase::UpdateCollection,
        Phase::DeleteNulls,
    ];

    fn bit(self) -> u8 {
        match self {
            Phase::Insert => 0x01,
            Phase::Delete => 0x02,
            Phase::Update => 0x04,
            Phase::UpdateCollection => 0x08,
            Phase::DeleteNulls => 0x10,
        }
    }
}

/// Set of pending phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PhaseMask(u8);

impl PhaseMask {
    /// Nothing to do
    pub const NONE: PhaseMask = PhaseMask(0);
    /// See [`Phase::Insert`]
    pub const INSERT: PhaseMask = PhaseMask(0x01);
    /// See [`Phase::Delete`]
    pub const DELETE: PhaseMask = PhaseMask(0x02);
    /// See [`Phase::Update`]
    pub const UPDATE: PhaseMask = PhaseMask(0x04);
    /// See [`Phase::UpdateCollection`]
    pub const UPDCOLL: PhaseMask = PhaseMask(0x08);
    /// See [`Phase::DeleteNulls`]
    pub const DELNULLS: PhaseMask = PhaseMask(0x10);
    /// Full replacement of the pin's tuples
    pub const REPLACE: PhaseMask = PhaseMask(0x01 | 0x02 | 0x10);

    /// Check whether `phase` is pending
    pub fn contains(self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    /// Union of two masks
    pub fn union(self, other: PhaseMask) -> PhaseMask {
        PhaseMask(self.0 | other.0)
    }

    /// Mask with `phase` cleared
    pub fn without(self, phase: Phase) -> PhaseMask {
        PhaseMask(self.0 & !phase.bit())
    }

    /// True when no phase is pending
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Next phase to run
    pub fn next(self) -> Option<Phase> {
        Phase::ORDER.into_iter().find(|p| self.contains(*p))
    }
}

/// One composite-key tuple of a pin
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct KeyEntry {
    pub key: Vec<u8>,
    /// Produced from a collection element
    pub coll: bool,
    /// Carries at least one null sentinel
    pub nulls: bool,
}

impl KeyEntry {
    /// Stored value of this tuple for `pin_ref`
    pub fn reference(&self, pin_ref: PinRef) -> Vec<u8> {
        if self.coll {
            pin_ref.with_flags(RefFlags::COLL_ELEMENT).encode()
        } else {
            pin_ref.encode()
        }
    }
}

/// Candidate values of one segment
#[derive(Debug, Clone)]
struct SegValues<'a> {
    values: Vec<Option<&'a Value>>,
    coll: bool,
}

impl<'a> SegValues<'a> {
    fn of(value: Option<&'a Value>) -> Self {
        match value {
            Some(v) if v.is_collection() => {
                let values: Vec<_> = v.elements().into_iter().map(Some).collect();
                if values.is_empty() {
                    Self::absent()
                } else {
                    Self { values, coll: true }
                }
            }
            Some(v) if !v.is_null() => Self {
                values: vec![Some(v)],
                coll: false,
            },
            _ => Self::absent(),
        }
    }

    fn absent() -> Self {
        Self {
            values: vec![None],
            coll: false,
        }
    }
}

/// Odometer over the Cartesian product of per-segment values
///
/// The last segment varies fastest. Every list holds at least one value,
/// so the product is never empty.
struct TupleCursor<'s, 'a> {
    lists: &'s [SegValues<'a>],
    pos: Vec<usize>,
    done: bool,
}

impl<'s, 'a> TupleCursor<'s, 'a> {
    fn new(lists: &'s [SegValues<'a>]) -> Self {
        Self {
            lists,
            pos: vec![0; lists.len()],
            done: lists.is_empty(),
        }
    }
}

impl<'a> Iterator for TupleCursor<'_, 'a> {
    type Item = Vec<Option<&'a Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let tuple = self
            .lists
            .iter()
            .zip(&self.pos)
            .map(|(list, &i)| list.values[i])
            .collect();
        let mut seg = self.lists.len();
        loop {
            if seg == 0 {
                self.done = true;
                break;
            }
            seg -= 1;
            self.pos[seg] += 1;
            if self.pos[seg] < self.lists[seg].values.len() {
                break;
            }
            self.pos[seg] = 0;
        }
        Some(tuple)
    }
}

fn build_entries(cid: ClassId, segs: &[IndexSeg], lists: &[SegValues<'_>]) -> BTreeSet<KeyEntry> {
    let coll = lists.iter().any(|l| l.coll);
    let mut out = BTreeSet::new();
    for tuple in TupleCursor::new(lists) {
        match SearchKey::build(segs, &tuple) {
            Ok(Some(key)) => {
                out.insert(KeyEntry {
                    key: key.as_bytes().to_vec(),
                    coll,
                    nulls: key.has_nulls(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                debug!(target: "pinstore::index", cid = %cid, error = %e, "skipping key tuple")
            }
        }
    }
    out
}

/// Key tuples of a pin for a family class
pub(crate) fn family_entries(class: &Class, ctx: &EvalContext<'_>) -> BTreeSet<KeyEntry> {
    let lists: Vec<SegValues<'_>> = class
        .segments()
        .iter()
        .map(|s| SegValues::of(ctx.get(s.prop)))
        .collect();
    build_entries(class.cid(), class.segments(), &lists)
}

/// Normalize a tree result: a missing entry is success, other
/// non-fatal errors are logged and dropped
fn absorb(cid: ClassId, what: &'static str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            trace!(target: "pinstore::index", cid = %cid, what, "entry already absent");
            Ok(())
        }
        Err(e) if !e.is_fatal() => {
            warn!(target: "pinstore::index", cid = %cid, what, error = %e, "index write failed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn family_tree(class: &Class) -> Result<&dyn IndexTree> {
    class
        .tree()
        .map(|t| &**t as &dyn IndexTree)
        .ok_or_else(|| Error::invalid(format!("class {} has no index", class.cid())))
}

/// Insert one (key, ref) pair into a family index
pub(crate) fn insert_entry(
    storage: &Storage,
    class: &Class,
    key: &[u8],
    value: &[u8],
    txn: &Txn,
) -> Result<()> {
    let tree = family_tree(class)?;
    let result = storage.trees().insert(tree, key, value, txn).map(|inserted| {
        if !inserted {
            trace!(target: "pinstore::index", cid = %class.cid(), "entry already present");
        }
    });
    absorb(class.cid(), "insert", result)
}

/// Remove one (key, ref) pair from a family index
pub(crate) fn remove_entry(
    storage: &Storage,
    class: &Class,
    key: &[u8],
    value: &[u8],
    txn: &Txn,
) -> Result<()> {
    let tree = family_tree(class)?;
    absorb(class.cid(), "remove", storage.trees().remove(tree, key, value, txn))
}

fn update_entry(
    storage: &Storage,
    class: &Class,
    key: &[u8],
    old: &[u8],
    new: &[u8],
    txn: &Txn,
) -> Result<()> {
    let tree = family_tree(class)?;
    absorb(class.cid(), "update", storage.trees().update(tree, key, old, new, txn))
}

// ============================================================================
// Families
// ============================================================================

fn initial_mask(class: &Class, old: &Pin, old_ctx: &EvalContext<'_>, new: &Pin, new_ctx: &EvalContext<'_>) -> PhaseMask {
    let mut mask = if old.to_ref() != new.to_ref() {
        PhaseMask::UPDATE
    } else {
        PhaseMask::NONE
    };
    let mut changed = class
        .segments()
        .iter()
        .filter(|s| old_ctx.get(s.prop) != new_ctx.get(s.prop))
        .peekable();
    if changed.peek().is_none() {
        return mask;
    }
    let coll = changed.any(|s| {
        old_ctx.get(s.prop).is_some_and(Value::is_collection)
            || new_ctx.get(s.prop).is_some_and(Value::is_collection)
    });
    mask = mask.union(if coll {
        PhaseMask::UPDCOLL
    } else {
        PhaseMask::REPLACE
    });
    mask
}

/// Element delta of the only changed segment, when it is a collection on
/// both sides
///
/// Returns the tuples to insert and the tuples to remove, or `None` when
/// the change is not a single collection delta.
fn collection_delta(
    class: &Class,
    old: &EvalContext<'_>,
    new: &EvalContext<'_>,
) -> Option<(BTreeSet<KeyEntry>, BTreeSet<KeyEntry>)> {
    let segs = class.segments();
    let mut changed = segs
        .iter()
        .enumerate()
        .filter(|(_, s)| old.get(s.prop) != new.get(s.prop));
    let (at, seg) = changed.next()?;
    if changed.next().is_some() {
        return None;
    }
    let before = SegValues::of(old.get(seg.prop));
    let after = SegValues::of(new.get(seg.prop));
    if !before.coll || !after.coll {
        return None;
    }
    let added: Vec<_> = after
        .values
        .iter()
        .filter(|v| !before.values.contains(v))
        .copied()
        .collect();
    let removed: Vec<_> = before
        .values
        .iter()
        .filter(|v| !after.values.contains(v))
        .copied()
        .collect();

    let mut lists: Vec<SegValues<'_>> = segs.iter().map(|s| SegValues::of(new.get(s.prop))).collect();
    let inserts = element_entries(class, &mut lists, at, added);
    let removes = element_entries(class, &mut lists, at, removed);
    Some((inserts, removes))
}

/// Tuples with segment `at` restricted to `values`
fn element_entries<'a>(
    class: &Class,
    lists: &mut [SegValues<'a>],
    at: usize,
    values: Vec<Option<&'a Value>>,
) -> BTreeSet<KeyEntry> {
    if values.is_empty() {
        return BTreeSet::new();
    }
    lists[at] = SegValues { values, coll: true };
    build_entries(class.cid(), class.segments(), lists)
}

fn apply_family(
    storage: &Storage,
    class: &Class,
    old: Option<&Pin>,
    new: Option<&Pin>,
    persisted: Option<&Pin>,
    txn: &Txn,
) -> Result<()> {
    let old_ctx = old.map(EvalContext::new);
    let new_ctx = new.map(|n| EvalContext::with_persisted(n, persisted));
    let old_ref = old.map(Pin::to_ref);
    let new_ref = new.map(Pin::to_ref);

    let mut mask = match (old, &old_ctx, new, &new_ctx) {
        (None, _, Some(_), _) => PhaseMask::INSERT,
        (Some(_), _, None, _) => PhaseMask::DELETE.union(PhaseMask::DELNULLS),
        (Some(o), Some(oc), Some(n), Some(nc)) => initial_mask(class, o, oc, n, nc),
        _ => PhaseMask::NONE,
    };
    trace!(target: "pinstore::index", cid = %class.cid(), mask = ?mask, "maintain family");

    let mut sets: Option<(BTreeSet<KeyEntry>, BTreeSet<KeyEntry>)> = None;
    while let Some(phase) = mask.next() {
        mask = mask.without(phase);

        if phase == Phase::UpdateCollection {
            let delta = match (&old_ctx, &new_ctx) {
                (Some(o), Some(n)) => collection_delta(class, o, n),
                _ => None,
            };
            match (delta, old_ref, new_ref) {
                (Some((inserts, removes)), Some(or), Some(nr)) => {
                    for e in &inserts {
                        insert_entry(storage, class, &e.key, &e.reference(nr), txn)?;
                    }
                    for e in &removes {
                        remove_entry(storage, class, &e.key, &e.reference(or), txn)?;
                    }
                }
                _ => mask = mask.union(PhaseMask::REPLACE),
            }
            continue;
        }

        let (old_set, new_set) = sets.get_or_insert_with(|| {
            (
                old_ctx
                    .as_ref()
                    .map(|c| family_entries(class, c))
                    .unwrap_or_default(),
                new_ctx
                    .as_ref()
                    .map(|c| family_entries(class, c))
                    .unwrap_or_default(),
            )
        });

        match phase {
            Phase::Insert => {
                if let Some(nr) = new_ref {
                    for e in new_set.difference(old_set) {
                        insert_entry(storage, class, &e.key, &e.reference(nr), txn)?;
                    }
                }
            }
            Phase::Delete | Phase::DeleteNulls => {
                let nulls = phase == Phase::DeleteNulls;
                if let Some(or) = old_ref {
                    for e in old_set.difference(new_set).filter(|e| e.nulls == nulls) {
                        remove_entry(storage, class, &e.key, &e.reference(or), txn)?;
                    }
                }
            }
            Phase::Update => {
                if let (Some(or), Some(nr)) = (old_ref, new_ref) {
                    for e in old_set.intersection(new_set) {
                        update_entry(storage, class, &e.key, &e.reference(or), &e.reference(nr), txn)?;
                    }
                }
            }
            Phase::UpdateCollection => {}
        }
    }
    Ok(())
}

// ============================================================================
// Membership lists
// ============================================================================

const TS_LEN: usize = 8;

fn is_interval(class: &Class) -> bool {
    matches!(class.spec().window, Some(Window::Interval { .. }))
}

fn value_ts(value: &[u8]) -> Option<Timestamp> {
    let bytes: [u8; TS_LEN] = value.get(..TS_LEN)?.try_into().ok()?;
    Some(Timestamp::from_be_bytes(bytes))
}

/// Ref part of a stored membership value
pub(crate) fn member_ref<'v>(class: &Class, value: &'v [u8]) -> &'v [u8] {
    if is_interval(class) {
        value.get(TS_LEN..).unwrap_or_default()
    } else {
        value
    }
}

fn member_ts(class: &Class, ctx: &EvalContext<'_>, existing: Option<Timestamp>) -> Option<Timestamp> {
    match class.spec().window {
        Some(Window::Interval { prop, .. }) => Some(
            prop.and_then(|p| ctx.get(p))
                .and_then(Value::as_timestamp)
                .or(existing)
                .unwrap_or_else(Timestamp::now),
        ),
        _ => None,
    }
}

fn encode_member(ts: Option<Timestamp>, pin_ref: PinRef) -> Vec<u8> {
    let mut out = Vec::with_capacity(TS_LEN + 16);
    if let Some(ts) = ts {
        out.extend_from_slice(&ts.to_be_bytes());
    }
    pin_ref.encode_into(&mut out);
    out
}

/// Stored membership value of a pin
///
/// Interval windows prefix the ref with the member's timestamp: the
/// window property if the pin has it, else `existing`, else now.
pub(crate) fn member_value(class: &Class, ctx: &EvalContext<'_>, existing: Option<Timestamp>) -> Vec<u8> {
    encode_member(member_ts(class, ctx, existing), ctx.pin.to_ref())
}

/// Timestamps of the current members of an interval-window class
pub(crate) fn member_stamps(storage: &Storage, class: &Class) -> FxHashMap<PinId, Timestamp> {
    if !is_interval(class) {
        return FxHashMap::default();
    }
    storage
        .trees()
        .values(storage.class_map(), &class.cid().to_key())
        .iter()
        .filter_map(|v| {
            let id = PinRef::decode_exact(member_ref(class, v)).ok()?.id;
            Some((id, value_ts(v)?))
        })
        .collect()
}

/// Stored value holding `pin_ref`, if any
fn find_member(storage: &Storage, class: &Class, pin_ref: &[u8]) -> Option<Vec<u8>> {
    if !is_interval(class) {
        return Some(pin_ref.to_vec());
    }
    storage
        .trees()
        .values(storage.class_map(), &class.cid().to_key())
        .into_iter()
        .find(|v| member_ref(class, v) == pin_ref)
}

/// Add a membership value, applying the class's retention window
pub(crate) fn add_member(storage: &Storage, class: &Class, value: &[u8], txn: &Txn) -> Result<()> {
    let cid = class.cid();
    let map = storage.class_map();
    let key = cid.to_key();
    match class.spec().window {
        Some(Window::Count(k)) => {
            let existing = storage.trees().values(map, &key);
            if existing.iter().any(|v| v == value) {
                return Ok(());
            }
            let keep = (k as usize).saturating_sub(1);
            let excess = existing.len().saturating_sub(keep);
            for old in existing.iter().take(excess) {
                absorb(cid, "truncate", storage.trees().remove(map, &key, old, txn))?;
            }
            if excess > 0 {
                trace!(target: "pinstore::index", cid = %cid, excess, "count window truncated");
            }
        }
        Some(Window::Interval { range_us, .. }) => {
            let cutoff = Timestamp::now().saturating_sub(Duration::from_micros(range_us));
            for old in storage.trees().values(map, &key) {
                if value_ts(&old).is_some_and(|ts| ts < cutoff) {
                    absorb(cid, "truncate", storage.trees().remove(map, &key, &old, txn))?;
                }
            }
            if value_ts(value).is_some_and(|ts| ts < cutoff) {
                trace!(target: "pinstore::index", cid = %cid, "member older than window");
                return Ok(());
            }
        }
        None => {}
    }
    let result = storage.trees().insert(map, &key, value, txn).map(|_| ());
    absorb(cid, "insert", result)
}

/// Remove the membership value holding `pin_ref`
pub(crate) fn remove_member(storage: &Storage, class: &Class, pin_ref: &[u8], txn: &Txn) -> Result<()> {
    let Some(value) = find_member(storage, class, pin_ref) else {
        trace!(target: "pinstore::index", cid = %class.cid(), "member already absent");
        return Ok(());
    };
    let key = class.cid().to_key();
    absorb(
        class.cid(),
        "remove",
        storage.trees().remove(storage.class_map(), &key, &value, txn),
    )
}

fn apply_membership(
    storage: &Storage,
    class: &Class,
    old: Option<&Pin>,
    new: Option<&Pin>,
    persisted: Option<&Pin>,
    txn: &Txn,
) -> Result<()> {
    match (old, new) {
        (None, Some(n)) => {
            let ctx = EvalContext::with_persisted(n, persisted);
            add_member(storage, class, &member_value(class, &ctx, None), txn)
        }
        (Some(o), None) => remove_member(storage, class, &o.to_ref().encode(), txn),
        (Some(o), Some(n)) => {
            let existing = find_member(storage, class, &o.to_ref().encode());
            let ctx = EvalContext::with_persisted(n, persisted);
            let prev_ts = existing.as_deref().and_then(value_ts);
            let desired = encode_member(member_ts(class, &ctx, prev_ts), n.to_ref());
            match existing {
                Some(v) if v == desired => Ok(()),
                Some(v) => {
                    let key = class.cid().to_key();
                    absorb(
                        class.cid(),
                        "remove",
                        storage.trees().remove(storage.class_map(), &key, &v, txn),
                    )?;
                    add_member(storage, class, &desired, txn)
                }
                None => add_member(storage, class, &desired, txn),
            }
        }
        (None, None) => Ok(()),
    }
}

/// Bring `class`'s entries for one pin from `old` to `new`
///
/// `old` is the pin's previous state if it was a member, `new` its
/// current state if it is one. `new` may be a partial projection; any
/// property it lacks is read from `persisted`, or from `old` when no
/// persisted state is given. `persisted` is independent of membership: a
/// pin entering the class still reads through to its stored state.
pub(crate) fn apply<'p>(
    storage: &Storage,
    class: &Class,
    old: Option<&'p Pin>,
    new: Option<&'p Pin>,
    persisted: Option<&'p Pin>,
    txn: &Txn,
) -> Result<()> {
    let persisted = persisted.or(old);
    let spec = class.spec();
    if spec.is_family() {
        apply_family(storage, class, old, new, persisted, txn)
    } else if spec.is_indexed() {
        apply_membership(storage, class, old, new, persisted, txn)
    } else {
        Ok(())
    }
}
