//! Bulk index builds
//!
//! `rebuild_all` discards every class index and rebuilds them from a full
//! pin scan; `classify_all` builds (or removes) the entries of a chosen
//! set of classes. Both collect entries per class in an
//! [`ExternalRefBuffer`] and write them out whenever the buffered bytes
//! of all classes together would exceed the per-store memory budget.
//!
//! Buffered family entries are `u16` key length, key, encoded ref. A sorted
//! buffer replays them grouped by key length, then in key order within a
//! length. Membership entries are the stored membership value itself.
//!
//! Interval-window members keep the timestamp they were listed with; a
//! build reads the current stamps before it writes anything.

use crate::class::Class;
use crate::classifier::Classifier;
use crate::maintain;
use crate::registry::ClassRef;
use crate::spill::ExternalRefBuffer;
use byteorder::{BigEndian, ByteOrder};
use pinstore_core::{ClassId, Error, EvalContext, Pin, PinId, PropertyId, Result, Timestamp};
use pinstore_storage::{IndexTree, Storage, Txn};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a bulk build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Pins examined
    pub scanned: usize,
    /// (pin, class) memberships found
    pub matched: usize,
    /// Entries written or removed
    pub entries: usize,
    /// Times the buffers were written out
    pub flushes: usize,
    /// Classes left out because they could not be loaded
    pub skipped: Vec<ClassId>,
    /// True if candidates came from a property lookup instead of a full scan
    pub targeted: bool,
}

struct Accumulator {
    class: Arc<Class>,
    /// Base classes the pin must also belong to, nearest first
    bases: Vec<Arc<ClassRef>>,
    /// Listing time of each current member of an interval window
    stamps: FxHashMap<PinId, Timestamp>,
    buf: ExternalRefBuffer,
}

impl Accumulator {
    fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        self.class.class_ref().matches(ctx) && self.bases.iter().all(|b| b.matches(ctx))
    }
}

struct Build<'s> {
    storage: &'s Storage,
    txn: &'s Txn,
    accs: BTreeMap<ClassId, Accumulator>,
    total: usize,
    budget: usize,
    drop: bool,
    stats: BuildStats,
}

impl<'s> Build<'s> {
    fn new(storage: &'s Storage, txn: &'s Txn, budget: usize, drop: bool) -> Self {
        Self {
            storage,
            txn,
            accs: BTreeMap::new(),
            total: 0,
            budget,
            drop,
            stats: BuildStats::default(),
        }
    }

    fn add_class(&mut self, class: Arc<Class>, bases: Vec<Arc<ClassRef>>) {
        let stamps = maintain::member_stamps(self.storage, &class);
        self.accs.insert(
            class.cid(),
            Accumulator {
                class,
                bases,
                stamps,
                buf: ExternalRefBuffer::new(true),
            },
        );
    }

    /// Buffer every entry `pin` contributes to class `cid`
    fn collect(&mut self, cid: ClassId, pin: &Pin) -> Result<()> {
        let Some(acc) = self.accs.get(&cid) else {
            return Ok(());
        };
        let ctx = EvalContext::new(pin);
        let entries: Vec<Vec<u8>> = if acc.class.spec().is_family() {
            let pin_ref = pin.to_ref();
            maintain::family_entries(&acc.class, &ctx)
                .iter()
                .map(|e| {
                    let mut out = vec![0u8; 2];
                    BigEndian::write_u16(&mut out, e.key.len() as u16);
                    out.extend_from_slice(&e.key);
                    out.extend_from_slice(&e.reference(pin_ref));
                    out
                })
                .collect()
        } else {
            let listed = acc.stamps.get(&pin.id()).copied();
            vec![maintain::member_value(&acc.class, &ctx, listed)]
        };
        self.stats.matched += 1;
        for entry in entries {
            self.push(cid, &entry)?;
        }
        Ok(())
    }

    /// Evaluate every class against `pin` and buffer the matches
    fn evaluate(&mut self, pin: &Pin) -> Result<()> {
        self.stats.scanned += 1;
        if pin.get(PropertyId::CLASS_ID).is_some() {
            return Ok(());
        }
        let ctx = EvalContext::new(pin);
        let hits: Vec<ClassId> = self
            .accs
            .iter()
            .filter(|(_, acc)| acc.matches(&ctx))
            .map(|(cid, _)| *cid)
            .collect();
        for cid in hits {
            self.collect(cid, pin)?;
        }
        Ok(())
    }

    fn push(&mut self, cid: ClassId, entry: &[u8]) -> Result<()> {
        let need = entry.len() + 2;
        if self.total > 0 && self.total + need > self.budget {
            self.flush()?;
        }
        let acc = self
            .accs
            .get_mut(&cid)
            .ok_or_else(|| Error::not_found(format!("class {}", cid)))?;
        acc.buf.append(entry)?;
        self.total += need;
        Ok(())
    }

    /// Write out and clear every buffer
    fn flush(&mut self) -> Result<()> {
        if self.total == 0 {
            return Ok(());
        }
        let mut written = 0;
        for acc in self.accs.values_mut() {
            for entry in acc.buf.cursor() {
                write_entry(self.storage, &acc.class, entry, self.drop, self.txn)?;
                written += 1;
            }
            acc.buf.clear();
        }
        debug!(target: "pinstore::bulk", written, bytes = self.total, "buffers flushed");
        self.stats.entries += written;
        self.stats.flushes += 1;
        self.total = 0;
        Ok(())
    }

    fn finish(mut self) -> Result<BuildStats> {
        self.flush()?;
        Ok(self.stats)
    }
}

/// Apply one buffered entry
fn write_entry(storage: &Storage, class: &Class, entry: &[u8], drop: bool, txn: &Txn) -> Result<()> {
    if class.spec().is_family() {
        if entry.len() < 2 {
            return Err(Error::Serialization("truncated bulk entry".into()));
        }
        let klen = BigEndian::read_u16(entry) as usize;
        let rest = &entry[2..];
        if rest.len() < klen {
            return Err(Error::Serialization("truncated bulk entry".into()));
        }
        let (key, value) = rest.split_at(klen);
        if drop {
            maintain::remove_entry(storage, class, key, value, txn)
        } else {
            maintain::insert_entry(storage, class, key, value, txn)
        }
    } else if drop {
        maintain::remove_member(storage, class, maintain::member_ref(class, entry), txn)
    } else {
        maintain::add_member(storage, class, entry, txn)
    }
}

impl Classifier {
    /// Discard every class index and rebuild all of them from a full scan
    ///
    /// Classes whose definition or index descriptor cannot be loaded are
    /// left out and listed in [`BuildStats::skipped`]; the remaining
    /// classes are rebuilt.
    pub fn rebuild_all(&self, txn: &Txn) -> Result<BuildStats> {
        let _admin = self.admin.lock();
        let storage = self.storage();
        info!(target: "pinstore::bulk", "rebuilding all class indexes");
        let mut build = Build::new(storage, txn, self.config().per_store_budget(), false);
        for cid in self.class_ids() {
            let class = match self.get_class(cid) {
                Ok(class) => class,
                Err(e) if e.is_fatal() && !matches!(e, Error::Corruption { .. }) => return Err(e),
                Err(e) => {
                    warn!(target: "pinstore::bulk", cid = %cid, error = %e, "skipping class");
                    build.stats.skipped.push(cid);
                    continue;
                }
            };
            if !class.spec().is_indexed() {
                continue;
            }
            if let Some(tree) = class.tree() {
                tree.destroy(txn)?;
            }
            build.add_class(class, Vec::new());
        }
        storage.class_map().destroy(txn)?;

        let batch = self.config().scan_batch_size;
        let mut after: Option<PinId> = None;
        loop {
            let pins = storage.pins().scan_batch(after, batch);
            let Some(last) = pins.last() else {
                break;
            };
            after = Some(last.id());
            for pin in &pins {
                build.stats.scanned += 1;
                let result = self.classify(pin);
                for class_ref in result.iter().filter(|c| c.is_indexed()) {
                    build.collect(class_ref.cid(), pin)?;
                }
            }
        }
        let rebuilt: Vec<Arc<ClassRef>> = build
            .accs
            .values()
            .map(|a| Arc::clone(a.class.class_ref()))
            .collect();
        let stats = build.finish()?;
        txn.on_commit(move || {
            for class_ref in rebuilt {
                class_ref.set_materialized(true);
            }
        });
        info!(
            target: "pinstore::bulk",
            scanned = stats.scanned,
            entries = stats.entries,
            flushes = stats.flushes,
            skipped = stats.skipped.len(),
            "rebuild complete"
        );
        Ok(stats)
    }

    /// Build the entries of `cids` over the existing pins, or remove them
    /// if `drop` is set
    ///
    /// Classes without an index or membership list are ignored.
    pub fn classify_all(&self, cids: &[ClassId], drop: bool, txn: &Txn) -> Result<BuildStats> {
        let _admin = self.admin.lock();
        let classes = cids
            .iter()
            .map(|cid| self.get_class(*cid))
            .collect::<Result<Vec<_>>>()?;
        self.build_locked(&classes, drop, txn)
    }

    /// Bulk build for `classes`; the caller holds the admin lock
    pub(crate) fn build_locked(
        &self,
        classes: &[Arc<Class>],
        drop: bool,
        txn: &Txn,
    ) -> Result<BuildStats> {
        let storage = self.storage();
        let mut build = Build::new(storage, txn, self.config().per_store_budget(), drop);
        for class in classes.iter().filter(|c| c.spec().is_indexed()) {
            build.add_class(Arc::clone(class), self.base_chain(class)?);
        }
        if build.accs.is_empty() {
            return Ok(build.stats);
        }

        let targets = match build.accs.values().next() {
            Some(acc) if build.accs.len() == 1 && !drop => candidates(storage, acc),
            _ => None,
        };
        let batch = self.config().scan_batch_size;
        match targets {
            Some((ids, props)) => {
                build.stats.targeted = true;
                debug!(target: "pinstore::bulk", candidates = ids.len(), "targeted build");
                for chunk in ids.chunks(batch) {
                    for id in chunk {
                        if let Some(pin) = storage.pins().project(*id, &props) {
                            build.evaluate(&pin)?;
                        }
                    }
                }
            }
            None => {
                let mut after: Option<PinId> = None;
                loop {
                    let pins = storage.pins().scan_batch(after, batch);
                    let Some(last) = pins.last() else {
                        break;
                    };
                    after = Some(last.id());
                    for pin in &pins {
                        build.evaluate(pin)?;
                    }
                }
            }
        }

        let refs: Vec<Arc<ClassRef>> = build
            .accs
            .values()
            .map(|a| Arc::clone(a.class.class_ref()))
            .collect();
        let stats = build.finish()?;
        txn.on_commit(move || {
            for class_ref in refs {
                class_ref.set_materialized(!drop);
            }
        });
        debug!(
            target: "pinstore::bulk",
            scanned = stats.scanned,
            entries = stats.entries,
            flushes = stats.flushes,
            drop,
            "bulk build complete"
        );
        Ok(stats)
    }

    /// Registry entries of `class`'s bases, nearest first
    fn base_chain(&self, class: &Class) -> Result<Vec<Arc<ClassRef>>> {
        let mut chain = Vec::new();
        let mut next = class.spec().base;
        while let Some(cid) = next {
            let base = self.get_class(cid)?;
            chain.push(Arc::clone(base.class_ref()));
            next = base.spec().base;
        }
        Ok(chain)
    }
}

/// Candidate pins of a single class and the properties to load for them
///
/// `None` when some disjunct of the class predicate needs no property,
/// in which case every pin is a candidate.
fn candidates(storage: &Storage, acc: &Accumulator) -> Option<(Vec<PinId>, Vec<PropertyId>)> {
    let mut ids = BTreeSet::new();
    for clause in acc.class.class_ref().condition().property_dnf() {
        ids.extend(storage.pins().with_properties(&clause)?);
    }
    let mut props: BTreeSet<PropertyId> = acc
        .class
        .class_ref()
        .condition()
        .properties()
        .into_iter()
        .collect();
    for base in &acc.bases {
        props.extend(base.condition().properties());
    }
    props.extend(acc.class.segments().iter().map(|s| s.prop));
    if let Some(crate::class::Window::Interval { prop: Some(p), .. }) = acc.class.spec().window {
        props.insert(p);
    }
    props.insert(PropertyId::CLASS_ID);
    Some((ids.into_iter().collect(), props.into_iter().collect()))
}
