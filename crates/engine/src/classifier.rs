//! Classifier: routing, class lifecycle and index maintenance
//!
//! The classifier owns the property trie every top-level class is routed
//! through, a directory of every registered class (derived classes
//! included) and the bounded class cache. It is always held in an `Arc`;
//! the class tree factory it registers with the storage keeps a weak
//! reference back to it.
//!
//! # Locking
//!
//! `admin` serializes class definition, class removal and bulk builds.
//! Trie and directory use their own read/write locks, so classification
//! and index maintenance never wait on `admin`.

use crate::actions::{fire_actions, ActionKind, ClassActions};
use crate::cache::ClassCache;
use crate::class::{owner_properties, read_descriptor, read_owner, Class, ClassInfo, ClassSpec};
use crate::config::ClassifierConfig;
use crate::index_tree::{ClassIndexTree, ClassTreeFactory};
use crate::maintain::{self, IndexOp};
use crate::registry::{ClassRef, NotifyMask};
use crate::result::ClassResult;
use crate::trie::PropertyTrie;
use parking_lot::{Mutex, RwLock};
use pinstore_core::{ClassId, Error, EvalContext, IndexSeg, Pin, PinId, PinRef, PropertyId, Result};
use pinstore_storage::{IndexTree, Storage, Txn};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Predicate classification and index-maintenance engine
pub struct Classifier {
    me: Weak<Classifier>,
    storage: Arc<Storage>,
    config: ClassifierConfig,
    trie: RwLock<PropertyTrie>,
    directory: RwLock<BTreeMap<ClassId, Arc<ClassRef>>>,
    cache: ClassCache,
    pub(crate) admin: Mutex<()>,
    next_cid: AtomicU32,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("classes", &self.directory.read().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl Classifier {
    /// Create a classifier with no classes
    pub fn new(storage: Arc<Storage>, config: ClassifierConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let classifier = Arc::new_cyclic(|me: &Weak<Classifier>| Classifier {
            me: me.clone(),
            cache: ClassCache::new(config.class_cache_capacity),
            storage,
            config,
            trie: RwLock::new(PropertyTrie::new()),
            directory: RwLock::new(BTreeMap::new()),
            admin: Mutex::new(()),
            next_cid: AtomicU32::new(1),
        });
        classifier
            .storage
            .trees()
            .register_factory(Arc::new(ClassTreeFactory::new(Arc::downgrade(&classifier))));
        Ok(classifier)
    }

    /// Create a classifier and register every class persisted in `storage`
    ///
    /// A class whose definition cannot be decoded is skipped with a
    /// warning; the others load normally.
    pub fn open(storage: Arc<Storage>, config: ClassifierConfig) -> Result<Arc<Self>> {
        let classifier = Self::new(storage, config)?;
        classifier.load();
        Ok(classifier)
    }

    fn load(&self) {
        let owners = self
            .storage
            .pins()
            .with_properties(&[PropertyId::CLASS_SPEC])
            .unwrap_or_default();
        let mut defined = Vec::new();
        let mut max_cid = 0u32;
        for id in owners {
            let Some(pin) = self.storage.pins().get(id) else {
                continue;
            };
            if let Some(raw) = pin.get(PropertyId::CLASS_ID).and_then(|v| v.as_int()) {
                max_cid = max_cid.max(raw.clamp(0, u32::MAX as i64) as u32);
            }
            match read_owner(&pin) {
                Some(Ok((cid, spec))) => defined.push((cid, pin.id(), spec)),
                Some(Err(e)) => {
                    warn!(target: "pinstore::classify", pin = %id, error = %e, "skipping undecodable class")
                }
                None => {}
            }
        }
        // bases always have smaller ids than the classes derived from them
        defined.sort_by_key(|(cid, _, _)| *cid);
        let mut loaded = 0usize;
        for (cid, owner, spec) in defined {
            let class_ref = new_class_ref(cid, owner, &spec);
            match self.register(&class_ref, spec.base) {
                Ok(()) => {
                    class_ref.set_materialized(true);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(target: "pinstore::classify", cid = %cid, error = %e, "skipping class")
                }
            }
        }
        self.next_cid.fetch_max(max_cid.saturating_add(1), Ordering::SeqCst);
        info!(target: "pinstore::classify", classes = loaded, "classes loaded");
    }

    /// Storage the classifier indexes
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Configuration
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn register(&self, class_ref: &Arc<ClassRef>, base: Option<ClassId>) -> Result<()> {
        let dnf = class_ref.condition().property_dnf();
        match base {
            Some(b) => {
                let base_ref = self.class_ref(b)?;
                base_ref.add_derived(class_ref, &dnf);
            }
            None => self.trie.write().add(class_ref, &dnf),
        }
        self.directory
            .write()
            .insert(class_ref.cid(), Arc::clone(class_ref));
        Ok(())
    }

    fn unregister(&self, cid: ClassId, base: Option<ClassId>) -> Option<Arc<ClassRef>> {
        let class_ref = self.directory.write().remove(&cid)?;
        let dnf = class_ref.condition().property_dnf();
        let base_ref = base.and_then(|b| self.directory.read().get(&b).cloned());
        match base_ref {
            Some(b) => b.remove_derived(cid, &dnf),
            None => {
                self.trie.write().remove(cid, &dnf);
            }
        }
        self.cache.remove(cid);
        Some(class_ref)
    }

    fn class_ref(&self, cid: ClassId) -> Result<Arc<ClassRef>> {
        self.directory
            .read()
            .get(&cid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("class {}", cid)))
    }

    /// Ids of every registered class
    pub fn class_ids(&self) -> Vec<ClassId> {
        self.directory.read().keys().copied().collect()
    }

    /// Define a class and build its index over the existing pins
    ///
    /// The class is visible to classification immediately and reported
    /// materialized once `txn` commits. Rolling `txn` back unregisters it.
    pub fn define_class(&self, spec: ClassSpec, txn: &Txn) -> Result<ClassId> {
        spec.validate()?;
        let _admin = self.admin.lock();
        if let Some(base) = spec.base {
            self.class_ref(base)?;
        }
        let cid = ClassId(self.next_cid.fetch_add(1, Ordering::SeqCst));
        let owner = self
            .storage
            .pins()
            .create(owner_properties(cid, &spec)?, txn)?;
        let class_ref = new_class_ref(cid, owner.id(), &spec);
        let base = spec.base;
        self.register(&class_ref, base)?;
        let me = self.me.clone();
        txn.on_rollback(move || {
            if let Some(classifier) = me.upgrade() {
                classifier.unregister(cid, base);
            }
        })?;

        let class = self.attach(class_ref, spec, None)?;
        if class.spec().is_indexed() {
            let stats = self.build_locked(&[Arc::clone(&class)], false, txn)?;
            debug!(target: "pinstore::classify", cid = %cid, entries = stats.entries, "initial build");
        } else {
            let class_ref = Arc::clone(class.class_ref());
            txn.on_commit(move || class_ref.set_materialized(true));
        }
        info!(target: "pinstore::classify", cid = %cid, name = ?class.spec().name, "class defined");
        Ok(cid)
    }

    /// Remove a class, its index and its defining pin
    ///
    /// Fails while other classes are derived from it.
    pub fn drop_class(&self, cid: ClassId, txn: &Txn) -> Result<()> {
        let _admin = self.admin.lock();
        let class = self.get_class(cid)?;
        if class.class_ref().has_derived() {
            return Err(Error::invalid(format!("class {} has derived classes", cid)));
        }
        if let Some(tree) = class.tree() {
            tree.destroy(txn)?;
        } else if class.spec().is_indexed() {
            let map = self.storage.class_map();
            let key = cid.to_key();
            for value in self.storage.trees().values(map, &key) {
                self.storage.trees().remove(map, &key, &value, txn)?;
            }
        }
        let base = class.spec().base;
        if let Some(class_ref) = self.unregister(cid, base) {
            let me = self.me.clone();
            txn.on_rollback(move || {
                if let Some(classifier) = me.upgrade() {
                    if let Err(e) = classifier.register(&class_ref, base) {
                        warn!(target: "pinstore::classify", cid = %cid, error = %e, "could not restore class");
                    }
                }
            })?;
        }
        self.storage.pins().delete(class.owner(), txn)?;
        info!(target: "pinstore::classify", cid = %cid, "class dropped");
        Ok(())
    }

    // ========================================================================
    // Class loading
    // ========================================================================

    fn attach(
        &self,
        class_ref: Arc<ClassRef>,
        spec: ClassSpec,
        desc: Option<crate::class::IndexDescriptor>,
    ) -> Result<Arc<Class>> {
        let cid = class_ref.cid();
        let tree = if spec.is_family() {
            let format = IndexSeg::encode_format(&spec.segs);
            let state = class_ref.tree_state(|| desc);
            let tree = ClassIndexTree::open_shared(cid, class_ref.owner(), format, &self.storage, state)?;
            Some(Arc::new(tree))
        } else {
            None
        };
        Ok(self.cache.insert(Arc::new(Class::new(class_ref, spec, tree))))
    }

    /// Load a class
    ///
    /// Served from the cache when possible, otherwise decoded from the
    /// class's defining pin. A damaged definition or index descriptor is
    /// reported as `Corruption` for this class only.
    pub fn get_class(&self, cid: ClassId) -> Result<Arc<Class>> {
        if let Some(class) = self.cache.get(cid) {
            return Ok(class);
        }
        let class_ref = self.class_ref(cid)?;
        let corrupt = |reason: &str| Error::Corruption {
            cid,
            reason: reason.to_string(),
        };
        let owner = self
            .storage
            .pins()
            .get(class_ref.owner())
            .ok_or_else(|| corrupt("defining pin is missing"))?;
        let (stored, spec) = read_owner(&owner).ok_or_else(|| corrupt("defining pin carries no class"))??;
        if stored != cid {
            return Err(corrupt("defining pin names another class"));
        }
        let desc = read_descriptor(cid, &owner)?;
        debug!(target: "pinstore::cache", cid = %cid, "class loaded");
        self.attach(class_ref, spec, desc)
    }

    /// Class handle plus approximate cardinality
    pub fn get_class_info(&self, cid: ClassId) -> Result<ClassInfo> {
        let class = self.get_class(cid)?;
        let cardinality = match class.tree() {
            Some(tree) => self.storage.trees().count(&**tree as &dyn IndexTree),
            None if class.spec().is_indexed() => self
                .storage
                .trees()
                .key_count(self.storage.class_map(), &cid.to_key()),
            None => 0,
        };
        Ok(ClassInfo {
            materialized: class.class_ref().is_materialized(),
            class,
            cardinality,
        })
    }

    /// Pins currently indexed under a membership-only class
    pub fn members(&self, cid: ClassId) -> Result<Vec<PinId>> {
        let class = self.get_class(cid)?;
        if class.spec().is_family() || !class.spec().is_indexed() {
            return Err(Error::invalid(format!("class {} keeps no membership list", cid)));
        }
        self.storage
            .trees()
            .values(self.storage.class_map(), &cid.to_key())
            .iter()
            .map(|v| PinRef::decode_exact(maintain::member_ref(&class, v)).map(|r| r.id))
            .collect()
    }

    // ========================================================================
    // Classification
    // ========================================================================

    /// Classes `pin` belongs to
    pub fn classify(&self, pin: &Pin) -> ClassResult {
        self.classify_with(pin, None)
    }

    /// Classes `pin` belongs to, reading properties a partial `pin` lacks
    /// from `persisted`
    ///
    /// Pins that define classes are never members of any class.
    pub fn classify_with(&self, pin: &Pin, persisted: Option<&Pin>) -> ClassResult {
        let mut result = ClassResult::new();
        let ctx = EvalContext::with_persisted(pin, persisted);
        if ctx.get(PropertyId::CLASS_SPEC).is_some() {
            return result;
        }
        let mut props: Vec<PropertyId> = pin.property_ids().collect();
        if pin.is_partial() {
            if let Some(p) = persisted {
                props.extend(p.property_ids());
                props.sort();
                props.dedup();
            }
        }
        let mut rejected = FxHashSet::default();
        let trie = self.trie.read();
        classify_into(&trie, &props, &ctx, &mut result, &mut rejected);
        result
    }

    // ========================================================================
    // Index maintenance
    // ========================================================================

    /// Insert or delete `pin`'s entries in every indexed class of `result`
    pub fn index(&self, op: IndexOp, pin: &Pin, result: &ClassResult, txn: &Txn) -> Result<()> {
        if result.index_count() == 0 {
            return Ok(());
        }
        for class_ref in result.iter().filter(|c| c.is_indexed()) {
            let class = self.get_class(class_ref.cid())?;
            match op {
                IndexOp::Insert => maintain::apply(&self.storage, &class, None, Some(pin), None, txn)?,
                IndexOp::Delete => maintain::apply(&self.storage, &class, Some(pin), None, None, txn)?,
            }
        }
        Ok(())
    }

    /// Move `pin`'s entries from its old state to its new state
    ///
    /// `old_result` and `new_result` classify `old` and `new`. Classes in
    /// only one of them gain or lose the pin; classes in both get the
    /// phase-wise update. `new` may be a partial projection of changed
    /// properties over `old`; it reads through to `old` in every class,
    /// including those it just entered.
    pub fn update_index(
        &self,
        old: &Pin,
        new: &Pin,
        old_result: &ClassResult,
        new_result: &ClassResult,
        txn: &Txn,
    ) -> Result<()> {
        let mut cids: Vec<ClassId> = old_result
            .iter()
            .chain(new_result.iter())
            .filter(|c| c.is_indexed())
            .map(|c| c.cid())
            .collect();
        cids.sort();
        cids.dedup();
        for cid in cids {
            let class = self.get_class(cid)?;
            let before = old_result.contains(cid).then_some(old);
            let after = new_result.contains(cid).then_some(new);
            maintain::apply(&self.storage, &class, before, after, Some(old), txn)?;
        }
        Ok(())
    }

    /// Classify and index a newly written pin, then run enter hooks
    pub fn pin_inserted(&self, pin: &Pin, txn: &Txn) -> Result<ClassResult> {
        let result = self.classify(pin);
        self.index(IndexOp::Insert, pin, &result, txn)?;
        fire_actions(ActionKind::Enter, pin, &result, txn)?;
        Ok(result)
    }

    /// Reclassify a changed pin, update its entries and run hooks
    ///
    /// Enter hooks run for classes the pin joined, update hooks for
    /// classes it stayed in and leave hooks for classes it left.
    pub fn pin_updated(&self, old: &Pin, new: &Pin, txn: &Txn) -> Result<ClassResult> {
        let old_result = self.classify(old);
        let new_result = self.classify_with(new, Some(old));
        self.update_index(old, new, &old_result, &new_result, txn)?;
        if old_result.action_count() + new_result.action_count() > 0 {
            let mut entered = ClassResult::new();
            let mut stayed = ClassResult::new();
            let mut left = ClassResult::new();
            for c in new_result.iter() {
                if old_result.contains(c.cid()) {
                    stayed.insert(c);
                } else {
                    entered.insert(c);
                }
            }
            for c in old_result.iter().filter(|c| !new_result.contains(c.cid())) {
                left.insert(c);
            }
            fire_actions(ActionKind::Enter, new, &entered, txn)?;
            fire_actions(ActionKind::Update, new, &stayed, txn)?;
            fire_actions(ActionKind::Leave, old, &left, txn)?;
        }
        Ok(new_result)
    }

    /// Remove a deleted pin's entries, then run leave hooks
    pub fn pin_deleted(&self, pin: &Pin, txn: &Txn) -> Result<ClassResult> {
        let result = self.classify(pin);
        self.index(IndexOp::Delete, pin, &result, txn)?;
        fire_actions(ActionKind::Leave, pin, &result, txn)?;
        Ok(result)
    }

    // ========================================================================
    // Notifications and hooks
    // ========================================================================

    /// Add notification bits to a class
    pub fn enable(&self, cid: ClassId, mask: NotifyMask) -> Result<()> {
        self.class_ref(cid)?.enable(mask);
        Ok(())
    }

    /// Clear notification bits of a class
    pub fn disable(&self, cid: ClassId, mask: NotifyMask) -> Result<()> {
        self.class_ref(cid)?.disable(mask);
        Ok(())
    }

    /// Notification bits of every top-level class
    pub fn notify_mask(&self) -> NotifyMask {
        self.trie.read().notify_mask()
    }

    /// Install or clear a class's action hooks
    pub fn set_actions(&self, cid: ClassId, actions: Option<ClassActions>) -> Result<()> {
        self.class_ref(cid)?.set_actions(actions);
        Ok(())
    }

    /// Run the `kind` hooks of `result`'s classes for `pin`
    pub fn fire_actions(
        &self,
        kind: ActionKind,
        pin: &Pin,
        result: &ClassResult,
        txn: &Txn,
    ) -> Result<()> {
        fire_actions(kind, pin, result, txn)
    }
}

fn new_class_ref(cid: ClassId, owner: PinId, spec: &ClassSpec) -> Arc<ClassRef> {
    Arc::new(ClassRef::new(
        cid,
        owner,
        Arc::new(spec.cond.clone()),
        spec.flags,
        spec.segs.len() as u16,
    ))
}

/// Evaluate every candidate reachable through `props`, recursing into the
/// derived classes of each match
fn classify_into(
    trie: &PropertyTrie,
    props: &[PropertyId],
    ctx: &EvalContext<'_>,
    result: &mut ClassResult,
    rejected: &mut FxHashSet<ClassId>,
) {
    let mut matched = Vec::new();
    trie.for_each_candidate(props, |class| {
        let cid = class.cid();
        if result.contains(cid) || rejected.contains(&cid) {
            return;
        }
        if class.matches(ctx) {
            result.insert(class);
            matched.push(Arc::clone(class));
        } else {
            rejected.insert(cid);
        }
    });
    for class in matched {
        if let Some(sub) = class.derived().as_ref() {
            classify_into(sub, props, ctx, result, rejected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Window;
    use pinstore_core::{Condition, SearchKey, Value, ValueType};
    use std::sync::atomic::AtomicUsize;

    const COLOR: PropertyId = PropertyId(300);
    const SIZE: PropertyId = PropertyId(301);
    const SHAPE: PropertyId = PropertyId(302);

    fn setup() -> (Arc<Storage>, Arc<Classifier>) {
        let storage = Storage::in_memory();
        let classifier = Classifier::new(storage.clone(), ClassifierConfig::default()).unwrap();
        (storage, classifier)
    }

    fn red() -> Condition {
        Condition::Eq(COLOR, "red".into())
    }

    #[test]
    fn test_define_and_classify() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let a = classifier.define_class(ClassSpec::new(red()), &txn).unwrap();
        let b = classifier
            .define_class(ClassSpec::new(Condition::Exists(SIZE)), &txn)
            .unwrap();
        txn.commit().unwrap();

        let txn = storage.begin();
        let pin = storage
            .pins()
            .create([(COLOR, Value::from("red")), (SIZE, Value::Int(3))], &txn)
            .unwrap();
        assert_eq!(classifier.classify(&pin).ids(), vec![a, b]);
        let blue = storage
            .pins()
            .create([(COLOR, Value::from("blue"))], &txn)
            .unwrap();
        assert!(classifier.classify(&blue).is_empty());
    }

    #[test]
    fn test_class_pins_are_not_classified() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let cid = classifier
            .define_class(ClassSpec::new(Condition::True), &txn)
            .unwrap();
        let class = classifier.get_class(cid).unwrap();
        let owner = storage.pins().get(class.owner()).unwrap();
        assert!(classifier.classify(&owner).is_empty());
    }

    #[test]
    fn test_rollback_unregisters_class() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        classifier.define_class(ClassSpec::new(red()), &txn).unwrap();
        assert_eq!(classifier.class_ids().len(), 1);
        txn.rollback();
        assert!(classifier.class_ids().is_empty());
        assert!(storage.pins().is_empty());
    }

    #[test]
    fn test_materialized_on_commit() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let cid = classifier
            .define_class(
                ClassSpec::new(red()).with_segment(IndexSeg::new(SIZE, ValueType::Int)),
                &txn,
            )
            .unwrap();
        assert!(!classifier.get_class_info(cid).unwrap().materialized);
        txn.commit().unwrap();
        assert!(classifier.get_class_info(cid).unwrap().materialized);
    }

    #[test]
    fn test_partial_pin_uses_persisted_properties() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let cid = classifier
            .define_class(
                ClassSpec::new(Condition::and([red(), Condition::Gt(SIZE, Value::Int(2))])),
                &txn,
            )
            .unwrap();
        let pin = storage
            .pins()
            .create([(COLOR, Value::from("red")), (SIZE, Value::Int(1))], &txn)
            .unwrap();
        let changed = pin.clone().with(SIZE, 5).project(&[SIZE]);
        assert!(classifier.classify(&changed).is_empty());
        assert_eq!(classifier.classify_with(&changed, Some(&pin)).ids(), vec![cid]);
    }

    #[test]
    fn test_derived_classes_need_their_base() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let base = classifier.define_class(ClassSpec::new(red()), &txn).unwrap();
        let derived = classifier
            .define_class(
                ClassSpec::new(Condition::Eq(SHAPE, "round".into())).derived_from(base),
                &txn,
            )
            .unwrap();
        let loose = classifier
            .define_class(ClassSpec::new(Condition::Eq(SHAPE, "round".into())), &txn)
            .unwrap();

        let pin = |color: &str| {
            storage
                .pins()
                .create([(COLOR, Value::from(color)), (SHAPE, Value::from("round"))], &txn)
                .unwrap()
        };
        assert_eq!(classifier.classify(&pin("red")).ids(), vec![base, derived, loose]);
        assert_eq!(classifier.classify(&pin("blue")).ids(), vec![loose]);

        let err = classifier.drop_class(base, &txn).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        classifier.drop_class(derived, &txn).unwrap();
        classifier.drop_class(base, &txn).unwrap();
        assert_eq!(classifier.classify(&pin("red")).ids(), vec![loose]);
    }

    #[test]
    fn test_scenario_red_size_update() {
        let (storage, classifier) = setup();
        let seg = IndexSeg::new(SIZE, ValueType::Int);
        let txn = storage.begin();
        let a = classifier
            .define_class(ClassSpec::new(red()).with_segment(seg), &txn)
            .unwrap();
        let pin = storage
            .pins()
            .create([(COLOR, Value::from("red")), (SIZE, Value::Int(3))], &txn)
            .unwrap();
        let result = classifier.classify(&pin);
        assert_eq!(result.ids(), vec![a]);
        classifier.index(IndexOp::Insert, &pin, &result, &txn).unwrap();

        let class = classifier.get_class(a).unwrap();
        let tree = class.tree().unwrap();
        let key = |v: i64| {
            SearchKey::single(&seg, &Value::Int(v))
                .unwrap()
                .unwrap()
                .as_bytes()
                .to_vec()
        };
        assert_eq!(storage.trees().values(&**tree, &key(3)), vec![pin.to_ref().encode()]);

        let updated = pin.clone().with(SIZE, 5);
        storage.pins().put(updated.clone(), &txn).unwrap();
        let new_result = classifier.classify(&updated);
        classifier
            .update_index(&pin, &updated, &result, &new_result, &txn)
            .unwrap();
        assert!(storage.trees().values(&**tree, &key(3)).is_empty());
        assert_eq!(storage.trees().values(&**tree, &key(5)), vec![pin.to_ref().encode()]);
        txn.commit().unwrap();
        assert_eq!(classifier.get_class_info(a).unwrap().cardinality, 1);
    }

    #[test]
    fn test_membership_follows_updates() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let cid = classifier
            .define_class(ClassSpec::new(red()).indexed(), &txn)
            .unwrap();
        let pin = storage
            .pins()
            .create([(COLOR, Value::from("red"))], &txn)
            .unwrap();
        classifier.pin_inserted(&pin, &txn).unwrap();
        assert_eq!(classifier.members(cid).unwrap(), vec![pin.id()]);

        let blue = pin.clone().with(COLOR, "blue");
        classifier.pin_updated(&pin, &blue, &txn).unwrap();
        assert!(classifier.members(cid).unwrap().is_empty());

        classifier.pin_updated(&blue, &pin, &txn).unwrap();
        classifier.pin_deleted(&pin, &txn).unwrap();
        assert!(classifier.members(cid).unwrap().is_empty());
    }

    #[test]
    fn test_hooks_follow_membership_changes() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let cid = classifier.define_class(ClassSpec::new(red()), &txn).unwrap();
        let counts = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);
        let hook = |i: usize| {
            let counts = counts.clone();
            Arc::new(move |_: ClassId, _: &Pin, _: &Txn| -> Result<()> {
                counts[i].fetch_add(1, Ordering::SeqCst);
                Ok(())
            }) as Arc<dyn crate::actions::ClassAction>
        };
        classifier
            .set_actions(
                cid,
                Some(ClassActions {
                    on_enter: vec![hook(0)],
                    on_update: vec![hook(1)],
                    on_leave: vec![hook(2)],
                }),
            )
            .unwrap();

        let pin = storage
            .pins()
            .create([(COLOR, Value::from("red"))], &txn)
            .unwrap();
        classifier.pin_inserted(&pin, &txn).unwrap();
        let sized = pin.clone().with(SIZE, 2);
        classifier.pin_updated(&pin, &sized, &txn).unwrap();
        let blue = sized.clone().with(COLOR, "blue");
        classifier.pin_updated(&sized, &blue, &txn).unwrap();

        let seen: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(seen, vec![1, 1, 1]);
    }

    #[test]
    fn test_enable_disable() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let cid = classifier.define_class(ClassSpec::new(red()), &txn).unwrap();
        classifier.enable(cid, NotifyMask::ENTER.union(NotifyMask::LEAVE)).unwrap();
        classifier.disable(cid, NotifyMask::LEAVE).unwrap();
        assert_eq!(classifier.notify_mask(), NotifyMask::ENTER);

        let pin = storage
            .pins()
            .create([(COLOR, Value::from("red"))], &txn)
            .unwrap();
        assert_eq!(classifier.classify(&pin).notify_mask(), NotifyMask::ENTER);
        assert!(classifier.enable(ClassId(999), NotifyMask::ALL).unwrap_err().is_not_found());
    }

    #[test]
    fn test_open_reloads_classes() {
        let (storage, classifier) = setup();
        let txn = storage.begin();
        let a = classifier
            .define_class(
                ClassSpec::new(red()).with_segment(IndexSeg::new(SIZE, ValueType::Int)),
                &txn,
            )
            .unwrap();
        let b = classifier
            .define_class(ClassSpec::new(red()).indexed().with_window(Window::Count(4)), &txn)
            .unwrap();
        let pin = storage
            .pins()
            .create([(COLOR, Value::from("red")), (SIZE, Value::Int(1))], &txn)
            .unwrap();
        classifier.pin_inserted(&pin, &txn).unwrap();
        txn.commit().unwrap();
        drop(classifier);

        let reopened = Classifier::open(storage.clone(), ClassifierConfig::default()).unwrap();
        assert_eq!(reopened.class_ids(), vec![a, b]);
        assert_eq!(reopened.classify(&pin).ids(), vec![a, b]);
        assert_eq!(reopened.get_class_info(a).unwrap().cardinality, 1);
        assert_eq!(reopened.members(b).unwrap(), vec![pin.id()]);

        let txn = storage.begin();
        let c = reopened.define_class(ClassSpec::new(red()), &txn).unwrap();
        assert!(c > b);
    }
}
