//! Class predicates
//!
//! A `Condition` is the boolean predicate a class is defined by. The
//! classifier needs two things from it:
//!
//! - `evaluate`: test a pin (and optionally its persisted counterpart)
//! - `property_dnf`: the property-inclusion clauses of its disjunctive
//!   normal form, used to route pins to candidate classes
//!
//! ## DNF Clauses
//!
//! Each clause is a sorted, duplicate-free list of properties that must all
//! be present for the clause to be satisfiable. A predicate is routed to a
//! pin only when some clause is a subset of the pin's properties, so every
//! clause must be a *necessary* condition of one disjunct. Negations and
//! `Ne` guarantee nothing about presence and contribute an empty clause,
//! which the trie stores in its "other" bucket (always evaluated).

use crate::pin::Pin;
use crate::types::PropertyId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Clauses with more disjuncts than this collapse into one empty clause
const MAX_DNF_CLAUSES: usize = 64;

/// Boolean predicate over pin properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Always true
    True,
    /// Property is present
    Exists(PropertyId),
    /// Property (or one of its elements) equals the value
    Eq(PropertyId, Value),
    /// Property is absent or differs from the value
    Ne(PropertyId, Value),
    /// Property (or one of its elements) is less than the value
    Lt(PropertyId, Value),
    /// Less than or equal
    Le(PropertyId, Value),
    /// Greater than
    Gt(PropertyId, Value),
    /// Greater than or equal
    Ge(PropertyId, Value),
    /// Property (or one of its elements) equals one of the values
    In(PropertyId, Vec<Value>),
    /// All sub-conditions hold
    And(Vec<Condition>),
    /// At least one sub-condition holds
    Or(Vec<Condition>),
    /// Sub-condition does not hold
    Not(Box<Condition>),
}

/// Bindings a condition is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Pin being classified
    pub pin: &'a Pin,
    /// Persisted version of the pin, when the pin is a partial projection
    pub persisted: Option<&'a Pin>,
}

impl<'a> EvalContext<'a> {
    /// Context for a standalone pin
    pub fn new(pin: &'a Pin) -> Self {
        Self {
            pin,
            persisted: None,
        }
    }

    /// Context with a persisted counterpart
    pub fn with_persisted(pin: &'a Pin, persisted: Option<&'a Pin>) -> Self {
        Self { pin, persisted }
    }

    /// Property lookup, falling back to the persisted pin for projections
    pub fn get(&self, prop: PropertyId) -> Option<&'a Value> {
        match self.pin.get(prop) {
            Some(v) => Some(v),
            None if self.pin.is_partial() => self.persisted.and_then(|p| p.get(prop)),
            None => None,
        }
    }
}

fn any_element(v: Option<&Value>, mut f: impl FnMut(&Value) -> bool) -> bool {
    v.map(|v| v.elements().into_iter().any(|e| f(e)))
        .unwrap_or(false)
}

fn cmp_is(v: Option<&Value>, rhs: &Value, ok: impl Fn(Ordering) -> bool) -> bool {
    any_element(v, |e| e.compare(rhs).map(&ok).unwrap_or(false))
}

impl Condition {
    /// Conjunction helper
    pub fn and(conds: impl IntoIterator<Item = Condition>) -> Condition {
        Condition::And(conds.into_iter().collect())
    }

    /// Disjunction helper
    pub fn or(conds: impl IntoIterator<Item = Condition>) -> Condition {
        Condition::Or(conds.into_iter().collect())
    }

    /// Evaluate against a pin
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Condition::True => true,
            Condition::Exists(p) => ctx.get(*p).is_some(),
            Condition::Eq(p, v) => any_element(ctx.get(*p), |e| e == v),
            Condition::Ne(p, v) => !any_element(ctx.get(*p), |e| e == v),
            Condition::Lt(p, v) => cmp_is(ctx.get(*p), v, |o| o == Ordering::Less),
            Condition::Le(p, v) => cmp_is(ctx.get(*p), v, |o| o != Ordering::Greater),
            Condition::Gt(p, v) => cmp_is(ctx.get(*p), v, |o| o == Ordering::Greater),
            Condition::Ge(p, v) => cmp_is(ctx.get(*p), v, |o| o != Ordering::Less),
            Condition::In(p, vs) => any_element(ctx.get(*p), |e| vs.contains(e)),
            Condition::And(cs) => cs.iter().all(|c| c.evaluate(ctx)),
            Condition::Or(cs) => cs.iter().any(|c| c.evaluate(ctx)),
            Condition::Not(c) => !c.evaluate(ctx),
        }
    }

    /// Property-inclusion clauses of the disjunctive normal form
    ///
    /// Always returns at least one clause. Clauses are sorted and
    /// deduplicated; a clause that is a superset of another is dropped
    /// because the smaller one already routes every pin it would.
    pub fn property_dnf(&self) -> Vec<Vec<PropertyId>> {
        let mut clauses = self.dnf();
        for c in &mut clauses {
            c.sort();
            c.dedup();
        }
        clauses.sort();
        clauses.dedup();
        let minimal: Vec<Vec<PropertyId>> = clauses
            .iter()
            .filter(|c| {
                !clauses
                    .iter()
                    .any(|o| o.len() < c.len() && o.iter().all(|p| c.binary_search(p).is_ok()))
            })
            .cloned()
            .collect();
        if minimal.is_empty() {
            vec![Vec::new()]
        } else {
            minimal
        }
    }

    /// Every property the condition reads, sorted and deduplicated
    pub fn properties(&self) -> Vec<PropertyId> {
        let mut out = Vec::new();
        self.collect_properties(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_properties(&self, out: &mut Vec<PropertyId>) {
        match self {
            Condition::True => {}
            Condition::Exists(p)
            | Condition::Eq(p, _)
            | Condition::Ne(p, _)
            | Condition::Lt(p, _)
            | Condition::Le(p, _)
            | Condition::Gt(p, _)
            | Condition::Ge(p, _)
            | Condition::In(p, _) => out.push(*p),
            Condition::And(cs) | Condition::Or(cs) => {
                for c in cs {
                    c.collect_properties(out);
                }
            }
            Condition::Not(c) => c.collect_properties(out),
        }
    }

    fn dnf(&self) -> Vec<Vec<PropertyId>> {
        match self {
            Condition::True | Condition::Ne(..) | Condition::Not(_) => vec![Vec::new()],
            Condition::Exists(p)
            | Condition::Eq(p, _)
            | Condition::Lt(p, _)
            | Condition::Le(p, _)
            | Condition::Gt(p, _)
            | Condition::Ge(p, _)
            | Condition::In(p, _) => vec![vec![*p]],
            Condition::Or(cs) => {
                if cs.is_empty() {
                    return vec![Vec::new()];
                }
                let mut out: Vec<Vec<PropertyId>> = cs.iter().flat_map(|c| c.dnf()).collect();
                if out.len() > MAX_DNF_CLAUSES {
                    out = vec![Vec::new()];
                }
                out
            }
            Condition::And(cs) => {
                let mut acc: Vec<Vec<PropertyId>> = vec![Vec::new()];
                for c in cs {
                    let sub = c.dnf();
                    let mut next = Vec::with_capacity(acc.len() * sub.len());
                    for a in &acc {
                        for s in &sub {
                            let mut merged = a.clone();
                            merged.extend_from_slice(s);
                            next.push(merged);
                        }
                    }
                    if next.len() > MAX_DNF_CLAUSES {
                        // Keep only properties common to every disjunct
                        let common: Vec<PropertyId> = next[0]
                            .iter()
                            .copied()
                            .filter(|p| next.iter().all(|n| n.contains(p)))
                            .collect();
                        next = vec![common];
                    }
                    acc = next;
                }
                acc
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PageId, PinAddr, PinId};

    const COLOR: PropertyId = PropertyId(300);
    const SIZE: PropertyId = PropertyId(301);
    const TAGS: PropertyId = PropertyId(302);

    fn pin() -> Pin {
        Pin::new(PinId(1), PinAddr::new(PageId(0), 0))
    }

    #[test]
    fn test_eq_and_exists() {
        let p = pin().with(COLOR, "red").with(SIZE, 3);
        let ctx = EvalContext::new(&p);
        assert!(Condition::Eq(COLOR, "red".into()).evaluate(&ctx));
        assert!(!Condition::Eq(COLOR, "blue".into()).evaluate(&ctx));
        assert!(Condition::Exists(SIZE).evaluate(&ctx));
        assert!(!Condition::Exists(TAGS).evaluate(&ctx));
        assert!(Condition::Ne(TAGS, "x".into()).evaluate(&ctx));
    }

    #[test]
    fn test_comparisons() {
        let p = pin().with(SIZE, 3);
        let ctx = EvalContext::new(&p);
        assert!(Condition::Lt(SIZE, 4.into()).evaluate(&ctx));
        assert!(Condition::Le(SIZE, 3.into()).evaluate(&ctx));
        assert!(!Condition::Gt(SIZE, 3.into()).evaluate(&ctx));
        assert!(Condition::Ge(SIZE, 2.5.into()).evaluate(&ctx));
        // incomparable types never match
        assert!(!Condition::Lt(SIZE, "9".into()).evaluate(&ctx));
    }

    #[test]
    fn test_collection_any_element() {
        let p = pin().with(TAGS, vec!["a", "b"]);
        let ctx = EvalContext::new(&p);
        assert!(Condition::Eq(TAGS, "b".into()).evaluate(&ctx));
        assert!(Condition::In(TAGS, vec!["z".into(), "a".into()]).evaluate(&ctx));
        assert!(!Condition::Eq(TAGS, "c".into()).evaluate(&ctx));
    }

    #[test]
    fn test_partial_pin_falls_back_to_persisted() {
        let full = pin().with(COLOR, "red").with(SIZE, 3);
        let partial = full.project(&[SIZE]);
        let cond = Condition::and([
            Condition::Eq(COLOR, "red".into()),
            Condition::Gt(SIZE, 1.into()),
        ]);
        assert!(!cond.evaluate(&EvalContext::new(&partial)));
        assert!(cond.evaluate(&EvalContext::with_persisted(&partial, Some(&full))));
    }

    #[test]
    fn test_properties_include_negated() {
        let c = Condition::and([
            Condition::Eq(SIZE, 1.into()),
            Condition::Not(Box::new(Condition::Exists(TAGS))),
            Condition::Ne(COLOR, "red".into()),
            Condition::Exists(SIZE),
        ]);
        assert_eq!(c.properties(), vec![COLOR, SIZE, TAGS]);
    }

    #[test]
    fn test_dnf_simple() {
        let c = Condition::and([
            Condition::Eq(SIZE, 1.into()),
            Condition::Eq(COLOR, "red".into()),
        ]);
        assert_eq!(c.property_dnf(), vec![vec![COLOR, SIZE]]);
    }

    #[test]
    fn test_dnf_or_distributes() {
        let c = Condition::and([
            Condition::Exists(COLOR),
            Condition::or([Condition::Exists(SIZE), Condition::Exists(TAGS)]),
        ]);
        assert_eq!(c.property_dnf(), vec![vec![COLOR, SIZE], vec![COLOR, TAGS]]);
    }

    #[test]
    fn test_dnf_negation_is_unrestricted() {
        let c = Condition::Not(Box::new(Condition::Exists(COLOR)));
        assert_eq!(c.property_dnf(), vec![Vec::<PropertyId>::new()]);
        let c = Condition::or([Condition::Exists(COLOR), Condition::True]);
        // the empty clause subsumes the other one
        assert_eq!(c.property_dnf(), vec![Vec::<PropertyId>::new()]);
    }

    #[test]
    fn test_dnf_drops_supersets() {
        let c = Condition::or([
            Condition::Exists(COLOR),
            Condition::and([Condition::Exists(COLOR), Condition::Exists(SIZE)]),
        ]);
        assert_eq!(c.property_dnf(), vec![vec![COLOR]]);
    }
}
