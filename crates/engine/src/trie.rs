//! Property-set trie routing pins to candidate classes
//!
//! Each class contributes the clauses of its condition's property DNF. A
//! clause is a sorted list of property ids; the trie stores one path per
//! clause and keeps the class in the leaf at the end of the path. A class
//! is a candidate for a pin when the path of one of its clauses consists
//! only of properties the pin carries.
//!
//! # Layout
//!
//! Nodes live in an arena (`Vec<Node>`) addressed by `NodeId`. Node 0 is
//! the root; its leaf is the "other" bucket holding classes with an empty
//! clause, which are candidates for every pin. Children are kept sorted by
//! property id in a `SmallVec`, leaves are sorted by class id. A class
//! with `N` clauses appears in up to `N` leaves as clones of one
//! `Arc<ClassRef>`; the last clone dropped frees it.

use crate::registry::{ClassRef, NotifyMask};
use pinstore_core::{ClassId, PropertyId};
use smallvec::SmallVec;
use std::sync::Arc;

type NodeId = u32;

const ROOT: NodeId = 0;

#[derive(Debug, Default)]
struct Node {
    children: SmallVec<[(PropertyId, NodeId); 4]>,
    leaf: Vec<Arc<ClassRef>>,
}

impl Node {
    fn child(&self, prop: PropertyId) -> Option<NodeId> {
        self.children
            .binary_search_by_key(&prop, |(p, _)| *p)
            .ok()
            .map(|i| self.children[i].1)
    }

    fn is_vacant(&self) -> bool {
        self.children.is_empty() && self.leaf.is_empty()
    }
}

/// Trie over sorted property-id sets
#[derive(Debug)]
pub struct PropertyTrie {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    entries: usize,
}

impl Default for PropertyTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyTrie {
    /// Create an empty trie
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            free: Vec::new(),
            entries: 0,
        }
    }

    /// Number of (leaf, class) entries
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Check if no class is registered
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Classes with an empty clause; candidates for every pin
    pub fn other(&self) -> &[Arc<ClassRef>] {
        &self.nodes[ROOT as usize].leaf
    }

    fn alloc(&mut self) -> NodeId {
        match self.free.pop() {
            Some(id) => id,
            None => {
                self.nodes.push(Node::default());
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id as usize]
    }

    /// Register `class` under every clause of `dnf`
    ///
    /// Clauses must be sorted. If the class is already present in a leaf,
    /// its notification mask is merged instead.
    pub fn add(&mut self, class: &Arc<ClassRef>, dnf: &[Vec<PropertyId>]) {
        for clause in dnf {
            let mut cur = ROOT;
            for &prop in clause {
                cur = match self.node(cur).child(prop) {
                    Some(next) => next,
                    None => {
                        let next = self.alloc();
                        let children = &mut self.node_mut(cur).children;
                        let at = children
                            .binary_search_by_key(&prop, |(p, _)| *p)
                            .unwrap_or_else(|i| i);
                        children.insert(at, (prop, next));
                        next
                    }
                };
            }
            let leaf = &mut self.node_mut(cur).leaf;
            match leaf.binary_search_by_key(&class.cid(), |c| c.cid()) {
                Ok(i) => leaf[i].enable(class.notify_mask()),
                Err(i) => {
                    leaf.insert(i, Arc::clone(class));
                    self.entries += 1;
                }
            }
        }
    }

    /// Leaf reached by exactly `clause`
    pub fn find(&self, clause: &[PropertyId]) -> Option<&[Arc<ClassRef>]> {
        let mut cur = ROOT;
        for &prop in clause {
            cur = self.node(cur).child(prop)?;
        }
        Some(&self.node(cur).leaf)
    }

    /// Find `cid` in the leaf of `clause`
    pub fn find_class(&self, cid: ClassId, clause: &[PropertyId]) -> Option<&Arc<ClassRef>> {
        let leaf = self.find(clause)?;
        leaf.binary_search_by_key(&cid, |c| c.cid())
            .ok()
            .map(|i| &leaf[i])
    }

    /// Remove `cid` from the leaf of every clause in `dnf`
    ///
    /// Nodes left with no children and an empty leaf are recycled. Returns
    /// the number of leaves the class was removed from.
    pub fn remove(&mut self, cid: ClassId, dnf: &[Vec<PropertyId>]) -> usize {
        let mut removed = 0;
        for clause in dnf {
            if self.remove_clause(cid, clause) {
                removed += 1;
            }
        }
        removed
    }

    fn remove_clause(&mut self, cid: ClassId, clause: &[PropertyId]) -> bool {
        let mut path: SmallVec<[NodeId; 8]> = SmallVec::new();
        let mut cur = ROOT;
        for &prop in clause {
            path.push(cur);
            cur = match self.node(cur).child(prop) {
                Some(next) => next,
                None => return false,
            };
        }
        let leaf = &mut self.node_mut(cur).leaf;
        let Ok(i) = leaf.binary_search_by_key(&cid, |c| c.cid()) else {
            return false;
        };
        leaf.remove(i);
        self.entries -= 1;

        // Prune the now-empty tail of the path
        for (depth, parent) in path.iter().enumerate().rev() {
            if cur == ROOT || !self.node(cur).is_vacant() {
                break;
            }
            let prop = clause[depth];
            let children = &mut self.node_mut(*parent).children;
            if let Ok(at) = children.binary_search_by_key(&prop, |(p, _)| *p) {
                children.remove(at);
            }
            self.free.push(cur);
            cur = *parent;
        }
        true
    }

    /// Visit every class whose clause is a subset of `props`
    ///
    /// `props` must be sorted. A class registered under several matching
    /// clauses is visited once per clause.
    pub fn for_each_candidate(&self, props: &[PropertyId], mut f: impl FnMut(&Arc<ClassRef>)) {
        self.visit(ROOT, props, &mut f);
    }

    fn visit(&self, id: NodeId, props: &[PropertyId], f: &mut impl FnMut(&Arc<ClassRef>)) {
        let node = self.node(id);
        for class in &node.leaf {
            f(class);
        }
        if node.children.is_empty() {
            return;
        }
        // Walk whichever side is smaller and probe the other
        if node.children.len() < props.len() {
            for &(prop, child) in &node.children {
                if let Ok(i) = props.binary_search(&prop) {
                    self.visit(child, &props[i + 1..], f);
                }
            }
        } else {
            for (i, &prop) in props.iter().enumerate() {
                if let Some(child) = node.child(prop) {
                    self.visit(child, &props[i + 1..], f);
                }
            }
        }
    }

    /// Merged notification mask of every registered class
    pub fn notify_mask(&self) -> NotifyMask {
        let mut mask = NotifyMask::NONE;
        for node in &self.nodes {
            for class in &node.leaf {
                mask = mask.union(class.notify_mask());
            }
        }
        mask
    }
}
