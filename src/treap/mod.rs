//! # Ordered Maps
//!
//! The sorted key space backing snapshots and in-transaction staging is a
//! treap: a binary search tree ordered by key whose heap shape is driven by
//! per-node priorities. Two façades share one node representation:
//!
//! - [`Immutable`] — a persistent map. Every mutation path-copies the
//!   O(log n) nodes from the root to the touched position and returns a new
//!   map; untouched subtrees are shared through `Arc`. A committed snapshot
//!   is therefore nothing more than a clone of the root pointer, and stays
//!   readable for as long as anyone holds it.
//! - [`Mutable`] — the staging map used for pending transaction state. Same
//!   ordering and nodes, `&mut self` API, plus [`Mutable::freeze`] to hand
//!   cursors a consistent capture of the current contents.
//!
//! ## Priorities
//!
//! Node priorities are derived from a CRC-64 of the key rather than an RNG.
//! The tree shape is then a pure function of the key set: identical across
//! runs, stable under value replacement (replacing a value never rotates),
//! and free of any global mutable state.
//!
//! ## Complexity
//!
//! Search, insert, and remove are O(log n) expected. The positional
//! searches used by cursors (`ceiling`, `successor`, `predecessor`) are a
//! single root-to-leaf descent each, so cursor movement over a frozen root
//! costs O(log n) per step without any iterator state to invalidate.

mod immutable;
mod mutable;

pub use immutable::{Immutable, RangeIter};
pub use mutable::Mutable;

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use crc::{Crc, CRC_64_ECMA_182};

const PRIORITY_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

fn node_priority(key: &[u8]) -> u64 {
    PRIORITY_CRC.checksum(key)
}

#[derive(Clone)]
pub(crate) struct Node {
    key: Bytes,
    value: Bytes,
    priority: u64,
    left: Option<Arc<Node>>,
    right: Option<Arc<Node>>,
}

impl Node {
    fn leaf(key: Bytes, value: Bytes) -> Self {
        let priority = node_priority(key.as_ref());
        Self {
            key,
            value,
            priority,
            left: None,
            right: None,
        }
    }

    pub(crate) fn entry(&self) -> (Bytes, Bytes) {
        (self.key.clone(), self.value.clone())
    }
}

pub(crate) type Link = Option<Arc<Node>>;

fn find<'a>(mut node: Option<&'a Arc<Node>>, key: &[u8]) -> Option<&'a Arc<Node>> {
    while let Some(n) = node {
        match key.cmp(n.key.as_ref()) {
            Ordering::Less => node = n.left.as_ref(),
            Ordering::Greater => node = n.right.as_ref(),
            Ordering::Equal => return Some(n),
        }
    }
    None
}

fn min_node(mut node: Option<&Arc<Node>>) -> Option<&Arc<Node>> {
    let mut best = None;
    while let Some(n) = node {
        best = Some(n);
        node = n.left.as_ref();
    }
    best
}

fn max_node(mut node: Option<&Arc<Node>>) -> Option<&Arc<Node>> {
    let mut best = None;
    while let Some(n) = node {
        best = Some(n);
        node = n.right.as_ref();
    }
    best
}

/// Smallest node with `node.key >= key`.
fn ceiling<'a>(mut node: Option<&'a Arc<Node>>, key: &[u8]) -> Option<&'a Arc<Node>> {
    let mut best = None;
    while let Some(n) = node {
        if n.key.as_ref() < key {
            node = n.right.as_ref();
        } else {
            best = Some(n);
            node = n.left.as_ref();
        }
    }
    best
}

/// Smallest node with `node.key > key`.
fn successor<'a>(mut node: Option<&'a Arc<Node>>, key: &[u8]) -> Option<&'a Arc<Node>> {
    let mut best = None;
    while let Some(n) = node {
        if n.key.as_ref() <= key {
            node = n.right.as_ref();
        } else {
            best = Some(n);
            node = n.left.as_ref();
        }
    }
    best
}

/// Largest node with `node.key < key`.
fn predecessor<'a>(mut node: Option<&'a Arc<Node>>, key: &[u8]) -> Option<&'a Arc<Node>> {
    let mut best = None;
    while let Some(n) = node {
        if n.key.as_ref() >= key {
            node = n.left.as_ref();
        } else {
            best = Some(n);
            node = n.right.as_ref();
        }
    }
    best
}

fn rotate_right(mut n: Node) -> Arc<Node> {
    let l = n.left.take().expect("rotate_right requires a left child");
    let mut root = (*l).clone();
    n.left = root.right.take();
    root.right = Some(Arc::new(n));
    Arc::new(root)
}

fn rotate_left(mut n: Node) -> Arc<Node> {
    let r = n.right.take().expect("rotate_left requires a right child");
    let mut root = (*r).clone();
    n.right = root.left.take();
    root.left = Some(Arc::new(n));
    Arc::new(root)
}

/// Path-copying insert. Returns the new subtree root and whether an
/// existing value was replaced.
fn insert_rec(node: Option<&Arc<Node>>, key: &Bytes, value: &Bytes) -> (Arc<Node>, bool) {
    let Some(n) = node else {
        return (Arc::new(Node::leaf(key.clone(), value.clone())), false);
    };
    match key.as_ref().cmp(n.key.as_ref()) {
        Ordering::Equal => {
            let mut updated = (**n).clone();
            updated.value = value.clone();
            (Arc::new(updated), true)
        }
        Ordering::Less => {
            let (child, replaced) = insert_rec(n.left.as_ref(), key, value);
            let rotate = child.priority > n.priority;
            let mut updated = (**n).clone();
            updated.left = Some(child);
            let new_root = if rotate {
                rotate_right(updated)
            } else {
                Arc::new(updated)
            };
            (new_root, replaced)
        }
        Ordering::Greater => {
            let (child, replaced) = insert_rec(n.right.as_ref(), key, value);
            let rotate = child.priority > n.priority;
            let mut updated = (**n).clone();
            updated.right = Some(child);
            let new_root = if rotate {
                rotate_left(updated)
            } else {
                Arc::new(updated)
            };
            (new_root, replaced)
        }
    }
}

/// Joins two subtrees where every key of `a` sorts before every key of `b`.
fn join(a: Link, b: Link) -> Link {
    match (a, b) {
        (None, other) | (other, None) => other,
        (Some(l), Some(r)) => {
            if l.priority >= r.priority {
                let mut node = (*l).clone();
                node.right = join(node.right.take(), Some(r));
                Some(Arc::new(node))
            } else {
                let mut node = (*r).clone();
                node.left = join(Some(l), node.left.take());
                Some(Arc::new(node))
            }
        }
    }
}

/// Path-copying remove. Returns the new subtree root and whether the key
/// was present.
fn remove_rec(node: Option<&Arc<Node>>, key: &[u8]) -> (Link, bool) {
    let Some(n) = node else {
        return (None, false);
    };
    match key.cmp(n.key.as_ref()) {
        Ordering::Less => {
            let (child, removed) = remove_rec(n.left.as_ref(), key);
            if !removed {
                return (Some(Arc::clone(n)), false);
            }
            let mut updated = (**n).clone();
            updated.left = child;
            (Some(Arc::new(updated)), true)
        }
        Ordering::Greater => {
            let (child, removed) = remove_rec(n.right.as_ref(), key);
            if !removed {
                return (Some(Arc::clone(n)), false);
            }
            let mut updated = (**n).clone();
            updated.right = child;
            (Some(Arc::new(updated)), true)
        }
        Ordering::Equal => (join(n.left.clone(), n.right.clone()), true),
    }
}
