//! Persistent sorted set
//!
//! An immutable B-tree with structural sharing: every mutation returns a
//! new handle, unchanged subtrees are shared by reference (in memory) or
//! by address (on storage). Three consumers, one implementation:
//!
//! - metadata index: `internal_id -> metadata map`
//! - external-id index: `external_id -> internal_id`
//! - address maps: `chunk position -> chunk address`
//!
//! Nodes live behind a pluggable [`NodeCache`]: loaded nodes are
//! LRU-cached with weak-reference fallback, so the runtime can reclaim
//! cold subtrees and a later descent transparently reloads them. An
//! incremental append into an address map rewrites O(log n) tree nodes,
//! not O(n) bytes — this is what makes per-commit persistence cheap.

mod key;
mod storage;

pub use key::ExternalId;
pub use storage::NodeCache;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::store::PendingWrite;

/// Branching factor: max keys per node before a split.
pub const DEFAULT_ORDER: usize = 512;

/// Values storable in a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PssValue {
    /// Internal id / position payloads.
    U64(u64),
    /// Chunk or node address.
    Address(Uuid),
    /// Metadata map (arbitrary JSON object).
    Json(serde_json::Value),
}

impl PssValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PssValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<Uuid> {
        match self {
            PssValue::Address(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            PssValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// A tree node. Immutable once constructed; mutation paths copy.
#[derive(Debug, Clone)]
pub enum Node {
    Leaf {
        keys: Vec<ExternalId>,
        values: Vec<PssValue>,
    },
    Branch {
        level: u16,
        /// Fence keys: `keys[i]` is the minimum key of `children[i]`'s
        /// subtree. Same length as `children`.
        keys: Vec<ExternalId>,
        children: Vec<Child>,
    },
}

/// A child slot: either an in-memory (dirty, not yet persisted) node or
/// an address into node storage.
#[derive(Debug, Clone)]
pub enum Child {
    Mem(Arc<Node>),
    Stored(Uuid),
}

impl Node {
    fn level(&self) -> u16 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Branch { level, .. } => *level,
        }
    }

    fn min_key(&self) -> ExternalId {
        match self {
            Node::Leaf { keys, .. } => keys[0].clone(),
            Node::Branch { keys, .. } => keys[0].clone(),
        }
    }
}

enum InsertOutcome {
    One(Arc<Node>),
    /// Left node, right-subtree minimum key, right node.
    Split(Arc<Node>, ExternalId, Arc<Node>),
}

enum DeleteOutcome {
    Unchanged,
    Emptied,
    Replaced(Arc<Node>),
}

/// Handle to one version of a set. Cheap to clone; clones share all
/// nodes until one of them mutates.
#[derive(Clone)]
pub struct Pss {
    root: Option<Child>,
    cache: Arc<NodeCache>,
    order: usize,
}

impl Pss {
    /// Empty set over the given node storage.
    pub fn new(cache: Arc<NodeCache>) -> Self {
        Self::with_order(cache, DEFAULT_ORDER)
    }

    /// Custom branching factor (tests use small orders to force splits).
    pub fn with_order(cache: Arc<NodeCache>, order: usize) -> Self {
        Pss {
            root: None,
            cache,
            order: order.max(2),
        }
    }

    /// Rehydrate a persisted set from its root address.
    pub fn load(root: Option<Uuid>, cache: Arc<NodeCache>) -> Self {
        Pss {
            root: root.map(Child::Stored),
            cache,
            order: DEFAULT_ORDER,
        }
    }

    /// Root address if the current version has been persisted.
    pub fn root_address(&self) -> Option<Uuid> {
        match &self.root {
            Some(Child::Stored(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn with_root(&self, root: Option<Child>) -> Self {
        Pss {
            root,
            cache: self.cache.clone(),
            order: self.order,
        }
    }

    fn resolve(&self, child: &Child) -> Result<Arc<Node>> {
        match child {
            Child::Mem(node) => Ok(node.clone()),
            Child::Stored(addr) => self.cache.restore(*addr),
        }
    }

    /// Route a key to a child slot by fence keys.
    fn route(keys: &[ExternalId], k: &ExternalId) -> usize {
        keys.partition_point(|fence| fence <= k).saturating_sub(1)
    }

    // ===== Lookup =====

    pub fn lookup(&self, k: &ExternalId) -> Result<Option<PssValue>> {
        let mut child = match &self.root {
            None => return Ok(None),
            Some(c) => c.clone(),
        };
        loop {
            let node = self.resolve(&child)?;
            match &*node {
                Node::Leaf { keys, values } => {
                    return Ok(match keys.binary_search(k) {
                        Ok(i) => Some(values[i].clone()),
                        Err(_) => None,
                    });
                }
                Node::Branch { keys, children, .. } => {
                    child = children[Self::route(keys, k)].clone();
                }
            }
        }
    }

    pub fn contains(&self, k: &ExternalId) -> Result<bool> {
        Ok(self.lookup(k)?.is_some())
    }

    // ===== Insert =====

    /// Insert or replace; returns the new version.
    pub fn insert(&self, k: ExternalId, v: PssValue) -> Result<Pss> {
        let new_root = match &self.root {
            None => Child::Mem(Arc::new(Node::Leaf {
                keys: vec![k],
                values: vec![v],
            })),
            Some(child) => match self.insert_into(child, k, v)? {
                InsertOutcome::One(node) => Child::Mem(node),
                InsertOutcome::Split(left, sep, right) => {
                    let level = left.level() + 1;
                    let left_min = left.min_key();
                    Child::Mem(Arc::new(Node::Branch {
                        level,
                        keys: vec![left_min, sep],
                        children: vec![Child::Mem(left), Child::Mem(right)],
                    }))
                }
            },
        };
        Ok(self.with_root(Some(new_root)))
    }

    fn insert_into(&self, child: &Child, k: ExternalId, v: PssValue) -> Result<InsertOutcome> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Leaf { keys, values } => {
                let mut keys = keys.clone();
                let mut values = values.clone();
                match keys.binary_search(&k) {
                    Ok(i) => values[i] = v,
                    Err(i) => {
                        keys.insert(i, k);
                        values.insert(i, v);
                    }
                }
                if keys.len() > self.order {
                    let mid = keys.len() / 2;
                    let right_keys = keys.split_off(mid);
                    let right_values = values.split_off(mid);
                    let sep = right_keys[0].clone();
                    Ok(InsertOutcome::Split(
                        Arc::new(Node::Leaf { keys, values }),
                        sep,
                        Arc::new(Node::Leaf {
                            keys: right_keys,
                            values: right_values,
                        }),
                    ))
                } else {
                    Ok(InsertOutcome::One(Arc::new(Node::Leaf { keys, values })))
                }
            }
            Node::Branch {
                level,
                keys,
                children,
            } => {
                let idx = Self::route(keys, &k);
                let mut keys = keys.clone();
                let mut children = children.clone();
                if k < keys[idx] {
                    keys[idx] = k.clone();
                }
                match self.insert_into(&children[idx], k, v)? {
                    InsertOutcome::One(node) => {
                        children[idx] = Child::Mem(node);
                    }
                    InsertOutcome::Split(left, sep, right) => {
                        children[idx] = Child::Mem(left);
                        keys.insert(idx + 1, sep);
                        children.insert(idx + 1, Child::Mem(right));
                    }
                }
                if keys.len() > self.order {
                    let mid = keys.len() / 2;
                    let right_keys = keys.split_off(mid);
                    let right_children = children.split_off(mid);
                    let sep = right_keys[0].clone();
                    Ok(InsertOutcome::Split(
                        Arc::new(Node::Branch {
                            level: *level,
                            keys,
                            children,
                        }),
                        sep,
                        Arc::new(Node::Branch {
                            level: *level,
                            keys: right_keys,
                            children: right_children,
                        }),
                    ))
                } else {
                    Ok(InsertOutcome::One(Arc::new(Node::Branch {
                        level: *level,
                        keys,
                        children,
                    })))
                }
            }
        }
    }

    // ===== Delete =====

    /// Remove a key if present; returns the new version (shares all
    /// nodes with `self` when the key was absent).
    pub fn delete(&self, k: &ExternalId) -> Result<Pss> {
        let root = match &self.root {
            None => return Ok(self.clone()),
            Some(c) => c,
        };
        match self.delete_from(root, k)? {
            DeleteOutcome::Unchanged => Ok(self.clone()),
            DeleteOutcome::Emptied => Ok(self.with_root(None)),
            DeleteOutcome::Replaced(mut node) => {
                // Collapse single-child branch chains at the root
                loop {
                    let collapse = match &*node {
                        Node::Branch { children, .. } if children.len() == 1 => {
                            Some(self.resolve(&children[0])?)
                        }
                        _ => None,
                    };
                    match collapse {
                        Some(child) => node = child,
                        None => break,
                    }
                }
                Ok(self.with_root(Some(Child::Mem(node))))
            }
        }
    }

    fn delete_from(&self, child: &Child, k: &ExternalId) -> Result<DeleteOutcome> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Leaf { keys, values } => match keys.binary_search(k) {
                Err(_) => Ok(DeleteOutcome::Unchanged),
                Ok(i) => {
                    if keys.len() == 1 {
                        return Ok(DeleteOutcome::Emptied);
                    }
                    let mut keys = keys.clone();
                    let mut values = values.clone();
                    keys.remove(i);
                    values.remove(i);
                    Ok(DeleteOutcome::Replaced(Arc::new(Node::Leaf {
                        keys,
                        values,
                    })))
                }
            },
            Node::Branch {
                level,
                keys,
                children,
            } => {
                let idx = Self::route(keys, k);
                match self.delete_from(&children[idx], k)? {
                    DeleteOutcome::Unchanged => Ok(DeleteOutcome::Unchanged),
                    DeleteOutcome::Emptied => {
                        if children.len() == 1 {
                            return Ok(DeleteOutcome::Emptied);
                        }
                        let mut keys = keys.clone();
                        let mut children = children.clone();
                        keys.remove(idx);
                        children.remove(idx);
                        Ok(DeleteOutcome::Replaced(Arc::new(Node::Branch {
                            level: *level,
                            keys,
                            children,
                        })))
                    }
                    DeleteOutcome::Replaced(new_child) => {
                        let mut keys = keys.clone();
                        let mut children = children.clone();
                        // Fence may be stale-low after deleting a subtree
                        // minimum; that only loosens routing, never breaks it.
                        children[idx] = Child::Mem(new_child);
                        Ok(DeleteOutcome::Replaced(Arc::new(Node::Branch {
                            level: *level,
                            keys,
                            children,
                        })))
                    }
                }
            }
        }
    }

    // ===== Iteration =====

    /// All entries in key order.
    pub fn entries(&self) -> Result<Vec<(ExternalId, PssValue)>> {
        self.slice(None, None)
    }

    /// Entries with `lo <= key <= hi` (either bound optional), in key
    /// order.
    pub fn slice(
        &self,
        lo: Option<&ExternalId>,
        hi: Option<&ExternalId>,
    ) -> Result<Vec<(ExternalId, PssValue)>> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            self.collect(root, lo, hi, &mut out)?;
        }
        Ok(out)
    }

    fn collect(
        &self,
        child: &Child,
        lo: Option<&ExternalId>,
        hi: Option<&ExternalId>,
        out: &mut Vec<(ExternalId, PssValue)>,
    ) -> Result<()> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Leaf { keys, values } => {
                for (k, v) in keys.iter().zip(values) {
                    if lo.is_some_and(|lo| k < lo) {
                        continue;
                    }
                    if hi.is_some_and(|hi| k > hi) {
                        break;
                    }
                    out.push((k.clone(), v.clone()));
                }
            }
            Node::Branch { keys, children, .. } => {
                for (i, child) in children.iter().enumerate() {
                    // Prune subtrees entirely outside [lo, hi]: child i
                    // covers [keys[i], keys[i+1]).
                    if let Some(hi) = hi {
                        if &keys[i] > hi {
                            break;
                        }
                    }
                    if let (Some(lo), Some(next_fence)) = (lo, keys.get(i + 1)) {
                        if next_fence <= lo {
                            continue;
                        }
                    }
                    self.collect(child, lo, hi, out)?;
                }
            }
        }
        Ok(())
    }

    /// Entry count. Walks the tree; prefer commit-record counters for the
    /// hot path.
    pub fn count(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    // ===== Persistence =====

    /// Write all in-memory (dirty) nodes to node storage, bottom-up.
    ///
    /// Returns the root address and a handle whose nodes are all
    /// address-backed; writes are enqueued on the pool and their receipts
    /// appended to `pending` — the caller must await them before
    /// publishing the root address anywhere durable.
    pub fn persist(
        &self,
        crypto: bool,
        pending: &mut Vec<PendingWrite>,
    ) -> Result<(Option<Uuid>, Pss)> {
        match &self.root {
            None => Ok((None, self.clone())),
            Some(root) => {
                let (addr, stored) = self.persist_child(root, crypto, pending)?;
                Ok((Some(addr), self.with_root(Some(stored))))
            }
        }
    }

    fn persist_child(
        &self,
        child: &Child,
        crypto: bool,
        pending: &mut Vec<PendingWrite>,
    ) -> Result<(Uuid, Child)> {
        match child {
            Child::Stored(addr) => Ok((*addr, child.clone())),
            Child::Mem(node) => {
                let storable: Node = match &**node {
                    Node::Leaf { .. } => (**node).clone(),
                    Node::Branch {
                        level,
                        keys,
                        children,
                    } => {
                        let mut stored_children = Vec::with_capacity(children.len());
                        for c in children {
                            let (_, stored) = self.persist_child(c, crypto, pending)?;
                            stored_children.push(stored);
                        }
                        Node::Branch {
                            level: *level,
                            keys: keys.clone(),
                            children: stored_children,
                        }
                    }
                };
                let (addr, receipt) = self.cache.store(&storable, crypto)?;
                pending.push(receipt);
                Ok((addr, Child::Stored(addr)))
            }
        }
    }

    /// Collect every node address reachable from the current root
    /// (used by gc reachability analysis).
    pub fn reachable_addresses(&self, out: &mut std::collections::HashSet<Uuid>) -> Result<()> {
        if let Some(root) = &self.root {
            self.reachable_from(root, out)?;
        }
        Ok(())
    }

    fn reachable_from(
        &self,
        child: &Child,
        out: &mut std::collections::HashSet<Uuid>,
    ) -> Result<()> {
        if let Child::Stored(addr) = child {
            out.insert(*addr);
        }
        let node = self.resolve(child)?;
        if let Node::Branch { children, .. } = &*node {
            for c in children {
                self.reachable_from(c, out)?;
            }
        }
        Ok(())
    }
}
