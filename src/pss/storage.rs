//! Node storage with LRU + weak-reference caching
//!
//! Tree nodes are serialized in a self-describing form carrying the node
//! kind, level, keys, and either child addresses (branch) or payload
//! (leaf). Addresses are random UUIDs in plain mode and SHA-512-derived
//! content hashes in crypto mode, so identical subtrees deduplicate.
//!
//! In-memory residency is two-tier: an LRU of strong references bounded
//! by `cache_size`, and a weak map that lets a node still referenced by
//! some live tree handle be recovered without a storage read after LRU
//! eviction.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use serde::{Deserialize, Serialize};

use crate::error::{ProximumError, Result};
use crate::store::{KvStore, PendingWrite, StoreHandle, WritePool};

use super::{Child, ExternalId, Node, PssValue};

/// Derive a 16-byte address from content bytes (crypto mode).
pub(crate) fn content_address(bytes: &[u8]) -> Uuid {
    let digest = Sha512::digest(bytes);
    let mut addr = [0u8; 16];
    addr.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(addr)
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireKind {
    Leaf,
    Branch,
}

/// On-storage node form. Branch children are always addresses here —
/// `Pss::persist` stores bottom-up, so a node is serialized only after
/// its children have addresses.
#[derive(Serialize, Deserialize)]
struct WireNode {
    kind: WireKind,
    level: u16,
    keys: Vec<ExternalId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    values: Option<Vec<PssValue>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    children: Option<Vec<Uuid>>,
}

fn encode(node: &Node) -> Result<Vec<u8>> {
    let wire = match node {
        Node::Leaf { keys, values } => WireNode {
            kind: WireKind::Leaf,
            level: 0,
            keys: keys.clone(),
            values: Some(values.clone()),
            children: None,
        },
        Node::Branch {
            level,
            keys,
            children,
        } => {
            let addrs = children
                .iter()
                .map(|c| match c {
                    Child::Stored(addr) => Ok(*addr),
                    Child::Mem(_) => Err(ProximumError::io(
                        "pss.store",
                        std::io::Error::other("branch serialized before its children"),
                    )),
                })
                .collect::<Result<Vec<_>>>()?;
            WireNode {
                kind: WireKind::Branch,
                level: *level,
                keys: keys.clone(),
                values: None,
                children: Some(addrs),
            }
        }
    };
    serde_json::to_vec(&wire).map_err(|e| ProximumError::codec("pss.store", e))
}

fn decode(bytes: &[u8]) -> Result<Node> {
    let wire: WireNode =
        serde_json::from_slice(bytes).map_err(|e| ProximumError::codec("pss.restore", e))?;
    Ok(match wire.kind {
        WireKind::Leaf => Node::Leaf {
            keys: wire.keys,
            values: wire.values.unwrap_or_default(),
        },
        WireKind::Branch => Node::Branch {
            level: wire.level,
            keys: wire.keys,
            children: wire
                .children
                .unwrap_or_default()
                .into_iter()
                .map(Child::Stored)
                .collect(),
        },
    })
}

/// Pluggable node storage: store/restore/accessed over the KV backend.
pub struct NodeCache {
    store: StoreHandle,
    pool: Arc<WritePool>,
    lru: Mutex<LruCache<Uuid, Arc<Node>>>,
    weak: Mutex<HashMap<Uuid, Weak<Node>>>,
}

impl NodeCache {
    pub fn new(store: StoreHandle, pool: Arc<WritePool>, cache_size: usize) -> Self {
        NodeCache {
            store,
            pool,
            lru: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_size.max(1)).expect("non-zero cache size"),
            )),
            weak: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize and enqueue a node write; returns its address.
    pub fn store(&self, node: &Node, crypto: bool) -> Result<(Uuid, PendingWrite)> {
        let bytes = encode(node)?;
        let addr = if crypto {
            content_address(&bytes)
        } else {
            Uuid::new_v4()
        };
        let receipt = self.pool.put_async(addr.to_string(), bytes);
        self.remember(addr, Arc::new(node.clone()));
        Ok((addr, receipt))
    }

    /// Load a node, hitting the caches first.
    pub fn restore(&self, addr: Uuid) -> Result<Arc<Node>> {
        if let Some(node) = self.lru.lock().get(&addr) {
            return Ok(node.clone());
        }
        if let Some(node) = self.weak.lock().get(&addr).and_then(Weak::upgrade) {
            // Still alive through some tree handle; promote back into the LRU
            self.lru.lock().put(addr, node.clone());
            return Ok(node);
        }
        let bytes = self
            .store
            .get(&addr.to_string())?
            .ok_or(ProximumError::ChunkUnavailable {
                op: "pss.restore",
                address: addr,
            })?;
        let node = Arc::new(decode(&bytes)?);
        self.remember(addr, node.clone());
        Ok(node)
    }

    /// LRU touch for externally-observed access.
    pub fn accessed(&self, addr: Uuid) {
        let _ = self.lru.lock().get(&addr);
    }

    fn remember(&self, addr: Uuid, node: Arc<Node>) {
        self.lru.lock().put(addr, node.clone());
        let mut weak = self.weak.lock();
        weak.insert(addr, Arc::downgrade(&node));
        // Keep the weak map from accumulating dead slots forever
        if weak.len() > 4096 && weak.len() % 1024 == 0 {
            weak.retain(|_, w| w.strong_count() > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn fixture() -> (Arc<MemStore>, NodeCache) {
        let store = Arc::new(MemStore::new());
        let handle: StoreHandle = store.clone();
        let pool = Arc::new(WritePool::new(handle.clone()));
        (store.clone(), NodeCache::new(handle, pool, 4))
    }

    fn leaf(n: u64) -> Node {
        Node::Leaf {
            keys: vec![ExternalId::from(n)],
            values: vec![PssValue::U64(n)],
        }
    }

    #[test]
    fn test_store_restore_round_trip() {
        let (_, cache) = fixture();
        let (addr, receipt) = cache.store(&leaf(7), false).unwrap();
        receipt.wait().unwrap();
        let node = cache.restore(addr).unwrap();
        match &*node {
            Node::Leaf { keys, values } => {
                assert_eq!(keys[0], ExternalId::from(7u64));
                assert_eq!(values[0], PssValue::U64(7));
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_restore_survives_lru_eviction() {
        let (_, cache) = fixture();
        let (first, receipt) = cache.store(&leaf(0), false).unwrap();
        receipt.wait().unwrap();
        // Push well past the LRU bound of 4
        for n in 1..16 {
            let (_, r) = cache.store(&leaf(n), false).unwrap();
            r.wait().unwrap();
        }
        // Evicted from LRU and no live strong ref: reloads from storage
        let node = cache.restore(first).unwrap();
        assert!(matches!(&*node, Node::Leaf { .. }));
    }

    #[test]
    fn test_missing_address_is_chunk_unavailable() {
        let (_, cache) = fixture();
        let err = cache.restore(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ProximumError::ChunkUnavailable { .. }));
    }

    #[test]
    fn test_crypto_address_is_deterministic() {
        let (_, cache) = fixture();
        let (a1, r1) = cache.store(&leaf(3), true).unwrap();
        let (a2, r2) = cache.store(&leaf(3), true).unwrap();
        r1.wait().unwrap();
        r2.wait().unwrap();
        assert_eq!(a1, a2);
        let (a3, r3) = cache.store(&leaf(4), true).unwrap();
        r3.wait().unwrap();
        assert_ne!(a1, a3);
    }
}
