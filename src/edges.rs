//! Chunked edge store
//!
//! HNSW neighbor lists, stored as fixed-size slabs of `u32` slots:
//! `chunk_size` contiguous nodes per chunk, and per node one count slot
//! followed by up to `cap` neighbor ids (`cap` is `2m` at layer 0, `m`
//! above). Layer 0 is dense; upper layers allocate lazily.
//!
//! Mutation is copy-on-write at chunk granularity. A slot holds an
//! `Arc`'d slab; forks clone the slot tables, so both sides share every
//! slab until one of them writes — at which point `Arc::make_mut` gives
//! the writer a private copy and readers keep the snapshot they already
//! hold. Reads therefore never lock a chunk: they clone the `Arc` under
//! a short table read-lock and walk it freely.
//!
//! Each slot is a two-tier cache: a strong reference (possibly dirty,
//! pinned) or a weak one (clean, reclaimable). `softify` demotes clean
//! persisted chunks; a later read reloads the bytes through the chunk
//! source callback. The callback gets the storage handle at construction
//! time — it never needs a back-reference to the index.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::error::{ProximumError, Result};
use crate::store::StoreHandle;

/// Sentinel for "no node" (entry point of an empty graph).
pub const NIL: u32 = u32::MAX;

const STRIPES: usize = 1024;

/// Decode persisted chunk bytes into a slab. Bytes from the KV store
/// carry no alignment guarantee, so this goes through `from_le_bytes`
/// rather than a slice cast.
fn decode_slab(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes(b.try_into().expect("4-byte chunk")))
        .collect()
}

/// Loads chunk bytes for soft-evicted slots.
pub trait ChunkSource: Send + Sync {
    fn load(&self, address: Uuid) -> Result<Vec<u8>>;
}

/// Chunk source over the KV store.
pub struct KvChunkSource {
    store: StoreHandle,
}

impl KvChunkSource {
    pub fn new(store: StoreHandle) -> Self {
        KvChunkSource { store }
    }
}

impl ChunkSource for KvChunkSource {
    fn load(&self, address: Uuid) -> Result<Vec<u8>> {
        self.store
            .get(&address.to_string())?
            .ok_or(ProximumError::ChunkUnavailable {
                op: "edges.load",
                address,
            })
    }
}

/// Source for store-less indices: nothing is ever soft-evicted, so a
/// load request means a bug or a missing store.
pub struct NullChunkSource;

impl ChunkSource for NullChunkSource {
    fn load(&self, address: Uuid) -> Result<Vec<u8>> {
        Err(ProximumError::ChunkUnavailable {
            op: "edges.load",
            address,
        })
    }
}

/// One chunk slot: strong (resident, maybe dirty) or weak (reclaimable).
struct ChunkSlot {
    strong: Option<Arc<Vec<u32>>>,
    weak: Weak<Vec<u32>>,
    /// Address of the last persisted version of this chunk, if any.
    address: Option<Uuid>,
    dirty: bool,
}

impl ChunkSlot {
    fn empty() -> Self {
        ChunkSlot {
            strong: None,
            weak: Weak::new(),
            address: None,
            dirty: false,
        }
    }

    fn resident(&self) -> Option<Arc<Vec<u32>>> {
        self.strong.clone().or_else(|| self.weak.upgrade())
    }
}

impl Clone for ChunkSlot {
    fn clone(&self) -> Self {
        ChunkSlot {
            strong: self.strong.clone(),
            weak: self.weak.clone(),
            address: self.address,
            dirty: self.dirty,
        }
    }
}

/// A consistent view of one node's neighbor list. Holds the slab alive;
/// the ids stay valid even if the store mutates concurrently.
pub struct Neighbors {
    chunk: Option<Arc<Vec<u32>>>,
    offset: usize,
    len: usize,
}

impl Neighbors {
    fn empty() -> Self {
        Neighbors {
            chunk: None,
            offset: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u32] {
        match &self.chunk {
            Some(chunk) => &chunk[self.offset..self.offset + self.len],
            None => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.as_slice().iter().copied()
    }
}

/// A dirty chunk drained for persistence.
pub struct DirtyChunk {
    pub layer: usize,
    pub chunk_idx: usize,
    pub bytes: Vec<u8>,
}

pub struct EdgeStore {
    chunk_size: usize,
    m: usize,
    m0: usize,
    /// `layers[layer][chunk_idx]`; layer 0 dense, upper layers grown on
    /// first write at that level.
    layers: RwLock<Vec<Vec<ChunkSlot>>>,
    /// Deletion bitset, CoW on the word array, published by Arc swap.
    deleted: RwLock<Arc<Vec<u64>>>,
    stripes: Vec<Mutex<()>>,
    /// Transient mode: in-place mutation of unshared slabs. Sealed mode
    /// always copies before writing.
    transient: AtomicBool,
    source: Arc<dyn ChunkSource>,
}

impl EdgeStore {
    pub fn new(chunk_size: usize, m: usize, source: Arc<dyn ChunkSource>) -> Self {
        EdgeStore {
            chunk_size,
            m,
            m0: 2 * m,
            layers: RwLock::new(vec![Vec::new()]),
            deleted: RwLock::new(Arc::new(Vec::new())),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            transient: AtomicBool::new(false),
            source,
        }
    }

    /// Neighbor cap at a layer.
    pub fn layer_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    fn slots_per_node(&self, layer: usize) -> usize {
        self.layer_cap(layer) + 1
    }

    /// Acquire the write stripe for a node. Distinct stripes proceed
    /// concurrently; reads never take these.
    pub fn lock_node(&self, node: u32) -> MutexGuard<'_, ()> {
        self.stripes[(node as usize) & (STRIPES - 1)].lock()
    }

    /// Switch to transient mode: freshly allocated, unshared slabs may
    /// be mutated in place. Used during bulk insert.
    pub fn as_transient(&self) {
        self.transient.store(true, Ordering::Release);
    }

    /// Seal back to full copy-on-write for safe sharing.
    pub fn as_persistent(&self) {
        self.transient.store(false, Ordering::Release);
    }

    // ===== Reads =====

    /// A consistent snapshot of one node's neighbor list. Transparently
    /// reloads a soft-evicted chunk through the chunk source.
    pub fn neighbors(&self, layer: usize, node: u32) -> Result<Neighbors> {
        let chunk_idx = node as usize / self.chunk_size;
        let address = {
            let layers = self.layers.read();
            let slot = match layers.get(layer).and_then(|t| t.get(chunk_idx)) {
                Some(slot) => slot,
                None => return Ok(Neighbors::empty()),
            };
            if let Some(chunk) = slot.resident() {
                return Ok(self.view(chunk, layer, node));
            }
            match slot.address {
                Some(addr) => addr,
                None => return Ok(Neighbors::empty()),
            }
        };
        // Reclaimed weak slot: reload outside the read lock, then install
        let chunk = self.reload(layer, chunk_idx, address)?;
        Ok(self.view(chunk, layer, node))
    }

    fn view(&self, chunk: Arc<Vec<u32>>, layer: usize, node: u32) -> Neighbors {
        let spn = self.slots_per_node(layer);
        let offset = (node as usize % self.chunk_size) * spn;
        let len = (chunk[offset] as usize).min(spn - 1);
        Neighbors {
            chunk: Some(chunk),
            offset: offset + 1,
            len,
        }
    }

    fn reload(&self, layer: usize, chunk_idx: usize, address: Uuid) -> Result<Arc<Vec<u32>>> {
        let bytes = self.source.load(address)?;
        let chunk = Arc::new(decode_slab(&bytes));
        let mut layers = self.layers.write();
        let slot = &mut layers[layer][chunk_idx];
        // Another thread may have beaten us to it
        if let Some(existing) = slot.resident() {
            return Ok(existing);
        }
        slot.strong = Some(chunk.clone());
        slot.weak = Weak::new();
        Ok(chunk)
    }

    /// True when the node is tombstoned.
    pub fn is_deleted(&self, node: u32) -> bool {
        let words = self.deleted.read().clone();
        let word = node as usize / 64;
        match words.get(word) {
            Some(w) => w & (1 << (node % 64)) != 0,
            None => false,
        }
    }

    /// Tombstone a node. CoW on the word array; readers holding the old
    /// array keep a consistent pre-delete view.
    pub fn mark_deleted(&self, node: u32) {
        let mut guard = self.deleted.write();
        let mut words = (**guard).clone();
        let word = node as usize / 64;
        if words.len() <= word {
            words.resize(word + 1, 0);
        }
        words[word] |= 1 << (node % 64);
        *guard = Arc::new(words);
    }

    /// The bitset word array, sized for `count` nodes (commit records
    /// store exactly `ceil(count / 64)` words).
    pub fn deleted_words(&self, count: usize) -> Vec<u64> {
        let mut words = (**self.deleted.read()).clone();
        words.resize(count.div_ceil(64), 0);
        words
    }

    /// Number of set bits among the first `count` nodes.
    pub fn deleted_count(&self, count: usize) -> usize {
        self.deleted_words(count)
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    /// Seed the bitset from a commit record.
    pub fn seed_deleted(&self, words: Vec<u64>) {
        *self.deleted.write() = Arc::new(words);
    }

    // ===== Writes =====

    /// Replace one node's neighbor list. Enforces the layer cap;
    /// resolves-and-clones an inherited or soft-evicted chunk before
    /// writing; marks the chunk dirty.
    pub fn set_neighbors(&self, layer: usize, node: u32, ids: &[u32]) -> Result<()> {
        let cap = self.layer_cap(layer);
        if ids.len() > cap {
            return Err(ProximumError::CapacityExceeded {
                op: "set_neighbors",
                used: ids.len(),
                limit: cap,
            });
        }
        debug_assert!(!ids.contains(&node), "self-edge on node {node}");

        let chunk_idx = node as usize / self.chunk_size;
        let spn = self.slots_per_node(layer);
        let transient = self.transient.load(Ordering::Acquire);

        let mut layers = self.layers.write();
        if layers.len() <= layer {
            layers.resize_with(layer + 1, Vec::new);
        }
        let table = &mut layers[layer];
        if table.len() <= chunk_idx {
            table.resize_with(chunk_idx + 1, ChunkSlot::empty);
        }
        let slot = &mut table[chunk_idx];

        // Materialize: resident, or reload from storage, or fresh slab
        let mut chunk: Arc<Vec<u32>> = match slot.resident() {
            Some(chunk) => chunk,
            None => match slot.address {
                Some(address) => {
                    let bytes = self.source.load(address)?;
                    Arc::new(decode_slab(&bytes))
                }
                None => Arc::new(vec![0u32; self.chunk_size * spn]),
            },
        };

        {
            // Transient mode mutates an unshared slab in place; sealed
            // mode (and any shared slab) copies first.
            let slab = if transient {
                Arc::make_mut(&mut chunk)
            } else {
                chunk = Arc::new((*chunk).clone());
                Arc::get_mut(&mut chunk).expect("freshly cloned slab is unshared")
            };
            let offset = (node as usize % self.chunk_size) * spn;
            slab[offset] = ids.len() as u32;
            slab[offset + 1..offset + 1 + ids.len()].copy_from_slice(ids);
            // Zero the tail so chunk bytes are a pure function of content
            slab[offset + 1 + ids.len()..offset + spn].fill(0);
        }

        slot.strong = Some(chunk);
        slot.weak = Weak::new();
        slot.dirty = true;
        Ok(())
    }

    // ===== Sharing and eviction =====

    /// Shallow fork: clones the slot tables and bitset reference. Every
    /// shared slab copies on first write on either side, and the fork
    /// starts with an empty dirty set. A chunk that was dirty in the
    /// parent forks without its address (the persisted bytes are stale),
    /// so the fork's first sync still writes its content through the
    /// missing-address path. The fork comes back sealed.
    pub fn fork(&self) -> EdgeStore {
        let layers = self
            .layers
            .read()
            .iter()
            .map(|table| {
                table
                    .iter()
                    .map(|slot| ChunkSlot {
                        strong: slot.strong.clone(),
                        weak: slot.weak.clone(),
                        address: if slot.dirty { None } else { slot.address },
                        dirty: false,
                    })
                    .collect()
            })
            .collect();
        let deleted = self.deleted.read().clone();
        EdgeStore {
            chunk_size: self.chunk_size,
            m: self.m,
            m0: self.m0,
            layers: RwLock::new(layers),
            deleted: RwLock::new(deleted),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            transient: AtomicBool::new(false),
            source: self.source.clone(),
        }
    }

    /// Demote a clean, persisted chunk to a weak reference so the
    /// allocator can reclaim it. Dirty chunks are pinned.
    pub fn softify(&self, layer: usize, chunk_idx: usize) {
        let mut layers = self.layers.write();
        if let Some(slot) = layers.get_mut(layer).and_then(|t| t.get_mut(chunk_idx)) {
            if slot.dirty || slot.address.is_none() {
                return;
            }
            if let Some(strong) = slot.strong.take() {
                slot.weak = Arc::downgrade(&strong);
            }
        }
    }

    /// Collect every chunk that must be written at sync: dirty ones,
    /// plus any resident chunk that has never been assigned an address
    /// (possible after forking an unsynced store).
    pub fn drain_dirty(&self) -> Vec<DirtyChunk> {
        let layers = self.layers.read();
        let mut out = Vec::new();
        for (layer, table) in layers.iter().enumerate() {
            for (chunk_idx, slot) in table.iter().enumerate() {
                let needs_write = slot.dirty || (slot.address.is_none() && slot.strong.is_some());
                if !needs_write {
                    continue;
                }
                if let Some(chunk) = slot.resident() {
                    out.push(DirtyChunk {
                        layer,
                        chunk_idx,
                        bytes: bytemuck::cast_slice(chunk.as_slice()).to_vec(),
                    });
                }
            }
        }
        out
    }

    /// Record that a drained chunk landed at `address`; clears dirty.
    pub fn mark_persisted(&self, layer: usize, chunk_idx: usize, address: Uuid) {
        let mut layers = self.layers.write();
        if let Some(slot) = layers.get_mut(layer).and_then(|t| t.get_mut(chunk_idx)) {
            slot.address = Some(address);
            slot.dirty = false;
        }
    }

    /// Register a persisted chunk at load time. The slab itself stays in
    /// storage until a read faults it in.
    pub fn seed_chunk(&self, layer: usize, chunk_idx: usize, address: Uuid) {
        let mut layers = self.layers.write();
        if layers.len() <= layer {
            layers.resize_with(layer + 1, Vec::new);
        }
        let table = &mut layers[layer];
        if table.len() <= chunk_idx {
            table.resize_with(chunk_idx + 1, ChunkSlot::empty);
        }
        let slot = &mut table[chunk_idx];
        slot.address = Some(address);
        slot.dirty = false;
    }

    /// Number of allocated layers (upper bound over per-node levels).
    pub fn layer_count(&self) -> usize {
        self.layers.read().len()
    }
}
