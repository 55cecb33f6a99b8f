//! The versioned index
//!
//! `Index` ties the four parts together: the mmap vector region, the
//! chunked edge store, the four persistent sorted sets (metadata,
//! external ids, and the two chunk address maps), and the commit/branch
//! model over the KV store.
//!
//! Every mutation has snapshot semantics through `fork` (O(chunks),
//! in-memory); `sync` turns the current state into an immutable commit
//! and moves the branch head; `branch` materializes a new branch file;
//! `load_commit` reopens any historical commit read-only.
//!
//! All methods take `&self`; internal locks follow a fixed acquisition
//! order (external-id set, metadata set, vectors, address maps, write
//! receipts) so parallel inserts, searches, and a concurrent `sync`
//! cannot deadlock.

use crossbeam_channel::{bounded, Receiver};
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::commit::{self, Commit};
use crate::compact::{DeltaOp, DeltaSink};
use crate::config::IndexOptions;
use crate::edges::{EdgeStore, KvChunkSource, NIL};
use crate::error::{truncate_for_error, ProximumError, Result};
use crate::graph::{self, EntryPoint, GraphParams, SearchOptions};
use crate::pss::{ExternalId, NodeCache, Pss, PssValue};
use crate::store::{
    open_store, put_json, KvStore, MemStore, PendingWrite, StoreHandle, WritePool, CONFIG_KEY,
};
use crate::vectors::{chunk_address, VectorStore};

/// Metadata field that carries the external id for reverse lookup.
pub(crate) const EXTERNAL_ID_FIELD: &str = "external-id";

/// Options for one `sync` call.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Explicit parent commits (merges). Defaults to the previous commit.
    pub parents: Option<Vec<Uuid>>,
}

/// Completion handle for a `sync`: the commit pipeline finishes on a
/// background thread once every enqueued chunk/node write has landed,
/// with the branch head written last.
#[derive(Debug)]
pub struct SyncHandle {
    rx: Receiver<Result<Commit>>,
}

impl SyncHandle {
    /// Block until the commit is durable; yields the new snapshot record
    /// (the index itself already carries it as its current commit).
    pub fn wait(self) -> Result<Commit> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(ProximumError::io(
                "sync",
                std::io::Error::other("sync worker exited before completion"),
            )),
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub vector_count: usize,
    pub live_count: usize,
    pub deleted_count: usize,
    pub max_level: usize,
    pub branch: String,
    pub commit: Option<Uuid>,
}

pub struct Index {
    pub(crate) opts: IndexOptions,
    pub(crate) params: GraphParams,
    pub(crate) store: StoreHandle,
    pub(crate) pool: Arc<WritePool>,
    pub(crate) node_cache: Arc<NodeCache>,
    pub(crate) vectors: RwLock<VectorStore>,
    pub(crate) edges: Arc<EdgeStore>,
    pub(crate) entry: RwLock<EntryPoint>,
    /// `internal_id -> metadata map` (with the external id injected).
    pub(crate) meta: RwLock<Pss>,
    /// `external_id -> internal_id`.
    pub(crate) ext: RwLock<Pss>,
    /// `chunk position -> chunk address` for vector chunks.
    pub(crate) vec_addrs: RwLock<Pss>,
    /// `(layer << 32 | chunk_idx) -> chunk address` for edge chunks.
    pub(crate) edge_addrs: RwLock<Pss>,
    pub(crate) rng: Mutex<SmallRng>,
    pub(crate) branch: String,
    pub(crate) commit: Arc<RwLock<Option<Commit>>>,
    pub(crate) read_only: bool,
    pub(crate) is_fork: bool,
    pub(crate) deleted: AtomicU64,
    /// Receipts for chunk writes issued eagerly at append boundaries.
    pub(crate) pending: Mutex<Vec<PendingWrite>>,
    /// `(position, address)` pairs not yet folded into the address map.
    pub(crate) new_vec_chunks: Mutex<Vec<(u64, Uuid)>>,
    /// Mirror sink while an online compaction is running.
    pub(crate) delta: RwLock<Option<Arc<DeltaSink>>>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("branch", &self.branch)
            .field("read_only", &self.read_only)
            .field("is_fork", &self.is_fork)
            .finish_non_exhaustive()
    }
}

pub(crate) fn edge_key(layer: usize, chunk_idx: usize) -> ExternalId {
    ExternalId::Int(((layer as i64) << 32) | chunk_idx as i64)
}

pub(crate) fn decode_edge_key(key: &ExternalId) -> Option<(usize, usize)> {
    match key {
        ExternalId::Int(v) => Some(((*v >> 32) as usize, (*v & 0xffff_ffff) as usize)),
        _ => None,
    }
}

fn mmap_path_for(opts: &IndexOptions, branch: &str) -> Option<PathBuf> {
    let dir = opts.mmap_dir.clone().or_else(|| {
        opts.store
            .as_ref()
            .and_then(|s| s.path.as_ref())
            .map(|root| root.join("mmap"))
    })?;
    Some(dir.join(format!("{branch}.mmap")))
}

impl Index {
    // ===== Construction =====

    /// Create a fresh, empty index.
    pub fn create(opts: IndexOptions) -> Result<Self> {
        opts.validate("create")?;
        let store: StoreHandle = match &opts.store {
            Some(store_opts) => open_store(store_opts, "create")?,
            // Scratch index: same code paths over an in-process store
            None => Arc::new(MemStore::new()),
        };
        put_json(&*store, CONFIG_KEY, &opts, "create")?;

        let branch = opts.branch_or_default().to_string();
        let path = mmap_path_for(&opts, &branch);
        let vectors = VectorStore::create(
            path.as_deref(),
            opts.dim,
            opts.vector_chunk_size_or_default(),
        )?;
        Self::assemble(opts, store, vectors, branch, None, false, false)
    }

    /// Open the head of a branch from persistent storage.
    pub fn open(opts: IndexOptions) -> Result<Self> {
        opts.validate("load")?;
        let store_opts = opts.store.clone().ok_or(ProximumError::ConfigInvalid {
            op: "load",
            reason: "store config required to load".into(),
        })?;
        let store = open_store(&store_opts, "load")?;

        // The stored config is authoritative for structural parameters;
        // the caller picks paths and branch.
        let mut eff = crate::store::get_json::<IndexOptions>(&*store, CONFIG_KEY, "load")?
            .unwrap_or_else(|| opts.clone());
        eff.store = Some(store_opts);
        eff.mmap_dir = opts.mmap_dir.clone().or(eff.mmap_dir);
        eff.branch = opts.branch.clone().or(eff.branch);

        let branch = eff.branch_or_default().to_string();
        let head = commit::load_branch_head(&*store, &branch)?;
        Self::hydrate(eff, store, head, false)
    }

    /// Reopen a historical commit, read-only. Writes require a `fork`
    /// or a `branch` first.
    pub fn load_commit(&self, id: Uuid) -> Result<Self> {
        let head = commit::load_commit(&*self.store, id)?;
        Self::hydrate(self.opts.clone(), self.store.clone(), head, true)
    }

    fn hydrate(
        opts: IndexOptions,
        store: StoreHandle,
        head: Commit,
        read_only: bool,
    ) -> Result<Self> {
        let pool = Arc::new(WritePool::new(store.clone()));
        let node_cache = Arc::new(NodeCache::new(
            store.clone(),
            pool.clone(),
            opts.cache_size_or_default(),
        ));
        let vec_addrs = Pss::load(head.vectors_addr_root, node_cache.clone());

        let chunk_size = opts.vector_chunk_size_or_default();
        let path = mmap_path_for(&opts, &head.branch);
        let vectors = match &path {
            Some(p) if p.exists() => {
                if read_only {
                    VectorStore::open_read_only(p, opts.dim, chunk_size, head.vector_count as usize)?
                } else {
                    let mut vs = VectorStore::open(p, opts.dim, chunk_size)?;
                    vs.clamp_to(head.vector_count as usize);
                    vs
                }
            }
            _ => {
                // No branch file (mem backend, or moved store): rebuild the
                // region from the authoritative KV chunks.
                let target = if read_only { None } else { path.as_deref() };
                let mut vs = VectorStore::create(target, opts.dim, chunk_size)?;
                for (key, value) in vec_addrs.entries()? {
                    let addr = value.as_address().ok_or_else(|| {
                        ProximumError::io(
                            "load",
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "address map holds a non-address value",
                            ),
                        )
                    })?;
                    let bytes =
                        store
                            .get(&addr.to_string())?
                            .ok_or(ProximumError::ChunkUnavailable {
                                op: "load",
                                address: addr,
                            })?;
                    let floats: Vec<f32> = bytes
                        .chunks_exact(4)
                        .map(|b| f32::from_le_bytes(b.try_into().expect("4-byte chunk")))
                        .collect();
                    tracing::trace!(chunk = %key, rows = floats.len() / opts.dim, "rehydrated vector chunk");
                    for row in floats.chunks_exact(opts.dim) {
                        if vs.count() < head.vector_count as usize {
                            vs.append(row)?;
                        }
                    }
                }
                vs.mark_all_flushed();
                vs
            }
        };

        let branch = head.branch.clone();
        let mut index = Self::assemble(opts, store, vectors, branch, Some(head), read_only, false)?;
        index.node_cache = node_cache;
        index.pool = pool;
        // Rebind the PSS handles to the shared cache built above
        {
            let head = index.commit.read().clone().expect("hydrated commit");
            *index.meta.write() = Pss::load(head.metadata_root, index.node_cache.clone());
            *index.ext.write() = Pss::load(head.external_id_root, index.node_cache.clone());
            *index.vec_addrs.write() = Pss::load(head.vectors_addr_root, index.node_cache.clone());
            *index.edge_addrs.write() = Pss::load(head.edges_addr_root, index.node_cache.clone());
            for (key, value) in index.edge_addrs.read().entries()? {
                if let (Some((layer, chunk_idx)), Some(addr)) =
                    (decode_edge_key(&key), value.as_address())
                {
                    index.edges.seed_chunk(layer, chunk_idx, addr);
                }
            }
            index.edges.seed_deleted(head.deleted.clone());
        }
        Ok(index)
    }

    fn assemble(
        opts: IndexOptions,
        store: StoreHandle,
        vectors: VectorStore,
        branch: String,
        head: Option<Commit>,
        read_only: bool,
        is_fork: bool,
    ) -> Result<Self> {
        let params = GraphParams {
            m: opts.m_or_default(),
            m0: opts.m0(),
            ef_construction: opts.ef_construction_or_default(),
            ef_search: opts.ef_search_or_default(),
            max_levels: opts.max_levels_or_derived(),
            distance: opts.distance_or_default(),
        };
        let pool = Arc::new(WritePool::new(store.clone()));
        let node_cache = Arc::new(NodeCache::new(
            store.clone(),
            pool.clone(),
            opts.cache_size_or_default(),
        ));
        let edges = EdgeStore::new(
            opts.edge_chunk_size_or_default(),
            params.m,
            Arc::new(KvChunkSource::new(store.clone())),
        );
        edges.as_transient();

        let entry = match &head {
            Some(c) => match c.entrypoint {
                Some(node) => EntryPoint {
                    node,
                    level: c.max_level as usize,
                },
                None => EntryPoint::empty(),
            },
            None => EntryPoint::empty(),
        };
        let deleted = head.as_ref().map(|c| c.deleted_count).unwrap_or(0);
        let rng = SmallRng::seed_from_u64(opts.level_seed_or_default());

        Ok(Index {
            meta: RwLock::new(Pss::new(node_cache.clone())),
            ext: RwLock::new(Pss::new(node_cache.clone())),
            vec_addrs: RwLock::new(Pss::new(node_cache.clone())),
            edge_addrs: RwLock::new(Pss::new(node_cache.clone())),
            params,
            vectors: RwLock::new(vectors),
            edges: Arc::new(edges),
            entry: RwLock::new(entry),
            rng: Mutex::new(rng),
            branch,
            commit: Arc::new(RwLock::new(head)),
            read_only,
            is_fork,
            deleted: AtomicU64::new(deleted),
            pending: Mutex::new(Vec::new()),
            new_vec_chunks: Mutex::new(Vec::new()),
            delta: RwLock::new(None),
            node_cache,
            pool,
            store,
            opts,
        })
    }

    // ===== Accessors =====

    pub fn options(&self) -> &IndexOptions {
        &self.opts
    }

    pub fn current_branch(&self) -> &str {
        &self.branch
    }

    pub fn current_commit(&self) -> Option<Commit> {
        self.commit.read().clone()
    }

    /// Live (non-deleted) vector count.
    pub fn count(&self) -> usize {
        self.vector_count() - self.deleted_count()
    }

    /// Total vectors ever appended, tombstones included.
    pub fn vector_count(&self) -> usize {
        self.vectors.read().count()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::Acquire) as usize
    }

    pub fn len(&self) -> usize {
        self.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            vector_count: self.vector_count(),
            live_count: self.count(),
            deleted_count: self.deleted_count(),
            max_level: self.entry.read().level,
            branch: self.branch.clone(),
            commit: self.commit.read().as_ref().map(|c| c.id),
        }
    }

    fn guard_writable(&self, op: &'static str) -> Result<()> {
        if self.read_only {
            return Err(ProximumError::ReadOnly { op });
        }
        Ok(())
    }

    fn sample_level(&self) -> usize {
        let mut rng = self.rng.lock();
        let u: f64 = loop {
            let x: f64 = rng.random();
            if x > 0.0 {
                break x;
            }
        };
        let level = (-u.ln() * self.opts.level_mult()).floor() as usize;
        level.min(self.params.max_levels.saturating_sub(1))
    }

    fn resolve(&self, id: &ExternalId) -> Result<Option<u32>> {
        let found = self.ext.read().lookup(id)?;
        Ok(found.and_then(|v| v.as_u64()).map(|v| v as u32))
    }

    /// External id recorded for an internal id, via the metadata set.
    pub(crate) fn external_of(&self, internal: u32) -> Result<Option<ExternalId>> {
        let meta = self.meta.read();
        let entry = meta.lookup(&ExternalId::from(internal as u64))?;
        Ok(entry
            .and_then(|v| v.as_json().cloned())
            .and_then(|v| v.get(EXTERNAL_ID_FIELD).cloned())
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    pub(crate) fn record_delta(&self, make: impl FnOnce() -> DeltaOp) -> Result<()> {
        let sink = self.delta.read().clone();
        match sink {
            Some(sink) => sink.push(make()),
            None => Ok(()),
        }
    }

    // ===== Mutations =====

    /// Insert a vector under a caller-supplied external id.
    pub fn insert(&self, id: impl Into<ExternalId>, vector: &[f32]) -> Result<u32> {
        self.insert_with_metadata(id, vector, None)
    }

    /// Insert with a metadata map stored alongside the vector.
    pub fn insert_with_metadata(
        &self,
        id: impl Into<ExternalId>,
        vector: &[f32],
        metadata: Option<JsonMap<String, JsonValue>>,
    ) -> Result<u32> {
        self.guard_writable("insert")?;
        let id = id.into();
        if vector.len() != self.opts.dim {
            return Err(ProximumError::DimensionMismatch {
                op: "insert",
                expected: self.opts.dim,
                actual: vector.len(),
            });
        }

        let new_id;
        {
            // Lock order: ext -> meta -> vectors
            let mut ext = self.ext.write();
            if let Some(existing) = ext.lookup(&id)? {
                return Err(ProximumError::DuplicateExternalId {
                    op: "insert",
                    id: truncate_for_error(&id.canonical()),
                    existing: existing.as_u64().unwrap_or(0) as u32,
                });
            }
            let mut meta = self.meta.write();
            {
                let mut vectors = self.vectors.write();
                let capacity = self.opts.capacity_or_default();
                if vectors.count() >= capacity {
                    return Err(ProximumError::CapacityExceeded {
                        op: "insert",
                        used: vectors.count(),
                        limit: capacity,
                    });
                }
                new_id = vectors.append(vector)?;
                // Completed a chunk: ship it while the graph work proceeds
                if !self.is_fork
                    && vectors.count() % self.opts.vector_chunk_size_or_default() == 0
                {
                    let mut pending = self.pending.lock();
                    let written =
                        vectors.flush_full(self.opts.crypto(), &self.pool, &mut pending)?;
                    self.new_vec_chunks.lock().extend(written);
                }
            }
            *ext = ext.insert(id.clone(), PssValue::U64(new_id as u64))?;

            let mut object = metadata.clone().unwrap_or_default();
            object.insert(
                EXTERNAL_ID_FIELD.to_string(),
                serde_json::to_value(&id).map_err(|e| ProximumError::codec("insert", e))?,
            );
            *meta = meta.insert(
                ExternalId::from(new_id as u64),
                PssValue::Json(JsonValue::Object(object)),
            )?;
        }

        let level = self.sample_level();
        {
            let vectors = self.vectors.read();
            graph::insert(&self.edges, &vectors, &self.params, &self.entry, new_id, level)?;
        }
        tracing::trace!(internal = new_id, level, "inserted vector");

        self.record_delta(|| DeltaOp::Insert {
            id,
            vector: vector.to_vec(),
            metadata,
        })?;
        Ok(new_id)
    }

    /// Parallel batch insert over the striped-lock engine.
    pub fn insert_batch(
        &self,
        items: Vec<(ExternalId, Vec<f32>)>,
    ) -> Result<usize> {
        use rayon::prelude::*;
        let inserted = items
            .into_par_iter()
            .map(|(id, vector)| self.insert(id, &vector).map(|_| 1usize))
            .try_reduce(|| 0, |a, b| Ok(a + b))?;
        tracing::debug!(inserted, "batch insert complete");
        Ok(inserted)
    }

    /// Tombstone a vector. The graph keeps it as a waypoint until
    /// compaction; search never returns it.
    pub fn delete(&self, id: impl Into<ExternalId>) -> Result<()> {
        self.guard_writable("delete")?;
        let id = id.into();
        let internal = self.resolve(&id)?.ok_or_else(|| ProximumError::NotFound {
            op: "delete",
            what: "external id",
            key: truncate_for_error(&id.canonical()),
        })?;
        if !self.edges.is_deleted(internal) {
            self.edges.mark_deleted(internal);
            self.deleted.fetch_add(1, Ordering::AcqRel);
            self.repair_entrypoint(internal)?;
        }
        self.record_delta(|| DeltaOp::Delete { id })?;
        Ok(())
    }

    /// Keep the entry point on a live node: a tombstoned entry still
    /// works as a waypoint, but committed snapshots promise a
    /// non-deleted entrypoint. Prefers a neighbor of the old entry at
    /// the highest layer that has one.
    fn repair_entrypoint(&self, removed: u32) -> Result<()> {
        if self.entry.read().node != removed {
            return Ok(());
        }
        let level = self.entry.read().level;
        let mut replacement = None;
        'scan: for layer in (0..=level).rev() {
            for u in self.edges.neighbors(layer, removed)?.iter() {
                if !self.edges.is_deleted(u) {
                    replacement = Some(EntryPoint { node: u, level: layer });
                    break 'scan;
                }
            }
        }
        if replacement.is_none() {
            // No live neighbor anywhere: fall back to a scan
            let count = self.vectors.read().count() as u32;
            replacement = (0..count)
                .find(|&n| !self.edges.is_deleted(n))
                .map(|node| EntryPoint { node, level: 0 });
        }
        let mut entry = self.entry.write();
        if entry.node == removed {
            *entry = replacement.unwrap_or_else(EntryPoint::empty);
        }
        Ok(())
    }

    /// Fetch a vector by external id. `None` once deleted.
    pub fn get(&self, id: impl Into<ExternalId>) -> Result<Option<Vec<f32>>> {
        let id = id.into();
        let internal = match self.resolve(&id)? {
            Some(internal) if !self.edges.is_deleted(internal) => internal,
            _ => return Ok(None),
        };
        Ok(Some(self.vectors.read().vector(internal).to_vec()))
    }

    /// Fetch the metadata map (without the internal bookkeeping field).
    pub fn get_metadata(
        &self,
        id: impl Into<ExternalId>,
    ) -> Result<Option<JsonMap<String, JsonValue>>> {
        let id = id.into();
        let internal = match self.resolve(&id)? {
            Some(internal) if !self.edges.is_deleted(internal) => internal,
            _ => return Ok(None),
        };
        let entry = self.meta.read().lookup(&ExternalId::from(internal as u64))?;
        Ok(entry
            .and_then(|v| v.as_json().cloned())
            .and_then(|v| match v {
                JsonValue::Object(mut map) => {
                    map.remove(EXTERNAL_ID_FIELD);
                    Some(map)
                }
                _ => None,
            }))
    }

    /// Replace the metadata map for an existing, live vector.
    pub fn set_metadata(
        &self,
        id: impl Into<ExternalId>,
        metadata: JsonMap<String, JsonValue>,
    ) -> Result<()> {
        self.guard_writable("set_metadata")?;
        let id = id.into();
        let internal = match self.resolve(&id)? {
            Some(internal) if !self.edges.is_deleted(internal) => internal,
            _ => {
                return Err(ProximumError::NotFound {
                    op: "set_metadata",
                    what: "external id",
                    key: truncate_for_error(&id.canonical()),
                })
            }
        };
        {
            let mut meta = self.meta.write();
            let mut object = metadata.clone();
            object.insert(
                EXTERNAL_ID_FIELD.to_string(),
                serde_json::to_value(&id).map_err(|e| ProximumError::codec("set_metadata", e))?,
            );
            *meta = meta.insert(
                ExternalId::from(internal as u64),
                PssValue::Json(JsonValue::Object(object)),
            )?;
        }
        self.record_delta(|| DeltaOp::SetMetadata { id, metadata })?;
        Ok(())
    }

    pub fn contains(&self, id: impl Into<ExternalId>) -> Result<bool> {
        let id = id.into();
        Ok(match self.resolve(&id)? {
            Some(internal) => !self.edges.is_deleted(internal),
            None => false,
        })
    }

    // ===== Search =====

    /// k-nearest neighbors: `(external_id, distance)` ascending.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(ExternalId, f32)>> {
        self.search_with(query, k, &SearchOptions::default())
    }

    pub fn search_with(
        &self,
        query: &[f32],
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<(ExternalId, f32)>> {
        self.search_inner(query, k, opts, None)
    }

    /// Search restricted to an allow-set of external ids. An empty set
    /// short-circuits to no results without touching the graph.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        opts: &SearchOptions,
        allowed: &[ExternalId],
    ) -> Result<Vec<(ExternalId, f32)>> {
        if allowed.is_empty() {
            return Ok(Vec::new());
        }
        let mut internal = HashSet::with_capacity(allowed.len());
        for id in allowed {
            if let Some(node) = self.resolve(id)? {
                internal.insert(node);
            }
        }
        if internal.is_empty() {
            return Ok(Vec::new());
        }
        self.search_inner(query, k, opts, Some(&internal))
    }

    fn search_inner(
        &self,
        query: &[f32],
        k: usize,
        opts: &SearchOptions,
        filter: Option<&HashSet<u32>>,
    ) -> Result<Vec<(ExternalId, f32)>> {
        if query.len() != self.opts.dim {
            return Err(ProximumError::DimensionMismatch {
                op: "search",
                expected: self.opts.dim,
                actual: query.len(),
            });
        }
        let entry = *self.entry.read();
        let hits = {
            let vectors = self.vectors.read();
            graph::search(&self.edges, &vectors, &self.params, entry, query, k, opts, filter)?
        };
        // Translate after releasing the vector lock (metadata lookups
        // never nest inside it)
        let mut out = Vec::with_capacity(hits.len());
        for (internal, dist) in hits {
            match self.external_of(internal)? {
                Some(id) => out.push((id, dist)),
                None => tracing::warn!(internal, "hit without a metadata entry, dropping"),
            }
        }
        Ok(out)
    }

    // ===== Versioning =====

    /// In-memory snapshot fork: O(chunks). The fork accepts writes but
    /// must be materialized with [`Index::branch`] to persist them.
    pub fn fork(&self) -> Result<Index> {
        let vectors = self.vectors.read().fork()?;
        let edges = Arc::new(self.edges.fork());
        let rng = SmallRng::clone(&self.rng.lock());
        Ok(Index {
            opts: self.opts.clone(),
            params: self.params,
            store: self.store.clone(),
            pool: self.pool.clone(),
            node_cache: self.node_cache.clone(),
            vectors: RwLock::new(vectors),
            edges,
            entry: RwLock::new(*self.entry.read()),
            meta: RwLock::new(self.meta.read().clone()),
            ext: RwLock::new(self.ext.read().clone()),
            vec_addrs: RwLock::new(self.vec_addrs.read().clone()),
            edge_addrs: RwLock::new(self.edge_addrs.read().clone()),
            rng: Mutex::new(rng),
            branch: self.branch.clone(),
            commit: Arc::new(RwLock::new(self.commit.read().clone())),
            read_only: false,
            is_fork: true,
            deleted: AtomicU64::new(self.deleted.load(Ordering::Acquire)),
            pending: Mutex::new(Vec::new()),
            new_vec_chunks: Mutex::new(self.new_vec_chunks.lock().clone()),
            delta: RwLock::new(None),
        })
    }

    /// Commit the current state: flush vector chunks, drain dirty edge
    /// chunks, persist the four sets, then chain the snapshot record.
    /// Runs its writes through the pool; the returned handle resolves
    /// once the branch head is durable.
    pub fn sync(&self) -> Result<SyncHandle> {
        self.sync_with(SyncOptions::default())
    }

    pub fn sync_with(&self, sync_opts: SyncOptions) -> Result<SyncHandle> {
        self.guard_writable("sync")?;
        if self.is_fork {
            return Err(ProximumError::Unsynced { op: "sync" });
        }
        let crypto = self.opts.crypto();

        // Canonical lock order; holding all of them makes the commit
        // linearizable against completed mutations.
        let mut ext = self.ext.write();
        let mut meta = self.meta.write();
        let mut vectors = self.vectors.write();
        let mut vec_addrs = self.vec_addrs.write();
        let mut edge_addrs = self.edge_addrs.write();
        let mut pending: Vec<PendingWrite> = std::mem::take(&mut *self.pending.lock());

        let count = vectors.count();

        // 1. Vector chunks
        let mut new_chunks: Vec<(u64, Uuid)> = std::mem::take(&mut *self.new_vec_chunks.lock());
        new_chunks.extend(vectors.flush(crypto, &self.pool, &mut pending)?);
        for (position, addr) in &new_chunks {
            *vec_addrs = vec_addrs.insert(ExternalId::from(*position), PssValue::Address(*addr))?;
        }

        // 2. Edge chunks
        for chunk in self.edges.drain_dirty() {
            let addr = if crypto {
                chunk_address(&chunk.bytes)
            } else {
                Uuid::new_v4()
            };
            pending.push(self.pool.put_async(addr.to_string(), chunk.bytes));
            self.edges.mark_persisted(chunk.layer, chunk.chunk_idx, addr);
            *edge_addrs =
                edge_addrs.insert(edge_key(chunk.layer, chunk.chunk_idx), PssValue::Address(addr))?;
        }

        // 3. Persist the sets, swapping in the address-backed handles
        let (metadata_root, stored) = meta.persist(crypto, &mut pending)?;
        *meta = stored;
        let (external_id_root, stored) = ext.persist(crypto, &mut pending)?;
        *ext = stored;
        let (vectors_addr_root, stored) = vec_addrs.persist(crypto, &mut pending)?;
        *vec_addrs = stored;
        let (edges_addr_root, stored) = edge_addrs.persist(crypto, &mut pending)?;
        *edge_addrs = stored;

        // 4. Content hashes and commit id
        let (vectors_hash, edges_hash) = if crypto {
            (
                Some(commit::fold_chunk_hashes(&addr_entries(&vec_addrs)?)),
                Some(commit::fold_chunk_hashes(&addr_entries(&edge_addrs)?)),
            )
        } else {
            (None, None)
        };
        let prev = self.commit.read().clone();
        let parents = match sync_opts.parents {
            Some(parents) => parents,
            None => prev.iter().map(|c| c.id).collect(),
        };
        let id = if crypto {
            commit::merkle_commit_id(
                &parents,
                vectors_hash.as_deref().unwrap_or(""),
                edges_hash.as_deref().unwrap_or(""),
            )
        } else {
            Uuid::new_v4()
        };

        let entry = *self.entry.read();
        let record = Commit {
            id,
            parents,
            branch: self.branch.clone(),
            timestamp: chrono::Utc::now(),
            entrypoint: (entry.node != NIL).then_some(entry.node),
            max_level: entry.level as u32,
            deleted: self.edges.deleted_words(count),
            vector_count: count as u64,
            deleted_count: self.deleted.load(Ordering::Acquire),
            metadata_root,
            external_id_root,
            vectors_addr_root,
            edges_addr_root,
            vectors_hash,
            edges_hash,
        };
        drop((ext, meta, vectors, vec_addrs, edge_addrs));

        // 5. Completion: await every enqueued write, then publish the
        // snapshot — branch head last.
        let store = self.store.clone();
        let branch = self.branch.clone();
        let commit_cell = self.commit.clone();
        let (tx, rx) = bounded(1);
        std::thread::Builder::new()
            .name("proximum-sync".into())
            .spawn(move || {
                let result = (|| {
                    for receipt in pending {
                        receipt.wait()?;
                    }
                    put_json(&*store, &record.id.to_string(), &record, "sync")?;
                    put_json(&*store, &branch, &record, "sync")?;
                    commit::register_branch(&*store, &branch)?;
                    Ok(record.clone())
                })();
                match &result {
                    Ok(c) => {
                        *commit_cell.write() = Some(c.clone());
                        tracing::debug!(commit = %c.id, branch = %c.branch, "sync complete");
                    }
                    Err(e) => tracing::warn!(error = %e, "sync failed"),
                }
                let _ = tx.send(result);
            })
            .map_err(|e| ProximumError::io("sync", e))?;
        Ok(SyncHandle { rx })
    }

    /// Create a new branch at the current commit, with its own mmap
    /// file (reflinked when the filesystem supports it), and return an
    /// index opened on it. Requires a prior `sync`.
    pub fn branch(&self, name: &str) -> Result<Index> {
        let prev = self
            .commit
            .read()
            .clone()
            .ok_or(ProximumError::Unsynced { op: "branch" })?;
        let existing = commit::branches(&*self.store)?;
        if existing.iter().any(|b| b == name) || name == self.branch {
            return Err(ProximumError::BranchExists {
                op: "branch",
                branch: name.to_string(),
            });
        }

        let path = mmap_path_for(&self.opts, name);
        let vectors = self.vectors.read().fork_for_branch(path.as_deref())?;
        let rng = SmallRng::clone(&self.rng.lock());
        let branched = Index {
            opts: self.opts.clone(),
            params: self.params,
            store: self.store.clone(),
            pool: self.pool.clone(),
            node_cache: self.node_cache.clone(),
            vectors: RwLock::new(vectors),
            edges: Arc::new(self.edges.fork()),
            entry: RwLock::new(*self.entry.read()),
            meta: RwLock::new(self.meta.read().clone()),
            ext: RwLock::new(self.ext.read().clone()),
            vec_addrs: RwLock::new(self.vec_addrs.read().clone()),
            edge_addrs: RwLock::new(self.edge_addrs.read().clone()),
            rng: Mutex::new(rng),
            branch: name.to_string(),
            commit: Arc::new(RwLock::new(Some(prev))),
            read_only: false,
            is_fork: false,
            deleted: AtomicU64::new(self.deleted.load(Ordering::Acquire)),
            pending: Mutex::new(Vec::new()),
            new_vec_chunks: Mutex::new(self.new_vec_chunks.lock().clone()),
            delta: RwLock::new(None),
        };
        branched.edges.as_transient();
        // First snapshot of the branch, parented on the source commit
        branched.sync()?.wait()?;
        tracing::info!(branch = name, "created branch");
        Ok(branched)
    }

    /// Remove a branch reference and its mmap file. The current branch
    /// and `main` are protected; commits stay reachable until `gc`.
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        if name == self.branch || name == "main" {
            return Err(ProximumError::BranchProtected {
                op: "delete_branch",
                branch: name.to_string(),
            });
        }
        let existing = commit::branches(&*self.store)?;
        if !existing.iter().any(|b| b == name) {
            return Err(ProximumError::NotFound {
                op: "delete_branch",
                what: "branch",
                key: name.to_string(),
            });
        }
        commit::unregister_branch(&*self.store, name)?;
        self.store.delete(name)?;
        if let Some(path) = mmap_path_for(&self.opts, name) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "could not remove branch file");
                }
            }
        }
        tracing::info!(branch = name, "deleted branch");
        Ok(())
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        commit::branches(&*self.store)
    }

    // ===== History =====

    /// Parent chain from the current commit back to the root.
    pub fn history(&self) -> Result<Vec<Commit>> {
        match self.commit.read().as_ref() {
            Some(head) => commit::history(&*self.store, head.id),
            None => Ok(Vec::new()),
        }
    }

    pub fn ancestors(&self, of: Uuid) -> Result<HashSet<Uuid>> {
        commit::ancestors(&*self.store, of)
    }

    pub fn is_ancestor(&self, ancestor: Uuid, of: Uuid) -> Result<bool> {
        commit::is_ancestor(&*self.store, ancestor, of)
    }

    pub fn common_ancestor(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
        commit::common_ancestor(&*self.store, a, b)
    }

    /// Await all outstanding writes and release the index. Mapped files
    /// unmap on drop.
    pub fn close(self) -> Result<()> {
        let pending: Vec<PendingWrite> = std::mem::take(&mut *self.pending.lock());
        for receipt in pending {
            receipt.wait()?;
        }
        Ok(())
    }
}

fn addr_entries(pss: &Pss) -> Result<Vec<(u64, Uuid)>> {
    pss.entries().map(|entries| {
        entries
            .into_iter()
            .filter_map(|(key, value)| match (key, value.as_address()) {
                (ExternalId::Int(position), Some(addr)) => Some((position as u64, addr)),
                _ => None,
            })
            .collect()
    })
}
