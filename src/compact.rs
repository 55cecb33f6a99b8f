//! Compaction
//!
//! Tombstoned nodes stay in the graph as waypoints; compaction is how
//! they are finally reclaimed. Two modes:
//!
//! - **Offline**: rebuild the live set into a fresh index with dense
//!   ids and a newly constructed graph. The source is untouched.
//! - **Online**: the same rebuild runs from a fork (the snapshot at
//!   start time) on a background thread, while mutations on the source
//!   keep flowing and are mirrored into a bounded delta log. `finish`
//!   replays the log in order onto the new index and syncs it.
//!
//! The delta log is capped (`DEFAULT_MAX_DELTA` ops by default); hitting
//! the cap is a recoverable `DeltaOverflow` that advises finishing the
//! compaction sooner. On any failure the partially built index is
//! cleaned up: its mmap directory and (when it has its own store root)
//! its top-level keys are best-effort deleted.

use parking_lot::Mutex;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::IndexOptions;
use crate::error::{ProximumError, Result};
use crate::index::{Index, EXTERNAL_ID_FIELD};
use crate::pss::ExternalId;
use crate::store::KvStore;

/// Default cap on the online-compaction delta log.
pub const DEFAULT_MAX_DELTA: usize = 100_000;

/// One mirrored mutation.
pub(crate) enum DeltaOp {
    Insert {
        id: ExternalId,
        vector: Vec<f32>,
        metadata: Option<JsonMap<String, JsonValue>>,
    },
    Delete {
        id: ExternalId,
    },
    SetMetadata {
        id: ExternalId,
        metadata: JsonMap<String, JsonValue>,
    },
}

/// Bounded mirror of mutations during an online compaction.
pub(crate) struct DeltaSink {
    cap: usize,
    ops: Mutex<Vec<DeltaOp>>,
    overflowed: AtomicBool,
}

impl DeltaSink {
    pub(crate) fn new(cap: usize) -> Self {
        DeltaSink {
            cap,
            ops: Mutex::new(Vec::new()),
            overflowed: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, op: DeltaOp) -> Result<()> {
        let mut ops = self.ops.lock();
        if ops.len() >= self.cap {
            self.overflowed.store(true, Ordering::Release);
            return Err(ProximumError::DeltaOverflow {
                op: "compact_online",
                cap: self.cap,
            });
        }
        ops.push(op);
        Ok(())
    }

    fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    fn drain(&self) -> Vec<DeltaOp> {
        std::mem::take(&mut *self.ops.lock())
    }
}

/// Derive target options from the source: identical structural
/// parameters, capacity defaulted to the live count.
fn resolve_target(source: &Index, mut target: IndexOptions) -> Result<IndexOptions> {
    let src = source.options();
    if target.dim != src.dim {
        return Err(ProximumError::ConfigInvalid {
            op: "compact",
            reason: format!(
                "target dim {} differs from source dim {}",
                target.dim, src.dim
            ),
        });
    }
    target.m = target.m.or(src.m);
    target.ef_construction = target.ef_construction.or(src.ef_construction);
    target.ef_search = target.ef_search.or(src.ef_search);
    target.distance = target.distance.or(src.distance);
    target.crypto_hash = target.crypto_hash.or(src.crypto_hash);
    target.vector_chunk_size = target.vector_chunk_size.or(src.vector_chunk_size);
    target.edge_chunk_size = target.edge_chunk_size.or(src.edge_chunk_size);
    target.cache_size = target.cache_size.or(src.cache_size);
    target.level_seed = target.level_seed.or(src.level_seed);
    if target.capacity.is_none() {
        target.capacity = Some(source.count().max(1));
    }
    Ok(target)
}

/// Copy every live vector of `snapshot`, in internal-id order, into
/// `target` with its metadata. Dense ids come out the other side.
fn copy_live(snapshot: &Index, target: &Index, abort: Option<&AtomicBool>) -> Result<usize> {
    let entries = snapshot.meta.read().entries()?;
    let mut copied = 0usize;
    for (key, value) in entries {
        if let Some(abort) = abort {
            if abort.load(Ordering::Acquire) {
                return Err(ProximumError::io(
                    "compact_online",
                    std::io::Error::other("online compaction aborted"),
                ));
            }
        }
        let internal = match &key {
            ExternalId::Int(v) => *v as u32,
            _ => continue,
        };
        if snapshot.edges.is_deleted(internal) {
            continue;
        }
        let object = match value.as_json() {
            Some(JsonValue::Object(map)) => map.clone(),
            _ => continue,
        };
        let external = match object
            .get(EXTERNAL_ID_FIELD)
            .cloned()
            .and_then(|v| serde_json::from_value::<ExternalId>(v).ok())
        {
            Some(id) => id,
            None => continue,
        };
        let mut metadata = object;
        metadata.remove(EXTERNAL_ID_FIELD);
        let vector = snapshot.vectors.read().vector(internal).to_vec();
        let metadata = (!metadata.is_empty()).then_some(metadata);
        target.insert_with_metadata(external, &vector, metadata)?;
        copied += 1;
    }
    Ok(copied)
}

/// Best-effort teardown of a partially built target.
fn cleanup_target(target_opts: &IndexOptions, source: &Index) {
    if let Some(dir) = &target_opts.mmap_dir {
        let _ = std::fs::remove_dir_all(dir);
    }
    let own_store = match (&target_opts.store, &source.options().store) {
        (Some(t), Some(s)) => t.id != s.id,
        (Some(_), None) => true,
        _ => false,
    };
    if own_store {
        if let Ok(store) = crate::store::open_store(
            target_opts.store.as_ref().expect("checked above"),
            "compact",
        ) {
            let branch = target_opts.branch_or_default();
            let _ = store.delete(crate::store::CONFIG_KEY);
            let _ = store.delete(crate::store::BRANCHES_KEY);
            let _ = store.delete(branch);
        }
    }
}

/// Handle to a running online compaction.
pub struct OnlineCompaction {
    worker: JoinHandle<Result<Index>>,
    abort: Arc<AtomicBool>,
    sink: Arc<DeltaSink>,
    target_opts: IndexOptions,
}

impl OnlineCompaction {
    /// Request a cooperative abort; `finish` will fail and clean up.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Wait for the background copy, replay the delta log in order, and
    /// sync the new index. The source stops mirroring once this runs.
    pub fn finish(self, source: &Index) -> Result<Index> {
        *source.delta.write() = None;
        let copied = self
            .worker
            .join()
            .map_err(|_| {
                ProximumError::io(
                    "compact_online",
                    std::io::Error::other("compaction worker panicked"),
                )
            })?;
        let target = match copied {
            Ok(target) => target,
            Err(e) => {
                cleanup_target(&self.target_opts, source);
                return Err(e);
            }
        };
        if self.sink.overflowed() {
            cleanup_target(&self.target_opts, source);
            return Err(ProximumError::DeltaOverflow {
                op: "compact_online",
                cap: self.sink.cap,
            });
        }

        // Replay strictly in log order. An insert that raced the fork
        // boundary may already be present from the copy; that replay is
        // a no-op. Deletes and metadata updates resolve against both
        // copied and replayed ids by external identity.
        let ops = self.sink.drain();
        let replayed = ops.len();
        for op in ops {
            match op {
                DeltaOp::Insert {
                    id,
                    vector,
                    metadata,
                } => match target.insert_with_metadata(id, &vector, metadata) {
                    Ok(_) => {}
                    Err(ProximumError::DuplicateExternalId { .. }) => {}
                    Err(e) => {
                        cleanup_target(&self.target_opts, source);
                        return Err(e);
                    }
                },
                DeltaOp::Delete { id } => match target.delete(id) {
                    Ok(_) | Err(ProximumError::NotFound { .. }) => {}
                    Err(e) => {
                        cleanup_target(&self.target_opts, source);
                        return Err(e);
                    }
                },
                DeltaOp::SetMetadata { id, metadata } => {
                    match target.set_metadata(id, metadata) {
                        Ok(_) | Err(ProximumError::NotFound { .. }) => {}
                        Err(e) => {
                            cleanup_target(&self.target_opts, source);
                            return Err(e);
                        }
                    }
                }
            }
        }
        tracing::info!(replayed, "online compaction delta replay complete");
        target.sync()?.wait()?;
        Ok(target)
    }
}

impl Index {
    /// Offline compaction: rebuild the live set into a fresh index with
    /// dense ids and a newly built graph. `target` supplies the new
    /// store/mmap locations; structural parameters are inherited.
    pub fn compact(&self, target: IndexOptions) -> Result<Index> {
        let target_opts = resolve_target(self, target)?;
        let snapshot = self.fork()?;
        let new = Index::create(target_opts.clone())?;
        match copy_live(&snapshot, &new, None) {
            Ok(copied) => {
                tracing::info!(copied, "offline compaction complete");
                Ok(new)
            }
            Err(e) => {
                cleanup_target(&target_opts, self);
                Err(e)
            }
        }
    }

    /// Start a zero-downtime compaction: a fork of the current state is
    /// copied on a background thread while this index keeps serving
    /// reads and mirrors writes into a bounded delta log.
    pub fn compact_online(
        &self,
        target: IndexOptions,
        max_delta_size: Option<usize>,
    ) -> Result<OnlineCompaction> {
        let target_opts = resolve_target(self, target)?;
        let sink = Arc::new(DeltaSink::new(max_delta_size.unwrap_or(DEFAULT_MAX_DELTA)));
        // Mirror first, then snapshot: an op landing between the two is
        // both copied and logged, and replay tolerates the duplicate.
        *self.delta.write() = Some(sink.clone());
        let snapshot = self.fork()?;
        let abort = Arc::new(AtomicBool::new(false));

        let worker_abort = abort.clone();
        let worker_opts = target_opts.clone();
        let worker = std::thread::Builder::new()
            .name("proximum-compact".into())
            .spawn(move || {
                let target = Index::create(worker_opts)?;
                let copied = copy_live(&snapshot, &target, Some(&worker_abort))?;
                tracing::debug!(copied, "background copy complete");
                Ok(target)
            })
            .map_err(|e| ProximumError::io("compact_online", e))?;

        Ok(OnlineCompaction {
            worker,
            abort,
            sink,
            target_opts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(dim: usize) -> IndexOptions {
        let mut opts = IndexOptions::new(dim);
        opts.m = Some(4);
        opts.ef_construction = Some(32);
        opts.ef_search = Some(16);
        opts
    }

    #[test]
    fn test_offline_compact_densifies() {
        let index = Index::create(opts(2)).unwrap();
        for i in 0..100i64 {
            index.insert(i, &[i as f32, 0.0]).unwrap();
        }
        for i in 0..40i64 {
            index.delete(i * 2).unwrap();
        }
        assert_eq!(index.count(), 60);

        let compacted = index.compact(opts(2)).unwrap();
        assert_eq!(compacted.count(), 60);
        assert_eq!(compacted.deleted_count(), 0);
        assert_eq!(compacted.vector_count(), 60);

        // Survivors keep their bytes; the deleted stay gone
        assert_eq!(compacted.get(1i64).unwrap(), Some(vec![1.0, 0.0]));
        assert_eq!(compacted.get(0i64).unwrap(), None);
        assert_eq!(compacted.get(78i64).unwrap(), None);
        assert_eq!(compacted.get(99i64).unwrap(), Some(vec![99.0, 0.0]));
    }

    #[test]
    fn test_offline_compact_preserves_metadata() {
        let index = Index::create(opts(2)).unwrap();
        let mut map = JsonMap::new();
        map.insert("tag".into(), JsonValue::String("keep".into()));
        index
            .insert_with_metadata("a", &[1.0, 0.0], Some(map))
            .unwrap();
        index.insert("b", &[0.0, 1.0]).unwrap();
        index.delete("b").unwrap();

        let compacted = index.compact(opts(2)).unwrap();
        let got = compacted.get_metadata("a").unwrap().unwrap();
        assert_eq!(got.get("tag"), Some(&JsonValue::String("keep".into())));
        assert!(compacted.get_metadata("b").unwrap().is_none());
    }

    #[test]
    fn test_compact_inherits_chunking_from_source() {
        let mut src_opts = opts(2);
        src_opts.vector_chunk_size = Some(4);
        src_opts.edge_chunk_size = Some(8);
        let index = Index::create(src_opts).unwrap();
        for i in 0..20i64 {
            index.insert(i, &[i as f32, 0.0]).unwrap();
        }
        index.delete(3i64).unwrap();

        // Minimal target: unset chunk sizes inherit from the source
        // rather than falling back to the defaults
        let compacted = index.compact(IndexOptions::new(2)).unwrap();
        assert_eq!(compacted.options().vector_chunk_size_or_default(), 4);
        assert_eq!(compacted.options().edge_chunk_size_or_default(), 8);

        // The durable chunking granularity follows: 19 live vectors at
        // 4 per chunk is 5 chunks, not 1 chunk of the default 1000
        compacted.sync().unwrap().wait().unwrap();
        let chunks = compacted.vec_addrs.read().entries().unwrap().len();
        assert_eq!(chunks, 5);
    }

    #[test]
    fn test_compact_rejects_dim_change() {
        let index = Index::create(opts(2)).unwrap();
        let err = index.compact(opts(3)).unwrap_err();
        assert!(matches!(err, ProximumError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_online_compact_replays_concurrent_writes() {
        let index = Index::create(opts(2)).unwrap();
        for i in 0..50i64 {
            index.insert(i, &[i as f32, 0.0]).unwrap();
        }
        index.delete(10i64).unwrap();

        let running = index.compact_online(opts(2), None).unwrap();
        // Writes during the copy get mirrored
        index.insert(100i64, &[100.0, 0.0]).unwrap();
        index.delete(20i64).unwrap();
        index.delete(100i64).unwrap();
        index.insert(101i64, &[101.0, 0.0]).unwrap();

        let compacted = running.finish(&index).unwrap();
        assert_eq!(compacted.get(100i64).unwrap(), None, "delete after insert lands");
        assert_eq!(compacted.get(101i64).unwrap(), Some(vec![101.0, 0.0]));
        assert_eq!(compacted.get(20i64).unwrap(), None);
        assert_eq!(compacted.get(10i64).unwrap(), None);
        assert_eq!(compacted.get(30i64).unwrap(), Some(vec![30.0, 0.0]));
        // 50 - 2 deleted(10, 20) + 101 inserted, 100 insert+delete nets out
        assert_eq!(compacted.count(), 49);
        // The source stops mirroring after finish
        index.insert(102i64, &[102.0, 0.0]).unwrap();
        assert_eq!(compacted.get(102i64).unwrap(), None);
    }

    #[test]
    fn test_online_compact_delta_overflow() {
        let index = Index::create(opts(2)).unwrap();
        for i in 0..10i64 {
            index.insert(i, &[i as f32, 0.0]).unwrap();
        }
        let running = index.compact_online(opts(2), Some(2)).unwrap();
        index.insert(100i64, &[0.0, 0.0]).unwrap();
        index.insert(101i64, &[0.0, 1.0]).unwrap();
        // Third mirrored op exceeds the cap and errors at the source
        let err = index.insert(102i64, &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, ProximumError::DeltaOverflow { .. }));

        let err = running.finish(&index).unwrap_err();
        assert!(matches!(err, ProximumError::DeltaOverflow { .. }));
    }

    #[test]
    fn test_online_compact_abort() {
        let index = Index::create(opts(2)).unwrap();
        for i in 0..200i64 {
            index.insert(i, &[i as f32, (i % 7) as f32]).unwrap();
        }
        let running = index.compact_online(opts(2), None).unwrap();
        running.abort();
        let result = running.finish(&index);
        // Either the copy finished before the abort landed, or it
        // aborted cleanly; it must not hang or corrupt the source.
        if result.is_err() {
            assert_eq!(index.count(), 200);
        }
    }
}
