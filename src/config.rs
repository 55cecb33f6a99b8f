//! Index configuration
//!
//! `IndexOptions` is the single knob surface for creating or opening an
//! index. Unset fields fall back to the documented defaults via the
//! `*_or_default` accessors; `validate` runs once at open/create time and
//! rejects bad dimensions, missing store ids, and unknown backends before
//! any file is touched.
//!
//! The stored form (under the `index/config` key) is the serde
//! serialization of this struct, so a reopened index always sees the
//! parameters it was built with.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{ProximumError, Result};

/// Distance metric for vector comparison.
///
/// Cosine assumes externally normalized inputs (the index never
/// renormalizes). Inner product is converted to a distance as `-<a,b>` so
/// that "smaller is closer" holds for all three metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DistanceKind {
    /// Squared Euclidean distance (no square root).
    #[default]
    SquaredL2,
    /// Cosine distance, `1 - <a,b>` on normalized inputs.
    Cosine,
    /// Negated inner product.
    InnerProduct,
}

/// Storage backend selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Backend name: `"file"` or `"mem"`. Anything else is rejected with
    /// `ConfigInvalid` (S3 and friends live behind the same contract but
    /// outside this crate).
    pub backend: String,
    /// Root path for the `file` backend. Ignored by `mem`.
    pub path: Option<PathBuf>,
    /// Stable identity of this storage root. Required: two indices with
    /// the same id share one physical store.
    pub id: Option<Uuid>,
}

impl StoreOptions {
    /// In-memory store (tests, scratch indices).
    pub fn mem() -> Self {
        StoreOptions {
            backend: "mem".into(),
            path: None,
            id: Some(Uuid::new_v4()),
        }
    }

    /// File-backed store rooted at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        StoreOptions {
            backend: "file".into(),
            path: Some(path.into()),
            id: Some(Uuid::new_v4()),
        }
    }
}

/// Options accepted at index creation.
///
/// Only `dim` (and `store` for persistence) are required; everything else
/// has a default matching the HNSW literature values the index was tuned
/// with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Vector dimensionality. Required, must be non-zero.
    pub dim: usize,
    /// Upper-layer neighbor cap. Layer 0 allows `2 * m`.
    pub m: Option<usize>,
    /// Build-time beam width.
    pub ef_construction: Option<usize>,
    /// Default search beam width.
    pub ef_search: Option<usize>,
    /// Maximum node count. Also governs the derived level cap.
    pub capacity: Option<usize>,
    /// Distance metric.
    pub distance: Option<DistanceKind>,
    /// Backing store. Required for any persistence operation.
    pub store: Option<StoreOptions>,
    /// Directory holding per-branch mmap files.
    pub mmap_dir: Option<PathBuf>,
    /// Initial branch name.
    pub branch: Option<String>,
    /// Content-addressable mode: chunk/PSS addresses and commit ids become
    /// SHA-512-derived hashes, enabling dedup and tamper detection.
    pub crypto_hash: Option<bool>,
    /// Vectors per persisted vector chunk.
    pub vector_chunk_size: Option<usize>,
    /// Nodes per edge chunk (CoW granularity).
    pub edge_chunk_size: Option<usize>,
    /// LRU bound for the PSS node cache.
    pub cache_size: Option<usize>,
    /// Seed for the level-sampling RNG. Fixed by default so that replaying
    /// the same insert sequence reproduces the same graph (and, in crypto
    /// mode, the same commit hashes).
    pub level_seed: Option<u64>,
    /// Hard cap on layer count. Derived from capacity when unset.
    pub max_levels: Option<usize>,
}

impl IndexOptions {
    pub const DEFAULT_M: usize = 16;
    pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
    pub const DEFAULT_EF_SEARCH: usize = 50;
    pub const DEFAULT_CAPACITY: usize = 10_000_000;
    pub const DEFAULT_VECTOR_CHUNK_SIZE: usize = 1000;
    pub const DEFAULT_EDGE_CHUNK_SIZE: usize = 1024;
    pub const DEFAULT_CACHE_SIZE: usize = 10_000;
    pub const DEFAULT_LEVEL_SEED: u64 = 42;

    /// Minimal options for an in-memory index of the given dimensionality.
    pub fn new(dim: usize) -> Self {
        IndexOptions {
            dim,
            m: None,
            ef_construction: None,
            ef_search: None,
            capacity: None,
            distance: None,
            store: None,
            mmap_dir: None,
            branch: None,
            crypto_hash: None,
            vector_chunk_size: None,
            edge_chunk_size: None,
            cache_size: None,
            level_seed: None,
            max_levels: None,
        }
    }

    pub fn m_or_default(&self) -> usize {
        self.m.unwrap_or(Self::DEFAULT_M)
    }

    /// Layer-0 cap: `2 * m`.
    pub fn m0(&self) -> usize {
        2 * self.m_or_default()
    }

    pub fn ef_construction_or_default(&self) -> usize {
        self.ef_construction.unwrap_or(Self::DEFAULT_EF_CONSTRUCTION)
    }

    pub fn ef_search_or_default(&self) -> usize {
        self.ef_search.unwrap_or(Self::DEFAULT_EF_SEARCH)
    }

    pub fn capacity_or_default(&self) -> usize {
        self.capacity.unwrap_or(Self::DEFAULT_CAPACITY)
    }

    pub fn distance_or_default(&self) -> DistanceKind {
        self.distance.unwrap_or_default()
    }

    pub fn branch_or_default(&self) -> &str {
        self.branch.as_deref().unwrap_or("main")
    }

    pub fn crypto(&self) -> bool {
        self.crypto_hash.unwrap_or(false)
    }

    pub fn vector_chunk_size_or_default(&self) -> usize {
        self.vector_chunk_size
            .unwrap_or(Self::DEFAULT_VECTOR_CHUNK_SIZE)
    }

    pub fn edge_chunk_size_or_default(&self) -> usize {
        self.edge_chunk_size.unwrap_or(Self::DEFAULT_EDGE_CHUNK_SIZE)
    }

    pub fn cache_size_or_default(&self) -> usize {
        self.cache_size.unwrap_or(Self::DEFAULT_CACHE_SIZE)
    }

    pub fn level_seed_or_default(&self) -> u64 {
        self.level_seed.unwrap_or(Self::DEFAULT_LEVEL_SEED)
    }

    /// Level cap: explicit `max_levels`, or `ceil(log_m(capacity))`.
    pub fn max_levels_or_derived(&self) -> usize {
        if let Some(levels) = self.max_levels {
            return levels.max(1);
        }
        let m = self.m_or_default() as f64;
        let cap = self.capacity_or_default() as f64;
        (cap.ln() / m.ln()).ceil().max(1.0) as usize
    }

    /// Multiplier for the geometric level distribution: `1 / ln(m)`.
    pub fn level_mult(&self) -> f64 {
        1.0 / (self.m_or_default() as f64).ln()
    }

    /// Reject configurations that cannot produce a working index.
    pub fn validate(&self, op: &'static str) -> Result<()> {
        if self.dim == 0 {
            return Err(ProximumError::ConfigInvalid {
                op,
                reason: "dim must be non-zero".into(),
            });
        }
        if self.m_or_default() < 2 {
            return Err(ProximumError::ConfigInvalid {
                op,
                reason: format!("m must be >= 2, got {}", self.m_or_default()),
            });
        }
        if self.ef_construction_or_default() == 0 || self.ef_search_or_default() == 0 {
            return Err(ProximumError::ConfigInvalid {
                op,
                reason: "ef_construction and ef_search must be non-zero".into(),
            });
        }
        if self.vector_chunk_size_or_default() == 0 || self.edge_chunk_size_or_default() == 0 {
            return Err(ProximumError::ConfigInvalid {
                op,
                reason: "chunk sizes must be non-zero".into(),
            });
        }
        if let Some(store) = &self.store {
            match store.backend.as_str() {
                "mem" => {}
                "file" => {
                    if store.path.is_none() {
                        return Err(ProximumError::ConfigInvalid {
                            op,
                            reason: "file backend requires a root path".into(),
                        });
                    }
                }
                other => {
                    return Err(ProximumError::ConfigInvalid {
                        op,
                        reason: format!("unknown store backend: {other}"),
                    });
                }
            }
            if store.id.is_none() {
                return Err(ProximumError::ConfigInvalid {
                    op,
                    reason: "store id is required".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = IndexOptions::new(128);
        assert_eq!(opts.m_or_default(), 16);
        assert_eq!(opts.m0(), 32);
        assert_eq!(opts.ef_construction_or_default(), 200);
        assert_eq!(opts.ef_search_or_default(), 50);
        assert_eq!(opts.distance_or_default(), DistanceKind::SquaredL2);
        assert_eq!(opts.branch_or_default(), "main");
        assert!(!opts.crypto());
    }

    #[test]
    fn test_derived_max_levels() {
        let mut opts = IndexOptions::new(8);
        opts.capacity = Some(10_000_000);
        // log_16(1e7) ~ 5.8 -> 6
        assert_eq!(opts.max_levels_or_derived(), 6);

        opts.max_levels = Some(3);
        assert_eq!(opts.max_levels_or_derived(), 3);
    }

    #[test]
    fn test_zero_dim_rejected() {
        let opts = IndexOptions::new(0);
        assert!(matches!(
            opts.validate("create"),
            Err(ProximumError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut opts = IndexOptions::new(4);
        opts.store = Some(StoreOptions {
            backend: "s3".into(),
            path: None,
            id: Some(Uuid::new_v4()),
        });
        let err = opts.validate("create").unwrap_err();
        assert!(err.to_string().contains("unknown store backend"));
    }

    #[test]
    fn test_missing_store_id_rejected() {
        let mut opts = IndexOptions::new(4);
        opts.store = Some(StoreOptions {
            backend: "mem".into(),
            path: None,
            id: None,
        });
        assert!(opts.validate("create").is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let mut opts = IndexOptions::new(64);
        opts.m = Some(8);
        opts.crypto_hash = Some(true);
        opts.store = Some(StoreOptions::mem());
        let json = serde_json::to_string(&opts).unwrap();
        let back: IndexOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dim, 64);
        assert_eq!(back.m, Some(8));
        assert!(back.crypto());
    }
}
