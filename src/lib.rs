//! # proximum - Persistent Vector Index
//!
//! Approximate-nearest-neighbor search over immutable snapshots. Every
//! mutation is a new logical version: indices fork in O(chunks), commits
//! chain into a history DAG, branches diverge with reflink-copied mmap
//! files, and any past commit reopens for time-travel queries.
//!
//! ## Architecture
//!
//! - **HNSW graph** over a chunked edge store with per-chunk
//!   copy-on-write, striped write locks, and lock-free read snapshots
//! - **Vector storage** as a memory-mapped float region (SIMD distance
//!   via simsimd) fronting content-addressable chunks in a pluggable KV
//!   store
//! - **Persistent sorted sets** (immutable B-trees with structural
//!   sharing) for metadata, external-id mapping, and chunk address maps
//! - **Versioning**: commits, branches, forks, history walks, garbage
//!   collection, and optional merkle mode (`crypto_hash`) where every
//!   address is the SHA-512-derived hash of its content and tampering is
//!   detectable from the commit id alone
//!
//! ## Quick Start
//!
//! ```no_run
//! use proximum::{Index, IndexOptions, StoreOptions};
//!
//! # fn main() -> Result<(), proximum::ProximumError> {
//! let mut opts = IndexOptions::new(768);
//! opts.store = Some(StoreOptions::file("/var/lib/proximum"));
//! let index = Index::create(opts)?;
//!
//! index.insert("doc-1", &vec![0.1; 768])?;
//! index.insert("doc-2", &vec![0.2; 768])?;
//!
//! let hits = index.search(&vec![0.1; 768], 5)?;
//! assert_eq!(hits[0].0, "doc-1".into());
//!
//! // Durable snapshot; the handle resolves when the branch head moves
//! let commit = index.sync()?.wait()?;
//!
//! // Zero-cost snapshot isolation
//! let scratch = index.fork()?;
//! scratch.insert("doc-3", &vec![0.3; 768])?;
//! assert_eq!(index.len(), 2);
//!
//! // Time travel
//! let old = index.load_commit(commit.id)?;
//! # Ok(())
//! # }
//! ```

pub mod commit;
pub mod compact;
pub mod config;
pub mod distance;
pub mod edges;
pub mod error;
pub mod gc;
pub mod graph;
pub mod index;
pub mod pss;
pub mod store;
pub mod vectors;
pub mod verify;

pub use commit::Commit;
pub use compact::{OnlineCompaction, DEFAULT_MAX_DELTA};
pub use config::{DistanceKind, IndexOptions, StoreOptions};
pub use error::{ProximumError, Result};
pub use gc::GcReport;
pub use graph::SearchOptions;
pub use index::{Index, IndexStats, SyncHandle, SyncOptions};
pub use pss::{ExternalId, Pss, PssValue};
pub use store::{FileStore, KvStore, MemStore, StoreHandle};
pub use verify::VerifyReport;
