//! Key-value storage backends
//!
//! Everything durable — vector chunks, edge chunks, PSS nodes, commit
//! snapshots, the branch registry, the stored config — lives behind one
//! opaque key/value contract. The index core never assumes anything about
//! the backend beyond this trait, so a remote store can be dropped in by
//! implementing five methods.
//!
//! Required keys (consumed by the core):
//! - `index/config` — stored [`IndexOptions`](crate::config::IndexOptions)
//! - `:branches` — JSON array of branch names
//! - `<branch_name>` — head snapshot for that branch
//! - `<commit_id>` — snapshot record
//! - `<chunk_address>` — raw bytes of a vector or edge chunk
//! - `<pss_node_address>` — serialized PSS tree node

mod file;
mod memory;
mod writer;

pub use file::FileStore;
pub use memory::MemStore;
pub use writer::{PendingWrite, WritePool};

use std::sync::Arc;

use crate::config::StoreOptions;
use crate::error::{ProximumError, Result};

/// Key of the stored index configuration.
pub const CONFIG_KEY: &str = "index/config";

/// Key of the branch-name registry.
pub const BRANCHES_KEY: &str = ":branches";

/// The storage contract consumed by the core.
///
/// All methods are synchronous; asynchrony is layered on top by
/// [`WritePool`]. Implementations must be safe to share across threads —
/// the same handle is multi-owned by every index rooted at the same
/// storage.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    /// Optional fast path for batched writes. The default is a loop; the
    /// file backend overrides it to sync the directory once at the end.
    fn multi_put(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        for (k, v) in entries {
            self.put(&k, v)?;
        }
        Ok(())
    }
}

/// Shared store handle. Cloning shares the backend.
pub type StoreHandle = Arc<dyn KvStore>;

/// Process-wide registry of in-memory stores, keyed by store id, so two
/// indices opened on the same `mem` root share one physical store — the
/// same multi-ownership the file backend gets from the filesystem.
fn mem_registry() -> &'static parking_lot::Mutex<std::collections::HashMap<uuid::Uuid, Arc<MemStore>>>
{
    static REGISTRY: std::sync::OnceLock<
        parking_lot::Mutex<std::collections::HashMap<uuid::Uuid, Arc<MemStore>>>,
    > = std::sync::OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Open the backend selected by `opts`.
pub fn open_store(opts: &StoreOptions, op: &'static str) -> Result<StoreHandle> {
    match opts.backend.as_str() {
        "mem" => {
            let id = opts.id.ok_or(ProximumError::ConfigInvalid {
                op,
                reason: "store id is required".into(),
            })?;
            let store = mem_registry()
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(MemStore::new()))
                .clone();
            Ok(store)
        }
        "file" => {
            let root = opts.path.as_deref().ok_or_else(|| ProximumError::ConfigInvalid {
                op,
                reason: "file backend requires a root path".into(),
            })?;
            Ok(Arc::new(FileStore::open(root, op)?))
        }
        other => Err(ProximumError::ConfigInvalid {
            op,
            reason: format!("unknown store backend: {other}"),
        }),
    }
}

/// Fetch and JSON-decode a value.
pub(crate) fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
    op: &'static str,
) -> Result<Option<T>> {
    match store.get(key)? {
        None => Ok(None),
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| ProximumError::codec(op, e))?;
            Ok(Some(value))
        }
    }
}

/// JSON-encode and store a value.
pub(crate) fn put_json<T: serde::Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    op: &'static str,
) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| ProximumError::codec(op, e))?;
    store.put(key, bytes)
}

/// Hex-encode a key for use as a filename (see [`FileStore`]).
pub(crate) fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key.as_bytes() {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Inverse of [`encode_key`]. Returns `None` for names that are not valid
/// encodings (foreign files in the store directory are skipped, not
/// errors).
pub(crate) fn decode_key(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(name.len() / 2);
    let raw = name.as_bytes();
    for pair in raw.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        bytes.push((hi * 16 + lo) as u8);
    }
    String::from_utf8(bytes).ok()
}
