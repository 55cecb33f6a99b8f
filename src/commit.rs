//! Commit snapshots and branches
//!
//! A commit is the immutable record of one index state: counters, entry
//! point, deletion bitset, and the four PSS roots, plus parent links
//! forming the history DAG. Branches are named references to commits,
//! kept as a set under the `:branches` key with each head stored under
//! the branch's own name.
//!
//! In crypto mode the commit id is a chain hash over the parents and the
//! vectors/edges content hashes, so two indices that applied the same
//! ordered operations produce byte-identical commit ids, and any
//! divergence is detectable from the ids alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use uuid::Uuid;

use crate::error::{ProximumError, Result};
use crate::store::{get_json, put_json, KvStore, BRANCHES_KEY};

/// Immutable snapshot record. Stored under both its own id and (for the
/// head of each branch) the branch name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: Uuid,
    pub parents: Vec<Uuid>,
    pub branch: String,
    pub timestamp: DateTime<Utc>,
    /// Entry node of the HNSW descent; `None` for an empty index.
    pub entrypoint: Option<u32>,
    pub max_level: u32,
    /// Deletion bitset words, `ceil(vector_count / 64)` of them. The
    /// snapshot copy is authoritative at load time.
    pub deleted: Vec<u64>,
    pub vector_count: u64,
    pub deleted_count: u64,
    pub metadata_root: Option<Uuid>,
    pub external_id_root: Option<Uuid>,
    pub vectors_addr_root: Option<Uuid>,
    pub edges_addr_root: Option<Uuid>,
    /// Rolling SHA-512 over ordered vector chunk addresses (crypto mode).
    pub vectors_hash: Option<String>,
    /// Rolling SHA-512 over ordered edge chunk addresses (crypto mode).
    pub edges_hash: Option<String>,
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Fold ordered `(position, address)` pairs into one content hash.
pub(crate) fn fold_chunk_hashes(entries: &[(u64, Uuid)]) -> String {
    let mut hasher = Sha512::new();
    for (position, address) in entries {
        hasher.update(position.to_le_bytes());
        hasher.update(address.as_bytes());
    }
    hex(&hasher.finalize())
}

/// Chain hash for a crypto-mode commit id:
/// `hash(parents ++ vectors_hash ++ edges_hash)`, truncated to 16 bytes.
pub(crate) fn merkle_commit_id(
    parents: &[Uuid],
    vectors_hash: &str,
    edges_hash: &str,
) -> Uuid {
    let mut hasher = Sha512::new();
    for parent in parents {
        hasher.update(parent.as_bytes());
    }
    hasher.update(vectors_hash.as_bytes());
    hasher.update(edges_hash.as_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(id)
}

// ===== Branch registry =====

pub(crate) fn branches(store: &dyn KvStore) -> Result<Vec<String>> {
    Ok(get_json::<Vec<String>>(store, BRANCHES_KEY, "branches")?.unwrap_or_default())
}

pub(crate) fn register_branch(store: &dyn KvStore, name: &str) -> Result<()> {
    let mut names = branches(store)?;
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
        put_json(store, BRANCHES_KEY, &names, "branch")?;
    }
    Ok(())
}

pub(crate) fn unregister_branch(store: &dyn KvStore, name: &str) -> Result<()> {
    let mut names = branches(store)?;
    names.retain(|n| n != name);
    put_json(store, BRANCHES_KEY, &names, "delete_branch")?;
    Ok(())
}

// ===== Commit access =====

pub(crate) fn load_commit(store: &dyn KvStore, id: Uuid) -> Result<Commit> {
    get_json::<Commit>(store, &id.to_string(), "load_commit")?.ok_or(ProximumError::NotFound {
        op: "load_commit",
        what: "commit",
        key: id.to_string(),
    })
}

pub(crate) fn load_branch_head(store: &dyn KvStore, branch: &str) -> Result<Commit> {
    get_json::<Commit>(store, branch, "load")?.ok_or_else(|| ProximumError::NotFound {
        op: "load",
        what: "branch",
        key: branch.to_string(),
    })
}

// ===== History walks =====

/// Parent chain from `from` back to a root, following first parents.
pub(crate) fn history(store: &dyn KvStore, from: Uuid) -> Result<Vec<Commit>> {
    let mut out = Vec::new();
    let mut cursor = Some(from);
    while let Some(id) = cursor {
        let commit = load_commit(store, id)?;
        cursor = commit.parents.first().copied();
        out.push(commit);
    }
    Ok(out)
}

/// Every commit id reachable from `from` through parent links,
/// including `from` itself.
pub(crate) fn ancestors(
    store: &dyn KvStore,
    from: Uuid,
) -> Result<std::collections::HashSet<Uuid>> {
    let mut seen = std::collections::HashSet::new();
    let mut queue = vec![from];
    while let Some(id) = queue.pop() {
        if !seen.insert(id) {
            continue;
        }
        let commit = load_commit(store, id)?;
        queue.extend(commit.parents);
    }
    Ok(seen)
}

pub(crate) fn is_ancestor(store: &dyn KvStore, ancestor: Uuid, of: Uuid) -> Result<bool> {
    Ok(ancestors(store, of)?.contains(&ancestor))
}

/// Nearest commit reachable from both `a` and `b` (breadth-first from
/// `a`, so the closest-to-`a` common commit wins).
pub(crate) fn common_ancestor(store: &dyn KvStore, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
    let from_b = ancestors(store, b)?;
    let mut seen = std::collections::HashSet::new();
    let mut queue = std::collections::VecDeque::from([a]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if from_b.contains(&id) {
            return Ok(Some(id));
        }
        let commit = load_commit(store, id)?;
        queue.extend(commit.parents);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn commit(id: u128, parents: Vec<Uuid>) -> Commit {
        Commit {
            id: Uuid::from_u128(id),
            parents,
            branch: "main".into(),
            timestamp: Utc::now(),
            entrypoint: None,
            max_level: 0,
            deleted: Vec::new(),
            vector_count: 0,
            deleted_count: 0,
            metadata_root: None,
            external_id_root: None,
            vectors_addr_root: None,
            edges_addr_root: None,
            vectors_hash: None,
            edges_hash: None,
        }
    }

    fn put(store: &MemStore, c: &Commit) {
        put_json(store, &c.id.to_string(), c, "test").unwrap();
    }

    #[test]
    fn test_branch_registry_round_trip() {
        let store = MemStore::new();
        register_branch(&store, "main").unwrap();
        register_branch(&store, "experiment").unwrap();
        register_branch(&store, "main").unwrap(); // idempotent
        assert_eq!(branches(&store).unwrap(), vec!["main", "experiment"]);
        unregister_branch(&store, "experiment").unwrap();
        assert_eq!(branches(&store).unwrap(), vec!["main"]);
    }

    #[test]
    fn test_missing_commit_is_not_found() {
        let store = MemStore::new();
        let err = load_commit(&store, Uuid::from_u128(9)).unwrap_err();
        assert!(matches!(err, ProximumError::NotFound { what: "commit", .. }));
    }

    #[test]
    fn test_history_and_dag_walks() {
        let store = MemStore::new();
        let root = commit(1, vec![]);
        let mid = commit(2, vec![root.id]);
        let tip = commit(3, vec![mid.id]);
        let side = commit(4, vec![root.id]);
        for c in [&root, &mid, &tip, &side] {
            put(&store, c);
        }

        let chain = history(&store, tip.id).unwrap();
        let ids: Vec<Uuid> = chain.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![tip.id, mid.id, root.id]);

        assert!(is_ancestor(&store, root.id, tip.id).unwrap());
        assert!(!is_ancestor(&store, tip.id, root.id).unwrap());
        assert_eq!(
            common_ancestor(&store, tip.id, side.id).unwrap(),
            Some(root.id)
        );
    }

    #[test]
    fn test_merkle_id_deterministic_and_chained() {
        let parent = Uuid::from_u128(7);
        let a = merkle_commit_id(&[parent], "vh", "eh");
        let b = merkle_commit_id(&[parent], "vh", "eh");
        assert_eq!(a, b);
        // Any input change moves the id
        assert_ne!(a, merkle_commit_id(&[], "vh", "eh"));
        assert_ne!(a, merkle_commit_id(&[parent], "vh2", "eh"));
        assert_ne!(a, merkle_commit_id(&[parent], "vh", "eh2"));
    }

    #[test]
    fn test_fold_chunk_hashes_order_sensitive() {
        let a1 = (0u64, Uuid::from_u128(1));
        let a2 = (1u64, Uuid::from_u128(2));
        assert_ne!(
            fold_chunk_hashes(&[a1, a2]),
            fold_chunk_hashes(&[a2, a1])
        );
    }
}
