//! Garbage collection
//!
//! Commits stay in the store after branch deletion and rewinds; `gc`
//! reclaims them. Reachability starts from the branch set: every commit
//! reachable from any branch head is retained, along with every PSS
//! node and chunk its address maps reference. Unreachable commits older
//! than the cutoff are swept, as are chunks and nodes referenced by no
//! retained snapshot — in crypto mode a deduplicated chunk survives as
//! long as any retained commit still names it, which the reference walk
//! handles naturally (references are collected per retained commit, not
//! per branch).

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::commit::{self, Commit};
use crate::error::Result;
use crate::index::Index;
use crate::pss::Pss;
use crate::store::{KvStore, BRANCHES_KEY, CONFIG_KEY};

/// What a `gc` pass did.
#[derive(Debug, Clone)]
pub struct GcReport {
    /// Commits reachable from a branch (or too young to sweep).
    pub retained_commits: usize,
    /// Commit snapshots removed.
    pub swept_commits: usize,
    /// Chunk / PSS node keys removed.
    pub swept_chunks: usize,
}

impl Index {
    /// Sweep unreachable commits older than `before` (all of them when
    /// `None`) and every chunk or tree node no retained snapshot
    /// references.
    pub fn gc(&self, before: Option<DateTime<Utc>>) -> Result<GcReport> {
        let store = &*self.store;

        // Phase 1: commits reachable from the branch set
        let mut reachable: HashSet<Uuid> = HashSet::new();
        for branch in commit::branches(store)? {
            let head = commit::load_branch_head(store, &branch)?;
            reachable.extend(commit::ancestors(store, head.id)?);
        }

        // Phase 2: partition all stored commits into retained and swept
        let keys = store.keys()?;
        let mut retained: Vec<Commit> = Vec::new();
        let mut swept_commit_keys: Vec<String> = Vec::new();
        let mut candidate_chunks: Vec<(String, Uuid)> = Vec::new();
        for key in &keys {
            if key == CONFIG_KEY || key == BRANCHES_KEY {
                continue;
            }
            let Ok(id) = key.parse::<Uuid>() else {
                // Branch head keys and anything foreign stay put
                continue;
            };
            let Some(bytes) = store.get(key)? else { continue };
            match serde_json::from_slice::<Commit>(&bytes) {
                Ok(record) => {
                    let keep = reachable.contains(&record.id)
                        || before.is_some_and(|cutoff| record.timestamp >= cutoff);
                    if keep {
                        retained.push(record);
                    } else {
                        swept_commit_keys.push(key.clone());
                    }
                }
                Err(_) => candidate_chunks.push((key.clone(), id)),
            }
        }

        // Phase 3: addresses referenced by any retained snapshot
        let mut referenced: HashSet<Uuid> = HashSet::new();
        for record in &retained {
            for root in [
                record.metadata_root,
                record.external_id_root,
                record.vectors_addr_root,
                record.edges_addr_root,
            ] {
                let pss = Pss::load(root, self.node_cache.clone());
                pss.reachable_addresses(&mut referenced)?;
            }
            for root in [record.vectors_addr_root, record.edges_addr_root] {
                let pss = Pss::load(root, self.node_cache.clone());
                for (_, value) in pss.entries()? {
                    if let Some(addr) = value.as_address() {
                        referenced.insert(addr);
                    }
                }
            }
        }

        // Phase 4: sweep
        let mut swept_chunks = 0usize;
        for key in &swept_commit_keys {
            store.delete(key)?;
        }
        for (key, id) in &candidate_chunks {
            if !referenced.contains(id) {
                store.delete(key)?;
                swept_chunks += 1;
            }
        }

        let report = GcReport {
            retained_commits: retained.len(),
            swept_commits: swept_commit_keys.len(),
            swept_chunks,
        };
        tracing::info!(
            retained = report.retained_commits,
            swept_commits = report.swept_commits,
            swept_chunks = report.swept_chunks,
            "gc complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{IndexOptions, StoreOptions};
    use crate::index::Index;

    fn opts(dim: usize) -> IndexOptions {
        let mut opts = IndexOptions::new(dim);
        opts.m = Some(4);
        opts.ef_construction = Some(16);
        opts.vector_chunk_size = Some(4);
        opts.store = Some(StoreOptions::mem());
        opts
    }

    #[test]
    fn test_gc_keeps_everything_reachable() {
        let index = Index::create(opts(2)).unwrap();
        for i in 0..10i64 {
            index.insert(i, &[i as f32, 0.0]).unwrap();
        }
        index.sync().unwrap().wait().unwrap();
        index.insert(10i64, &[10.0, 0.0]).unwrap();
        index.sync().unwrap().wait().unwrap();

        let report = index.gc(None).unwrap();
        assert_eq!(report.swept_commits, 0);
        assert_eq!(report.retained_commits, 2);

        // The index still reads fine afterwards
        assert_eq!(index.get(3i64).unwrap(), Some(vec![3.0, 0.0]));
        let reopened = Index::open(index.options().clone()).unwrap();
        assert_eq!(reopened.count(), 11);
    }

    #[test]
    fn test_gc_sweeps_unreachable_branch_remnants() {
        let index = Index::create(opts(2)).unwrap();
        for i in 0..8i64 {
            index.insert(i, &[i as f32, 1.0]).unwrap();
        }
        index.sync().unwrap().wait().unwrap();

        // A side branch with its own data, later deleted
        let side = index.branch("scratch").unwrap();
        for i in 100..120i64 {
            side.insert(i, &[i as f32, 2.0]).unwrap();
        }
        let side_commit = side.sync().unwrap().wait().unwrap();
        drop(side);
        index.delete_branch("scratch").unwrap();

        let report = index.gc(None).unwrap();
        assert!(report.swept_commits >= 1, "scratch commits swept");
        // The side branch's commit is gone from the store
        assert!(index.load_commit(side_commit.id).is_err());
        // Main still works
        assert_eq!(index.get(5i64).unwrap(), Some(vec![5.0, 1.0]));
    }

    #[test]
    fn test_gc_respects_cutoff() {
        let index = Index::create(opts(2)).unwrap();
        index.insert(0i64, &[0.0, 0.0]).unwrap();
        index.sync().unwrap().wait().unwrap();
        let side = index.branch("young").unwrap();
        let young_commit = side.sync().unwrap().wait().unwrap();
        drop(side);
        index.delete_branch("young").unwrap();

        // Cutoff in the past: the young orphan commit survives
        let long_ago = chrono::Utc::now() - chrono::Duration::hours(1);
        index.gc(Some(long_ago)).unwrap();
        assert!(index.load_commit(young_commit.id).is_ok());

        // No cutoff: it goes
        index.gc(None).unwrap();
        assert!(index.load_commit(young_commit.id).is_err());
    }
}
