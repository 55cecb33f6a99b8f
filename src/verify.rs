//! Cold-start verification
//!
//! In crypto mode every address is the hash of what it names, and the
//! commit id chains the parents with the vectors/edges content hashes.
//! `verify_from_cold` re-derives the whole chain from the stored bytes:
//! each chunk is fetched and re-hashed, the rolling hashes are refolded
//! in address-map order, and the commit id is recomputed. Any
//! disagreement reports exactly which chunk or hash diverged, and
//! nothing in the in-memory index is touched.

use uuid::Uuid;

use crate::commit::{fold_chunk_hashes, merkle_commit_id};
use crate::error::{ProximumError, Result};
use crate::index::Index;
use crate::pss::{ExternalId, Pss};
use crate::store::KvStore;
use crate::vectors::chunk_address;

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub valid: bool,
    /// Vector chunks whose content hash matched their address.
    pub vectors_verified: usize,
    /// Edge chunks whose content hash matched their address.
    pub edges_verified: usize,
    pub commit_id: Uuid,
}

impl Index {
    /// Re-derive every content hash from stored bytes and check the
    /// commit chain. Requires crypto mode and at least one commit.
    pub fn verify_from_cold(&self) -> Result<VerifyReport> {
        if !self.opts.crypto() {
            return Err(ProximumError::ConfigInvalid {
                op: "verify_from_cold",
                reason: "verification requires crypto_hash mode".into(),
            });
        }
        let head = self
            .commit
            .read()
            .clone()
            .ok_or(ProximumError::Unsynced {
                op: "verify_from_cold",
            })?;

        let vectors_verified =
            self.verify_chunks(head.vectors_addr_root, "vector chunk")?;
        let edges_verified = self.verify_chunks(head.edges_addr_root, "edge chunk")?;

        // Refold the rolling hashes from the address maps
        let vectors_hash = fold_chunk_hashes(&self.addr_entries(head.vectors_addr_root)?);
        let stored_vectors_hash = head.vectors_hash.clone().unwrap_or_default();
        if vectors_hash != stored_vectors_hash {
            return Err(ProximumError::CryptoMismatch {
                op: "verify_from_cold",
                subject: "vectors hash".into(),
                expected: stored_vectors_hash,
                actual: vectors_hash,
            });
        }
        let edges_hash = fold_chunk_hashes(&self.addr_entries(head.edges_addr_root)?);
        let stored_edges_hash = head.edges_hash.clone().unwrap_or_default();
        if edges_hash != stored_edges_hash {
            return Err(ProximumError::CryptoMismatch {
                op: "verify_from_cold",
                subject: "edges hash".into(),
                expected: stored_edges_hash,
                actual: edges_hash,
            });
        }

        // The chain: parents x vectors_hash x edges_hash -> commit id
        let derived = merkle_commit_id(&head.parents, &vectors_hash, &edges_hash);
        if derived != head.id {
            return Err(ProximumError::CryptoMismatch {
                op: "verify_from_cold",
                subject: "commit id".into(),
                expected: head.id.to_string(),
                actual: derived.to_string(),
            });
        }

        Ok(VerifyReport {
            valid: true,
            vectors_verified,
            edges_verified,
            commit_id: head.id,
        })
    }

    fn addr_entries(&self, root: Option<Uuid>) -> Result<Vec<(u64, Uuid)>> {
        let pss = Pss::load(root, self.node_cache.clone());
        Ok(pss
            .entries()?
            .into_iter()
            .filter_map(|(key, value)| match (key, value.as_address()) {
                (ExternalId::Int(position), Some(addr)) => Some((position as u64, addr)),
                _ => None,
            })
            .collect())
    }

    fn verify_chunks(&self, root: Option<Uuid>, what: &str) -> Result<usize> {
        let mut verified = 0usize;
        for (position, addr) in self.addr_entries(root)? {
            let bytes = self
                .store
                .get(&addr.to_string())?
                .ok_or(ProximumError::ChunkUnavailable {
                    op: "verify_from_cold",
                    address: addr,
                })?;
            let actual = chunk_address(&bytes);
            if actual != addr {
                return Err(ProximumError::CryptoMismatch {
                    op: "verify_from_cold",
                    subject: format!("{what} {position}"),
                    expected: addr.to_string(),
                    actual: actual.to_string(),
                });
            }
            verified += 1;
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{IndexOptions, StoreOptions};
    use crate::error::ProximumError;
    use crate::index::Index;

    fn crypto_opts(dim: usize) -> IndexOptions {
        let mut opts = IndexOptions::new(dim);
        opts.m = Some(4);
        opts.ef_construction = Some(16);
        opts.vector_chunk_size = Some(4);
        opts.crypto_hash = Some(true);
        opts.store = Some(StoreOptions::mem());
        opts
    }

    #[test]
    fn test_verify_clean_index() {
        let index = Index::create(crypto_opts(2)).unwrap();
        for i in 0..10i64 {
            index.insert(i, &[i as f32, 0.5]).unwrap();
        }
        index.sync().unwrap().wait().unwrap();

        let report = index.verify_from_cold().unwrap();
        assert!(report.valid);
        // 10 vectors, chunk size 4 -> 3 chunks
        assert_eq!(report.vectors_verified, 3);
        assert!(report.edges_verified >= 1);
    }

    #[test]
    fn test_verify_detects_flipped_byte() {
        let index = Index::create(crypto_opts(2)).unwrap();
        for i in 0..10i64 {
            index.insert(i, &[i as f32, 0.5]).unwrap();
        }
        let commit = index.sync().unwrap().wait().unwrap();

        // Corrupt one byte of one vector chunk in the store
        let addr = {
            let head = index.current_commit().unwrap();
            assert_eq!(head.id, commit.id);
            let entries = index.addr_entries(head.vectors_addr_root).unwrap();
            entries[1].1
        };
        let mut bytes = index.store.get(&addr.to_string()).unwrap().unwrap();
        bytes[3] ^= 0x40;
        index.store.put(&addr.to_string(), bytes).unwrap();

        let err = index.verify_from_cold().unwrap_err();
        match err {
            ProximumError::CryptoMismatch { subject, .. } => {
                assert!(subject.contains("vector chunk 1"), "got subject {subject}");
            }
            other => panic!("expected CryptoMismatch, got {other}"),
        }
        // In-memory state untouched: queries still work
        assert_eq!(index.get(5i64).unwrap(), Some(vec![5.0, 0.5]));
    }

    #[test]
    fn test_verify_requires_crypto_mode() {
        let mut opts = crypto_opts(2);
        opts.crypto_hash = Some(false);
        let index = Index::create(opts).unwrap();
        assert!(matches!(
            index.verify_from_cold().unwrap_err(),
            ProximumError::ConfigInvalid { .. }
        ));
    }

    #[test]
    fn test_verify_requires_commit() {
        let index = Index::create(crypto_opts(2)).unwrap();
        assert!(matches!(
            index.verify_from_cold().unwrap_err(),
            ProximumError::Unsynced { .. }
        ));
    }
}
