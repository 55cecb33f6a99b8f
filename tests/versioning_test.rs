//! Versioning property tests
//!
//! Round-trip persistence, fork independence, merkle determinism, and
//! history walks over the commit DAG.

use proximum::{
    DistanceKind, ExternalId, Index, IndexOptions, ProximumError, StoreOptions,
};
use tempfile::TempDir;

fn file_opts(dim: usize, tmp: &TempDir) -> IndexOptions {
    let mut opts = IndexOptions::new(dim);
    opts.m = Some(8);
    opts.ef_construction = Some(50);
    opts.ef_search = Some(32);
    opts.vector_chunk_size = Some(4);
    opts.edge_chunk_size = Some(16);
    opts.store = Some(StoreOptions::file(tmp.path().join("store")));
    opts.mmap_dir = Some(tmp.path().join("mmap"));
    opts
}

/// Deterministic pseudo-random unit-ish vectors.
fn vec_for(seed: u64, dim: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
    (0..dim)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
        })
        .collect()
}

#[test]
fn test_round_trip_search_identical() {
    let tmp = TempDir::new().unwrap();
    let opts = file_opts(8, &tmp);
    let index = Index::create(opts.clone()).unwrap();
    for i in 0..60u64 {
        index.insert(i as i64, &vec_for(i, 8)).unwrap();
    }
    index.delete(13i64).unwrap();
    index.sync().unwrap().wait().unwrap();

    let query = vec_for(999, 8);
    let before = index.search(&query, 10).unwrap();

    let reloaded = Index::open(opts).unwrap();
    let after = reloaded.search(&query, 10).unwrap();

    // Same ordering, same ids, bit-identical distances
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(&after) {
        assert_eq!(b.0, a.0);
        assert_eq!(b.1.to_bits(), a.1.to_bits(), "distance must be bit-identical");
    }
    assert_eq!(reloaded.count(), 59);
}

#[test]
fn test_fork_independence_bit_identical() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(8, &tmp)).unwrap();
    for i in 0..40u64 {
        index.insert(i as i64, &vec_for(i, 8)).unwrap();
    }
    let query = vec_for(777, 8);
    let before = index.search(&query, 10).unwrap();

    // Arbitrary mutation of the fork
    let fork = index.fork().unwrap();
    for i in 100..140u64 {
        fork.insert(i as i64, &vec_for(i, 8)).unwrap();
    }
    fork.delete(5i64).unwrap();
    fork.set_metadata(
        6i64,
        serde_json::Map::from_iter([("k".to_string(), serde_json::json!("v"))]),
    )
    .unwrap();

    let after = index.search(&query, 10).unwrap();
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(&after) {
        assert_eq!(b.0, a.0);
        assert_eq!(b.1.to_bits(), a.1.to_bits());
    }
    // The fork really did diverge
    assert_eq!(fork.count(), 79);
    assert!(index.get_metadata(6i64).unwrap().unwrap().is_empty());
}

#[test]
fn test_merkle_determinism() {
    // Two indices over distinct stores, same ordered operations
    let build = || {
        let mut opts = IndexOptions::new(6);
        opts.m = Some(4);
        opts.ef_construction = Some(24);
        opts.vector_chunk_size = Some(4);
        opts.edge_chunk_size = Some(8);
        opts.crypto_hash = Some(true);
        opts.store = Some(StoreOptions::mem());
        let index = Index::create(opts).unwrap();
        let mut commits = Vec::new();
        for i in 0..30u64 {
            index.insert(i as i64, &vec_for(i, 6)).unwrap();
            if i % 10 == 9 {
                commits.push(index.sync().unwrap().wait().unwrap());
            }
        }
        commits
    };
    let a = build();
    let b = build();
    assert_eq!(a.len(), b.len());
    for (ca, cb) in a.iter().zip(&b) {
        assert_eq!(ca.id, cb.id, "same ops + same sync points -> same commit id");
        assert_eq!(ca.vectors_hash, cb.vectors_hash);
        assert_eq!(ca.edges_hash, cb.edges_hash);
    }
}

#[test]
fn test_history_walks() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(4, &tmp)).unwrap();
    index.insert(1i64, &vec_for(1, 4)).unwrap();
    let c1 = index.sync().unwrap().wait().unwrap();
    index.insert(2i64, &vec_for(2, 4)).unwrap();
    let c2 = index.sync().unwrap().wait().unwrap();

    let branch = index.branch("side").unwrap();
    branch.insert(3i64, &vec_for(3, 4)).unwrap();
    let c3 = branch.sync().unwrap().wait().unwrap();

    let chain: Vec<_> = index.history().unwrap().iter().map(|c| c.id).collect();
    assert_eq!(chain, vec![c2.id, c1.id]);

    assert!(index.is_ancestor(c1.id, c3.id).unwrap());
    assert!(!index.is_ancestor(c3.id, c2.id).unwrap());
    assert_eq!(index.common_ancestor(c2.id, c3.id).unwrap(), Some(c2.id));

    let ancestors = index.ancestors(c3.id).unwrap();
    assert!(ancestors.contains(&c1.id));
    assert!(ancestors.contains(&c2.id));
}

#[test]
fn test_cosine_and_inner_product_metrics() {
    for kind in [DistanceKind::Cosine, DistanceKind::InnerProduct] {
        let mut opts = IndexOptions::new(3);
        opts.m = Some(4);
        opts.ef_construction = Some(16);
        opts.distance = Some(kind);
        let index = Index::create(opts).unwrap();
        // Normalized inputs
        index.insert("x", &[1.0, 0.0, 0.0]).unwrap();
        index.insert("y", &[0.0, 1.0, 0.0]).unwrap();
        let hits = index.search(&[0.8, 0.6, 0.0], 2).unwrap();
        assert_eq!(hits[0].0, ExternalId::from("x"));
        assert!(hits[0].1 < hits[1].1);
    }
}

#[test]
fn test_mixed_external_id_types_coexist() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(4, &tmp)).unwrap();
    index.insert(7i64, &vec_for(1, 4)).unwrap();
    index.insert("seven", &vec_for(2, 4)).unwrap();
    index.insert(ExternalId::float(7.5), &vec_for(3, 4)).unwrap();
    index.sync().unwrap().wait().unwrap();

    let reopened = Index::open(file_opts(4, &tmp)).unwrap();
    assert!(reopened.contains(7i64).unwrap());
    assert!(reopened.contains("seven").unwrap());
    assert!(reopened.contains(ExternalId::float(7.5)).unwrap());
    assert!(!reopened.contains(8i64).unwrap());
}

#[test]
fn test_close_waits_and_releases() {
    let tmp = TempDir::new().unwrap();
    let opts = file_opts(4, &tmp);
    let index = Index::create(opts.clone()).unwrap();
    for i in 0..30u64 {
        index.insert(i as i64, &vec_for(i, 4)).unwrap();
    }
    index.sync().unwrap().wait().unwrap();
    index.close().unwrap();

    let reopened = Index::open(opts).unwrap();
    assert_eq!(reopened.count(), 30);
}

#[test]
fn test_concurrent_search_and_insert() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(8, &tmp)).unwrap();
    for i in 0..100u64 {
        index.insert(i as i64, &vec_for(i, 8)).unwrap();
    }

    std::thread::scope(|scope| {
        let idx = &index;
        let writer = scope.spawn(move || {
            for i in 100..300u64 {
                idx.insert(i as i64, &vec_for(i, 8)).unwrap();
            }
        });
        for q in 0..200u64 {
            let hits = idx.search(&vec_for(5000 + q, 8), 5).unwrap();
            assert!(!hits.is_empty() && hits.len() <= 5);
            for pair in hits.windows(2) {
                assert!(pair[0].1 <= pair[1].1, "results stay sorted under load");
            }
        }
        writer.join().unwrap();
    });
    assert_eq!(index.count(), 300);

    // Parallel batch insert on top
    let batch: Vec<(ExternalId, Vec<f32>)> = (300..500u64)
        .map(|i| (ExternalId::from(i as i64), vec_for(i, 8)))
        .collect();
    assert_eq!(index.insert_batch(batch).unwrap(), 200);
    assert_eq!(index.count(), 500);
}

#[test]
fn test_unknown_branch_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let opts = file_opts(4, &tmp);
    let index = Index::create(opts.clone()).unwrap();
    index.insert(1i64, &vec_for(1, 4)).unwrap();
    index.sync().unwrap().wait().unwrap();

    let mut missing = opts;
    missing.branch = Some("nope".into());
    assert!(matches!(
        Index::open(missing).unwrap_err(),
        ProximumError::NotFound { .. }
    ));
}
