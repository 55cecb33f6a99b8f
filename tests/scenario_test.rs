//! End-to-end scenario tests
//!
//! Full-stack flows over a file-backed store: insert/search ordering,
//! snapshot isolation across forks, time travel, branch divergence,
//! delete + compact, and crypto tamper detection.

use proximum::{ExternalId, Index, IndexOptions, ProximumError, StoreOptions};
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

fn ids(hits: &[(ExternalId, f32)]) -> Vec<String> {
    hits.iter().map(|(id, _)| id.canonical()).collect()
}

#[test]
fn test_basic_insert_search_ordering() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(3, &tmp)).unwrap();
    index.insert("a", &[1.0, 0.0, 0.0]).unwrap();
    index.insert("b", &[0.0, 1.0, 0.0]).unwrap();
    index.insert("c", &[0.0, 0.0, 1.0]).unwrap();
    index.insert("d", &[0.5, 0.5, 0.0]).unwrap();

    let hits = index.search(&[0.9, 0.1, 0.0], 3).unwrap();
    let names = ids(&hits);
    assert_eq!(names[0], "a");
    assert_eq!(names[1], "d");
    assert!(
        names[2] == "b" || names[2] == "c",
        "third result should be b or c, got {}",
        names[2]
    );
}

#[test]
fn test_snapshot_isolation_across_versions() {
    let tmp = TempDir::new().unwrap();
    let a = [1.0f32, 0.0, 0.0];
    let b = [0.0f32, 1.0, 0.0];
    let c = [0.0f32, 0.0, 1.0];

    let v1 = Index::create(file_opts(3, &tmp)).unwrap();
    v1.insert("a", &a).unwrap();
    let v2 = v1.fork().unwrap();
    v2.insert("b", &b).unwrap();
    let v3 = v2.fork().unwrap();
    v3.insert("c", &c).unwrap();

    assert_eq!(v1.count(), 1);
    assert_eq!(v2.count(), 2);
    assert_eq!(v3.count(), 3);

    let hits = v1.search(&a, 1).unwrap();
    assert_eq!(ids(&hits), vec!["a"]);
    assert_eq!(hits[0].1, 0.0);
}

#[test]
fn test_time_travel_excludes_later_inserts() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(3, &tmp)).unwrap();
    let x = [1.0f32, 0.0, 0.0];
    let y = [0.0f32, 1.0, 0.0];
    let z = [0.0f32, 0.9, 0.1];

    index.insert("x", &x).unwrap();
    index.insert("y", &y).unwrap();
    let first = index.sync().unwrap().wait().unwrap();

    index.insert("z", &z).unwrap();
    let second = index.sync().unwrap().wait().unwrap();
    assert_ne!(first.id, second.id);

    let past = index.load_commit(first.id).unwrap();
    let hits = past.search(&y, 10).unwrap();
    let names = ids(&hits);
    assert!(names.contains(&"y".to_string()));
    assert!(
        !names.contains(&"z".to_string()),
        "commit {} must not see z",
        first.id
    );

    // The present still does
    let names = ids(&index.search(&y, 10).unwrap());
    assert!(names.contains(&"z".to_string()));
}

#[test]
fn test_time_travel_index_is_read_only() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(3, &tmp)).unwrap();
    index.insert("x", &[1.0, 0.0, 0.0]).unwrap();
    let commit = index.sync().unwrap().wait().unwrap();

    let past = index.load_commit(commit.id).unwrap();
    assert!(matches!(
        past.insert("new", &[0.0, 1.0, 0.0]).unwrap_err(),
        ProximumError::ReadOnly { .. }
    ));
    assert!(matches!(
        past.delete("x").unwrap_err(),
        ProximumError::ReadOnly { .. }
    ));
    // But it forks into a writable snapshot
    let writable = past.fork().unwrap();
    writable.insert("new", &[0.0, 1.0, 0.0]).unwrap();
    assert_eq!(writable.count(), 2);
}

#[test]
fn test_branch_divergence() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(3, &tmp)).unwrap();
    index.insert("a", &[1.0, 0.0, 0.0]).unwrap();
    index.insert("b", &[0.0, 1.0, 0.0]).unwrap();
    index.insert("c", &[0.0, 0.0, 1.0]).unwrap();
    index.sync().unwrap().wait().unwrap();

    let experiment = index.branch("experiment").unwrap();
    let d = [0.7f32, 0.7, 0.0];
    experiment.insert("d", &d).unwrap();
    index.sync().unwrap().wait().unwrap();
    experiment.sync().unwrap().wait().unwrap();

    let main_names = ids(&index.search(&d, 10).unwrap());
    assert!(!main_names.contains(&"d".to_string()), "main must not see d");

    let exp_names = ids(&experiment.search(&d, 10).unwrap());
    assert!(exp_names.contains(&"d".to_string()));

    // Both branch files exist, independently
    assert!(tmp.path().join("mmap/main.mmap").exists());
    assert!(tmp.path().join("mmap/experiment.mmap").exists());
    assert_eq!(
        {
            let mut names = index.list_branches().unwrap();
            names.sort();
            names
        },
        vec!["experiment", "main"]
    );
}

#[test]
fn test_branch_protection_and_collisions() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(3, &tmp)).unwrap();
    index.insert("a", &[1.0, 0.0, 0.0]).unwrap();

    // branch before any sync
    assert!(matches!(
        index.branch("early").unwrap_err(),
        ProximumError::Unsynced { .. }
    ));

    index.sync().unwrap().wait().unwrap();
    let side = index.branch("side").unwrap();
    drop(side);

    assert!(matches!(
        index.branch("side").unwrap_err(),
        ProximumError::BranchExists { .. }
    ));
    assert!(matches!(
        index.delete_branch("main").unwrap_err(),
        ProximumError::BranchProtected { .. }
    ));
    assert!(matches!(
        index.delete_branch("missing").unwrap_err(),
        ProximumError::NotFound { .. }
    ));

    index.delete_branch("side").unwrap();
    assert_eq!(index.list_branches().unwrap(), vec!["main"]);
    assert!(!tmp.path().join("mmap/side.mmap").exists());
}

#[test]
fn test_delete_then_compact() {
    let tmp = TempDir::new().unwrap();
    let index = Index::create(file_opts(3, &tmp)).unwrap();
    for i in 0..100i64 {
        let f = i as f32;
        index.insert(i, &[f, (i % 10) as f32, 1.0]).unwrap();
    }
    // Delete 40 specific external ids
    let doomed: Vec<i64> = (0..40).map(|i| i * 2 + 1).collect();
    for &id in &doomed {
        index.delete(id).unwrap();
    }
    assert_eq!(index.count(), 60);
    assert_eq!(index.deleted_count(), 40);

    let target_tmp = TempDir::new().unwrap();
    let compacted = index.compact(file_opts(3, &target_tmp)).unwrap();

    assert_eq!(compacted.count(), 60);
    assert_eq!(compacted.deleted_count(), 0);
    assert_eq!(compacted.vector_count(), 60);

    for i in 0..100i64 {
        let expected = if doomed.contains(&i) {
            None
        } else {
            Some(vec![i as f32, (i % 10) as f32, 1.0])
        };
        assert_eq!(compacted.get(i).unwrap(), expected, "id {i}");
    }
}

#[test]
fn test_crypto_tamper_detection() {
    let tmp = TempDir::new().unwrap();
    let mut opts = file_opts(4, &tmp);
    opts.crypto_hash = Some(true);
    let index = Index::create(opts).unwrap();
    for i in 0..10i64 {
        index.insert(i, &[i as f32, 0.5, 0.25, 0.125]).unwrap();
    }
    let commit = index.sync().unwrap().wait().unwrap();
    assert!(commit.vectors_hash.is_some());

    let report = index.verify_from_cold().unwrap();
    assert!(report.valid);
    assert_eq!(report.commit_id, commit.id);
    // 10 vectors at chunk size 4 -> 3 chunks
    assert_eq!(report.vectors_verified, 3);

    // Flip one byte of one vector chunk on disk. Store files are
    // hex-named; vector chunks are small raw-float payloads (every
    // JSON value starts with '{' or '[').
    let store_dir = tmp.path().join("store");
    let mut flipped = false;
    for entry in std::fs::read_dir(&store_dir).unwrap() {
        let path = entry.unwrap().path();
        let bytes = std::fs::read(&path).unwrap();
        let looks_json = bytes.first().is_some_and(|b| *b == b'{' || *b == b'[');
        // dim 4, chunk 4 -> full vector chunks are exactly 64 bytes
        if !looks_json && bytes.len() == 64 {
            let mut corrupted = bytes;
            corrupted[5] ^= 0x01;
            std::fs::write(&path, corrupted).unwrap();
            flipped = true;
            break;
        }
    }
    assert!(flipped, "no vector chunk found to corrupt");

    match index.verify_from_cold().unwrap_err() {
        ProximumError::CryptoMismatch { subject, .. } => {
            assert!(subject.contains("vector chunk"), "subject: {subject}");
        }
        other => panic!("expected CryptoMismatch, got {other}"),
    }

    // In-memory state unaffected
    assert_eq!(index.get(5i64).unwrap(), Some(vec![5.0, 0.5, 0.25, 0.125]));
    assert_eq!(index.count(), 10);
}
