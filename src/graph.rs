//! HNSW graph algorithms
//!
//! Insert, search, and the neighbor-selection heuristic, operating over
//! the chunked edge store and the mmap vector region. The index façade
//! owns the entry-point cell and the level RNG; everything here is a
//! free function over those parts, so the same code path serves live
//! indices, forks, and time-travel snapshots.
//!
//! Deleted nodes are tombstones: they never appear in results and are
//! never chosen as new neighbors, but descent still walks through them
//! so the graph stays navigable until compaction rebuilds it.

use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use crate::config::DistanceKind;
use crate::distance::{distance, similarity};
use crate::edges::{EdgeStore, NIL};
use crate::error::Result;
use crate::vectors::VectorStore;

/// Graph parameters, resolved once at index creation.
#[derive(Debug, Clone, Copy)]
pub struct GraphParams {
    pub m: usize,
    pub m0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_levels: usize,
    pub distance: DistanceKind,
}

impl GraphParams {
    fn cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }
}

/// Entry point of the descent. `node == NIL` means the graph is empty.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoint {
    pub node: u32,
    pub level: usize,
}

impl EntryPoint {
    pub fn empty() -> Self {
        EntryPoint {
            node: NIL,
            level: 0,
        }
    }
}

/// Per-query search knobs. All optional; `Default` gives plain beam
/// search at the index's configured width.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Beam width override; the effective width is `max(k, ef)`.
    pub ef: Option<usize>,
    /// Cooperative timeout: the beam loop aborts and returns the best
    /// results found so far.
    pub timeout_ms: Option<u64>,
    /// Stop after this many consecutive candidate evaluations that fail
    /// to improve the best similarity (see `patience_saturation`).
    pub patience: Option<usize>,
    /// Improvement factor an evaluation must reach to reset the patience
    /// counter. Defaults to 1.0 (any improvement resets).
    pub patience_saturation: Option<f32>,
    /// Drop results whose normalized similarity falls below this.
    pub min_similarity: Option<f32>,
}

/// Candidate ordering: by distance, ties broken toward the lower
/// internal id so equal-distance results are deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist: f32,
    node: u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct BeamKnobs<'a> {
    ef: usize,
    /// Node invisible to this traversal (the vector being inserted).
    exclude: Option<u32>,
    /// Allow-set of internal ids; `None` passes everything.
    filter: Option<&'a HashSet<u32>>,
    deadline: Option<Instant>,
    patience: Option<usize>,
    patience_saturation: f32,
}

impl<'a> BeamKnobs<'a> {
    fn construction(ef: usize, exclude: u32) -> Self {
        BeamKnobs {
            ef,
            exclude: Some(exclude),
            filter: None,
            deadline: None,
            patience: None,
            patience_saturation: 1.0,
        }
    }
}

/// Greedy width-1 descent from `cur` through layers
/// `from_layer ..= to_layer + 1`, moving to a strictly closer neighbor
/// at each step. Deleted nodes are legal waypoints.
fn greedy_descend(
    edges: &EdgeStore,
    vectors: &VectorStore,
    params: &GraphParams,
    query: &[f32],
    mut cur: u32,
    from_layer: usize,
    to_layer: usize,
) -> Result<u32> {
    let mut cur_dist = vectors.distance_to(query, cur, params.distance);
    let mut layer = from_layer;
    while layer > to_layer {
        loop {
            let mut improved = false;
            let neighbors = edges.neighbors(layer, cur)?;
            for u in neighbors.iter() {
                let d = vectors.distance_to(query, u, params.distance);
                if d < cur_dist {
                    cur = u;
                    cur_dist = d;
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }
        layer -= 1;
    }
    Ok(cur)
}

/// Beam search within one layer. Returns eligible candidates (not
/// deleted, not excluded, passing the filter) in ascending distance.
/// Deleted nodes are traversed but never returned.
fn beam(
    edges: &EdgeStore,
    vectors: &VectorStore,
    params: &GraphParams,
    query: &[f32],
    entry: u32,
    layer: usize,
    knobs: &BeamKnobs<'_>,
) -> Result<Vec<Candidate>> {
    let mut visited: HashSet<u32> = HashSet::new();
    let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
    // Max-heap of the ef best so far; peek is the current worst
    let mut best: BinaryHeap<Candidate> = BinaryHeap::new();

    let eligible = |node: u32| -> bool {
        !edges.is_deleted(node)
            && knobs.exclude != Some(node)
            && knobs.filter.is_none_or(|f| f.contains(&node))
    };

    let entry_dist = vectors.distance_to(query, entry, params.distance);
    visited.insert(entry);
    frontier.push(Reverse(Candidate {
        dist: entry_dist,
        node: entry,
    }));
    if eligible(entry) {
        best.push(Candidate {
            dist: entry_dist,
            node: entry,
        });
    }

    let mut best_sim = similarity(params.distance, entry_dist);
    let mut stale_evals = 0usize;

    'outer: while let Some(Reverse(candidate)) = frontier.pop() {
        if let Some(worst) = best.peek() {
            if best.len() >= knobs.ef && candidate.dist > worst.dist {
                break;
            }
        }
        if let Some(deadline) = knobs.deadline {
            if Instant::now() >= deadline {
                tracing::debug!(layer, "search timeout hit, returning partial results");
                break;
            }
        }

        let neighbors = edges.neighbors(layer, candidate.node)?;
        for u in neighbors.iter() {
            if !visited.insert(u) {
                continue;
            }
            if knobs.exclude == Some(u) {
                continue;
            }
            let d = vectors.distance_to(query, u, params.distance);

            if let Some(patience) = knobs.patience {
                let sim = similarity(params.distance, d);
                if sim >= best_sim * knobs.patience_saturation {
                    best_sim = best_sim.max(sim);
                    stale_evals = 0;
                } else {
                    stale_evals += 1;
                    if stale_evals >= patience {
                        tracing::debug!(layer, patience, "patience exhausted");
                        break 'outer;
                    }
                }
            }

            let worst = best.peek().map(|c| c.dist);
            let admissible = best.len() < knobs.ef || worst.is_some_and(|w| d < w);
            if admissible {
                frontier.push(Reverse(Candidate { dist: d, node: u }));
                if eligible(u) {
                    best.push(Candidate { dist: d, node: u });
                    if best.len() > knobs.ef {
                        best.pop();
                    }
                }
            }
        }
    }

    let mut results = best.into_vec();
    results.sort_unstable();
    Ok(results)
}

/// The neighbor-selection heuristic: greedily keep the closest candidate
/// that is closer to the base point than to any already-kept neighbor.
/// Produces diverse edges instead of a tight clique.
fn select_neighbors(
    vectors: &VectorStore,
    params: &GraphParams,
    candidates: &[Candidate],
    cap: usize,
) -> Vec<u32> {
    let mut chosen: Vec<Candidate> = Vec::with_capacity(cap);
    for &candidate in candidates {
        if chosen.len() >= cap {
            break;
        }
        let dominated = chosen.iter().any(|kept| {
            let between = distance(
                params.distance,
                vectors.vector(candidate.node),
                vectors.vector(kept.node),
            );
            between < candidate.dist
        });
        if !dominated {
            chosen.push(candidate);
        }
    }
    chosen.into_iter().map(|c| c.node).collect()
}

/// Insert an already-appended vector into the graph at `level`.
///
/// Neighbor-list updates take the owning node's stripe lock, so
/// parallel inserts on disjoint stripes proceed concurrently and no
/// reciprocal update is lost.
pub fn insert(
    edges: &EdgeStore,
    vectors: &VectorStore,
    params: &GraphParams,
    entry: &RwLock<EntryPoint>,
    new_id: u32,
    level: usize,
) -> Result<()> {
    {
        let mut ep = entry.write();
        if ep.node == NIL {
            *ep = EntryPoint {
                node: new_id,
                level,
            };
            return Ok(());
        }
    }
    let ep = *entry.read();
    let query = vectors.vector(new_id).to_vec();

    // Phase 1: descend to the insertion level
    let mut cur = if ep.level > level {
        greedy_descend(edges, vectors, params, &query, ep.node, ep.level, level)?
    } else {
        ep.node
    };

    // Phase 2: link on every layer from min(level, ep.level) down to 0
    for layer in (0..=level.min(ep.level)).rev() {
        let knobs = BeamKnobs::construction(params.ef_construction, new_id);
        let candidates = beam(edges, vectors, params, &query, cur, layer, &knobs)?;
        if candidates.is_empty() {
            // Nothing eligible on this layer (all deleted); keep descending
            continue;
        }
        let cap = params.cap(layer);
        let chosen = select_neighbors(vectors, params, &candidates, cap);

        {
            let _guard = edges.lock_node(new_id);
            edges.set_neighbors(layer, new_id, &chosen)?;
        }

        for &u in &chosen {
            let _guard = edges.lock_node(u);
            let current = edges.neighbors(layer, u)?;
            if current.as_slice().contains(&new_id) {
                continue;
            }
            if current.len() < cap {
                let mut ids = current.as_slice().to_vec();
                ids.push(new_id);
                edges.set_neighbors(layer, u, &ids)?;
            } else {
                // Over cap: rerun the heuristic over u's full neighborhood
                let base = vectors.vector(u).to_vec();
                let mut pool: Vec<Candidate> = current
                    .iter()
                    .chain(std::iter::once(new_id))
                    .map(|n| Candidate {
                        dist: distance(params.distance, &base, vectors.vector(n)),
                        node: n,
                    })
                    .collect();
                pool.sort_unstable();
                let pruned = select_neighbors(vectors, params, &pool, cap);
                edges.set_neighbors(layer, u, &pruned)?;
            }
        }

        cur = candidates[0].node;
    }

    // Phase 3: publish a higher entry point; also adopt the new node if
    // the current entry has been tombstoned out from under us
    if level > ep.level {
        let mut ep = entry.write();
        if level > ep.level || ep.node == NIL {
            *ep = EntryPoint {
                node: new_id,
                level,
            };
        }
    } else if edges.is_deleted(ep.node) {
        let mut ep = entry.write();
        if ep.node == NIL || edges.is_deleted(ep.node) {
            *ep = EntryPoint {
                node: new_id,
                level,
            };
        }
    }
    Ok(())
}

/// k-nearest search. Returns `(internal_id, distance)` ascending, ties
/// toward the lower id, at most `k` entries.
pub fn search(
    edges: &EdgeStore,
    vectors: &VectorStore,
    params: &GraphParams,
    entry: EntryPoint,
    query: &[f32],
    k: usize,
    opts: &SearchOptions,
    filter: Option<&HashSet<u32>>,
) -> Result<Vec<(u32, f32)>> {
    if entry.node == NIL || k == 0 {
        return Ok(Vec::new());
    }
    let ef = k.max(opts.ef.unwrap_or(params.ef_search));
    let deadline = opts
        .timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let cur = greedy_descend(edges, vectors, params, query, entry.node, entry.level, 0)?;

    let knobs = BeamKnobs {
        ef,
        exclude: None,
        filter,
        deadline,
        patience: opts.patience,
        patience_saturation: opts.patience_saturation.unwrap_or(1.0),
    };
    let mut results = beam(edges, vectors, params, query, cur, 0, &knobs)?;

    if let Some(threshold) = opts.min_similarity {
        results.retain(|c| similarity(params.distance, c.dist) >= threshold);
    }
    results.truncate(k);
    Ok(results.into_iter().map(|c| (c.node, c.dist)).collect())
}
