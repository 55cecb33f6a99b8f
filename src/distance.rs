//! Distance kernels
//!
//! All three metrics are expressed as distances (smaller is closer):
//! squared L2, cosine distance `1 - <a,b>` (normalized inputs assumed),
//! and negated inner product. Uses SIMD acceleration when available
//! (2-4x faster on AVX2/NEON), with an f64-accumulating scalar fallback
//! for unsupported architectures.

use crate::config::DistanceKind;

/// Distance between two equal-length vectors under `kind`.
///
/// Callers validate lengths up front (the index enforces `dim` on every
/// accepted vector), so this takes matching slices and does not re-check.
pub fn distance(kind: DistanceKind, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    match kind {
        DistanceKind::SquaredL2 => squared_l2(a, b),
        DistanceKind::Cosine => 1.0 - dot(a, b),
        DistanceKind::InnerProduct => -dot(a, b),
    }
}

/// Normalized similarity in "higher is better" form, for the
/// `min_similarity` and patience early-stop knobs.
pub fn similarity(kind: DistanceKind, dist: f32) -> f32 {
    match kind {
        DistanceKind::SquaredL2 => 1.0 / (1.0 + dist.max(0.0)),
        DistanceKind::Cosine => 1.0 - dist,
        DistanceKind::InnerProduct => -dist,
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    use simsimd::SpatialSimilarity;
    f32::sqeuclidean(a, b).unwrap_or_else(|| {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| {
                let d = (x as f64) - (y as f64);
                d * d
            })
            .sum::<f64>()
    }) as f32
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    use simsimd::SpatialSimilarity;
    f32::dot(a, b).unwrap_or_else(|| {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| (x as f64) * (y as f64))
            .sum::<f64>()
    }) as f32
}
