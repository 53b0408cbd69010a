//! Distance metrics for vector similarity computation
//!
//! Scalar kernels written in 8-lane chunks so the compiler can vectorize them.

pub mod cosine;
pub mod euclidean;
pub mod inner_product;

pub use cosine::{cosine_distance, cosine_similarity};
pub use euclidean::{euclidean_distance, euclidean_distance_squared};
pub use inner_product::inner_product;

use crate::types::Metric;

/// Score `a` against `b` under `metric`.
///
/// L2 is squared (no sqrt, rank-equivalent), cosine is `1 - cos`,
/// inner product is the raw dot product.
#[inline]
pub fn score(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::L2 => euclidean_distance_squared(a, b),
        Metric::InnerProduct => inner_product(a, b),
        Metric::Cosine => cosine_distance(a, b),
    }
}
