//! Cosine similarity and distance computation

use super::inner_product::inner_product;

/// Cosine similarity in range [-1, 1], where 1 means identical direction.
///
/// A zero vector has no direction; its similarity to anything is 0.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot = inner_product(a, b);
    let norm_a = inner_product(a, a).sqrt();
    let norm_b = inner_product(b, b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Cosine distance (1 - cosine_similarity), range [0, 2]
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}
