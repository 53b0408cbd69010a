//! Euclidean distance computation

/// Euclidean distance (L2 norm of `a - b`)
///
/// # Panics
/// Panics if vectors have different dimensions
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    euclidean_distance_squared(a, b).sqrt()
}

/// Squared Euclidean distance (avoids sqrt for comparison purposes)
#[inline]
pub fn euclidean_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let mut lanes = [0.0f32; 8];
    let chunks_a = a.chunks_exact(8);
    let chunks_b = b.chunks_exact(8);
    let tail_a = chunks_a.remainder();
    let tail_b = chunks_b.remainder();

    for (ca, cb) in chunks_a.zip(chunks_b) {
        for i in 0..8 {
            let diff = ca[i] - cb[i];
            lanes[i] += diff * diff;
        }
    }

    let mut sum: f32 = lanes.iter().sum();
    for (x, y) in tail_a.iter().zip(tail_b) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum
}
