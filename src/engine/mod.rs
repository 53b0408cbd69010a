//! Index-build capability
//!
//! The internal structure of a single vector index is opaque to the sharding
//! layer. Everything it needs from an engine goes through [`IndexEngine`]:
//! build a blob from vectors, search it, concatenate several blobs with id
//! offsets, and (de)serialize for persistence.

pub mod flat;

pub use flat::{FlatIndex, FlatIndexEngine};

use crate::error::Result;
use crate::types::{Metric, Vector, VectorId};

/// Raw per-query hits from one index: `(local id, score)`, best-first
pub type RawHits = Vec<Vec<(VectorId, f32)>>;

/// Vector index engine used by builders, mergers and fanout.
///
/// Implementations must be `Send + Sync`; the sharding layer calls them from
/// many worker threads at once.
pub trait IndexEngine: Send + Sync {
    /// Opaque in-memory index
    type Index: Send + Sync;

    /// Build an index over `vectors`, tagging vector `i` with `ids[i]`.
    ///
    /// # Errors
    /// Malformed input (dimension mismatch, non-finite values, duplicate ids).
    fn build(
        &self,
        dimension: usize,
        ids: &[VectorId],
        vectors: &[Vector],
        metric: Metric,
    ) -> Result<Self::Index>;

    /// Top-`k` per query, best-first under the index metric
    fn search(&self, index: &Self::Index, queries: &[Vector], k: usize) -> Result<RawHits>;

    /// Concatenate indexes in order; ids of part `i` are shifted by `parts[i].0`.
    ///
    /// # Errors
    /// Mixed metrics or dimensions, or colliding ids after shifting. The shard
    /// id fields of those errors hold positions in `parts`.
    fn merge(&self, parts: &[(VectorId, &Self::Index)]) -> Result<Self::Index>;

    fn serialize(&self, index: &Self::Index) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Index>;

    fn metric(&self, index: &Self::Index) -> Metric;

    fn dimension(&self, index: &Self::Index) -> usize;

    fn len(&self, index: &Self::Index) -> usize;
}
