//! Flat (brute-force) index engine
//!
//! Exact linear scan, O(n * d) per query. Used as the reference engine in
//! tests (its answers are the true top-K) and for small shards where building
//! a graph index is not worth it.

use ahash::AHashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{IndexEngine, RawHits};
use crate::distance;
use crate::error::{Result, ShardError};
use crate::types::{Metric, Vector, VectorId};

/// Blob format version, bumped on layout changes
const FLAT_FORMAT_VERSION: u32 = 1;

/// Row-major flat index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    version: u32,
    metric: Metric,
    dimension: usize,
    ids: Vec<VectorId>,
    /// `ids.len() * dimension` floats
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn ids(&self) -> &[VectorId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }

    /// Exact top-k for one query
    fn top_k(&self, query: &[f32], k: usize) -> Vec<(VectorId, f32)> {
        let metric = self.metric;
        let mut scored: Vec<(VectorId, f32)> = (0..self.len())
            .map(|i| (self.ids[i], distance::score(metric, query, self.row(i))))
            .collect();

        let cmp = |a: &(VectorId, f32), b: &(VectorId, f32)| {
            metric.compare(a.1, b.1).then(a.0.cmp(&b.0))
        };

        // 只保留前 k 个再排序
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, cmp);
            scored.truncate(k);
        }
        scored.sort_unstable_by(cmp);
        scored
    }
}

/// Engine producing [`FlatIndex`] blobs
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatIndexEngine;

impl FlatIndexEngine {
    pub fn new() -> Self {
        Self
    }

    fn validate_vector(dimension: usize, vector: &[f32]) -> Result<()> {
        if vector.len() != dimension {
            return Err(ShardError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
            return Err(ShardError::InvalidArgument(format!(
                "non-finite value at index {}",
                pos
            )));
        }
        Ok(())
    }
}

impl IndexEngine for FlatIndexEngine {
    type Index = FlatIndex;

    fn build(
        &self,
        dimension: usize,
        ids: &[VectorId],
        vectors: &[Vector],
        metric: Metric,
    ) -> Result<FlatIndex> {
        if dimension == 0 {
            return Err(ShardError::InvalidArgument("dimension must be at least 1".into()));
        }
        if ids.len() != vectors.len() {
            return Err(ShardError::InvalidArgument(format!(
                "{} ids for {} vectors",
                ids.len(),
                vectors.len()
            )));
        }

        let mut seen = AHashMap::with_capacity(ids.len());
        let mut data = Vec::with_capacity(vectors.len() * dimension);
        for (pos, (id, vector)) in ids.iter().zip(vectors).enumerate() {
            Self::validate_vector(dimension, vector)?;
            if let Some(prev) = seen.insert(*id, pos) {
                return Err(ShardError::InvalidArgument(format!(
                    "duplicate local id {} at positions {} and {}",
                    id, prev, pos
                )));
            }
            data.extend_from_slice(vector);
        }

        Ok(FlatIndex {
            version: FLAT_FORMAT_VERSION,
            metric,
            dimension,
            ids: ids.to_vec(),
            data,
        })
    }

    fn search(&self, index: &FlatIndex, queries: &[Vector], k: usize) -> Result<RawHits> {
        for query in queries {
            Self::validate_vector(index.dimension, query)?;
        }
        if k == 0 {
            return Ok(vec![Vec::new(); queries.len()]);
        }

        Ok(queries.par_iter().map(|q| index.top_k(q, k)).collect())
    }

    fn merge(&self, parts: &[(VectorId, &FlatIndex)]) -> Result<FlatIndex> {
        let (_, first) = parts
            .first()
            .ok_or_else(|| ShardError::InvalidArgument("nothing to merge".into()))?;

        let total: usize = parts.iter().map(|(_, idx)| idx.len()).sum();
        let mut ids = Vec::with_capacity(total);
        let mut data = Vec::with_capacity(total * first.dimension);
        let mut owner: AHashMap<VectorId, usize> = AHashMap::with_capacity(total);

        for (part_no, (offset, index)) in parts.iter().enumerate() {
            if index.metric != first.metric {
                return Err(ShardError::MetricMismatch {
                    expected: first.metric,
                    actual: index.metric,
                    shard_id: part_no as u32,
                });
            }
            if index.dimension != first.dimension {
                return Err(ShardError::DimensionMismatch {
                    expected: first.dimension,
                    actual: index.dimension,
                });
            }

            for &local in &index.ids {
                let global = local.checked_add(*offset).ok_or_else(|| {
                    ShardError::InvalidArgument(format!(
                        "id {} + offset {} overflows",
                        local, offset
                    ))
                })?;
                if let Some(prev) = owner.insert(global, part_no) {
                    return Err(ShardError::IdCollision {
                        first: prev as u32,
                        second: part_no as u32,
                        detail: format!("global id {} produced by both parts", global),
                    });
                }
                ids.push(global);
            }
            data.extend_from_slice(&index.data);
        }

        Ok(FlatIndex {
            version: FLAT_FORMAT_VERSION,
            metric: first.metric,
            dimension: first.dimension,
            ids,
            data,
        })
    }

    fn serialize(&self, index: &FlatIndex) -> Result<Vec<u8>> {
        Ok(bincode::serialize(index)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<FlatIndex> {
        let index: FlatIndex = bincode::deserialize(bytes)?;
        if index.version != FLAT_FORMAT_VERSION {
            return Err(ShardError::Corruption(format!(
                "unsupported flat index version {}",
                index.version
            )));
        }
        if index.data.len() != index.ids.len() * index.dimension {
            return Err(ShardError::Corruption(format!(
                "flat index holds {} floats for {} ids of dimension {}",
                index.data.len(),
                index.ids.len(),
                index.dimension
            )));
        }
        Ok(index)
    }

    fn metric(&self, index: &FlatIndex) -> Metric {
        index.metric
    }

    fn dimension(&self, index: &FlatIndex) -> usize {
        index.dimension
    }

    fn len(&self, index: &FlatIndex) -> usize {
        index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> (Vec<VectorId>, Vec<Vector>) {
        let vectors: Vec<Vector> = (0..10).map(|i| vec![i as f32, 0.0]).collect();
        ((0..10).collect(), vectors)
    }

    #[test]
    fn test_exact_search_l2() {
        let engine = FlatIndexEngine::new();
        let (ids, vectors) = grid();
        let index = engine.build(2, &ids, &vectors, Metric::L2).unwrap();

        let hits = engine.search(&index, &[vec![3.2, 0.0]], 3).unwrap();
        let got: Vec<VectorId> = hits[0].iter().map(|h| h.0).collect();
        assert_eq!(got, vec![3, 4, 2]);
        assert!((hits[0][0].1 - 0.04).abs() < 1e-4);
    }

    #[test]
    fn test_inner_product_is_descending() {
        let engine = FlatIndexEngine::new();
        let (ids, vectors) = grid();
        let index = engine.build(2, &ids, &vectors, Metric::InnerProduct).unwrap();

        let hits = engine.search(&index, &[vec![1.0, 0.0]], 2).unwrap();
        assert_eq!(hits[0][0].0, 9);
        assert_eq!(hits[0][1].0, 8);
    }

    #[test]
    fn test_k_larger_than_index() {
        let engine = FlatIndexEngine::new();
        let index = engine.build(2, &[4, 7], &[vec![0.0, 0.0], vec![1.0, 1.0]], Metric::L2).unwrap();
        let hits = engine.search(&index, &[vec![0.0, 0.0]], 10).unwrap();
        assert_eq!(hits[0].len(), 2);
        assert_eq!(hits[0][0].0, 4);
    }

    #[test]
    fn test_build_rejects_bad_input() {
        let engine = FlatIndexEngine::new();
        assert!(matches!(
            engine.build(3, &[0], &[vec![1.0, 2.0]], Metric::L2),
            Err(ShardError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(engine.build(1, &[0], &[vec![f32::NAN]], Metric::L2).is_err());
        assert!(engine.build(1, &[5, 5], &[vec![1.0], vec![2.0]], Metric::L2).is_err());
    }

    #[test]
    fn test_merge_applies_offsets() {
        let engine = FlatIndexEngine::new();
        let a = engine.build(1, &[0, 1], &[vec![0.0], vec![1.0]], Metric::L2).unwrap();
        let b = engine.build(1, &[0, 1], &[vec![10.0], vec![11.0]], Metric::L2).unwrap();

        let merged = engine.merge(&[(0, &a), (2, &b)]).unwrap();
        assert_eq!(merged.ids(), &[0, 1, 2, 3]);

        let hits = engine.search(&merged, &[vec![10.4]], 1).unwrap();
        assert_eq!(hits[0][0].0, 2);
    }

    #[test]
    fn test_merge_detects_collisions() {
        let engine = FlatIndexEngine::new();
        let a = engine.build(1, &[0, 1], &[vec![0.0], vec![1.0]], Metric::L2).unwrap();
        let b = engine.build(1, &[0, 1], &[vec![2.0], vec![3.0]], Metric::L2).unwrap();
        let err = engine.merge(&[(0, &a), (1, &b)]).unwrap_err();
        assert!(matches!(err, ShardError::IdCollision { first: 0, second: 1, .. }));

        let c = engine.build(1, &[0], &[vec![0.0]], Metric::Cosine).unwrap();
        assert!(matches!(
            engine.merge(&[(0, &a), (10, &c)]),
            Err(ShardError::MetricMismatch { .. })
        ));
    }

    #[test]
    fn test_blob_round_trip_and_corruption() {
        let engine = FlatIndexEngine::new();
        let (ids, vectors) = grid();
        let index = engine.build(2, &ids, &vectors, Metric::Cosine).unwrap();
        let bytes = engine.serialize(&index).unwrap();
        assert_eq!(engine.deserialize(&bytes).unwrap(), index);

        assert!(engine.deserialize(&bytes[..bytes.len() / 2]).is_err());
    }
}
