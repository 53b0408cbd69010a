//! Core data model: metrics, shard specs, artifacts, queries and results

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Range;
use std::path::PathBuf;

use crate::error::{Result, ShardError};

/// Shard identifier (assigned by the planner)
pub type ShardId = u32;

/// Vector identifier. Local inside one shard, global after applying `id_offset`.
pub type VectorId = u64;

/// Dense embedding
pub type Vector = Vec<f32>;

/// Distance / similarity function that defines nearest-neighbor ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared Euclidean distance (smaller is better)
    L2,
    /// Dot product similarity (larger is better)
    InnerProduct,
    /// Cosine distance `1 - cos` (smaller is better)
    Cosine,
}

impl Metric {
    /// Whether a larger score ranks higher
    #[inline]
    pub fn higher_is_better(&self) -> bool {
        matches!(self, Metric::InnerProduct)
    }

    /// Order two scores best-first according to the metric direction.
    ///
    /// Uses `total_cmp`, so NaN scores sort deterministically (after every
    /// real number for ascending metrics).
    #[inline]
    pub fn compare(&self, a: f32, b: f32) -> Ordering {
        if self.higher_is_better() {
            b.total_cmp(&a)
        } else {
            a.total_cmp(&b)
        }
    }

    /// `a` ranks strictly better than `b`
    #[inline]
    pub fn is_better(&self, a: f32, b: f32) -> bool {
        self.compare(a, b) == Ordering::Less
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::InnerProduct => "inner_product",
            Metric::Cosine => "cosine",
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(Metric::L2),
            "ip" | "inner_product" | "dot" => Ok(Metric::InnerProduct),
            "cosine" => Ok(Metric::Cosine),
            other => Err(ShardError::InvalidArgument(format!("unknown metric '{}'", other))),
        }
    }
}

/// Corpus ids covered by one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdRange {
    /// `[start, end)` of corpus ids
    Contiguous(Range<VectorId>),
    /// Arbitrary subset, in shard-local order
    Explicit(Vec<VectorId>),
}

impl IdRange {
    pub fn len(&self) -> usize {
        match self {
            IdRange::Contiguous(r) => (r.end.saturating_sub(r.start)) as usize,
            IdRange::Explicit(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Corpus id of the `local`-th vector of this range
    pub fn corpus_id(&self, local: VectorId) -> Option<VectorId> {
        match self {
            IdRange::Contiguous(r) => {
                let id = r.start.checked_add(local)?;
                (id < r.end).then_some(id)
            }
            IdRange::Explicit(ids) => ids.get(local as usize).copied(),
        }
    }

    /// Iterate corpus ids in shard-local order
    pub fn iter(&self) -> Box<dyn Iterator<Item = VectorId> + '_> {
        match self {
            IdRange::Contiguous(r) => Box::new(r.clone()),
            IdRange::Explicit(ids) => Box::new(ids.iter().copied()),
        }
    }
}

/// One planned partition. Immutable once issued by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub shard_id: ShardId,
    pub vector_range: IdRange,
    /// Maximum number of vectors this shard may hold
    pub capacity: usize,
}

impl ShardSpec {
    pub fn len(&self) -> usize {
        self.vector_range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector_range.is_empty()
    }

    /// Map a shard-local id back to the corpus id it was built from
    pub fn corpus_id(&self, local: VectorId) -> Option<VectorId> {
        self.vector_range.corpus_id(local)
    }
}

/// A persisted single-shard index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardArtifact {
    pub shard_id: ShardId,
    pub storage_path: PathBuf,
    pub vector_count: usize,
    pub metric: Metric,
    pub dimension: usize,
    /// Base added to local ids to place them in the global id space
    pub id_offset: VectorId,
}

impl ShardArtifact {
    /// Global id range `[id_offset, id_offset + vector_count)`
    pub fn global_range(&self) -> Range<VectorId> {
        self.id_offset..self.id_offset + self.vector_count as VectorId
    }
}

/// Placement of one source shard inside a merged artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedSegment {
    pub shard_id: ShardId,
    /// Offset actually applied during the merge
    pub id_offset: VectorId,
    pub vector_count: usize,
}

/// A persisted index combined from several shard artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedArtifact {
    pub storage_path: PathBuf,
    pub vector_count: usize,
    pub metric: Metric,
    pub dimension: usize,
    pub source_shard_ids: Vec<ShardId>,
    pub segments: Vec<MergedSegment>,
}

impl MergedArtifact {
    /// View the merged index as a single searchable shard.
    ///
    /// Ids inside a merged blob are already global, so the offset is zero.
    pub fn as_shard(&self, shard_id: ShardId) -> ShardArtifact {
        ShardArtifact {
            shard_id,
            storage_path: self.storage_path.clone(),
            vector_count: self.vector_count,
            metric: self.metric,
            dimension: self.dimension,
            id_offset: 0,
        }
    }
}

/// Ordered batch of query vectors with the requested top-K
#[derive(Debug, Clone)]
pub struct QueryBatch {
    queries: Vec<Vector>,
    dimension: usize,
    pub k: usize,
}

impl QueryBatch {
    /// Build a batch, checking that every query has the same dimension.
    pub fn new(queries: Vec<Vector>, k: usize) -> Result<Self> {
        let dimension = queries.first().map(|q| q.len()).unwrap_or(0);
        if let Some(bad) = queries.iter().find(|q| q.len() != dimension) {
            return Err(ShardError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }
        if k == 0 {
            return Err(ShardError::InvalidArgument("k must be at least 1".into()));
        }
        Ok(Self { queries, dimension, k })
    }

    pub fn queries(&self) -> &[Vector] {
        &self.queries
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// One search hit with provenance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Global id (local id + shard offset)
    pub id: VectorId,
    pub distance: f32,
    pub shard_id: ShardId,
    /// Id inside the shard, before the offset was applied
    pub local_id: VectorId,
}

impl Candidate {
    /// Deterministic total order: metric direction, then shard id, then local id
    pub fn rank_cmp(&self, other: &Self, metric: Metric) -> Ordering {
        metric
            .compare(self.distance, other.distance)
            .then(self.shard_id.cmp(&other.shard_id))
            .then(self.local_id.cmp(&other.local_id))
    }
}

/// Globally ranked top-K per query
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    /// One best-first list of at most `k` candidates per query index
    pub results: Vec<Vec<Candidate>>,
    /// Set when some shards were excluded under the degrade policy
    pub partial: bool,
    /// Shards whose candidates are missing from this result
    pub missing_shards: Vec<ShardId>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Ranked global ids for one query
    pub fn ids(&self, query: usize) -> Vec<VectorId> {
        self.results
            .get(query)
            .map(|hits| hits.iter().map(|c| c.id).collect())
            .unwrap_or_default()
    }
}
