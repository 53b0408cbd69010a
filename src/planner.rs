//! Shard planning
//!
//! Decides how many shards a corpus needs under a memory ceiling and which
//! corpus ids each shard covers. Pure: no I/O, no side effects.

use tracing::{debug, info};

use crate::config::{Partitioning, ShardingConfig};
use crate::error::{Result, ShardError};
use crate::types::{IdRange, ShardId, ShardSpec, VectorId};

/// Planner inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub total_vectors: u64,
    pub vector_dim: usize,
    /// In-memory bytes per indexed vector (None = flat f32 storage plus id)
    pub bytes_per_vector_estimate: Option<u64>,
    pub current_memory_available: u64,
    pub max_index_memory_usage: u64,
    pub max_shards_hint: usize,
}

impl PlanRequest {
    pub fn new(
        total_vectors: u64,
        vector_dim: usize,
        bytes_per_vector_estimate: Option<u64>,
        current_memory_available: u64,
        max_index_memory_usage: u64,
        max_shards_hint: usize,
    ) -> Self {
        Self {
            total_vectors,
            vector_dim,
            bytes_per_vector_estimate,
            current_memory_available,
            max_index_memory_usage,
            max_shards_hint,
        }
    }

    /// Take memory budgets and the shard hint from `config`
    pub fn from_config(config: &ShardingConfig, total_vectors: u64, vector_dim: usize) -> Result<Self> {
        Ok(Self {
            total_vectors,
            vector_dim,
            bytes_per_vector_estimate: None,
            current_memory_available: config.memory.current_memory_bytes()?,
            max_index_memory_usage: config.memory.max_index_bytes()?,
            max_shards_hint: config.max_shards_hint,
        })
    }

    pub fn bytes_per_vector(&self) -> u64 {
        self.bytes_per_vector_estimate
            .unwrap_or_else(|| flat_bytes_per_vector(self.vector_dim))
    }

    /// Memory one shard may use: it must fit both the index ceiling and the worker
    pub fn memory_ceiling(&self) -> u64 {
        self.max_index_memory_usage.min(self.current_memory_available)
    }
}

/// f32 components plus a u64 id
pub fn flat_bytes_per_vector(dim: usize) -> u64 {
    dim as u64 * 4 + 8
}

/// Assigns corpus ids to a fixed number of shards.
///
/// The returned ranges must form a total, non-overlapping cover of
/// `0..total_vectors`; [`ShardPlanner::plan`] checks this.
pub trait Partitioner: Send + Sync {
    fn partition(&self, total_vectors: u64, shard_count: usize) -> Vec<IdRange>;
}

/// Balanced contiguous ranges; the first `total % n` shards get one extra id
#[derive(Debug, Clone, Copy, Default)]
pub struct ContiguousPartitioner;

impl Partitioner for ContiguousPartitioner {
    fn partition(&self, total_vectors: u64, shard_count: usize) -> Vec<IdRange> {
        let n = shard_count as u64;
        let base = total_vectors / n;
        let extra = total_vectors % n;

        let mut start = 0;
        (0..n)
            .map(|i| {
                let len = base + u64::from(i < extra);
                let range = IdRange::Contiguous(start..start + len);
                start += len;
                range
            })
            .collect()
    }
}

/// Round-robin: id `i` goes to shard `i % n`
#[derive(Debug, Clone, Copy, Default)]
pub struct StridedPartitioner;

impl Partitioner for StridedPartitioner {
    fn partition(&self, total_vectors: u64, shard_count: usize) -> Vec<IdRange> {
        let n = shard_count as u64;
        (0..n)
            .map(|s| IdRange::Explicit((s..total_vectors).step_by(shard_count).collect()))
            .collect()
    }
}

/// Shard planner
pub struct ShardPlanner {
    partitioner: Box<dyn Partitioner>,
}

impl Default for ShardPlanner {
    fn default() -> Self {
        Self::new(ContiguousPartitioner)
    }
}

impl ShardPlanner {
    pub fn new(partitioner: impl Partitioner + 'static) -> Self {
        Self {
            partitioner: Box::new(partitioner),
        }
    }

    pub fn from_partitioning(partitioning: Partitioning) -> Self {
        match partitioning {
            Partitioning::Contiguous => Self::new(ContiguousPartitioner),
            Partitioning::Strided => Self::new(StridedPartitioner),
        }
    }

    /// Vectors one shard can hold under the request's memory ceiling.
    ///
    /// An empty corpus always fits, so a zero capacity is only an error when
    /// there is something to place.
    pub fn per_shard_capacity(req: &PlanRequest) -> Result<u64> {
        if req.vector_dim == 0 {
            return Err(ShardError::InvalidArgument("vector_dim must be at least 1".into()));
        }
        let bytes = req.bytes_per_vector();
        if bytes == 0 {
            return Err(ShardError::InvalidArgument(
                "bytes_per_vector_estimate must be at least 1".into(),
            ));
        }
        let capacity = req.memory_ceiling() / bytes;
        if capacity == 0 && req.total_vectors > 0 {
            return Err(ShardError::Capacity(format!(
                "memory ceiling of {} bytes cannot hold a single {}-byte vector",
                req.memory_ceiling(),
                bytes
            )));
        }
        Ok(capacity)
    }

    /// Number of shards the request needs: `max(ceil(total / capacity), 1)`
    pub fn shard_count(req: &PlanRequest) -> Result<usize> {
        if req.max_shards_hint == 0 {
            return Err(ShardError::InvalidArgument("max_shards_hint must be at least 1".into()));
        }
        let capacity = Self::per_shard_capacity(req)?;
        let min_shards = if req.total_vectors == 0 {
            1
        } else {
            req.total_vectors.div_ceil(capacity)
        };

        if min_shards > req.max_shards_hint as u64 {
            return Err(ShardError::Capacity(format!(
                "{} vectors need {} shards of at most {} vectors ({} bytes each), \
                 but at most {} shards are allowed",
                req.total_vectors,
                min_shards,
                capacity,
                req.memory_ceiling(),
                req.max_shards_hint
            )));
        }
        Ok(min_shards as usize)
    }

    /// Plan the shards for `req`
    pub fn plan(&self, req: &PlanRequest) -> Result<Vec<ShardSpec>> {
        let capacity = Self::per_shard_capacity(req)?;
        let shard_count = Self::shard_count(req)?;

        let ranges = self.partitioner.partition(req.total_vectors, shard_count);
        validate_cover(&ranges, req.total_vectors, shard_count, capacity)?;

        let specs: Vec<ShardSpec> = ranges
            .into_iter()
            .enumerate()
            .map(|(i, vector_range)| ShardSpec {
                shard_id: i as ShardId,
                vector_range,
                capacity: capacity as usize,
            })
            .collect();

        for spec in &specs {
            debug!(shard_id = spec.shard_id, vectors = spec.len(), "planned shard");
        }
        info!(
            total_vectors = req.total_vectors,
            shards = specs.len(),
            per_shard_capacity = capacity,
            bytes_per_vector = req.bytes_per_vector(),
            "shard plan ready"
        );
        Ok(specs)
    }
}

/// Ranges must cover `0..total` exactly once and respect the shard capacity
fn validate_cover(ranges: &[IdRange], total: u64, shard_count: usize, capacity: u64) -> Result<()> {
    let invalid = |msg: String| ShardError::InvalidArgument(format!("invalid partitioning: {}", msg));

    if ranges.len() != shard_count {
        return Err(invalid(format!("{} ranges for {} shards", ranges.len(), shard_count)));
    }
    if let Some((i, r)) = ranges.iter().enumerate().find(|(_, r)| r.len() as u64 > capacity) {
        return Err(invalid(format!(
            "shard {} holds {} vectors, capacity is {}",
            i,
            r.len(),
            capacity
        )));
    }
    let covered: u64 = ranges.iter().map(|r| r.len() as u64).sum();
    if covered != total {
        return Err(invalid(format!("ranges cover {} ids, corpus has {}", covered, total)));
    }

    if let Some(contiguous) = ranges
        .iter()
        .map(|r| match r {
            IdRange::Contiguous(range) => Some((range.start, range.end)),
            IdRange::Explicit(_) => None,
        })
        .collect::<Option<Vec<(VectorId, VectorId)>>>()
    {
        return validate_intervals(contiguous, total).map_err(invalid);
    }

    // 每个 id 恰好出现一次
    let mut seen = vec![0u64; total.div_ceil(64) as usize];
    for range in ranges {
        for id in range.iter() {
            mark(&mut seen, id, total).map_err(invalid)?;
        }
    }
    Ok(())
}

/// Contiguous ranges: sorted, they must tile `0..total` end to start
fn validate_intervals(mut intervals: Vec<(VectorId, VectorId)>, total: u64) -> std::result::Result<(), String> {
    intervals.retain(|(start, end)| end > start);
    intervals.sort_unstable();

    let mut cursor = 0;
    for (start, end) in intervals {
        if start < cursor {
            return Err(format!("id {} assigned twice", start));
        }
        if start > cursor {
            return Err(format!("ids {}..{} not assigned", cursor, start));
        }
        cursor = end;
    }
    if cursor != total {
        return Err(format!("ids {}..{} not assigned", cursor, total));
    }
    Ok(())
}

fn mark(bits: &mut [u64], id: VectorId, total: u64) -> std::result::Result<(), String> {
    if id >= total {
        return Err(format!("id {} outside corpus of {}", id, total));
    }
    let (word, bit) = ((id / 64) as usize, id % 64);
    if bits[word] & (1 << bit) != 0 {
        return Err(format!("id {} assigned twice", id));
    }
    bits[word] |= 1 << bit;
    Ok(())
}
