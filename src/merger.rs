//! Offline index merging
//!
//! Concatenates persisted shard artifacts into one merged artifact.
//!
//! - `shift_ids = true`: offsets are reassigned from a running cursor in input
//!   order, so global ids are unique by construction.
//! - `shift_ids = false`: each artifact keeps its own `id_offset`; the ranges
//!   `[id_offset, id_offset + vector_count)` must be pairwise disjoint or the
//!   merge fails with `IdCollision`. Colliding ids are never renumbered.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::engine::IndexEngine;
use crate::error::{Result, ShardError};
use crate::storage::{ArtifactStore, SidecarRecord};
use crate::types::{MergedArtifact, MergedSegment, ShardArtifact, ShardId, VectorId};

pub struct IndexMerger<E: IndexEngine> {
    engine: Arc<E>,
    store: ArtifactStore,
    retry: RetryConfig,
}

impl<E: IndexEngine> IndexMerger<E> {
    pub fn new(engine: Arc<E>, store: ArtifactStore) -> Self {
        Self {
            engine,
            store,
            retry: RetryConfig::none(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Merge `artifacts` (in order) into a new artifact under `destination`.
    ///
    /// All preconditions are checked before any blob is read.
    pub fn merge(
        &self,
        artifacts: &[ShardArtifact],
        shift_ids: bool,
        destination: &str,
    ) -> Result<MergedArtifact> {
        let start = Instant::now();
        let segments = plan_segments(artifacts, shift_ids)?;
        let root = self.store.resolve_local(destination)?;

        let mut indexes = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let bytes = self.store.read_blob(&artifact.storage_path)?;
            let index = self.engine.deserialize(&bytes)?;
            let stored = self.engine.len(&index);
            if stored != artifact.vector_count {
                return Err(ShardError::Corruption(format!(
                    "shard {} blob holds {} vectors, artifact says {}",
                    artifact.shard_id, stored, artifact.vector_count
                )));
            }
            debug!(shard_id = artifact.shard_id, vectors = stored, "merge input loaded");
            indexes.push(index);
        }

        let parts: Vec<(VectorId, &E::Index)> = segments
            .iter()
            .zip(&indexes)
            .map(|(seg, index)| (seg.id_offset, index))
            .collect();
        let merged = self
            .engine
            .merge(&parts)
            .map_err(|e| attribute_parts(e, &segments))?;
        let blob = self.engine.serialize(&merged)?;
        drop(parts);
        drop(indexes);

        let first = &artifacts[0];
        let vector_count = self.engine.len(&merged);
        let sidecar = SidecarRecord::for_merged(vector_count, first.dimension, first.metric, segments.clone());

        let storage_path = {
            let attempts = self.retry.max_attempts.max(1);
            let mut attempt = 1;
            loop {
                match self.store.publish_merged(&root, &blob, sidecar.clone()) {
                    Ok(path) => break path,
                    Err(e) if e.is_retryable() && attempt < attempts => {
                        attempt += 1;
                        warn!(attempt, error = %e, "merged artifact persist failed, retrying");
                        std::thread::sleep(self.retry.backoff_for(attempt));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        info!(
            inputs = artifacts.len(),
            vectors = vector_count,
            shift_ids,
            path = %storage_path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "shards merged"
        );

        Ok(MergedArtifact {
            storage_path,
            vector_count,
            metric: first.metric,
            dimension: first.dimension,
            source_shard_ids: segments.iter().map(|s| s.shard_id).collect(),
            segments,
        })
    }
}

/// Validate merge preconditions and compute the offset applied to each input.
pub fn plan_segments(artifacts: &[ShardArtifact], shift_ids: bool) -> Result<Vec<MergedSegment>> {
    let first = artifacts
        .first()
        .ok_or_else(|| ShardError::InvalidArgument("merge needs at least one artifact".into()))?;

    for (i, artifact) in artifacts.iter().enumerate() {
        if artifact.metric != first.metric {
            return Err(ShardError::MetricMismatch {
                expected: first.metric,
                actual: artifact.metric,
                shard_id: artifact.shard_id,
            });
        }
        if artifact.dimension != first.dimension {
            return Err(ShardError::DimensionMismatch {
                expected: first.dimension,
                actual: artifact.dimension,
            });
        }
        if artifacts[..i].iter().any(|a| a.storage_path == artifact.storage_path) {
            return Err(ShardError::InvalidArgument(format!(
                "artifact {} listed twice",
                artifact.storage_path.display()
            )));
        }
    }

    if shift_ids {
        let mut cursor: VectorId = 0;
        artifacts
            .iter()
            .map(|a| {
                let seg = MergedSegment {
                    shard_id: a.shard_id,
                    id_offset: cursor,
                    vector_count: a.vector_count,
                };
                cursor = cursor.checked_add(a.vector_count as VectorId).ok_or_else(|| {
                    ShardError::InvalidArgument("merged id space overflows u64".into())
                })?;
                Ok(seg)
            })
            .collect()
    } else {
        check_disjoint(artifacts)?;
        Ok(artifacts
            .iter()
            .map(|a| MergedSegment {
                shard_id: a.shard_id,
                id_offset: a.id_offset,
                vector_count: a.vector_count,
            })
            .collect())
    }
}

/// Engine merge errors name part positions; report the shard ids instead
fn attribute_parts(err: ShardError, segments: &[MergedSegment]) -> ShardError {
    let shard = |part: ShardId| {
        segments
            .get(part as usize)
            .map(|s| s.shard_id)
            .unwrap_or(part)
    };
    match err {
        ShardError::IdCollision { first, second, detail } => ShardError::IdCollision {
            first: shard(first),
            second: shard(second),
            detail,
        },
        ShardError::MetricMismatch { expected, actual, shard_id } => ShardError::MetricMismatch {
            expected,
            actual,
            shard_id: shard(shard_id),
        },
        other => other,
    }
}

/// Pairwise-disjoint `[id_offset, id_offset + vector_count)` ranges
fn check_disjoint(artifacts: &[ShardArtifact]) -> Result<()> {
    let mut ranges: Vec<(VectorId, VectorId, &ShardArtifact)> = Vec::with_capacity(artifacts.len());
    for a in artifacts.iter().filter(|a| a.vector_count > 0) {
        let end = a.id_offset.checked_add(a.vector_count as VectorId).ok_or_else(|| {
            ShardError::InvalidArgument(format!("shard {} id range overflows u64", a.shard_id))
        })?;
        ranges.push((a.id_offset, end, a));
    }
    ranges.sort_by_key(|(start, end, a)| (*start, *end, a.shard_id));

    for pair in ranges.windows(2) {
        let (start_a, end_a, a) = pair[0];
        let (start_b, end_b, b) = pair[1];
        if start_b < end_a {
            return Err(ShardError::IdCollision {
                first: a.shard_id,
                second: b.shard_id,
                detail: format!(
                    "global ids [{}, {}) overlap [{}, {})",
                    start_a, end_a, start_b, end_b
                ),
            });
        }
    }
    Ok(())
}
