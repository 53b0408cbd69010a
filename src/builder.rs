//! Shard building
//!
//! Turns one planned partition into a persisted [`ShardArtifact`]: the engine
//! builds the index, the store publishes it under the shard's directory.
//! A failure here belongs to this shard only.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::engine::IndexEngine;
use crate::error::{Result, ShardError};
use crate::storage::{ArtifactStore, SidecarRecord};
use crate::types::{Metric, ShardArtifact, ShardId, ShardSpec, Vector, VectorId};

/// Builds and persists single-shard indexes
pub struct ShardBuilder<E: IndexEngine> {
    engine: Arc<E>,
    store: ArtifactStore,
    /// Corpus-wide vector dimension
    dimension: usize,
    retry: RetryConfig,
}

impl<E: IndexEngine> ShardBuilder<E> {
    pub fn new(engine: Arc<E>, store: ArtifactStore, dimension: usize) -> Self {
        Self {
            engine,
            store,
            dimension,
            retry: RetryConfig::none(),
        }
    }

    /// Retry policy for storage failures while persisting
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Build `spec`'s partition and persist it under `destination`.
    ///
    /// Local ids are `0..vectors.len()` in the order given; `id_offset` places
    /// them in the global id space.
    ///
    /// # Errors
    /// - `ShardBuild`: the engine rejected the input (isolated, retry the shard)
    /// - `Storage`: persisting failed after all retries (transient)
    pub fn build(
        &self,
        spec: &ShardSpec,
        vectors: &[Vector],
        metric: Metric,
        destination: &str,
        id_offset: VectorId,
    ) -> Result<ShardArtifact> {
        let start = Instant::now();
        let shard_id = spec.shard_id;

        if vectors.len() != spec.len() {
            return Err(build_failure(
                shard_id,
                format!("shard covers {} ids but {} vectors were supplied", spec.len(), vectors.len()),
            ));
        }
        if vectors.len() > spec.capacity {
            return Err(build_failure(
                shard_id,
                format!("{} vectors exceed shard capacity {}", vectors.len(), spec.capacity),
            ));
        }
        if id_offset.checked_add(vectors.len() as VectorId).is_none() {
            return Err(ShardError::InvalidArgument(format!(
                "id_offset {} overflows the id space",
                id_offset
            )));
        }

        let local_ids: Vec<VectorId> = (0..vectors.len() as VectorId).collect();
        let index = self
            .engine
            .build(self.dimension, &local_ids, vectors, metric)
            .map_err(|e| into_build_failure(shard_id, e))?;
        let blob = self
            .engine
            .serialize(&index)
            .map_err(|e| into_build_failure(shard_id, e))?;
        drop(index);

        let root = self.store.resolve_local(destination)?;
        let sidecar = SidecarRecord::for_shard(shard_id, vectors.len(), self.dimension, metric, id_offset);
        let storage_path = self.persist_with_retry(shard_id, || {
            self.store.publish_shard(&root, &blob, sidecar.clone())
        })?;

        info!(
            shard_id,
            vectors = vectors.len(),
            bytes = blob.len(),
            path = %storage_path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "shard built"
        );

        Ok(ShardArtifact {
            shard_id,
            storage_path,
            vector_count: vectors.len(),
            metric,
            dimension: self.dimension,
            id_offset,
        })
    }

    fn persist_with_retry<T>(&self, shard_id: ShardId, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    attempt += 1;
                    let backoff = self.retry.backoff_for(attempt);
                    warn!(shard_id, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "persist failed, retrying");
                    std::thread::sleep(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn build_failure(shard_id: ShardId, reason: String) -> ShardError {
    ShardError::ShardBuild { shard_id, reason }
}

/// Engine errors are input problems of this shard
fn into_build_failure(shard_id: ShardId, err: ShardError) -> ShardError {
    match err {
        e @ ShardError::ShardBuild { .. } => e,
        e @ ShardError::Storage { .. } => e,
        other => build_failure(shard_id, other.to_string()),
    }
}
