//! Query fanout (scatter-gather)
//!
//! One scoped search task per shard; results come back over a channel and
//! the gather loop is the single join point. Local ids are turned into
//! global ids (`local + id_offset`) and tagged with the shard id before they
//! leave this module.
//!
//! Failure handling is chosen per call:
//! - `FailFast`: the first failed shard stops outstanding tasks and the
//!   whole batch fails.
//! - `Degrade`: failed shards are reported and left out of the merge, even
//!   when that leaves no shard at all.
//!
//! Cancellation is all-or-nothing: once the token is set, the batch returns
//! `Cancelled` and no partial result.

use crossbeam::channel::{self, RecvTimeoutError};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::engine::IndexEngine;
use crate::error::{Result, ShardError};
use crate::storage::ArtifactStore;
use crate::types::{Candidate, QueryBatch, ShardArtifact, ShardId, VectorId};

/// Gather loop wake-up interval for cancellation checks
const GATHER_POLL: Duration = Duration::from_millis(10);

/// What to do when a shard search fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the whole batch
    FailFast,
    /// Exclude the failed shard and flag the result as partial
    Degrade,
}

/// Per-shard candidate lists: `shard_id -> [query index -> best-first candidates]`
pub type PerShardResults = BTreeMap<ShardId, Vec<Vec<Candidate>>>;

/// Gathered fanout output
#[derive(Debug, Clone, Default)]
pub struct FanoutResult {
    pub per_shard: PerShardResults,
    /// Shards excluded under `Degrade`, with the failure reason
    pub failed: Vec<(ShardId, String)>,
}

impl FanoutResult {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

enum TaskOutcome {
    Done(Vec<Vec<Candidate>>),
    Failed(ShardError),
    /// Skipped because the batch was aborted or cancelled
    Skipped,
}

pub struct QueryFanout<E: IndexEngine> {
    engine: Arc<E>,
    store: ArtifactStore,
    /// Opened indexes keyed by blob path; artifacts are immutable
    cache: Mutex<LruCache<PathBuf, Arc<E::Index>>>,
}

impl<E: IndexEngine> QueryFanout<E> {
    pub fn new(engine: Arc<E>, store: ArtifactStore, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            engine,
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of opened indexes currently cached
    pub fn cached_indexes(&self) -> usize {
        self.cache.lock().len()
    }

    /// Search every shard for `k_per_shard` candidates per query.
    ///
    /// Blocks until every dispatched task has completed or definitively failed.
    pub fn fanout(
        &self,
        batch: &QueryBatch,
        shards: &[ShardArtifact],
        k_per_shard: usize,
        policy: FailurePolicy,
        cancel: &CancellationToken,
    ) -> Result<FanoutResult> {
        validate(batch, shards, k_per_shard)?;
        cancel.check()?;

        let start = Instant::now();
        let abort = AtomicBool::new(false);
        let (tx, rx) = channel::unbounded::<(ShardId, TaskOutcome)>();

        let mut result = FanoutResult::default();
        let mut real_failures: Vec<(ShardId, String)> = Vec::new();

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(shards.len());
            for artifact in shards {
                let tx = tx.clone();
                let abort = &abort;
                let handle = scope.spawn(move || {
                    let stopped = || cancel.is_cancelled() || abort.load(Ordering::Acquire);
                    // checked again after the (possibly slow) index load
                    let outcome = if stopped() {
                        TaskOutcome::Skipped
                    } else {
                        match self.open(artifact) {
                            Err(e) => TaskOutcome::Failed(e),
                            Ok(_) if stopped() => TaskOutcome::Skipped,
                            Ok(index) => match self.search_shard(&index, artifact, batch, k_per_shard) {
                                Ok(lists) => TaskOutcome::Done(lists),
                                Err(e) => TaskOutcome::Failed(e),
                            },
                        }
                    };
                    let _ = tx.send((artifact.shard_id, outcome));
                });
                handles.push((artifact.shard_id, handle));
            }
            drop(tx);

            // Gather: until every task has reported (or its sender is gone)
            let mut reported = 0;
            while reported < shards.len() {
                match rx.recv_timeout(GATHER_POLL) {
                    Ok((shard_id, outcome)) => {
                        reported += 1;
                        match outcome {
                            TaskOutcome::Done(lists) => {
                                debug!(shard_id, "shard search done");
                                result.per_shard.insert(shard_id, lists);
                            }
                            TaskOutcome::Failed(e) => {
                                warn!(shard_id, error = %e, "shard search failed");
                                real_failures.push((shard_id, e.to_string()));
                                if policy == FailurePolicy::FailFast {
                                    abort.store(true, Ordering::Release);
                                }
                            }
                            TaskOutcome::Skipped => {}
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if cancel.is_cancelled() {
                            abort.store(true, Ordering::Release);
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            // Join point: a task that panicked never reported
            for (shard_id, handle) in handles {
                if handle.join().is_err() {
                    warn!(shard_id, "shard search task panicked");
                    real_failures.push((shard_id, "search task panicked".into()));
                    if policy == FailurePolicy::FailFast {
                        abort.store(true, Ordering::Release);
                    }
                }
            }
        });

        cancel.check()?;
        real_failures.sort_by_key(|(id, _)| *id);

        if !real_failures.is_empty() {
            if policy == FailurePolicy::FailFast {
                return Err(ShardError::QueryFanoutPartialFailure {
                    failed: real_failures,
                });
            }
            warn!(
                failed = real_failures.len(),
                total = shards.len(),
                "fanout degraded, continuing with partial results"
            );
            result.failed = real_failures;
        }

        info!(
            shards = shards.len(),
            queries = batch.len(),
            k_per_shard,
            partial = result.is_partial(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fanout complete"
        );
        Ok(result)
    }

    fn search_shard(
        &self,
        index: &E::Index,
        artifact: &ShardArtifact,
        batch: &QueryBatch,
        k: usize,
    ) -> Result<Vec<Vec<Candidate>>> {
        let raw = self.engine.search(index, batch.queries(), k)?;
        if raw.len() != batch.len() {
            return Err(ShardError::Corruption(format!(
                "shard {} answered {} queries, expected {}",
                artifact.shard_id,
                raw.len(),
                batch.len()
            )));
        }

        raw.into_iter()
            .map(|hits| {
                hits.into_iter()
                    .map(|(local_id, distance)| to_candidate(artifact, local_id, distance))
                    .collect()
            })
            .collect()
    }

    fn open(&self, artifact: &ShardArtifact) -> Result<Arc<E::Index>> {
        if let Some(index) = self.cache.lock().get(&artifact.storage_path) {
            return Ok(index.clone());
        }

        // 锁外加载，避免阻塞其他分片
        let bytes = self.store.read_blob(&artifact.storage_path)?;
        let index = Arc::new(self.engine.deserialize(&bytes)?);
        let dimension = self.engine.dimension(&index);
        if dimension != artifact.dimension {
            return Err(ShardError::DimensionMismatch {
                expected: artifact.dimension,
                actual: dimension,
            });
        }
        if self.engine.metric(&index) != artifact.metric {
            return Err(ShardError::MetricMismatch {
                expected: artifact.metric,
                actual: self.engine.metric(&index),
                shard_id: artifact.shard_id,
            });
        }

        self.cache
            .lock()
            .put(artifact.storage_path.clone(), index.clone());
        Ok(index)
    }
}

fn to_candidate(artifact: &ShardArtifact, local_id: VectorId, distance: f32) -> Result<Candidate> {
    let id = local_id.checked_add(artifact.id_offset).ok_or_else(|| {
        ShardError::Corruption(format!(
            "shard {} local id {} + offset {} overflows",
            artifact.shard_id, local_id, artifact.id_offset
        ))
    })?;
    Ok(Candidate {
        id,
        distance,
        shard_id: artifact.shard_id,
        local_id,
    })
}

fn validate(batch: &QueryBatch, shards: &[ShardArtifact], k_per_shard: usize) -> Result<()> {
    if k_per_shard == 0 {
        return Err(ShardError::InvalidArgument("k_per_shard must be at least 1".into()));
    }
    let first = shards
        .first()
        .ok_or_else(|| ShardError::InvalidArgument("no shards to search".into()))?;

    for (i, shard) in shards.iter().enumerate() {
        if shards[..i].iter().any(|s| s.shard_id == shard.shard_id) {
            return Err(ShardError::InvalidArgument(format!(
                "shard id {} appears twice",
                shard.shard_id
            )));
        }
        if shard.metric != first.metric {
            return Err(ShardError::MetricMismatch {
                expected: first.metric,
                actual: shard.metric,
                shard_id: shard.shard_id,
            });
        }
        if shard.dimension != first.dimension {
            return Err(ShardError::DimensionMismatch {
                expected: first.dimension,
                actual: shard.dimension,
            });
        }
    }
    if !batch.is_empty() && batch.dimension() != first.dimension {
        return Err(ShardError::DimensionMismatch {
            expected: first.dimension,
            actual: batch.dimension(),
        });
    }
    Ok(())
}
