//! Online search over a set of shard artifacts
//!
//! Fanout with `k_per_shard >= k_final`, then a deterministic top-K merge.

use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::config::SearchConfig;
use crate::engine::IndexEngine;
use crate::error::{Result, ShardError};
use crate::fanout::{FailurePolicy, QueryFanout};
use crate::result_merger::ResultMerger;
use crate::storage::ArtifactStore;
use crate::types::{MergedArtifact, Metric, QueryBatch, ResultSet, ShardArtifact};

pub struct ShardedSearcher<E: IndexEngine> {
    fanout: QueryFanout<E>,
    shards: Vec<ShardArtifact>,
    metric: Metric,
    oversample_factor: f32,
    failure_policy: FailurePolicy,
}

impl<E: IndexEngine> ShardedSearcher<E> {
    /// Search over explicit artifacts (all must share one metric)
    pub fn new(
        engine: Arc<E>,
        store: ArtifactStore,
        shards: Vec<ShardArtifact>,
        config: &SearchConfig,
    ) -> Result<Self> {
        let metric = shards
            .first()
            .map(|s| s.metric)
            .ok_or_else(|| ShardError::InvalidArgument("searcher needs at least one shard".into()))?;
        if let Some(bad) = shards.iter().find(|s| s.metric != metric) {
            return Err(ShardError::MetricMismatch {
                expected: metric,
                actual: bad.metric,
                shard_id: bad.shard_id,
            });
        }

        Ok(Self {
            fanout: QueryFanout::new(engine, store, config.index_cache_capacity),
            shards,
            metric,
            oversample_factor: config.oversample_factor.max(1.0),
            failure_policy: config.failure_policy,
        })
    }

    /// Search a merged artifact as a single shard
    pub fn from_merged(
        engine: Arc<E>,
        store: ArtifactStore,
        merged: &MergedArtifact,
        config: &SearchConfig,
    ) -> Result<Self> {
        Self::new(engine, store, vec![merged.as_shard(0)], config)
    }

    /// Open the current shard artifacts under `root`
    pub fn open(engine: Arc<E>, store: ArtifactStore, root: &str, config: &SearchConfig) -> Result<Self> {
        let shards = store.list_current_shards(root)?;
        if shards.is_empty() {
            return Err(ShardError::InvalidArgument(format!("no shard artifacts under {}", root)));
        }
        Self::new(engine, store, shards, config)
    }

    pub fn shards(&self) -> &[ShardArtifact] {
        &self.shards
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Configured default policy, for callers to pass to [`Self::search`].
    ///
    /// `search` never falls back to it: the policy is always an argument.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Candidates requested from each shard for a final top `k_final`
    pub fn k_per_shard(&self, k_final: usize) -> usize {
        let scaled = (k_final as f64 * self.oversample_factor as f64).ceil() as usize;
        scaled.max(k_final)
    }

    /// Global top `batch.k` per query.
    ///
    /// Under `Degrade`, a result missing some shards comes back with
    /// `partial = true`.
    pub fn search(
        &self,
        batch: &QueryBatch,
        policy: FailurePolicy,
        cancel: &CancellationToken,
    ) -> Result<ResultSet> {
        if batch.is_empty() {
            return Ok(ResultSet::default());
        }
        let k_per_shard = self.k_per_shard(batch.k);
        let gathered = self.fanout.fanout(batch, &self.shards, k_per_shard, policy, cancel)?;
        ResultMerger::merge_fanout(&gathered, batch.len(), batch.k, self.metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::engine::FlatIndexEngine;
    use crate::path::LocalPathResolver;
    use std::path::PathBuf;

    fn store() -> ArtifactStore {
        ArtifactStore::new(Arc::new(LocalPathResolver::new()), StorageConfig::default())
    }

    fn shard(shard_id: u32, metric: Metric) -> ShardArtifact {
        ShardArtifact {
            shard_id,
            storage_path: PathBuf::from("/unused"),
            vector_count: 1,
            metric,
            dimension: 2,
            id_offset: 0,
        }
    }

    #[test]
    fn test_k_per_shard_oversampling() {
        let config = SearchConfig {
            oversample_factor: 1.5,
            ..SearchConfig::default()
        };
        let searcher =
            ShardedSearcher::new(Arc::new(FlatIndexEngine), store(), vec![shard(0, Metric::L2)], &config).unwrap();
        assert_eq!(searcher.k_per_shard(10), 15);
        assert_eq!(searcher.k_per_shard(1), 2);
        assert_eq!(searcher.failure_policy(), FailurePolicy::FailFast);
    }

    #[test]
    fn test_mixed_metrics_rejected() {
        let shards = vec![shard(0, Metric::L2), shard(1, Metric::InnerProduct)];
        let err = ShardedSearcher::new(Arc::new(FlatIndexEngine), store(), shards, &SearchConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ShardError::MetricMismatch { shard_id: 1, .. }));
    }
}
