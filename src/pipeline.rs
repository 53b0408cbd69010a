//! Offline build orchestration
//!
//! plan -> one build task per partition -> barrier -> optional merge.
//!
//! A planning failure stops everything before any shard is built. Shard
//! failures are collected per shard; the merge only runs once every shard of
//! the plan has an artifact.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::builder::ShardBuilder;
use crate::config::ShardingConfig;
use crate::engine::IndexEngine;
use crate::error::{Result, ShardError};
use crate::executor::TaskExecutor;
use crate::merger::IndexMerger;
use crate::planner::{PlanRequest, ShardPlanner};
use crate::storage::ArtifactStore;
use crate::types::{IdRange, MergedArtifact, Metric, ShardArtifact, ShardId, ShardSpec, Vector, VectorId};

/// Where shard builders read their vectors from
pub trait VectorSource: Sync {
    fn dimension(&self) -> usize;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vectors of `range`, in range order
    fn fetch(&self, range: &IdRange) -> Result<Vec<Vector>>;
}

/// Corpus held in memory; corpus id = position
pub struct InMemoryCorpus {
    dimension: usize,
    vectors: Vec<Vector>,
}

impl InMemoryCorpus {
    pub fn new(dimension: usize, vectors: Vec<Vector>) -> Result<Self> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(ShardError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }
        Ok(Self { dimension, vectors })
    }

    pub fn vectors(&self) -> &[Vector] {
        &self.vectors
    }
}

impl VectorSource for InMemoryCorpus {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> u64 {
        self.vectors.len() as u64
    }

    fn fetch(&self, range: &IdRange) -> Result<Vec<Vector>> {
        range
            .iter()
            .map(|id| {
                self.vectors.get(id as usize).cloned().ok_or_else(|| {
                    ShardError::InvalidArgument(format!("corpus id {} out of range", id))
                })
            })
            .collect()
    }
}

/// What to do with the shard artifacts once all are built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Leave N artifacts for fanout search
    KeepShards,
    /// Combine into one artifact
    MergeAll { shift_ids: bool },
}

/// Outcome of one planning round
#[derive(Debug)]
pub struct BuildReport {
    pub plan: Vec<ShardSpec>,
    /// Built artifacts, ordered by shard id
    pub artifacts: Vec<ShardArtifact>,
    /// Isolated per-shard failures, ordered by shard id
    pub failures: Vec<(ShardId, ShardError)>,
    pub merged: Option<MergedArtifact>,
}

impl BuildReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.artifacts.len() == self.plan.len()
    }

    /// Shard ids whose failure is worth retrying as-is
    pub fn retryable_shards(&self) -> Vec<ShardId> {
        self.failures
            .iter()
            .filter(|(_, e)| e.is_retryable())
            .map(|(id, _)| *id)
            .collect()
    }

    /// `(storage path, metric)` of every built shard
    pub fn index_paths(&self) -> Vec<(String, Metric)> {
        self.artifacts
            .iter()
            .map(|a| (a.storage_path.to_string_lossy().into_owned(), a.metric))
            .collect()
    }
}

/// Global offset of each shard: vectors in all earlier shards of the plan
pub fn plan_offsets(plan: &[ShardSpec]) -> Vec<VectorId> {
    let mut cursor: VectorId = 0;
    plan.iter()
        .map(|spec| {
            let offset = cursor;
            cursor += spec.len() as VectorId;
            offset
        })
        .collect()
}

pub struct ShardedIndexBuilder<E: IndexEngine, X: TaskExecutor> {
    engine: Arc<E>,
    executor: X,
    store: ArtifactStore,
    config: ShardingConfig,
    metric: Metric,
    destination: String,
    merge_mode: MergeMode,
}

impl<E: IndexEngine, X: TaskExecutor> ShardedIndexBuilder<E, X> {
    pub fn new(
        engine: Arc<E>,
        executor: X,
        store: ArtifactStore,
        config: ShardingConfig,
        metric: Metric,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            executor,
            store,
            config,
            metric,
            destination: destination.into(),
            merge_mode: MergeMode::KeepShards,
        }
    }

    pub fn with_merge_mode(mut self, merge_mode: MergeMode) -> Self {
        self.merge_mode = merge_mode;
        self
    }

    pub fn plan<S: VectorSource>(&self, corpus: &S) -> Result<Vec<ShardSpec>> {
        let req = PlanRequest::from_config(&self.config, corpus.len(), corpus.dimension())?;
        ShardPlanner::from_partitioning(self.config.partitioning).plan(&req)
    }

    /// Plan, build every shard, then merge if configured and complete.
    ///
    /// # Errors
    /// Only fatal conditions: planning (`Capacity`, bad arguments) and merge
    /// precondition or persistence failures. Shard failures land in the report.
    pub fn run<S: VectorSource>(&self, corpus: &S) -> Result<BuildReport> {
        self.config.validate()?;
        let start = Instant::now();
        let plan = self.plan(corpus)?;

        let targets: Vec<usize> = (0..plan.len()).collect();
        let (artifacts, failures) = self.build_shards(corpus, &plan, &targets);

        let mut report = BuildReport {
            plan,
            artifacts,
            failures,
            merged: None,
        };
        self.merge_if_complete(&mut report)?;

        info!(
            shards = report.plan.len(),
            built = report.artifacts.len(),
            failed = report.failures.len(),
            merged = report.merged.is_some(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sharded build finished"
        );
        Ok(report)
    }

    /// Rebuild only the shards that failed in `report`, then merge if configured.
    pub fn retry_failed<S: VectorSource>(&self, corpus: &S, report: &mut BuildReport) -> Result<()> {
        if report.failures.is_empty() {
            return Ok(());
        }
        let failed: Vec<ShardId> = report.failures.iter().map(|(id, _)| *id).collect();
        let targets: Vec<usize> = report
            .plan
            .iter()
            .enumerate()
            .filter(|(_, spec)| failed.contains(&spec.shard_id))
            .map(|(i, _)| i)
            .collect();

        info!(shards = ?failed, "retrying failed shards");
        let (artifacts, failures) = self.build_shards(corpus, &report.plan, &targets);

        report.artifacts.extend(artifacts);
        report.artifacts.sort_by_key(|a| a.shard_id);
        report.failures = failures;
        self.merge_if_complete(report)
    }

    fn build_shards<S: VectorSource>(
        &self,
        corpus: &S,
        plan: &[ShardSpec],
        targets: &[usize],
    ) -> (Vec<ShardArtifact>, Vec<(ShardId, ShardError)>) {
        let builder = ShardBuilder::new(self.engine.clone(), self.store.clone(), corpus.dimension())
            .with_retry(self.config.retry.clone());
        let offsets = plan_offsets(plan);
        let metric = self.metric;
        let destination = self.destination.as_str();

        let tasks: Vec<(&ShardSpec, VectorId)> = targets.iter().map(|&i| (&plan[i], offsets[i])).collect();
        let outcomes = self.executor.map(tasks, |(spec, offset)| {
            let vectors = corpus.fetch(&spec.vector_range)?;
            builder.build(spec, &vectors, metric, destination, offset)
        });

        let mut artifacts = Vec::new();
        let mut failures = Vec::new();
        for (&i, outcome) in targets.iter().zip(outcomes) {
            let shard_id = plan[i].shard_id;
            match outcome {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    // panics are reported with the task position; name the shard instead
                    let e = match e {
                        ShardError::ShardBuild { reason, .. } => ShardError::ShardBuild { shard_id, reason },
                        other => other,
                    };
                    warn!(shard_id, retryable = e.is_retryable(), error = %e, "shard build failed");
                    failures.push((shard_id, e));
                }
            }
        }
        artifacts.sort_by_key(|a| a.shard_id);
        failures.sort_by_key(|(id, _)| *id);
        (artifacts, failures)
    }

    fn merge_if_complete(&self, report: &mut BuildReport) -> Result<()> {
        let MergeMode::MergeAll { shift_ids } = self.merge_mode else {
            return Ok(());
        };
        if !report.is_complete() {
            warn!(failed = report.failures.len(), "merge skipped, not every shard was built");
            return Ok(());
        }

        let merger = IndexMerger::new(self.engine.clone(), self.store.clone()).with_retry(self.config.retry.clone());
        report.merged = Some(merger.merge(&report.artifacts, shift_ids, &self.destination)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::engine::FlatIndexEngine;
    use crate::executor::{RayonExecutor, SequentialExecutor};
    use crate::path::LocalPathResolver;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn store() -> ArtifactStore {
        ArtifactStore::new(
            Arc::new(LocalPathResolver::new()),
            StorageConfig { fsync: false, ..StorageConfig::default() },
        )
    }

    /// 100 vectors of dimension 4; 20 vectors fit one shard
    fn config() -> ShardingConfig {
        let mut config = ShardingConfig::for_testing();
        config.memory.max_index_memory_usage = format!("{}", 20 * (4 * 4 + 8));
        config
    }

    fn corpus(n: usize) -> InMemoryCorpus {
        let vectors = (0..n).map(|i| vec![i as f32, 1.0, (i % 7) as f32, 0.5]).collect();
        InMemoryCorpus::new(4, vectors).unwrap()
    }

    /// Fails to fetch any range containing `poison` until healed
    struct FlakyCorpus {
        inner: InMemoryCorpus,
        poison: VectorId,
        broken: AtomicBool,
    }

    impl VectorSource for FlakyCorpus {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn len(&self) -> u64 {
            self.inner.len()
        }

        fn fetch(&self, range: &IdRange) -> Result<Vec<Vector>> {
            if self.broken.load(Ordering::SeqCst) && range.iter().any(|id| id == self.poison) {
                return Err(ShardError::storage(
                    "/corpus/part-0003.parquet",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"),
                ));
            }
            self.inner.fetch(range)
        }
    }

    #[test]
    fn test_plan_and_build_all_shards() {
        let dir = tempdir().unwrap();
        let dest = dir.path().to_string_lossy().into_owned();
        let pipeline = ShardedIndexBuilder::new(
            Arc::new(FlatIndexEngine),
            RayonExecutor::new(Some(2)).unwrap(),
            store(),
            config(),
            Metric::L2,
            dest.clone(),
        );

        let report = pipeline.run(&corpus(100)).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.artifacts.len(), 5);
        assert!(report.merged.is_none());

        let offsets: Vec<u64> = report.artifacts.iter().map(|a| a.id_offset).collect();
        assert_eq!(offsets, vec![0, 20, 40, 60, 80]);
        assert_eq!(report.index_paths().len(), 5);

        let listed = store().list_current_shards(&dest).unwrap();
        assert_eq!(listed, report.artifacts);
    }

    #[test]
    fn test_capacity_error_before_any_build() {
        let dir = tempdir().unwrap();
        let mut cfg = config();
        cfg.max_shards_hint = 2;
        let pipeline = ShardedIndexBuilder::new(
            Arc::new(FlatIndexEngine),
            SequentialExecutor,
            store(),
            cfg,
            Metric::L2,
            dir.path().to_string_lossy().into_owned(),
        );

        assert!(matches!(pipeline.run(&corpus(100)), Err(ShardError::Capacity(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_shard_is_isolated_and_retried() {
        let dir = tempdir().unwrap();
        let dest = dir.path().to_string_lossy().into_owned();
        let flaky = FlakyCorpus {
            inner: corpus(100),
            poison: 45,
            broken: AtomicBool::new(true),
        };
        let pipeline = ShardedIndexBuilder::new(
            Arc::new(FlatIndexEngine),
            SequentialExecutor,
            store(),
            config(),
            Metric::L2,
            dest,
        )
        .with_merge_mode(MergeMode::MergeAll { shift_ids: false });

        let mut report = pipeline.run(&flaky).unwrap();
        assert_eq!(report.artifacts.len(), 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 2);
        assert_eq!(report.retryable_shards(), vec![2]);
        assert!(report.merged.is_none());

        flaky.broken.store(false, Ordering::SeqCst);
        pipeline.retry_failed(&flaky, &mut report).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.artifacts[2].id_offset, 40);

        let merged = report.merged.expect("merge after retry");
        assert_eq!(merged.vector_count, 100);
        assert_eq!(merged.source_shard_ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_strided_plan_offsets() {
        let plan = vec![
            ShardSpec { shard_id: 0, capacity: 4, vector_range: IdRange::Explicit(vec![0, 2, 4]) },
            ShardSpec { shard_id: 1, capacity: 4, vector_range: IdRange::Explicit(vec![1, 3]) },
        ];
        assert_eq!(plan_offsets(&plan), vec![0, 3]);
    }

    #[test]
    fn test_corpus_rejects_mixed_dimensions() {
        assert!(InMemoryCorpus::new(2, vec![vec![1.0, 2.0], vec![1.0]]).is_err());
    }
}
