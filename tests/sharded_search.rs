//! End-to-end build, merge and search over a random corpus.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::{tempdir, TempDir};

use shardann::distance;
use shardann::pipeline::plan_offsets;
use shardann::*;

const DIM: usize = 8;
const CORPUS: usize = 300;

fn random_corpus(seed: u64) -> InMemoryCorpus {
    let mut rng = StdRng::seed_from_u64(seed);
    let vectors = (0..CORPUS)
        .map(|_| (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect();
    InMemoryCorpus::new(DIM, vectors).unwrap()
}

fn random_queries(seed: u64, n: usize) -> Vec<Vector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

/// 64 vectors per shard -> 5 shards for the corpus
fn config(partitioning: Partitioning) -> ShardingConfig {
    let mut config = ShardingConfig::for_testing();
    config.memory.max_index_memory_usage = format!("{}", 64 * (DIM * 4 + 8));
    config.partitioning = partitioning;
    config
}

fn store() -> ArtifactStore {
    ArtifactStore::new(
        Arc::new(LocalPathResolver::new()),
        StorageConfig { compression: Compression::Snappy, fsync: false },
    )
}

fn build(metric: Metric, partitioning: Partitioning, merge: MergeMode) -> (TempDir, BuildReport, InMemoryCorpus) {
    let dir = tempdir().unwrap();
    let corpus = random_corpus(7);
    let pipeline = ShardedIndexBuilder::new(
        Arc::new(FlatIndexEngine::new()),
        RayonExecutor::new(Some(3)).unwrap(),
        store(),
        config(partitioning),
        metric,
        dir.path().to_string_lossy().into_owned(),
    )
    .with_merge_mode(merge);
    let report = pipeline.run(&corpus).unwrap();
    assert!(report.is_complete());
    (dir, report, corpus)
}

/// Exact top-k corpus ids over the whole corpus
fn brute_force(corpus: &InMemoryCorpus, query: &[f32], k: usize, metric: Metric) -> Vec<u64> {
    let mut scored: Vec<(u64, f32)> = corpus
        .vectors()
        .iter()
        .enumerate()
        .map(|(i, v)| (i as u64, distance::score(metric, query, v)))
        .collect();
    scored.sort_by(|a, b| metric.compare(a.1, b.1).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored.into_iter().map(|(id, _)| id).collect()
}

fn search(searcher: &ShardedSearcher<FlatIndexEngine>, queries: Vec<Vector>, k: usize) -> ResultSet {
    let batch = QueryBatch::new(queries, k).unwrap();
    searcher
        .search(&batch, FailurePolicy::FailFast, &CancellationToken::new())
        .unwrap()
}

#[test]
fn test_sharded_top_k_matches_brute_force() {
    for metric in [Metric::L2, Metric::InnerProduct, Metric::Cosine] {
        let (dir, report, corpus) = build(metric, Partitioning::Contiguous, MergeMode::KeepShards);
        assert_eq!(report.artifacts.len(), 5);

        let searcher = ShardedSearcher::open(
            Arc::new(FlatIndexEngine::new()),
            store(),
            &dir.path().to_string_lossy(),
            &SearchConfig::default(),
        )
        .unwrap();

        let queries = random_queries(11, 20);
        let results = search(&searcher, queries.clone(), 10);
        assert!(!results.partial);
        for (q, query) in queries.iter().enumerate() {
            assert_eq!(results.ids(q), brute_force(&corpus, query, 10, metric), "{:?} query {}", metric, q);
        }
    }
}

#[test]
fn test_strided_ids_map_back_to_corpus() {
    let (_dir, report, corpus) = build(Metric::L2, Partitioning::Strided, MergeMode::KeepShards);
    let searcher = ShardedSearcher::new(
        Arc::new(FlatIndexEngine::new()),
        store(),
        report.artifacts.clone(),
        &SearchConfig::default(),
    )
    .unwrap();

    let offsets = plan_offsets(&report.plan);
    let to_corpus = |global: u64| -> u64 {
        let i = offsets.iter().rposition(|&o| o <= global).unwrap();
        report.plan[i].corpus_id(global - offsets[i]).unwrap()
    };

    let queries = random_queries(5, 8);
    let results = search(&searcher, queries.clone(), 5);
    for (q, query) in queries.iter().enumerate() {
        let mapped: Vec<u64> = results.ids(q).into_iter().map(to_corpus).collect();
        assert_eq!(mapped, brute_force(&corpus, query, 5, Metric::L2));
    }
}

#[test]
fn test_merged_artifact_matches_sharded_search() {
    let (_dir, report, _corpus) = build(Metric::L2, Partitioning::Contiguous, MergeMode::MergeAll { shift_ids: true });
    let merged = report.merged.as_ref().unwrap();
    assert_eq!(merged.vector_count, CORPUS);
    assert_eq!(merged.source_shard_ids, vec![0, 1, 2, 3, 4]);

    let engine = Arc::new(FlatIndexEngine::new());
    let index = engine.deserialize(&store().read_blob(&merged.storage_path).unwrap()).unwrap();
    let mut ids = index.ids().to_vec();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), CORPUS);

    let sharded = ShardedSearcher::new(engine.clone(), store(), report.artifacts.clone(), &SearchConfig::default()).unwrap();
    let single = ShardedSearcher::from_merged(engine, store(), merged, &SearchConfig::default()).unwrap();

    let queries = random_queries(3, 10);
    let a = search(&sharded, queries.clone(), 7);
    let b = search(&single, queries, 7);
    for q in 0..a.len() {
        assert_eq!(a.ids(q), b.ids(q));
    }
}

#[test]
fn test_shard_order_does_not_change_results() {
    let (_dir, report, _corpus) = build(Metric::InnerProduct, Partitioning::Contiguous, MergeMode::KeepShards);
    let engine = Arc::new(FlatIndexEngine::new());

    let mut reversed = report.artifacts.clone();
    reversed.reverse();
    let forward = ShardedSearcher::new(engine.clone(), store(), report.artifacts.clone(), &SearchConfig::default()).unwrap();
    let backward = ShardedSearcher::new(engine, store(), reversed, &SearchConfig::default()).unwrap();

    let queries = random_queries(13, 6);
    assert_eq!(search(&forward, queries.clone(), 12), search(&backward, queries, 12));
}

#[test]
fn test_merge_keeping_ids_detects_collision() {
    let (dir, report, _corpus) = build(Metric::L2, Partitioning::Contiguous, MergeMode::KeepShards);
    let merger = IndexMerger::new(Arc::new(FlatIndexEngine::new()), store());
    let dest = dir.path().to_string_lossy().into_owned();

    let merged = merger.merge(&report.artifacts, false, &dest).unwrap();
    assert_eq!(merged.vector_count, CORPUS);

    let mut clashing = report.artifacts[..2].to_vec();
    clashing[1].id_offset = clashing[0].id_offset + 1;
    assert!(matches!(
        merger.merge(&clashing, false, &dest),
        Err(ShardError::IdCollision { .. })
    ));
}

#[test]
fn test_missing_shard_degrades_or_fails() {
    let (_dir, report, _corpus) = build(Metric::L2, Partitioning::Contiguous, MergeMode::KeepShards);
    std::fs::remove_file(&report.artifacts[3].storage_path).unwrap();

    let search_config = SearchConfig {
        failure_policy: FailurePolicy::Degrade,
        ..SearchConfig::default()
    };
    let searcher =
        ShardedSearcher::new(Arc::new(FlatIndexEngine::new()), store(), report.artifacts.clone(), &search_config)
            .unwrap();
    let batch = QueryBatch::new(random_queries(17, 4), 5).unwrap();

    let degraded = searcher
        .search(&batch, searcher.failure_policy(), &CancellationToken::new())
        .unwrap();
    assert!(degraded.partial);
    assert_eq!(degraded.missing_shards, vec![3]);
    assert_eq!(degraded.len(), 4);
    let shard_three = report.artifacts[3].global_range();
    assert!(degraded.results.iter().flatten().all(|c| !shard_three.contains(&c.id)));

    let err = searcher
        .search(&batch, FailurePolicy::FailFast, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, ShardError::QueryFanoutPartialFailure { .. }));
}

#[test]
fn test_two_shard_end_to_end() {
    let dir = tempdir().unwrap();
    let dest = dir.path().to_string_lossy().into_owned();
    let corpus = InMemoryCorpus::new(1, (0..8).map(|i| vec![i as f32]).collect()).unwrap();

    let mut cfg = ShardingConfig::for_testing();
    cfg.memory.max_index_memory_usage = format!("{}", 4 * (4 + 8));
    let report = ShardedIndexBuilder::new(
        Arc::new(FlatIndexEngine::new()),
        SequentialExecutor,
        store(),
        cfg,
        Metric::L2,
        dest.clone(),
    )
    .run(&corpus)
    .unwrap();
    assert_eq!(report.artifacts.len(), 2);

    let searcher = ShardedSearcher::open(Arc::new(FlatIndexEngine::new()), store(), &dest, &SearchConfig::default()).unwrap();
    let results = search(&searcher, vec![vec![3.6]], 3);
    assert_eq!(results.ids(0), vec![4, 3, 5]);
    assert_eq!(results.results[0][0].shard_id, 1);
    assert_eq!(results.results[0][1].shard_id, 0);
}

#[test]
fn test_degrade_with_every_shard_missing() {
    let (_dir, report, _corpus) = build(Metric::Cosine, Partitioning::Contiguous, MergeMode::KeepShards);
    for artifact in &report.artifacts {
        std::fs::remove_file(&artifact.storage_path).unwrap();
    }

    let searcher = ShardedSearcher::new(
        Arc::new(FlatIndexEngine::new()),
        store(),
        report.artifacts.clone(),
        &SearchConfig::default(),
    )
    .unwrap();
    let batch = QueryBatch::new(random_queries(19, 3), 4).unwrap();

    let results = searcher
        .search(&batch, FailurePolicy::Degrade, &CancellationToken::new())
        .unwrap();
    assert!(results.partial);
    assert_eq!(results.missing_shards, vec![0, 1, 2, 3, 4]);
    assert_eq!(results.len(), 3);
    assert!(results.results.iter().all(|r| r.is_empty()));
}
