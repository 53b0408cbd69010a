//! ShardANN
//!
//! 分片向量索引：超出单机内存的语料按内存预算切分为 N 个分片，
//! 分别构建、持久化，可选合并，在线查询时扇出到所有分片再做全局 top-K 合并。
//!
//! ## 流程
//! - 规划: memory budget -> shard count -> disjoint id ranges (`planner`)
//! - 构建: one index per shard, persisted as a durable artifact (`builder`, `storage`)
//! - 合并: concatenate shard artifacts, optionally shifting ids (`merger`)
//! - 查询: scatter/gather over shards + deterministic top-K (`fanout`, `result_merger`)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shardann::*;
//!
//! let config = ShardingConfig::default();
//! let store = ArtifactStore::new(Arc::new(LocalPathResolver::new()), config.storage.clone());
//! let engine = Arc::new(FlatIndexEngine::new());
//!
//! let pipeline = ShardedIndexBuilder::new(
//!     engine.clone(),
//!     RayonExecutor::new(config.build_threads)?,
//!     store.clone(),
//!     config.clone(),
//!     Metric::L2,
//!     "/data/index",
//! );
//! let report = pipeline.run(&corpus)?;
//!
//! let searcher = ShardedSearcher::open(engine, store, "/data/index", &config.search)?;
//! let batch = QueryBatch::new(queries, 10)?;
//! let results = searcher.search(&batch, FailurePolicy::FailFast, &CancellationToken::new())?;
//! ```

pub mod builder;
pub mod cancel;
pub mod config;
pub mod distance;
pub mod engine;
pub mod executor;
pub mod fanout;
pub mod logging;
pub mod merger;
pub mod path;
pub mod pipeline;
pub mod planner;
pub mod result_merger;
pub mod search;
pub mod storage;
pub mod types;

mod error;

pub use error::{Result, ShardError};

pub use builder::ShardBuilder;
pub use cancel::CancellationToken;
pub use config::{
    Compression, MemoryBudget, Partitioning, RetryConfig, SearchConfig, ShardingConfig, StorageConfig,
};
pub use engine::{FlatIndex, FlatIndexEngine, IndexEngine};
pub use executor::{RayonExecutor, SequentialExecutor, TaskExecutor};
pub use fanout::{FailurePolicy, FanoutResult, QueryFanout};
pub use merger::IndexMerger;
pub use path::{LocalPathResolver, PathResolver, ResolvedPath};
pub use pipeline::{BuildReport, InMemoryCorpus, MergeMode, ShardedIndexBuilder, VectorSource};
pub use planner::{PlanRequest, ShardPlanner};
pub use result_merger::ResultMerger;
pub use search::ShardedSearcher;
pub use storage::ArtifactStore;
pub use types::{
    Candidate, IdRange, MergedArtifact, Metric, QueryBatch, ResultSet, ShardArtifact, ShardId, ShardSpec,
    Vector, VectorId,
};
