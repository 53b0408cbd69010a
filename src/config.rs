//! Sharding configuration
//!
//! Memory budgets, partitioning, storage, retry and search settings.
//! Loadable from a JSON file; presets mirror the common deployment shapes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ShardError};
use crate::fanout::FailurePolicy;

/// How corpus ids are assigned to shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Partitioning {
    /// Balanced contiguous ranges (reproducible, offset-friendly)
    #[default]
    Contiguous,
    /// Round-robin: id `i` goes to shard `i % n`
    Strided,
}

/// Compression of persisted index blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    /// Snappy framing-free block compression
    Snappy,
}

/// Memory budget, human-readable sizes such as `"10G"` or `"512M"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    /// Memory a single build worker can use
    pub current_memory_available: String,
    /// Ceiling for one shard's index in memory
    pub max_index_memory_usage: String,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            current_memory_available: "16G".into(),
            max_index_memory_usage: "16G".into(),
        }
    }
}

impl MemoryBudget {
    pub fn current_memory_bytes(&self) -> Result<u64> {
        parse_memory_size(&self.current_memory_available)
    }

    pub fn max_index_bytes(&self) -> Result<u64> {
        parse_memory_size(&self.max_index_memory_usage)
    }
}

/// Artifact persistence settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub compression: Compression,
    /// fsync blobs, sidecars and directory entries before publishing
    pub fsync: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            fsync: true,
        }
    }
}

/// Retry policy for retryable (storage) failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries, no sleeping
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Backoff before attempt `attempt` (1-based; the first attempt never waits)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32 - 2);
        Duration::from_millis((self.initial_backoff_ms as f64 * factor) as u64)
    }
}

/// Query-time settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Policy a caller reads from the searcher and passes to each `search`
    /// call; nothing applies it implicitly
    pub failure_policy: FailurePolicy,
    /// `k_per_shard = ceil(k_final * oversample_factor)`, never below `k_final`
    pub oversample_factor: f32,
    /// Number of opened shard indexes kept in memory
    pub index_cache_capacity: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::FailFast,
            oversample_factor: 1.0,
            index_cache_capacity: 16,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub memory: MemoryBudget,

    /// Upper bound on the number of shards a plan may produce
    pub max_shards_hint: usize,

    pub partitioning: Partitioning,

    /// Build worker threads (None = one per core)
    pub build_threads: Option<usize>,

    pub storage: StorageConfig,

    pub retry: RetryConfig,

    pub search: SearchConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            memory: MemoryBudget::default(),
            max_shards_hint: 64,
            partitioning: Partitioning::Contiguous,
            build_threads: None,
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl ShardingConfig {
    /// Small budgets, no fsync, no retry sleeps
    pub fn for_testing() -> Self {
        Self {
            memory: MemoryBudget {
                current_memory_available: "64M".into(),
                max_index_memory_usage: "64M".into(),
            },
            max_shards_hint: 16,
            build_threads: Some(2),
            storage: StorageConfig {
                compression: Compression::None,
                fsync: false,
            },
            retry: RetryConfig::none(),
            ..Self::default()
        }
    }

    /// Load from a JSON file and validate
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ShardError::storage(path, e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ShardError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let current = self.memory.current_memory_bytes()?;
        let max_index = self.memory.max_index_bytes()?;
        if current == 0 || max_index == 0 {
            return Err(ShardError::Config("memory budgets must be non-zero".into()));
        }
        if self.max_shards_hint == 0 {
            return Err(ShardError::Config("max_shards_hint must be at least 1".into()));
        }
        if self.build_threads == Some(0) {
            return Err(ShardError::Config("build_threads must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ShardError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(self.search.oversample_factor >= 1.0) {
            return Err(ShardError::Config(format!(
                "search.oversample_factor must be >= 1.0, got {}",
                self.search.oversample_factor
            )));
        }
        if self.search.index_cache_capacity == 0 {
            return Err(ShardError::Config("search.index_cache_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse a memory size such as `"10G"`, `"512MB"`, `"1.5g"` or `"4096"` into bytes.
///
/// Units are binary (K = 1024).
pub fn parse_memory_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let invalid = || ShardError::Config(format!("invalid memory size '{}'", input));

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(invalid()),
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}
