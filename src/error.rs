//! Error types for the sharded ANN subsystem
//!
//! Every failure path returns a [`ShardError`]. Callers use
//! [`ShardError::is_retryable`] to tell transient storage trouble apart from
//! structural failures that a retry cannot fix.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{Metric, ShardId};

pub type Result<T> = std::result::Result<T, ShardError>;

#[derive(Error, Debug)]
pub enum ShardError {
    /// The corpus cannot be split under the memory ceiling with the allowed shard count.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// One partition failed to build. Siblings are unaffected.
    #[error("Shard {shard_id} build failed: {reason}")]
    ShardBuild { shard_id: ShardId, reason: String },

    #[error("Storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Metric mismatch: expected {expected:?}, shard {shard_id} uses {actual:?}")]
    MetricMismatch {
        expected: Metric,
        actual: Metric,
        shard_id: ShardId,
    },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Id collision between shard {first} and shard {second}: {detail}")]
    IdCollision {
        first: ShardId,
        second: ShardId,
        detail: String,
    },

    #[error("Query fanout failed on {} shard(s): {}", .failed.len(), describe_failures(.failed))]
    QueryFanoutPartialFailure { failed: Vec<(ShardId, String)> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported artifact location: {0}")]
    UnsupportedLocation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl ShardError {
    /// Wrap an I/O failure on an artifact path.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ShardError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Only storage failures are worth retrying; everything else is structural.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardError::Storage { .. })
    }
}

fn describe_failures(failed: &[(ShardId, String)]) -> String {
    failed
        .iter()
        .map(|(id, reason)| format!("shard {}: {}", id, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<bincode::Error> for ShardError {
    fn from(err: bincode::Error) -> Self {
        ShardError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ShardError {
    fn from(err: serde_json::Error) -> Self {
        ShardError::Serialization(err.to_string())
    }
}
