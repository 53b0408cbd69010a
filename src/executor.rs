//! Distributed-compute capability
//!
//! `map(partitions, fn)` runs one task per partition and reports each task's
//! outcome on its own, so one failed shard never hides its siblings' results.

use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{Result, ShardError};

/// Runs independent tasks, possibly in parallel.
///
/// The output has one entry per input partition, in input order. A task that
/// panics is reported as `ShardBuild` with the task's position as `shard_id`.
pub trait TaskExecutor: Send + Sync {
    fn map<P, T, F>(&self, partitions: Vec<P>, task: F) -> Vec<Result<T>>
    where
        P: Send,
        T: Send,
        F: Fn(P) -> Result<T> + Send + Sync;
}

fn run_isolated<P, T, F>(position: usize, partition: P, task: &F) -> Result<T>
where
    F: Fn(P) -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(|| task(partition))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ShardError::ShardBuild {
                shard_id: position as u32,
                reason: format!("task panicked: {}", reason),
            })
        }
    }
}

/// Runs tasks one after another on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl TaskExecutor for SequentialExecutor {
    fn map<P, T, F>(&self, partitions: Vec<P>, task: F) -> Vec<Result<T>>
    where
        P: Send,
        T: Send,
        F: Fn(P) -> Result<T> + Send + Sync,
    {
        partitions
            .into_iter()
            .enumerate()
            .map(|(pos, p)| run_isolated(pos, p, &task))
            .collect()
    }
}

/// Runs tasks on a dedicated rayon pool
pub struct RayonExecutor {
    pool: rayon::ThreadPool,
}

impl RayonExecutor {
    /// `threads = None` sizes the pool to the number of cores
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("shard-build-{}", i));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| ShardError::Config(format!("cannot start build pool: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskExecutor for RayonExecutor {
    fn map<P, T, F>(&self, partitions: Vec<P>, task: F) -> Vec<Result<T>>
    where
        P: Send,
        T: Send,
        F: Fn(P) -> Result<T> + Send + Sync,
    {
        self.pool.install(|| {
            partitions
                .into_par_iter()
                .enumerate()
                .map(|(pos, p)| run_isolated(pos, p, &task))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(x: u32) -> Result<u32> {
        match x {
            3 => Err(ShardError::Storage {
                path: "/tmp/shard_3".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
            }),
            5 => panic!("boom on {}", x),
            _ => Ok(x * 10),
        }
    }

    fn check(results: Vec<Result<u32>>) {
        assert_eq!(results.len(), 7);
        assert_eq!(results[0].as_ref().unwrap(), &0);
        assert_eq!(results[6].as_ref().unwrap(), &60);
        assert!(results[3].as_ref().unwrap_err().is_retryable());
        match &results[5] {
            Err(ShardError::ShardBuild { shard_id, reason }) => {
                assert_eq!(*shard_id, 5);
                assert!(reason.contains("boom on 5"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sequential_isolates_failures() {
        check(SequentialExecutor.map((0..7).collect(), task));
    }

    #[test]
    fn test_rayon_isolates_failures() {
        let executor = RayonExecutor::new(Some(3)).unwrap();
        assert_eq!(executor.threads(), 3);
        check(executor.map((0..7).collect(), task));
    }
}
