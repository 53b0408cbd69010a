//! Top-K result merging
//!
//! Reduces per-shard candidate lists into one globally ranked list per query.
//! Ranking is a total order (metric direction, then shard id, then local id),
//! so the output does not depend on shard completion order or on sort
//! stability.

use std::cmp::Ordering;
use tracing::debug;

use crate::error::{Result, ShardError};
use crate::fanout::{FanoutResult, PerShardResults};
use crate::types::{Candidate, Metric, ResultSet};

pub struct ResultMerger;

impl ResultMerger {
    /// Merge per-shard lists into the global top `k_final` per query.
    ///
    /// Every shard must report the same number of queries. An empty mapping
    /// yields an empty result set.
    pub fn merge(per_shard: &PerShardResults, k_final: usize, metric: Metric) -> Result<ResultSet> {
        if k_final == 0 {
            return Err(ShardError::InvalidArgument("k_final must be at least 1".into()));
        }

        let num_queries = match per_shard.values().next() {
            Some(lists) => lists.len(),
            None => return Ok(ResultSet::default()),
        };
        if let Some((shard_id, lists)) = per_shard.iter().find(|(_, l)| l.len() != num_queries) {
            return Err(ShardError::InvalidArgument(format!(
                "shard {} reported {} queries, expected {}",
                shard_id,
                lists.len(),
                num_queries
            )));
        }

        let results = (0..num_queries)
            .map(|q| {
                let pooled: Vec<Candidate> = per_shard
                    .values()
                    .flat_map(|lists| lists[q].iter().copied())
                    .collect();
                top_k(pooled, k_final, metric)
            })
            .collect();

        debug!(shards = per_shard.len(), queries = num_queries, k_final, "results merged");
        Ok(ResultSet {
            results,
            partial: false,
            missing_shards: Vec::new(),
        })
    }

    /// Merge a gathered fanout, carrying its partial-failure flag.
    ///
    /// When every shard failed there is nothing to merge; the result has
    /// `num_queries` empty lists and is flagged partial.
    pub fn merge_fanout(
        fanout: &FanoutResult,
        num_queries: usize,
        k_final: usize,
        metric: Metric,
    ) -> Result<ResultSet> {
        let mut set = Self::merge(&fanout.per_shard, k_final, metric)?;
        if fanout.per_shard.is_empty() {
            set.results = vec![Vec::new(); num_queries];
        }
        if fanout.is_partial() {
            set.partial = true;
            set.missing_shards = fanout.failed.iter().map(|(id, _)| *id).collect();
        }
        Ok(set)
    }
}

/// Best `k` of `pool`, best-first
fn top_k(mut pool: Vec<Candidate>, k: usize, metric: Metric) -> Vec<Candidate> {
    let cmp = |a: &Candidate, b: &Candidate| -> Ordering { a.rank_cmp(b, metric) };
    if pool.len() > k {
        pool.select_nth_unstable_by(k - 1, cmp);
        pool.truncate(k);
    }
    pool.sort_unstable_by(cmp);
    pool
}
