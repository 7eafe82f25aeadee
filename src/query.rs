use crate::error::DbError;
use crate::index::NUM_SHARDS;
use crate::storage::ShardArray;
use crate::types::{LabelSet, QueryOptions, SeriesResult};
use rayon::prelude::*;

/// Evaluates a query against the shard array.
///
/// Shards are scanned independently, each under its own read lock for the
/// duration of its scan, so queries are not snapshot-isolated across shards:
/// a query racing a multi-series write may observe a subset of that write's
/// series. Within a series, points come back in non-decreasing timestamp
/// order. The order of result entries across series is deterministic for a
/// given store state but is not part of the contract.
pub fn execute_query(
    shards: &ShardArray,
    opts: &QueryOptions,
) -> Result<Vec<SeriesResult>, DbError> {
    let per_shard: Vec<Vec<SeriesResult>> = (0..NUM_SHARDS)
        .into_par_iter()
        .map(|i| scan_shard(shards, i, opts))
        .collect::<Result<_, _>>()?;

    Ok(per_shard.into_iter().flatten().collect())
}

fn scan_shard(
    shards: &ShardArray,
    index: usize,
    opts: &QueryOptions,
) -> Result<Vec<SeriesResult>, DbError> {
    let guard = shards.shard_at(index).series.read()?;

    let mut out = Vec::new();
    for series in guard.values() {
        if series.metric() != opts.metric {
            continue;
        }
        if !labels_match(&opts.labels, series.labels()) {
            continue;
        }
        let points = series.range(opts.from, opts.to);
        if points.is_empty() {
            continue;
        }
        out.push(SeriesResult {
            metric: series.metric().to_string(),
            labels: series.labels().clone(),
            points,
        });
    }
    Ok(out)
}

/// Checks that every key/value pair of the filter is present in the series'
/// labels. Extra labels on the series are allowed; an empty filter matches
/// every series.
#[inline]
fn labels_match(filter: &LabelSet, actual: &LabelSet) -> bool {
    if filter.is_empty() {
        return true;
    }
    if actual.len() < filter.len() {
        return false;
    }
    filter.iter().all(|(key, value)| actual.get(key) == Some(value))
}
