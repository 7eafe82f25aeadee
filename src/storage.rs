use crate::buffer::SeriesBuffer;
use crate::error::DbError;
use crate::index::{series_id, SeriesId, NUM_SHARDS};
use crate::types::{LabelSet, Point};
use std::collections::HashMap;
use std::sync::RwLock;

/// One bucket of the series index, guarded by a single reader/writer lock.
///
/// All reads of any buffer in the shard take the read lock; all mutations of
/// the map or of a buffer take the write lock.
#[derive(Debug, Default)]
pub struct SeriesShard {
    pub(crate) series: RwLock<HashMap<SeriesId, SeriesBuffer>>,
}

/// Fixed array of [`NUM_SHARDS`] shards providing horizontal concurrency
/// across unrelated series. The array itself is immutable after construction;
/// only the per-shard maps change.
#[derive(Debug)]
pub struct ShardArray {
    shards: Box<[SeriesShard]>,
}

impl ShardArray {
    pub fn new() -> Self {
        let shards: Vec<SeriesShard> = (0..NUM_SHARDS).map(|_| SeriesShard::default()).collect();
        ShardArray {
            shards: shards.into_boxed_slice(),
        }
    }

    /// The shard owning `id`.
    #[inline]
    pub fn shard_for(&self, id: SeriesId) -> &SeriesShard {
        &self.shards[id.shard()]
    }

    /// Shard by position, for whole-index scans.
    #[inline]
    pub fn shard_at(&self, index: usize) -> &SeriesShard {
        &self.shards[index]
    }

    /// Inserts points for one series identity under the shard's write lock.
    ///
    /// On first contact the series is created with a defensive copy of the
    /// labels. On a hit the stored metric and labels are re-verified against
    /// the incoming identity; a mismatch means two distinct identities hashed
    /// to the same id and is rejected as [`DbError::SeriesCollision`] rather
    /// than silently merged.
    pub fn insert(&self, metric: &str, labels: &LabelSet, points: &[Point]) -> Result<(), DbError> {
        if points.is_empty() {
            return Ok(());
        }
        self.insert_at(series_id(metric, labels), metric, labels, points)
    }

    pub(crate) fn insert_at(
        &self,
        id: SeriesId,
        metric: &str,
        labels: &LabelSet,
        points: &[Point],
    ) -> Result<(), DbError> {
        let shard = self.shard_for(id);
        let mut guard = shard.series.write()?;

        let entry = guard.entry(id).or_insert_with(|| {
            SeriesBuffer::with_capacity(metric.to_string(), labels.clone(), points.len())
        });
        if entry.metric() != metric || entry.labels() != labels {
            return Err(DbError::SeriesCollision {
                id: id.0,
                existing: entry.metric().to_string(),
            });
        }
        for p in points {
            entry.insert(*p);
        }
        Ok(())
    }

    /// Binds `id` to this metric and label set under the shard's write lock,
    /// creating the (still empty) series on first contact and re-verifying
    /// the stored identity otherwise.
    ///
    /// The write path claims the id this way before handing the record to
    /// the durability pipeline. The claim is atomic with respect to
    /// concurrent writers, and series are never removed during the engine's
    /// lifetime, so once a claim succeeds no colliding record for that id
    /// can reach the log and poison replay.
    pub(crate) fn claim(
        &self,
        id: SeriesId,
        metric: &str,
        labels: &LabelSet,
    ) -> Result<(), DbError> {
        let mut guard = self.shard_for(id).series.write()?;
        let entry = guard
            .entry(id)
            .or_insert_with(|| SeriesBuffer::new(metric.to_string(), labels.clone()));
        if entry.metric() != metric || entry.labels() != labels {
            return Err(DbError::SeriesCollision {
                id: id.0,
                existing: entry.metric().to_string(),
            });
        }
        Ok(())
    }

    /// Inserts points into a series previously bound with [`Self::claim`].
    pub(crate) fn append_points(&self, id: SeriesId, points: &[Point]) -> Result<(), DbError> {
        let mut guard = self.shard_for(id).series.write()?;
        match guard.get_mut(&id) {
            Some(entry) => {
                for p in points {
                    entry.insert(*p);
                }
                Ok(())
            }
            None => Err(DbError::Internal(format!(
                "series {:#018x} vanished after claim",
                id.0
            ))),
        }
    }

    /// Total number of series across all shards.
    pub fn series_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.series.read().map(|m| m.len()).unwrap_or(0))
            .sum()
    }
}

impl Default for ShardArray {
    fn default() -> Self {
        Self::new()
    }
}
