//! Engine facade: open/replay lifecycle, the write path, queries, shutdown.

use crate::error::DbError;
use crate::index::series_id;
use crate::persistence::{self, encode_record, WalWriter};
use crate::query::execute_query;
use crate::storage::ShardArray;
use crate::telemetry::{db_metrics, noop_event_listener, DbEvent, DbEventListener};
use crate::types::{LabelSet, Point, QueryOptions, SeriesResult, Timestamp, Value, WriteSeries};

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Configuration options for the engine.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Capacity of the bounded channel between `write` and the WAL worker.
    /// Writers block (never drop) when it is full.
    pub wal_channel_capacity: usize,
    /// Size of the user-space buffer in front of the log file.
    pub wal_buffer_bytes: usize,
    /// Interval between WAL flush+fsync cycles. Together with one flush and
    /// one fsync this bounds the durability horizon of acknowledged writes.
    pub sync_interval: Duration,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn DbEventListener>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            wal_channel_capacity: 4096,
            wal_buffer_bytes: 1 << 20, // 1 MiB
            sync_interval: Duration::from_millis(10),
            event_listener: noop_event_listener(),
        }
    }
}

/// The main embeddable time-series store.
///
/// Writes go to the WAL pipeline first and into the sharded in-memory index
/// second, so an acknowledged write is immediately queryable and at worst one
/// sync interval away from being crash-safe. All methods are thread-safe;
/// writes and queries may run concurrently from arbitrary threads.
#[derive(Debug)]
pub struct DbCore {
    /// Sharded in-memory series index.
    shards: ShardArray,
    /// Sender side of the WAL channel; `None` once closed.
    wal_tx: Mutex<Option<SyncSender<Vec<u8>>>>,
    /// Handle for the WAL worker thread, joined on close.
    wal_handle: Mutex<Option<JoinHandle<()>>>,
    /// Engine configuration.
    config: DbConfig,
    /// Path of the log file.
    path: PathBuf,
}

impl DbCore {
    /// Opens (or creates) the database at `path` with default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::open_with_config(path, DbConfig::default())
    }

    /// Opens (or creates) the database at `path`.
    ///
    /// The parent directory is created if absent. The log is replayed into
    /// the in-memory index before the WAL worker starts; a trailing record
    /// truncated by a crash is silently trimmed, while a malformed record
    /// earlier in the log fails the open with [`DbError::CorruptWal`].
    ///
    /// # Errors
    /// Returns [`DbError::InvalidPath`] for an empty path, io errors from
    /// directory or file creation, and [`DbError::CorruptWal`] from replay.
    /// Replay can also surface [`DbError::SeriesCollision`] if the log holds
    /// two differing identities hashing to the same id; this crate's write
    /// path claims ids before logging and cannot produce such a log, but a
    /// foreign or hand-edited one could.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: DbConfig) -> Result<Self, DbError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(DbError::InvalidPath("path must not be empty".to_string()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    fs::DirBuilder::new()
                        .recursive(true)
                        .mode(0o755)
                        .create(parent)?;
                }
                #[cfg(not(unix))]
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).read(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        let mut file = options.open(path)?;

        let shards = ShardArray::new();
        let summary = persistence::prepare_log(&mut file, &shards)?;
        config.event_listener.on_event(DbEvent::ReplayCompleted {
            records: summary.records,
            skipped: summary.skipped,
            trimmed_bytes: summary.dropped_bytes,
        });

        let (wal_tx, wal_rx) = mpsc::sync_channel(config.wal_channel_capacity);
        let writer = WalWriter::new(
            file,
            config.wal_buffer_bytes,
            config.sync_interval,
            wal_rx,
            config.event_listener.clone(),
        );
        let wal_handle = thread::Builder::new()
            .name("zarija-wal".to_string())
            .spawn(move || writer.run())
            .map_err(|e| DbError::Internal(format!("failed to spawn WAL worker: {}", e)))?;

        Ok(DbCore {
            shards,
            wal_tx: Mutex::new(Some(wal_tx)),
            wal_handle: Mutex::new(Some(wal_handle)),
            config,
            path: path.to_path_buf(),
        })
    }

    /// Writes a batch of series.
    ///
    /// For every series with at least one point the record is serialised and
    /// handed to the durability pipeline first (blocking while the WAL
    /// channel is full, never dropping), then the points are inserted into
    /// the in-memory index under the owning shard's write lock. A returned
    /// `Ok` therefore means every series in the batch is queryable and at
    /// least enqueued for the next fsync; it is crash-safe once that fsync
    /// completes, at most one sync interval plus one flush+fsync later.
    /// Worker-side flush/fsync failures are reported through the event
    /// listener and do not fail writes that already returned.
    ///
    /// Labels and points are copied on ingest: the caller may mutate or reuse
    /// its maps and buffers freely after this returns.
    ///
    /// Empty batches and series with zero points succeed without effect.
    ///
    /// # Errors
    /// Returns an io kind when the engine is closed or a record cannot be
    /// serialised, and [`DbError::SeriesCollision`] when a series id
    /// collision with a differing identity is detected.
    pub fn write(&self, batch: &[WriteSeries]) -> Result<(), DbError> {
        for series in batch {
            if series.points.is_empty() {
                continue;
            }

            // Claim the identity under the shard's write lock before the
            // record reaches the log. The claim either binds the id to this
            // metric/labels or rejects the collision; either way no
            // colliding record can be enqueued, even by a racing writer.
            let id = series_id(&series.metric, &series.labels);
            self.shards.claim(id, &series.metric, &series.labels)?;

            let payload = encode_record(&series.metric, &series.labels, &series.points)?;

            // Clone the sender out of the lock so concurrent writers block on
            // the channel, not on each other.
            let tx = {
                let guard = self.wal_tx.lock()?;
                match guard.as_ref() {
                    Some(tx) => tx.clone(),
                    None => return Err(closed_error()),
                }
            };
            tx.send(payload).map_err(|_| closed_error())?;

            self.shards.append_points(id, &series.points)?;
            db_metrics::record_write_points(series.points.len() as u64);
        }
        Ok(())
    }

    /// Writes `values` as one series stamped with the current wall-clock
    /// time, for ad-hoc instrumentation call sites.
    ///
    /// # Errors
    /// Returns [`DbError::BadRequest`] for an empty value list, otherwise the
    /// same errors as [`DbCore::write`].
    pub fn write_now(
        &self,
        metric: &str,
        labels: LabelSet,
        values: &[Value],
    ) -> Result<(), DbError> {
        if values.is_empty() {
            return Err(DbError::BadRequest(
                "points must be more than zero".to_string(),
            ));
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as Timestamp;
        let points = values
            .iter()
            .map(|&value| Point { timestamp, value })
            .collect();

        self.write(&[WriteSeries {
            metric: metric.to_string(),
            labels,
            points,
        }])
    }

    /// Queries every series of `options.metric` whose labels contain all of
    /// the filter pairs, returning the points with
    /// `from <= timestamp <= to` (both inclusive). An empty filter matches
    /// every series of the metric; an empty result list is valid.
    ///
    /// # Errors
    /// Returns [`DbError::BadRequest`] when the metric is empty or
    /// `from > to`.
    pub fn query(&self, options: &QueryOptions) -> Result<Vec<SeriesResult>, DbError> {
        if options.metric.is_empty() {
            return Err(DbError::BadRequest("metric is required".to_string()));
        }
        if options.from > options.to {
            return Err(DbError::BadRequest(format!(
                "invalid time range: from={} > to={}",
                options.from, options.to
            )));
        }

        let results = execute_query(&self.shards, options)?;
        db_metrics::record_query_series(results.len() as u64);
        Ok(results)
    }

    /// Stops the engine: no further writes are accepted, in-flight WAL
    /// records are drained, and the log is flushed, fsynced and closed.
    ///
    /// Idempotent; a second close is a no-op returning success.
    pub fn close(&self) -> Result<(), DbError> {
        // Dropping the sender disconnects the channel once in-flight clones
        // are gone; the worker drains what is queued, does the final
        // flush+fsync and exits, closing the file with it.
        let tx = self.wal_tx.lock()?.take();
        drop(tx);

        let handle = self.wal_handle.lock()?.take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| DbError::Internal("WAL worker panicked".to_string()))?;
        }
        Ok(())
    }

    /// Returns a reference to the configuration the engine was opened with.
    pub fn get_config(&self) -> &DbConfig {
        &self.config
    }

    /// Path of the log file backing this engine.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn closed_error() -> DbError {
    DbError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "engine is closed",
    ))
}

/// Shut down the WAL worker gracefully when the engine is dropped without an
/// explicit close.
impl Drop for DbCore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
