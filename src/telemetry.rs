use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not
/// acceptable for production. Instead, callers can provide an implementation
/// that forwards these events to `tracing`, `log`, metrics, or custom sinks.
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the core.
#[derive(Debug, Clone)]
pub enum DbEvent {
    WalWorkerStarted,
    WalWorkerStopping,

    WalAppendFailed { error: String },
    WalFlushFailed { error: String },
    WalFsyncFailed { error: String },

    ReplayCompleted {
        records: u64,
        skipped: u64,
        trimmed_bytes: u64,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation via the `metrics` facade.
///
/// Emitting is effectively a no-op until the host installs a recorder; this
/// crate ships no exporter of its own.
pub mod db_metrics {
    use ::metrics::{describe_counter, describe_histogram, Unit};
    use std::time::Duration;

    // Counters are exposed as `<name>_total` by most exporters.
    pub const WRITE_POINTS: &str = "zarija_write_points";
    pub const WAL_BYTES_WRITTEN: &str = "zarija_wal_bytes_written";
    pub const QUERY_SERIES_RETURNED: &str = "zarija_query_series_returned";

    pub const WAL_FSYNC_DURATION_SECONDS: &str = "zarija_wal_fsync_duration_seconds";

    #[inline]
    pub fn record_write_points(points: u64) {
        if points > 0 {
            ::metrics::counter!(WRITE_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_wal_bytes(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(WAL_BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_query_series(series: u64) {
        if series > 0 {
            ::metrics::counter!(QUERY_SERIES_RETURNED).increment(series);
        }
    }

    #[inline]
    pub fn record_wal_fsync(duration: Duration) {
        ::metrics::histogram!(WAL_FSYNC_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Registers descriptions with the installed recorder. Hosts that scrape
    /// (e.g. through a Prometheus exporter) call this once after install.
    pub fn describe_all() {
        describe_counter!(
            WRITE_POINTS,
            Unit::Count,
            "Total number of points accepted via DbCore::write."
        );
        describe_counter!(
            WAL_BYTES_WRITTEN,
            Unit::Bytes,
            "Total framed bytes handed to the WAL file buffer (logical bytes, not including filesystem metadata)."
        );
        describe_counter!(
            QUERY_SERIES_RETURNED,
            Unit::Count,
            "Total series entries returned from queries."
        );
        describe_histogram!(
            WAL_FSYNC_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of WAL fsync/sync_data calls."
        );
    }
}
