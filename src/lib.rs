#![doc = r#"
zarija: Embeddable Labelled Time-Series Store

This crate provides a small, durable time-series core for Rust applications.
A host process links the library, writes labelled metric samples, and gets
bounded time-range queries back out, with crash safety from an append-only
write-ahead log. It supports:
- A sharded concurrent in-memory index keyed by series identity
- Sorted per-series point buffers with a monotonic-append fast path
- A write-ahead log with an asynchronous, batched fsync pipeline
- Crash recovery by replaying the log on open
- Time-range queries filtered by metric name and label equality

See the README for usage examples and more details.
"#]
// Declare modules
pub mod buffer;
pub mod core;
pub mod error;
pub mod index;
pub mod persistence;
pub mod query;
pub mod storage;
pub mod telemetry;
pub mod types;

/// Main entry point for interacting with the time-series store.
pub use crate::core::DbCore;
/// Configuration options for the store.
pub use crate::core::DbConfig;
/// Error type for store operations.
pub use crate::error::DbError;
/// Stable 64-bit series identity and its hash function.
pub use crate::index::{series_id, SeriesId, NUM_SHARDS};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener};
/// Core data model types.
pub use crate::types::{
    LabelSet, Point, QueryOptions, SeriesResult, Timestamp, Value, WriteSeries,
};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
