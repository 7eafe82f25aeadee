use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Timestamp type (signed nanoseconds since the Unix epoch).
pub type Timestamp = i64;

/// LabelSet type (using a HashMap for flexibility). An absent label set is
/// equivalent to an empty one.
pub type LabelSet = HashMap<String, String>;

/// A tagged scalar sample value.
///
/// `Float64` is the primary value type. The integer and boolean variants
/// occupy the same slot in the log framing, so they can be stored and
/// replayed without a format change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Float64(f64),
    Int64(i64),
    Bool(bool),
}

impl Value {
    /// Returns the value widened to an `f64`.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Float64(v) => v,
            Value::Int64(v) => v as f64,
            Value::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A single (timestamp, value) sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Point {
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Point {
            timestamp,
            value: value.into(),
        }
    }
}

/// One series' worth of samples in a write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSeries {
    pub metric: String,
    #[serde(default)]
    pub labels: LabelSet,
    pub points: Vec<Point>,
}

/// A series returned from a query: the metric, a copy of the series' labels,
/// and the points that fell inside the queried range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesResult {
    pub metric: String,
    pub labels: LabelSet,
    pub points: Vec<Point>,
}

/// Parameters for a time-range query. `from` and `to` are both inclusive;
/// an empty `labels` filter matches every series of the metric.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub metric: String,
    pub labels: LabelSet,
    pub from: Timestamp,
    pub to: Timestamp,
}
