use crate::types::{LabelSet, Point, Timestamp};

/// A single series: its identity plus the points, kept sorted by timestamp.
///
/// The common case of monotonically increasing timestamps takes a tail-append
/// fast path; out-of-order points fall back to a binary-search insertion.
/// Points sharing a timestamp keep their insertion order.
#[derive(Debug, Clone)]
pub struct SeriesBuffer {
    metric: String,
    labels: LabelSet,
    points: Vec<Point>,
}

impl SeriesBuffer {
    /// Creates an empty buffer owning a copy of the series identity.
    pub fn new(metric: String, labels: LabelSet) -> Self {
        SeriesBuffer {
            metric,
            labels,
            points: Vec::new(),
        }
    }

    pub fn with_capacity(metric: String, labels: LabelSet, capacity: usize) -> Self {
        SeriesBuffer {
            metric,
            labels,
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Inserts a point, keeping the buffer sorted by timestamp.
    ///
    /// The insertion index for an out-of-order point is the first index with
    /// a strictly greater timestamp, so a new point lands after any stored
    /// points with the same timestamp.
    pub fn insert(&mut self, p: Point) {
        let append = self
            .points
            .last()
            .map_or(true, |last| p.timestamp >= last.timestamp);
        if append {
            self.points.push(p);
        } else {
            let idx = self.points.partition_point(|q| q.timestamp <= p.timestamp);
            self.points.insert(idx, p);
        }
    }

    /// Copies out the points with `from <= timestamp <= to` (both inclusive).
    pub fn range(&self, from: Timestamp, to: Timestamp) -> Vec<Point> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let start = self.points.partition_point(|p| p.timestamp < from);
        let end = self.points.partition_point(|p| p.timestamp <= to);
        if start >= end {
            return Vec::new();
        }
        self.points[start..end].to_vec()
    }
}
