//! tidemark - a lightweight embedded time-series storage engine
//!
//! tidemark ingests timestamped observations keyed by a metric name plus an
//! optional label set and answers range queries over them. Hot data lives in
//! writable in-memory partitions backed by a write-ahead log; older partitions
//! are frozen into compressed read-only files on disk and expired once they
//! fall out of the retention window.

pub mod bitstream;
pub mod concurrency;
pub mod disk;
pub mod engine;
pub mod error;
pub mod gorilla;
pub mod label;
pub mod list;
pub mod memory;
pub mod partition;
pub mod time;
pub mod wal;

pub use concurrency::CancelToken;
pub use engine::{Storage, StorageBuilder};
pub use error::{Result, TidemarkError};
pub use label::Label;
pub use time::TimestampPrecision;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a data point, the smallest unit of time series data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// The actual value.
    pub value: f64,
    /// Unix timestamp in the engine's configured precision.
    pub timestamp: i64,
}

impl DataPoint {
    /// Creates a new DataPoint.
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataPoint(ts: {}, val: {})", self.timestamp, self.value)
    }
}

/// A row includes a data point along with properties to identify a kind of metric.
#[derive(Debug, Clone)]
pub struct Row {
    /// The unique name of the metric.
    metric: String,
    /// Optional key-value properties for detailed identification.
    labels: Vec<Label>,
    /// The data point.
    data_point: DataPoint,
}

impl Row {
    /// Creates a new Row without labels.
    pub fn new(metric: impl Into<String>, data_point: DataPoint) -> Self {
        Self {
            metric: metric.into(),
            labels: Vec::new(),
            data_point,
        }
    }

    /// Creates a new Row with labels.
    pub fn with_labels(
        metric: impl Into<String>,
        labels: Vec<Label>,
        data_point: DataPoint,
    ) -> Self {
        Self {
            metric: metric.into(),
            labels,
            data_point,
        }
    }

    /// Gets the metric name.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Gets the labels.
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Gets the data point.
    pub fn data_point(&self) -> DataPoint {
        self.data_point
    }

    pub(crate) fn from_parts(metric: String, labels: Vec<Label>, data_point: DataPoint) -> Self {
        Self {
            metric,
            labels,
            data_point,
        }
    }
}
