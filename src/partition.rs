//! The partition capability set shared by memory and disk variants.

use crate::concurrency::CancelToken;
use crate::disk::PartitionMeta;
use crate::{DataPoint, Label, Result, Row};
use std::sync::Arc;

/// A partition is a time-bounded container of data points.
///
/// Partitions act as independent stores for their time range. Memory
/// partitions are writable; disk partitions are read-only. The lifecycle is
/// writable -> inactive (still accepting out-of-order rows) -> flushed and
/// replaced by a disk partition.
pub trait Partition: Send + Sync {
    /// Inserts rows into the partition.
    /// Returns the rows this partition did not accept (older than its
    /// minimum timestamp, or arriving while the partition is sealed).
    fn insert_rows(&self, rows: &[Row]) -> Result<Vec<Row>>;

    /// Inserts rows during WAL replay. Defaults to a normal insert;
    /// memory partitions override it to skip the WAL append.
    fn insert_rows_recovery(&self, rows: &[Row]) -> Result<Vec<Row>> {
        self.insert_rows(rows)
    }

    /// Selects data points for an exact (metric, labels) series within
    /// `[start, end)`.
    fn select_data_points(
        &self,
        metric: &str,
        labels: &[Label],
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint>>;

    /// Cancellable variant of `select_data_points`. Disk partitions override
    /// it to check the token between decoded points.
    fn select_data_points_with_cancel(
        &self,
        metric: &str,
        labels: &[Label],
        start: i64,
        end: i64,
        _cancel: &CancelToken,
    ) -> Result<Vec<DataPoint>> {
        self.select_data_points(metric, labels, start, end)
    }

    /// Returns the minimum timestamp in the partition.
    fn min_timestamp(&self) -> i64;

    /// Returns the maximum timestamp in the partition.
    fn max_timestamp(&self) -> i64;

    /// Returns the number of data points in the partition.
    fn size(&self) -> usize;

    /// Returns true while the partition is the insertion target.
    fn active(&self) -> bool;

    /// Returns true once the partition has outlived the retention window.
    fn expired(&self) -> bool;

    /// Releases resources owned by the partition (files, mappings).
    fn clean(&self) -> Result<()>;

    /// Encodes the partition into (data bytes, metadata) for persisting.
    /// Returns None when the partition is already on disk.
    fn flush_to_disk(&self) -> Result<Option<(Vec<u8>, PartitionMeta)>>;

    /// Seals the partition against new writes ahead of a flush.
    /// Returns true when the partition supports sealing and was not
    /// already sealed.
    fn begin_flush(&self) -> bool {
        false
    }

    /// Clears a previously established seal.
    fn end_flush(&self) {}
}

/// Shared handle to a partition.
pub type SharedPartition = Arc<dyn Partition>;
