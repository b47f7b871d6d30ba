//! Writable in-memory partitions.

use crate::disk::{DiskMetric, PartitionMeta, encode_metric_key};
use crate::gorilla::GorillaEncoder;
use crate::label::marshal_metric_name;
use crate::time::{TimestampPrecision, duration_to_units, now_in_precision};
use crate::wal::{Wal, wal_error};
use crate::{DataPoint, Label, Result, Row, TidemarkError};
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};
use tracing::warn;

/// A memory partition stores the hot head of the series on the heap.
pub struct MemoryPartition {
    /// Number of accepted data points, including out-of-order ones.
    num_points: AtomicUsize,
    /// Minimum timestamp; latched once by the first successful insert.
    min_t: AtomicI64,
    max_t: AtomicI64,
    min_latch: Once,
    /// Per-series storage keyed by the marshaled metric name.
    metrics: DashMap<Vec<u8>, Arc<MemorySeries>>,
    wal: Arc<dyn Wal>,
    /// Partition duration in timestamp units.
    partition_duration: i64,
    precision: TimestampPrecision,
    created_at: SystemTime,
    /// Blocks new writes while the partition is being flushed.
    flush_sealed: AtomicBool,
    /// Writes currently mutating this partition.
    inflight_inserts: AtomicUsize,
}

struct InflightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl MemoryPartition {
    /// Creates an empty memory partition backed by the given WAL.
    pub fn new(
        wal: Arc<dyn Wal>,
        partition_duration: Duration,
        precision: TimestampPrecision,
    ) -> Self {
        Self {
            num_points: AtomicUsize::new(0),
            min_t: AtomicI64::new(0),
            max_t: AtomicI64::new(0),
            min_latch: Once::new(),
            metrics: DashMap::new(),
            wal,
            partition_duration: duration_to_units(partition_duration, precision),
            precision,
            created_at: SystemTime::now(),
            flush_sealed: AtomicBool::new(false),
            inflight_inserts: AtomicUsize::new(0),
        }
    }

    fn get_or_create_series(&self, name: Vec<u8>) -> Arc<MemorySeries> {
        match self.metrics.entry(name) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let series = Arc::new(MemorySeries::new());
                entry.insert(series.clone());
                series
            }
        }
    }

    fn insert_rows_impl(&self, rows: &[Row], append_wal: bool) -> Result<Vec<Row>> {
        if rows.is_empty() {
            return Err(TidemarkError::EmptyBatch);
        }

        if self.flush_sealed.load(Ordering::Acquire) {
            return Ok(rows.to_vec());
        }
        self.inflight_inserts.fetch_add(1, Ordering::AcqRel);
        if self.flush_sealed.load(Ordering::Acquire) {
            self.inflight_inserts.fetch_sub(1, Ordering::AcqRel);
            return Ok(rows.to_vec());
        }
        let _inflight = InflightGuard {
            counter: &self.inflight_inserts,
        };

        // The whole batch hits the log before outdated filtering, so outdated
        // rows reappear on replay and recovery re-filters them against the
        // reconstructed minimum timestamp.
        if append_wal {
            self.wal
                .append_rows(rows)
                .map_err(|e| wal_error("append", e))?;
        }

        self.min_latch.call_once(|| {
            let batch_min = rows
                .iter()
                .map(|row| row.data_point().timestamp)
                .min()
                .expect("batch is non-empty");
            self.min_t.store(batch_min, Ordering::Release);
        });
        let partition_min = self.min_t.load(Ordering::Acquire);

        let mut outdated_rows = Vec::new();
        let mut batch_max = i64::MIN;
        let mut accepted = 0usize;
        let mut now: Option<i64> = None;

        for row in rows {
            let mut timestamp = row.data_point().timestamp;
            if timestamp < partition_min {
                outdated_rows.push(row.clone());
                continue;
            }
            if timestamp == 0 {
                let substituted =
                    *now.get_or_insert_with(|| now_in_precision(self.precision));
                warn!(
                    metric = row.metric(),
                    substituted, "replacing zero timestamp with current time"
                );
                timestamp = substituted;
            }

            let name = marshal_metric_name(row.metric(), row.labels());
            let series = self.get_or_create_series(name);
            series.insert_point(DataPoint::new(timestamp, row.data_point().value));

            batch_max = batch_max.max(timestamp);
            accepted += 1;
        }

        self.num_points.fetch_add(accepted, Ordering::SeqCst);

        if accepted > 0 {
            // 0 doubles as the unset sentinel, so fetch_max alone is not enough.
            let mut current = self.max_t.load(Ordering::Acquire);
            while current == 0 || batch_max > current {
                match self.max_t.compare_exchange_weak(
                    current,
                    batch_max,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }

        Ok(outdated_rows)
    }
}

impl crate::partition::Partition for MemoryPartition {
    fn insert_rows(&self, rows: &[Row]) -> Result<Vec<Row>> {
        self.insert_rows_impl(rows, true)
    }

    fn insert_rows_recovery(&self, rows: &[Row]) -> Result<Vec<Row>> {
        self.insert_rows_impl(rows, false)
    }

    fn select_data_points(
        &self,
        metric: &str,
        labels: &[Label],
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint>> {
        let min = self.min_t.load(Ordering::Acquire);
        let max = self.max_t.load(Ordering::Acquire);
        if min != 0 && (end <= min || start > max) {
            return Ok(Vec::new());
        }

        let name = marshal_metric_name(metric, labels);
        match self.metrics.get(&name) {
            Some(series) => Ok(series.select_points(start, end)),
            None => Ok(Vec::new()),
        }
    }

    fn min_timestamp(&self) -> i64 {
        self.min_t.load(Ordering::SeqCst)
    }

    fn max_timestamp(&self) -> i64 {
        self.max_t.load(Ordering::SeqCst)
    }

    fn size(&self) -> usize {
        self.num_points.load(Ordering::SeqCst)
    }

    fn active(&self) -> bool {
        let min = self.min_timestamp();
        if min == 0 {
            // An empty partition stays the insertion target.
            return true;
        }
        self.max_timestamp().saturating_sub(min).saturating_add(1) < self.partition_duration
    }

    fn expired(&self) -> bool {
        // Memory partitions never expire; they leave the list by being
        // flushed and swapped for a disk partition.
        false
    }

    fn clean(&self) -> Result<()> {
        Ok(())
    }

    fn flush_to_disk(&self) -> Result<Option<(Vec<u8>, PartitionMeta)>> {
        self.wal.flush().map_err(|e| wal_error("flush", e))?;

        let mut data = Vec::new();
        let mut metrics_map = HashMap::new();

        for entry in self.metrics.iter() {
            let (name, series) = entry.pair();
            let offset = data.len() as u64;

            let mut encoder = GorillaEncoder::new(&mut data);
            let stats = series.encode_all_points(&mut encoder)?;
            encoder.flush().map_err(TidemarkError::Io)?;
            if stats.num_points == 0 {
                continue;
            }

            let key = encode_metric_key(name);
            metrics_map.insert(
                key.clone(),
                DiskMetric {
                    name: key,
                    offset,
                    size: (data.len() as u64).saturating_sub(offset),
                    min_timestamp: stats.min_timestamp,
                    max_timestamp: stats.max_timestamp,
                    num_data_points: stats.num_points,
                },
            );
        }

        let meta = PartitionMeta {
            min_timestamp: self.min_timestamp(),
            max_timestamp: self.max_timestamp(),
            num_data_points: self.size(),
            metrics: metrics_map,
            created_at: self.created_at,
        };

        Ok(Some((data, meta)))
    }

    fn begin_flush(&self) -> bool {
        if self
            .flush_sealed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Wait out writers that slipped in before the seal.
        while self.inflight_inserts.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        true
    }

    fn end_flush(&self) {
        self.flush_sealed.store(false, Ordering::Release);
    }
}

/// Stats of one encoded series stream, computed over the merged point order.
pub(crate) struct SeriesEncodeStats {
    pub num_points: usize,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

/// Per-series storage: an ordered array for the hot path plus an unordered
/// buffer for late arrivals, merged only at flush time.
struct MemorySeries {
    /// Number of points in the ordered array.
    size: AtomicUsize,
    min_timestamp: AtomicI64,
    max_timestamp: AtomicI64,
    points: RwLock<Vec<DataPoint>>,
    out_of_order_points: Mutex<Vec<DataPoint>>,
}

impl MemorySeries {
    fn new() -> Self {
        Self {
            size: AtomicUsize::new(0),
            min_timestamp: AtomicI64::new(0),
            max_timestamp: AtomicI64::new(0),
            points: RwLock::new(Vec::new()),
            out_of_order_points: Mutex::new(Vec::new()),
        }
    }

    fn insert_point(&self, point: DataPoint) {
        let mut points = self.points.write();

        if points.is_empty() {
            points.push(point);
            self.min_timestamp.store(point.timestamp, Ordering::Release);
            self.max_timestamp.store(point.timestamp, Ordering::Release);
            self.size.store(1, Ordering::Release);
            return;
        }

        if points[points.len() - 1].timestamp < point.timestamp {
            points.push(point);
            self.max_timestamp.store(point.timestamp, Ordering::Release);
            self.size.fetch_add(1, Ordering::Release);
            return;
        }

        drop(points);
        self.out_of_order_points.lock().push(point);
    }

    /// Selects from the ordered array only. Out-of-order points stay
    /// invisible until flush; that keeps this path branch-free.
    fn select_points(&self, start: i64, end: i64) -> Vec<DataPoint> {
        if self.size.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        if end <= self.min_timestamp.load(Ordering::Acquire) {
            return Vec::new();
        }

        let points = self.points.read();
        let start_idx = points.partition_point(|p| p.timestamp < start);
        let end_idx = points.partition_point(|p| p.timestamp < end);
        points[start_idx..end_idx].to_vec()
    }

    /// Encodes every point in ascending timestamp order: a two-pointer merge
    /// of the ordered array with the sorted out-of-order buffer. Ties emit
    /// the in-order point first.
    fn encode_all_points<W: Write>(
        &self,
        encoder: &mut GorillaEncoder<W>,
    ) -> Result<SeriesEncodeStats> {
        let mut ooo_points = self.out_of_order_points.lock();
        ooo_points.sort_by_key(|p| p.timestamp);
        let points = self.points.read();

        let mut stats = SeriesEncodeStats {
            num_points: 0,
            min_timestamp: 0,
            max_timestamp: 0,
        };
        let mut emit = |encoder: &mut GorillaEncoder<W>, point: &DataPoint| -> Result<()> {
            encoder.encode_point(point)?;
            if stats.num_points == 0 {
                stats.min_timestamp = point.timestamp;
            }
            stats.max_timestamp = point.timestamp;
            stats.num_points += 1;
            Ok(())
        };

        let mut oi = 0usize;
        let mut pi = 0usize;
        while oi < ooo_points.len() && pi < points.len() {
            if ooo_points[oi].timestamp < points[pi].timestamp {
                emit(encoder, &ooo_points[oi])?;
                oi += 1;
            } else {
                emit(encoder, &points[pi])?;
                pi += 1;
            }
        }
        for point in &ooo_points[oi..] {
            emit(encoder, point)?;
        }
        for point in &points[pi..] {
            emit(encoder, point)?;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;
    use crate::wal::NopWal;

    fn new_partition() -> MemoryPartition {
        MemoryPartition::new(
            Arc::new(NopWal),
            Duration::from_secs(3600),
            TimestampPrecision::Seconds,
        )
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let partition = new_partition();
        assert!(matches!(
            partition.insert_rows(&[]),
            Err(TidemarkError::EmptyBatch)
        ));
    }

    #[test]
    fn test_rows_older_than_min_are_returned_as_outdated() {
        let partition = new_partition();
        let outdated = partition
            .insert_rows(&[Row::new("m", DataPoint::new(10, 1.0))])
            .unwrap();
        assert!(outdated.is_empty());

        let outdated = partition
            .insert_rows(&[
                Row::new("m", DataPoint::new(5, 2.0)),
                Row::new("m", DataPoint::new(11, 3.0)),
            ])
            .unwrap();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].data_point().timestamp, 5);
        assert_eq!(partition.size(), 2);
    }

    #[test]
    fn test_out_of_order_points_are_invisible_until_flush() {
        let partition = new_partition();
        partition
            .insert_rows(&[
                Row::new("m", DataPoint::new(10, 1.0)),
                Row::new("m", DataPoint::new(30, 3.0)),
            ])
            .unwrap();
        // Within the partition window but behind the series cursor.
        partition
            .insert_rows(&[Row::new("m", DataPoint::new(20, 2.0))])
            .unwrap();

        let points = partition.select_data_points("m", &[], 0, 100).unwrap();
        let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![10, 30]);
        assert_eq!(partition.size(), 3);
    }

    #[test]
    fn test_flush_merges_out_of_order_points() {
        let partition = new_partition();
        partition
            .insert_rows(&[
                Row::new("m", DataPoint::new(10, 1.0)),
                Row::new("m", DataPoint::new(30, 3.0)),
                Row::new("m", DataPoint::new(20, 2.0)),
                Row::new("m", DataPoint::new(40, 4.0)),
            ])
            .unwrap();

        let (data, meta) = partition.flush_to_disk().unwrap().unwrap();
        let entry = meta.metrics.values().next().unwrap();
        assert_eq!(entry.num_data_points, 4);
        assert_eq!(entry.min_timestamp, 10);
        assert_eq!(entry.max_timestamp, 40);

        let mut decoder = crate::gorilla::GorillaDecoder::new(&data);
        let timestamps: Vec<i64> = (0..4)
            .map(|_| decoder.decode_point().unwrap().timestamp)
            .collect();
        assert_eq!(timestamps, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_active_tracks_partition_duration() {
        let partition = MemoryPartition::new(
            Arc::new(NopWal),
            Duration::from_secs(10),
            TimestampPrecision::Seconds,
        );
        assert!(partition.active());

        partition
            .insert_rows(&[Row::new("m", DataPoint::new(100, 1.0))])
            .unwrap();
        assert!(partition.active());

        partition
            .insert_rows(&[Row::new("m", DataPoint::new(109, 2.0))])
            .unwrap();
        assert!(!partition.active());
    }

    #[test]
    fn test_sealed_partition_returns_batch_untouched() {
        let partition = new_partition();
        assert!(partition.begin_flush());
        let rows = vec![Row::new("m", DataPoint::new(1, 1.0))];
        let rejected = partition.insert_rows(&rows).unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(partition.size(), 0);

        partition.end_flush();
        assert!(partition.insert_rows(&rows).unwrap().is_empty());
        assert_eq!(partition.size(), 1);
    }
}
