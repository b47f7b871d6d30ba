//! Read-only disk partitions.

use crate::concurrency::CancelToken;
use crate::gorilla::GorillaDecoder;
use crate::label::marshal_metric_name;
use crate::time::{TimestampPrecision, duration_to_units, now_in_precision};
use crate::{DataPoint, Label, Result, Row, TidemarkError};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const DATA_FILE_NAME: &str = "data";
pub const META_FILE_NAME: &str = "meta.json";

/// Metadata persisted next to a partition's data file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMeta {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub num_data_points: usize,
    /// Per-series entries keyed by the hex-encoded marshaled metric name.
    pub metrics: HashMap<String, DiskMetric>,
    pub created_at: SystemTime,
}

/// Location and stats of one compressed series stream within the data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskMetric {
    pub name: String,
    pub offset: u64,
    /// Encoded byte length of the stream.
    pub size: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub num_data_points: usize,
}

/// An immutable partition persisted as a directory holding `meta.json` and a
/// memory-mapped `data` file of concatenated per-series Gorilla streams.
pub struct DiskPartition {
    dir_path: PathBuf,
    meta: PartitionMeta,
    mmap: Mmap,
    #[allow(dead_code)]
    data_file: File,
    precision: TimestampPrecision,
    retention_units: i64,
}

impl DiskPartition {
    /// Opens an existing partition directory.
    pub fn open(
        dir_path: impl AsRef<Path>,
        retention: Duration,
        precision: TimestampPrecision,
    ) -> Result<Self> {
        let dir_path = dir_path.as_ref();
        if dir_path.as_os_str().is_empty() {
            return Err(TidemarkError::InvalidPartition {
                path: dir_path.to_path_buf(),
                details: "empty partition path".to_string(),
            });
        }
        if !dir_path.is_dir() {
            return Err(TidemarkError::InvalidPartition {
                path: dir_path.to_path_buf(),
                details: "partition directory does not exist".to_string(),
            });
        }

        let meta_path = dir_path.join(META_FILE_NAME);
        if !meta_path.exists() {
            return Err(TidemarkError::InvalidPartition {
                path: dir_path.to_path_buf(),
                details: "missing metadata file".to_string(),
            });
        }
        let meta: PartitionMeta = serde_json::from_reader(File::open(&meta_path)?)?;

        let data_path = dir_path.join(DATA_FILE_NAME);
        let data_file = File::open(&data_path).map_err(|source| TidemarkError::IoWithPath {
            path: data_path.clone(),
            source,
        })?;
        if data_file.metadata()?.len() == 0 {
            return Err(TidemarkError::InvalidPartition {
                path: dir_path.to_path_buf(),
                details: "empty data file".to_string(),
            });
        }

        let mmap = unsafe { Mmap::map(&data_file)? };

        Ok(Self {
            dir_path: dir_path.to_path_buf(),
            meta,
            mmap,
            data_file,
            precision,
            retention_units: duration_to_units(retention, precision),
        })
    }

    /// Creates a partition directory from flushed memory-partition data and
    /// opens it.
    pub fn create(
        dir_path: impl AsRef<Path>,
        meta: PartitionMeta,
        data: Vec<u8>,
        retention: Duration,
        precision: TimestampPrecision,
    ) -> Result<Self> {
        let dir_path = dir_path.as_ref();
        fs::create_dir_all(dir_path).map_err(|source| TidemarkError::IoWithPath {
            path: dir_path.to_path_buf(),
            source,
        })?;

        let data_path = dir_path.join(DATA_FILE_NAME);
        fs::write(&data_path, &data)?;

        // Metadata lands last, via rename, so a partial partition directory
        // is never mistaken for a valid one.
        let meta_path = dir_path.join(META_FILE_NAME);
        let tmp_path = dir_path.join(format!("{META_FILE_NAME}.tmp"));
        serde_json::to_writer_pretty(File::create(&tmp_path)?, &meta)?;
        fs::rename(&tmp_path, &meta_path)?;

        Self::open(dir_path, retention, precision)
    }

    fn decode_metric_points(
        &self,
        disk_metric: &DiskMetric,
        start: i64,
        end: i64,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<DataPoint>> {
        if end <= disk_metric.min_timestamp || start > disk_metric.max_timestamp {
            return Ok(Vec::new());
        }

        let offset = disk_metric.offset as usize;
        let stream_end = offset.saturating_add(disk_metric.size as usize);
        if offset >= self.mmap.len() || stream_end > self.mmap.len() || stream_end <= offset {
            return Err(TidemarkError::DataCorruption(format!(
                "series stream [{offset}, {stream_end}) outside data file of {} bytes",
                self.mmap.len()
            )));
        }

        let mut decoder = GorillaDecoder::new(&self.mmap[offset..stream_end]);
        let mut points = Vec::new();

        // Delta encoding forbids random access; decode from the start and
        // stop once past the window.
        for _ in 0..disk_metric.num_data_points {
            if let Some(token) = cancel
                && token.is_cancelled()
            {
                return Err(TidemarkError::Cancelled);
            }

            let point = decoder.decode_point()?;
            if point.timestamp < start {
                continue;
            }
            if point.timestamp >= end {
                break;
            }
            points.push(point);
        }

        Ok(points)
    }

    fn lookup_metric(&self, metric: &str, labels: &[Label]) -> Option<&DiskMetric> {
        let key = encode_metric_key(&marshal_metric_name(metric, labels));
        self.meta.metrics.get(&key)
    }
}

impl crate::partition::Partition for DiskPartition {
    fn insert_rows(&self, _rows: &[Row]) -> Result<Vec<Row>> {
        Err(TidemarkError::ReadOnlyPartition {
            path: self.dir_path.clone(),
        })
    }

    fn select_data_points(
        &self,
        metric: &str,
        labels: &[Label],
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint>> {
        if self.expired() {
            return Err(TidemarkError::PartitionExpired {
                max_timestamp: self.meta.max_timestamp,
            });
        }
        match self.lookup_metric(metric, labels) {
            Some(disk_metric) => self.decode_metric_points(disk_metric, start, end, None),
            None => Ok(Vec::new()),
        }
    }

    fn select_data_points_with_cancel(
        &self,
        metric: &str,
        labels: &[Label],
        start: i64,
        end: i64,
        cancel: &CancelToken,
    ) -> Result<Vec<DataPoint>> {
        if self.expired() {
            return Err(TidemarkError::PartitionExpired {
                max_timestamp: self.meta.max_timestamp,
            });
        }
        match self.lookup_metric(metric, labels) {
            Some(disk_metric) => self.decode_metric_points(disk_metric, start, end, Some(cancel)),
            None => Ok(Vec::new()),
        }
    }

    fn min_timestamp(&self) -> i64 {
        self.meta.min_timestamp
    }

    fn max_timestamp(&self) -> i64 {
        self.meta.max_timestamp
    }

    fn size(&self) -> usize {
        self.meta.num_data_points
    }

    fn active(&self) -> bool {
        false
    }

    fn expired(&self) -> bool {
        if self.retention_units <= 0 {
            return false;
        }
        let now = now_in_precision(self.precision);
        now.saturating_sub(self.meta.max_timestamp) > self.retention_units
    }

    fn clean(&self) -> Result<()> {
        fs::remove_dir_all(&self.dir_path).map_err(|source| TidemarkError::IoWithPath {
            path: self.dir_path.clone(),
            source,
        })
    }

    fn flush_to_disk(&self) -> Result<Option<(Vec<u8>, PartitionMeta)>> {
        Ok(None)
    }
}

/// Hex-encodes a marshaled metric name so it can key JSON metadata losslessly.
pub(crate) fn encode_metric_key(metric: &[u8]) -> String {
    let mut out = String::with_capacity(metric.len() * 2);
    for byte in metric {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
