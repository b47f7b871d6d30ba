//! Write-ahead log backing the hot memory partition.

use crate::gorilla::{encode_uvarint, encode_varint, read_uvarint_from, read_varint_from};
use crate::label::{marshal_metric_name, unmarshal_metric_name};
use crate::{DataPoint, Result, Row, TidemarkError};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// WAL operation types.
///
/// The insert record layout is:
///
/// ```text
/// +--------+-----------------+--------+------------+--------------+
/// | op(1B) | metric len(var) | metric | ts(svar)   | value(uvar)  |
/// +--------+-----------------+--------+------------+--------------+
/// ```
///
/// The metric field holds the marshaled (metric, labels) key; the value field
/// holds the IEEE-754 bit pattern of the f64 as an unsigned varint.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOperation {
    Insert = 0,
}

impl WalOperation {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WalOperation::Insert),
            _ => None,
        }
    }
}

/// Trait for write-ahead log implementations.
pub trait Wal: Send + Sync {
    /// Appends insert records for the given rows.
    fn append_rows(&self, rows: &[Row]) -> Result<()>;

    /// Durably persists everything appended so far.
    fn flush(&self) -> Result<()>;

    /// Closes the current segment and rotates to a new one.
    fn punctuate(&self) -> Result<()>;

    /// Removes the oldest segment, corresponding to the oldest flushed
    /// partition.
    fn remove_oldest(&self) -> Result<()>;

    /// Removes every segment.
    fn remove_all(&self) -> Result<()>;

    /// Removes every segment and starts a fresh active one. Called once
    /// recovery has replayed the old segments.
    fn refresh(&self) -> Result<()>;
}

/// No-op WAL selected when durability is disabled.
pub struct NopWal;

impl Wal for NopWal {
    fn append_rows(&self, _rows: &[Row]) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn punctuate(&self) -> Result<()> {
        Ok(())
    }

    fn remove_oldest(&self) -> Result<()> {
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

const WAL_SEGMENT_EXTENSION: &str = ".wal";
const MAX_WAL_METRIC_NAME_BYTES: u64 = 4 * 1024 * 1024;

fn parse_segment_index(name: &OsStr) -> Option<u32> {
    let name = name.to_str()?;
    let stem = name.strip_suffix(WAL_SEGMENT_EXTENSION)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<u32>().ok()
}

fn sorted_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && let Some(index) = path.file_name().and_then(parse_segment_index)
        {
            segments.push((index, path));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments.into_iter().map(|(_, path)| path).collect())
}

/// Segmented append-only WAL on disk.
pub struct DiskWal {
    dir: PathBuf,
    current_segment: Mutex<Option<WalSegment>>,
    buffer_size: usize,
    segment_index: AtomicU32,
}

struct WalSegment {
    writer: BufWriter<File>,
}

impl DiskWal {
    /// Creates a WAL rooted at `dir`, continuing from any existing segments.
    pub fn new(dir: impl AsRef<Path>, buffer_size: usize) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let next_index = sorted_segments(&dir)?
            .last()
            .and_then(|path| path.file_name().and_then(parse_segment_index))
            .map_or(0, |max| max + 1);

        Ok(Arc::new(Self {
            dir,
            current_segment: Mutex::new(None),
            buffer_size,
            segment_index: AtomicU32::new(next_index),
        }))
    }

    fn create_segment(&self) -> Result<WalSegment> {
        let index = self.segment_index.fetch_add(1, Ordering::SeqCst);
        let path = self
            .dir
            .join(format!("{index:06}{WAL_SEGMENT_EXTENSION}"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = if self.buffer_size > 0 {
            BufWriter::with_capacity(self.buffer_size, file)
        } else {
            BufWriter::new(file)
        };
        Ok(WalSegment { writer })
    }

    fn sync_segment(segment: &mut WalSegment) -> Result<()> {
        segment.writer.flush()?;
        segment.writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl Wal for DiskWal {
    fn append_rows(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut current = self.current_segment.lock();
        if current.is_none() {
            *current = Some(self.create_segment()?);
        }
        let segment = current.as_mut().expect("segment was just created");

        let mut varint_buf = [0u8; 10];
        for row in rows {
            segment.writer.write_all(&[WalOperation::Insert as u8])?;

            let metric_name = marshal_metric_name(row.metric(), row.labels());
            let n = encode_uvarint(metric_name.len() as u64, &mut varint_buf);
            segment.writer.write_all(&varint_buf[..n])?;
            segment.writer.write_all(&metric_name)?;

            let n = encode_varint(row.data_point().timestamp, &mut varint_buf);
            segment.writer.write_all(&varint_buf[..n])?;

            let n = encode_uvarint(row.data_point().value.to_bits(), &mut varint_buf);
            segment.writer.write_all(&varint_buf[..n])?;
        }

        // Push the records out of the userspace buffer so a process crash
        // cannot lose them; fsync happens on flush/punctuate.
        segment.writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if let Some(segment) = self.current_segment.lock().as_mut() {
            Self::sync_segment(segment)?;
        }
        Ok(())
    }

    fn punctuate(&self) -> Result<()> {
        let mut current = self.current_segment.lock();
        if let Some(segment) = current.as_mut() {
            Self::sync_segment(segment)?;
        }
        // The next append opens a new segment; the old one becomes eligible
        // for remove_oldest once its partition is persisted.
        *current = None;
        Ok(())
    }

    fn remove_oldest(&self) -> Result<()> {
        let segments = sorted_segments(&self.dir)?;
        // Keep at least one segment so active WAL data is never discarded.
        if segments.len() <= 1 {
            return Ok(());
        }
        if let Some(oldest) = segments.first() {
            fs::remove_file(oldest)?;
        }
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        // Drop the open writer before unlinking files.
        drop(self.current_segment.lock().take());

        for segment in sorted_segments(&self.dir)? {
            fs::remove_file(segment)?;
        }
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        self.remove_all()?;
        let mut current = self.current_segment.lock();
        *current = Some(self.create_segment()?);
        Ok(())
    }
}

/// Replays WAL segments oldest-first during recovery.
pub struct WalReader {
    dir: PathBuf,
    rows: Vec<Row>,
}

impl WalReader {
    /// Creates a reader over the segments under `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            rows: Vec::new(),
        }
    }

    /// Reads every segment and returns the recovered rows in append order.
    pub fn read_all(mut self) -> Result<Vec<Row>> {
        let segments = sorted_segments(&self.dir)?;
        debug!(
            segments = segments.len(),
            wal_dir = %self.dir.display(),
            "scanning WAL segments"
        );

        for segment in &segments {
            self.read_segment(segment)?;
        }

        if !self.rows.is_empty() {
            info!(rows = self.rows.len(), "recovered rows from WAL");
        }
        Ok(self.rows)
    }

    /// Reads one segment. A torn or malformed record truncates the rest of
    /// the segment: everything before it is kept, everything after is lost.
    fn read_segment(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }

        let mut reader = BufReader::new(file);
        loop {
            let mut op_buf = [0u8; 1];
            match reader.read_exact(&mut op_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            if WalOperation::from_u8(op_buf[0]).is_none() {
                warn!(
                    segment = %path.display(),
                    opcode = op_buf[0],
                    "unknown WAL opcode, truncating segment"
                );
                break;
            }

            match Self::read_insert_record(&mut reader) {
                Ok(Some(row)) => self.rows.push(row),
                Ok(None) => {
                    warn!(segment = %path.display(), "torn WAL record, truncating segment");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Decodes one insert record. Returns None when the record is incomplete
    /// or implausible (truncated segment tail).
    fn read_insert_record(reader: &mut impl Read) -> Result<Option<Row>> {
        let Ok(metric_len) = read_uvarint_from(reader) else {
            return Ok(None);
        };
        if metric_len > MAX_WAL_METRIC_NAME_BYTES {
            return Ok(None);
        }

        let mut metric_buf = vec![0u8; metric_len as usize];
        if reader.read_exact(&mut metric_buf).is_err() {
            return Ok(None);
        }
        let (metric, labels) = unmarshal_metric_name(&metric_buf);

        let Ok(timestamp) = read_varint_from(reader) else {
            return Ok(None);
        };
        let Ok(value_bits) = read_uvarint_from(reader) else {
            return Ok(None);
        };

        Ok(Some(Row::from_parts(
            metric,
            labels,
            DataPoint::new(timestamp, f64::from_bits(value_bits)),
        )))
    }
}

/// Wraps a WAL error with the failing operation name.
pub(crate) fn wal_error(operation: &str, err: impl std::fmt::Display) -> TidemarkError {
    TidemarkError::Wal {
        operation: operation.to_string(),
        details: err.to_string(),
    }
}
