//! WAL segment files
//!
//! Layout: a fixed header (magic, schema version, topic), then length- and
//! CRC-framed bincode rows. Segments are written as `.tmp` and renamed to
//! `.wal` on close; the rename is the atomicity boundary that makes a
//! segment eligible for loading.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use common::events::{RecordEvent, Topic};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

const MAGIC: &[u8; 4] = b"VSWL";
const SCHEMA_VERSION: u16 = 1;

/// Segment failure
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Filesystem error
    #[error("segment io: {0}")]
    Io(#[from] std::io::Error),
    /// Row encoding error
    #[error("segment encoding: {0}")]
    Encode(#[from] bincode::Error),
    /// File is not a segment or carries an unknown schema
    #[error("bad segment header in {0}")]
    BadHeader(PathBuf),
}

/// Append side of one segment
pub struct SegmentWriter {
    file: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    rows_written: u64,
    opened_at: Instant,
}

impl SegmentWriter {
    /// Create a new segment as `<final_path>.tmp`
    pub fn create(final_path: &Path, topic: Topic) -> Result<Self, SegmentError> {
        let tmp_path = final_path.with_extension("tmp");
        let mut file = BufWriter::new(
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp_path)?,
        );

        file.write_all(MAGIC)?;
        file.write_u16::<LittleEndian>(SCHEMA_VERSION)?;
        let topic_bytes = topic.as_str().as_bytes();
        file.write_u8(topic_bytes.len() as u8)?;
        file.write_all(topic_bytes)?;

        Ok(Self {
            file,
            tmp_path,
            final_path: final_path.to_path_buf(),
            bytes_written: 0,
            rows_written: 0,
            opened_at: Instant::now(),
        })
    }

    /// Append one row; durable only after [`SegmentWriter::sync`]
    pub fn append(&mut self, row: &RecordEvent) -> Result<(), SegmentError> {
        let payload = bincode::serialize(row)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);

        self.file.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.file.write_u32::<LittleEndian>(hasher.finalize())?;
        self.file.write_all(&payload)?;
        self.bytes_written += 8 + payload.len() as u64;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush and fsync; the durability barrier a batch ack waits on
    pub fn sync(&mut self) -> Result<(), SegmentError> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Bytes appended so far (excluding header)
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.bytes_written
    }

    /// Rows appended so far
    #[must_use]
    pub const fn rows(&self) -> u64 {
        self.rows_written
    }

    /// Seconds since the segment was opened
    #[must_use]
    pub fn age_ms(&self) -> u64 {
        self.opened_at.elapsed().as_millis() as u64
    }

    /// Sync and rename to the final `.wal` name, publishing the segment
    pub fn close(mut self) -> Result<PathBuf, SegmentError> {
        self.sync()?;
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(self.final_path)
    }
}

/// Read side of one closed segment
pub struct SegmentReader {
    file: BufReader<File>,
    path: PathBuf,
    /// Topic recorded in the header
    pub topic: String,
}

impl SegmentReader {
    /// Open a closed segment and validate its header
    pub fn open(path: &Path) -> Result<Self, SegmentError> {
        let mut file = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        let version = file.read_u16::<LittleEndian>()?;
        if &magic != MAGIC || version != SCHEMA_VERSION {
            return Err(SegmentError::BadHeader(path.to_path_buf()));
        }
        let topic_len = file.read_u8()? as usize;
        let mut topic = vec![0u8; topic_len];
        file.read_exact(&mut topic)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            topic: String::from_utf8_lossy(&topic).into_owned(),
        })
    }

    /// Next row; None at end of file or at a torn/corrupt tail
    pub fn read_next(&mut self) -> Option<RecordEvent> {
        let len = self.file.read_u32::<LittleEndian>().ok()?;
        let crc = self.file.read_u32::<LittleEndian>().ok()?;
        let mut payload = vec![0u8; len as usize];
        if self.file.read_exact(&mut payload).is_err() {
            warn!(path = %self.path.display(), "torn record at segment tail");
            return None;
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            metrics::counter!("wal_crc_errors_total").increment(1);
            warn!(path = %self.path.display(), "crc mismatch, stopping read");
            return None;
        }
        match bincode::deserialize(&payload) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "undecodable row");
                None
            }
        }
    }

    /// Drain the remaining rows
    pub fn read_all(&mut self) -> Vec<RecordEvent> {
        let mut rows = Vec::new();
        while let Some(row) = self.read_next() {
            rows.push(row);
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::{LatencySpanRow, TradeRow};
    use common::{Side, StrategyId, Symbol, Ts};

    fn trade_row(fill_id: u64) -> RecordEvent {
        RecordEvent::Trade(TradeRow {
            fill_id,
            order_id: 1,
            strategy: StrategyId::new(1),
            symbol: Symbol::new(1),
            side: Side::Buy,
            price: 1_000_000,
            qty: 1,
            fee: 0,
            match_ts: Ts::from_nanos(fill_id as i64),
        })
    }

    #[test]
    fn test_write_close_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trades-0000000000001-000001.wal");

        let mut writer = SegmentWriter::create(&path, Topic::Trades).unwrap();
        for i in 0..10 {
            writer.append(&trade_row(i)).unwrap();
        }
        assert_eq!(writer.rows(), 10);
        let published = writer.close().unwrap();
        assert_eq!(published, path);

        let mut reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.topic, "trades");
        let rows = reader.read_all();
        assert_eq!(rows.len(), 10);
        assert!(matches!(&rows[3], RecordEvent::Trade(t) if t.fill_id == 3));
    }

    #[test]
    fn test_unclosed_segment_stays_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trades-0000000000001-000001.wal");

        let mut writer = SegmentWriter::create(&path, Topic::Trades).unwrap();
        writer.append(&trade_row(1)).unwrap();
        writer.sync().unwrap();
        drop(writer);

        assert!(!path.exists());
        assert!(path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_tail_stops_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("spans-0000000000001-000001.wal");

        let mut writer = SegmentWriter::create(&path, Topic::LatencySpans).unwrap();
        writer
            .append(&RecordEvent::Latency(LatencySpanRow {
                ts: Ts::from_nanos(1),
                stage: "gateway".to_string(),
                nanos: 100,
            }))
            .unwrap();
        let path = writer.close().unwrap();

        // Append garbage past the valid record
        use std::io::Write;
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xde, 0xad, 0xbe]).unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.read_all().len(), 1);
    }

    #[test]
    fn test_bad_header_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("junk.wal");
        std::fs::write(&path, b"not a segment at all").unwrap();
        assert!(matches!(
            SegmentReader::open(&path),
            Err(SegmentError::BadHeader(_))
        ));
    }
}
