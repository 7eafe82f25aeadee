//! Write-ahead log: on-disk framing, the asynchronous writer worker, and
//! replay on open.
//!
//! The log is a single append-only file; one file is the database. Layout
//! (all integers little-endian):
//!
//! ```text
//! file   := magic "ZRJWAL01" || u32 version || record*
//! record := u32 payload_len || u32 crc32(payload) || payload
//! payload:= u8 record_type || body
//! write  := type 1 || u32 metric_len || metric bytes
//!           || u32 labels_len || bincode(labels map)
//!           || u32 point_count
//!           || (i64 timestamp || u8 value_tag || 8-byte value)*
//! ```
//!
//! Value tags: 0 = f64 (raw IEEE-754 bits, so round-trip is exact),
//! 1 = i64, 2 = bool (low byte of the 8-byte slot). Unknown record types are
//! skipped on replay so new record kinds can be added without breaking old
//! readers. The length prefix makes records self-delimiting; the checksum
//! makes a partially flushed trailing record detectable.

use crate::error::DbError;
use crate::storage::ShardArray;
use crate::telemetry::{db_metrics, DbEvent, DbEventListener};
use crate::types::{LabelSet, Point, Value};
use crc32fast::Hasher as Crc32;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAL_MAGIC: &[u8; 8] = b"ZRJWAL01";
const WAL_VERSION: u32 = 1;

/// Bytes of magic + version before the first record.
pub(crate) const HEADER_LEN: u64 = 12;

/// Bytes of length prefix + checksum per record.
const FRAME_OVERHEAD: u64 = 8;

const REC_WRITE: u8 = 1;

const VALUE_TAG_F64: u8 = 0;
const VALUE_TAG_I64: u8 = 1;
const VALUE_TAG_BOOL: u8 = 2;

/// One durable unit: a single series' worth of points from one write call.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub metric: String,
    pub labels: LabelSet,
    pub points: Vec<Point>,
}

/// Serialises a write record into its payload form (unframed).
pub(crate) fn encode_record(
    metric: &str,
    labels: &LabelSet,
    points: &[Point],
) -> Result<Vec<u8>, DbError> {
    let labels_blob =
        bincode::serialize(labels).map_err(|e| DbError::Serialization(e.to_string()))?;

    let mut buf =
        Vec::with_capacity(1 + 4 + metric.len() + 4 + labels_blob.len() + 4 + points.len() * 17);
    buf.push(REC_WRITE);

    let metric_len = u32::try_from(metric.len())
        .map_err(|_| DbError::Serialization("metric name too large".to_string()))?;
    buf.extend_from_slice(&metric_len.to_le_bytes());
    buf.extend_from_slice(metric.as_bytes());

    let labels_len = u32::try_from(labels_blob.len())
        .map_err(|_| DbError::Serialization("labels blob too large".to_string()))?;
    buf.extend_from_slice(&labels_len.to_le_bytes());
    buf.extend_from_slice(&labels_blob);

    let count = u32::try_from(points.len())
        .map_err(|_| DbError::Serialization("too many points in record".to_string()))?;
    buf.extend_from_slice(&count.to_le_bytes());

    for p in points {
        buf.extend_from_slice(&p.timestamp.to_le_bytes());
        match p.value {
            Value::Float64(v) => {
                buf.push(VALUE_TAG_F64);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Int64(v) => {
                buf.push(VALUE_TAG_I64);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Bool(v) => {
                buf.push(VALUE_TAG_BOOL);
                let mut slot = [0u8; 8];
                slot[0] = v as u8;
                buf.extend_from_slice(&slot);
            }
        }
    }

    Ok(buf)
}

/// Parses a record payload. Returns `Ok(None)` for a record of an unknown
/// type, which replay counts and skips.
fn decode_record(payload: &[u8]) -> Result<Option<WalRecord>, String> {
    let mut cur = io::Cursor::new(payload);

    let mut tag = [0u8; 1];
    cur.read_exact(&mut tag).map_err(|e| e.to_string())?;
    if tag[0] != REC_WRITE {
        return Ok(None);
    }

    let mut b4 = [0u8; 4];
    cur.read_exact(&mut b4).map_err(|e| e.to_string())?;
    let metric_len = u32::from_le_bytes(b4) as usize;
    if metric_len > payload.len() {
        return Err(format!("metric length {} exceeds record", metric_len));
    }
    let mut metric_bytes = vec![0u8; metric_len];
    cur.read_exact(&mut metric_bytes).map_err(|e| e.to_string())?;
    let metric = String::from_utf8(metric_bytes).map_err(|e| e.to_string())?;

    cur.read_exact(&mut b4).map_err(|e| e.to_string())?;
    let labels_len = u32::from_le_bytes(b4) as usize;
    if labels_len > payload.len() {
        return Err(format!("labels length {} exceeds record", labels_len));
    }
    let mut labels_blob = vec![0u8; labels_len];
    cur.read_exact(&mut labels_blob).map_err(|e| e.to_string())?;
    let labels: LabelSet = bincode::deserialize(&labels_blob).map_err(|e| e.to_string())?;

    cur.read_exact(&mut b4).map_err(|e| e.to_string())?;
    let count = u32::from_le_bytes(b4) as usize;
    let remaining = payload.len() as u64 - cur.position();
    if count as u64 * 17 != remaining {
        return Err(format!(
            "point count {} does not match {} trailing bytes",
            count, remaining
        ));
    }

    let mut points = Vec::with_capacity(count);
    let mut b8 = [0u8; 8];
    for _ in 0..count {
        cur.read_exact(&mut b8).map_err(|e| e.to_string())?;
        let timestamp = i64::from_le_bytes(b8);

        cur.read_exact(&mut tag).map_err(|e| e.to_string())?;
        cur.read_exact(&mut b8).map_err(|e| e.to_string())?;
        let value = match tag[0] {
            VALUE_TAG_F64 => Value::Float64(f64::from_le_bytes(b8)),
            VALUE_TAG_I64 => Value::Int64(i64::from_le_bytes(b8)),
            VALUE_TAG_BOOL => Value::Bool(b8[0] != 0),
            other => return Err(format!("unknown value tag {}", other)),
        };
        points.push(Point { timestamp, value });
    }

    Ok(Some(WalRecord {
        metric,
        labels,
        points,
    }))
}

fn append_frame<W: Write>(out: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&crc.to_le_bytes())?;
    out.write_all(payload)
}

/// What replay found in the log.
#[derive(Debug)]
pub(crate) struct ReplaySummary {
    /// Write records applied to the shards.
    pub records: u64,
    /// Records of unknown type, counted and skipped.
    pub skipped: u64,
    /// Bytes of torn trailing data physically truncated away.
    pub dropped_bytes: u64,
}

/// Replays the log into the shard array and prepares the file for appending.
///
/// Invoked once by open, before the WAL worker starts. A fresh (or torn
/// shorter-than-header) file gets the header written. A truncated or
/// checksum-broken *trailing* record is trimmed: the file is shortened to the
/// last good offset so subsequent appends can never interleave with garbage.
/// Any malformed record before the trailing one fails the open.
pub(crate) fn prepare_log(file: &mut File, shards: &ShardArray) -> Result<ReplaySummary, DbError> {
    let file_len = file.metadata()?.len();

    if file_len < HEADER_LEN {
        // Nothing replayable: an empty file, or a header torn by a crash
        // during the very first open.
        let dropped_bytes = file_len;
        if dropped_bytes > 0 {
            file.set_len(0)?;
        }
        file.write_all(WAL_MAGIC)?;
        file.write_all(&WAL_VERSION.to_le_bytes())?;
        file.sync_data()?;
        return Ok(ReplaySummary {
            records: 0,
            skipped: 0,
            dropped_bytes,
        });
    }

    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != WAL_MAGIC {
        return Err(DbError::CorruptWal {
            offset: 0,
            details: "bad magic; not a zarija WAL file".to_string(),
        });
    }
    let mut b4 = [0u8; 4];
    reader.read_exact(&mut b4)?;
    let version = u32::from_le_bytes(b4);
    if version != WAL_VERSION {
        return Err(DbError::CorruptWal {
            offset: 8,
            details: format!("unsupported WAL version {}", version),
        });
    }

    let mut records = 0u64;
    let mut skipped = 0u64;
    let mut valid_len = HEADER_LEN;

    loop {
        let rec_start = valid_len;

        let mut len_bytes = [0u8; 4];
        if !read_full(&mut reader, &mut len_bytes)? {
            break;
        }
        let len = u32::from_le_bytes(len_bytes) as u64;

        let mut crc_bytes = [0u8; 4];
        if !read_full(&mut reader, &mut crc_bytes)? {
            break;
        }
        let expected_crc = u32::from_le_bytes(crc_bytes);

        // A length running past EOF means the payload never hit the disk in
        // full; that is the torn tail, not corruption.
        let rec_end = rec_start + FRAME_OVERHEAD + len;
        if rec_end > file_len {
            break;
        }

        let mut payload = vec![0u8; len as usize];
        if !read_full(&mut reader, &mut payload)? {
            break;
        }

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            if rec_end == file_len {
                // Trailing record with partially flushed data pages.
                break;
            }
            return Err(DbError::CorruptWal {
                offset: rec_start,
                details: "record checksum mismatch".to_string(),
            });
        }

        match decode_record(&payload) {
            Ok(Some(rec)) => {
                shards.insert(&rec.metric, &rec.labels, &rec.points)?;
                records += 1;
            }
            Ok(None) => skipped += 1,
            Err(details) => {
                // A malformed trailing record is treated as end-of-log like
                // any other torn tail; before the tail it is corruption.
                if rec_end == file_len {
                    break;
                }
                return Err(DbError::CorruptWal {
                    offset: rec_start,
                    details,
                });
            }
        }

        valid_len = rec_end;
    }

    drop(reader);

    let mut dropped_bytes = 0;
    if valid_len < file_len {
        dropped_bytes = file_len - valid_len;
        file.set_len(valid_len)?;
        file.sync_data()?;
    }

    Ok(ReplaySummary {
        records,
        skipped,
        dropped_bytes,
    })
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, DbError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(DbError::Io(e)),
    }
}

/// The dedicated WAL writer worker.
///
/// Owns the file handle and the user-space buffer exclusively; the bounded
/// channel is the only synchronisation boundary, so no lock guards the file.
/// Incoming payloads are framed into the buffer as they arrive; the buffer is
/// flushed and the file fsynced once per sync interval and once more on
/// shutdown, after the channel has drained.
pub(crate) struct WalWriter {
    rx: Receiver<Vec<u8>>,
    out: BufWriter<File>,
    sync_interval: Duration,
    events: Arc<dyn DbEventListener>,
}

impl WalWriter {
    pub(crate) fn new(
        file: File,
        buffer_bytes: usize,
        sync_interval: Duration,
        rx: Receiver<Vec<u8>>,
        events: Arc<dyn DbEventListener>,
    ) -> Self {
        WalWriter {
            rx,
            out: BufWriter::with_capacity(buffer_bytes, file),
            sync_interval,
            events,
        }
    }

    pub(crate) fn run(mut self) {
        self.events.on_event(DbEvent::WalWorkerStarted);

        let mut dirty = false;
        let mut last_sync = Instant::now();

        loop {
            let wait = self.sync_interval.saturating_sub(last_sync.elapsed());
            match self.rx.recv_timeout(wait) {
                Ok(payload) => {
                    dirty |= self.append(&payload);
                    if last_sync.elapsed() >= self.sync_interval {
                        self.sync(&mut dirty);
                        last_sync = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.sync(&mut dirty);
                    last_sync = Instant::now();
                }
                // All senders dropped and the queue is empty: shutdown.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.sync(&mut dirty);
        self.events.on_event(DbEvent::WalWorkerStopping);
    }

    fn append(&mut self, payload: &[u8]) -> bool {
        // BufWriter flushes to the OS by itself when the payload would
        // overflow the user-space buffer.
        match append_frame(&mut self.out, payload) {
            Ok(()) => {
                db_metrics::record_wal_bytes(payload.len() as u64 + FRAME_OVERHEAD);
                true
            }
            Err(e) => {
                self.events.on_event(DbEvent::WalAppendFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    fn sync(&mut self, dirty: &mut bool) {
        if !*dirty {
            return;
        }
        if let Err(e) = self.out.flush() {
            self.events.on_event(DbEvent::WalFlushFailed {
                error: e.to_string(),
            });
            return;
        }
        let started = Instant::now();
        match self.out.get_ref().sync_data() {
            Ok(()) => {
                db_metrics::record_wal_fsync(started.elapsed());
                *dirty = false;
            }
            Err(e) => self.events.on_event(DbEvent::WalFsyncFailed {
                error: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::series_id;
    use std::fs::OpenOptions;
    use std::path::Path;
    use tempfile::tempdir;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn open_log(path: &Path) -> File {
        OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .unwrap()
    }

    fn write_frames(path: &Path, payloads: &[Vec<u8>]) {
        let mut f = open_log(path);
        prepare_log(&mut f, &ShardArray::new()).unwrap(); // writes the header
        for p in payloads {
            append_frame(&mut f, p).unwrap();
        }
        f.sync_data().unwrap();
    }

    #[test]
    fn record_round_trip_preserves_all_value_tags() {
        let points = vec![
            Point::new(1, 0.5),
            Point::new(2, -7i64),
            Point::new(3, true),
            Point::new(4, false),
        ];
        let l = labels(&[("host", "a"), ("dc", "eu")]);
        let payload = encode_record("cpu", &l, &points).unwrap();

        let rec = decode_record(&payload).unwrap().unwrap();
        assert_eq!(rec.metric, "cpu");
        assert_eq!(rec.labels, l);
        assert_eq!(rec.points, points);
    }

    #[test]
    fn float_round_trip_is_bit_exact() {
        let values = [0.1 + 0.2, f64::MIN_POSITIVE, -0.0, 1e300, f64::MAX];
        let points: Vec<Point> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| Point::new(i as i64, v))
            .collect();
        let payload = encode_record("m", &LabelSet::new(), &points).unwrap();
        let rec = decode_record(&payload).unwrap().unwrap();
        for (got, want) in rec.points.iter().zip(values.iter()) {
            match got.value {
                Value::Float64(v) => assert_eq!(v.to_bits(), want.to_bits()),
                _ => panic!("expected Float64"),
            }
        }
    }

    #[test]
    fn fresh_file_gets_a_header_and_replays_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        let mut f = open_log(&path);
        let shards = ShardArray::new();
        let summary = prepare_log(&mut f, &shards).unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(summary.dropped_bytes, 0);
        assert_eq!(f.metadata().unwrap().len(), HEADER_LEN);

        // Second open of the same (still empty) log.
        let mut f = open_log(&path);
        let summary = prepare_log(&mut f, &shards).unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(shards.series_count(), 0);
    }

    #[test]
    fn replay_applies_write_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        let l = labels(&[("host", "a")]);
        write_frames(
            &path,
            &[
                encode_record("cpu", &l, &[Point::new(2, 0.7)]).unwrap(),
                encode_record("cpu", &l, &[Point::new(1, 0.5)]).unwrap(),
            ],
        );

        let shards = ShardArray::new();
        let mut f = open_log(&path);
        let summary = prepare_log(&mut f, &shards).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(shards.series_count(), 1);

        let id = series_id("cpu", &l);
        let guard = shards.shard_for(id).series.read().unwrap();
        let ts: Vec<i64> = guard[&id].points().iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![1, 2]);
    }

    #[test]
    fn unknown_record_types_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        write_frames(
            &path,
            &[
                vec![99, 1, 2, 3],
                encode_record("cpu", &LabelSet::new(), &[Point::new(1, 1.0)]).unwrap(),
            ],
        );

        let shards = ShardArray::new();
        let mut f = open_log(&path);
        let summary = prepare_log(&mut f, &shards).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.records, 1);
        assert_eq!(shards.series_count(), 1);
    }

    #[test]
    fn torn_trailing_record_is_trimmed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        write_frames(
            &path,
            &[encode_record("cpu", &LabelSet::new(), &[Point::new(1, 1.0)]).unwrap()],
        );
        let good_len = std::fs::metadata(&path).unwrap().len();

        // Append half a frame: a length that promises more bytes than exist.
        {
            let mut f = open_log(&path);
            f.write_all(&100u32.to_le_bytes()).unwrap();
            f.write_all(&0u32.to_le_bytes()).unwrap();
            f.write_all(&[0xAA; 10]).unwrap();
        }

        let shards = ShardArray::new();
        let mut f = open_log(&path);
        let summary = prepare_log(&mut f, &shards).unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.dropped_bytes, 18);
        assert_eq!(f.metadata().unwrap().len(), good_len);

        // The trim is physical: a subsequent open sees a clean log.
        let shards = ShardArray::new();
        let mut f = open_log(&path);
        let summary = prepare_log(&mut f, &shards).unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.dropped_bytes, 0);
    }

    #[test]
    fn trailing_checksum_mismatch_is_trimmed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        write_frames(
            &path,
            &[encode_record("cpu", &LabelSet::new(), &[Point::new(1, 1.0)]).unwrap()],
        );
        let good_len = std::fs::metadata(&path).unwrap().len();

        // A full-length record whose payload bytes never all hit the disk:
        // frame with a deliberately wrong checksum.
        {
            let payload = encode_record("cpu", &LabelSet::new(), &[Point::new(2, 2.0)]).unwrap();
            let mut f = open_log(&path);
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
        }

        let shards = ShardArray::new();
        let mut f = open_log(&path);
        let summary = prepare_log(&mut f, &shards).unwrap();
        assert_eq!(summary.records, 1);
        assert!(summary.dropped_bytes > 0);
        assert_eq!(f.metadata().unwrap().len(), good_len);
    }

    #[test]
    fn checksum_mismatch_before_the_tail_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        let bad = encode_record("cpu", &LabelSet::new(), &[Point::new(1, 1.0)]).unwrap();
        let good = encode_record("cpu", &LabelSet::new(), &[Point::new(2, 2.0)]).unwrap();
        {
            let mut f = open_log(&path);
            prepare_log(&mut f, &ShardArray::new()).unwrap();
            f.write_all(&(bad.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
            f.write_all(&bad).unwrap();
            append_frame(&mut f, &good).unwrap();
        }

        let mut f = open_log(&path);
        let err = prepare_log(&mut f, &ShardArray::new()).unwrap_err();
        assert!(matches!(
            err,
            DbError::CorruptWal {
                offset: HEADER_LEN,
                ..
            }
        ));
    }

    #[test]
    fn undecodable_trailing_record_is_trimmed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        // Type byte claims a write record but the body is garbage. As the
        // last record in the file it is treated as a torn tail.
        write_frames(&path, &[vec![REC_WRITE, 0xFF, 0xFF, 0xFF]]);

        let shards = ShardArray::new();
        let mut f = open_log(&path);
        let summary = prepare_log(&mut f, &shards).unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(summary.dropped_bytes, 12);
        assert_eq!(f.metadata().unwrap().len(), HEADER_LEN);
    }

    #[test]
    fn undecodable_record_before_the_tail_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        write_frames(
            &path,
            &[
                vec![REC_WRITE, 0xFF, 0xFF, 0xFF],
                encode_record("cpu", &LabelSet::new(), &[Point::new(1, 1.0)]).unwrap(),
            ],
        );

        let mut f = open_log(&path);
        let err = prepare_log(&mut f, &ShardArray::new()).unwrap_err();
        assert!(matches!(
            err,
            DbError::CorruptWal {
                offset: HEADER_LEN,
                ..
            }
        ));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        std::fs::write(&path, b"definitely not a wal file").unwrap();

        let mut f = open_log(&path);
        let err = prepare_log(&mut f, &ShardArray::new()).unwrap_err();
        assert!(matches!(err, DbError::CorruptWal { offset: 0, .. }));
    }
}
