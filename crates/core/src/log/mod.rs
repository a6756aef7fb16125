//! Append-only session log: one JSON record per processed frame.
//!
//! ```text
//! {"timestamp_ms": 1200, "angles": {"left_elbow": 92.5, "right_elbow": null}}
//! ```
//!
//! External tools read the file line by line and discover joint names from
//! the keys, so the record carries nothing beyond these two fields.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::snapshot::SessionSnapshot;
use crate::{RepCounterError, Result};

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_ms: u64,
    pub angles: BTreeMap<String, Option<f32>>,
}

impl From<&SessionSnapshot> for LogRecord {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            timestamp_ms: snapshot.frame_timestamp_ms,
            angles: snapshot.angles.clone(),
        }
    }
}

/// Destination for per-frame log records. Implementations must not block for
/// long; callers drop failed records rather than retrying.
pub trait LogSink: Send {
    fn append(&mut self, snapshot: &SessionSnapshot) -> Result<()>;
}

/// Writes [`LogRecord`]s as newline-delimited JSON to any writer.
///
/// Each record goes out as one `write_all` of the complete line followed by a
/// flush. `W` must not hold bytes back across calls: a failed record is
/// dropped, and a buffering writer would deliver it later with the next one.
#[derive(Debug)]
pub struct SessionLogWriter<W: Write> {
    writer: W,
    written: u64,
}

impl SessionLogWriter<File> {
    /// Opens `path` for appending, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::new(file))
    }
}

impl<W: Write> SessionLogWriter<W> {
    /// Creates a writer that appends records to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Records successfully written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Consumes the writer and returns the underlying destination.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|_| self.writer.flush())
            .map_err(|err| RepCounterError::LogWrite(err.to_string()))?;
        self.written += 1;
        Ok(())
    }
}

impl<W: Write + Send> LogSink for SessionLogWriter<W> {
    fn append(&mut self, snapshot: &SessionSnapshot) -> Result<()> {
        self.write_record(&LogRecord::from(snapshot))
    }
}

/// Sink used when logging is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn append(&mut self, _snapshot: &SessionSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Reads every record from a session log. Blank lines are skipped; a
/// malformed line is an error naming its line number.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<LogRecord>> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str(trimmed).map_err(|err| {
            RepCounterError::msg(format!("session log line {}: {err}", index + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    use crate::detector::Phase;

    fn snapshot(ts: u64, left: Option<f32>, right: Option<f32>) -> SessionSnapshot {
        SessionSnapshot {
            workout_id: "pushup".to_string(),
            rep_count: 0,
            per_joint_phase: BTreeMap::from([
                ("left_elbow".to_string(), Phase::Neutral),
                ("right_elbow".to_string(), Phase::Neutral),
            ]),
            feedback_text: "hello".to_string(),
            angles: BTreeMap::from([
                ("left_elbow".to_string(), left),
                ("right_elbow".to_string(), right),
            ]),
            frame_timestamp_ms: ts,
            person_detected: left.is_some() || right.is_some(),
            last_rep: None,
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "destination gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_one_line_per_frame_with_nulls() {
        let mut writer = SessionLogWriter::new(Vec::new());
        writer.append(&snapshot(0, Some(92.5), None)).unwrap();
        writer.append(&snapshot(33, None, None)).unwrap();

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"timestamp_ms":0,"angles":{"left_elbow":92.5,"right_elbow":null}}"#
        );
    }

    #[test]
    fn records_read_back_with_same_keys_and_values() {
        let frames = [
            snapshot(0, Some(171.25), Some(168.0)),
            snapshot(200, Some(88.0), None),
            snapshot(400, None, None),
        ];
        let mut writer = SessionLogWriter::new(Vec::new());
        for frame in &frames {
            writer.append(frame).unwrap();
        }
        assert_eq!(writer.written(), 3);

        let records = read_records(Cursor::new(writer.into_inner())).unwrap();
        assert_eq!(records.len(), frames.len());
        for (record, frame) in records.iter().zip(&frames) {
            assert_eq!(record.timestamp_ms, frame.frame_timestamp_ms);
            assert_eq!(record.angles, frame.angles);
        }
    }

    #[test]
    fn failed_write_is_reported_not_counted() {
        let mut writer = SessionLogWriter::new(BrokenPipe);
        let err = writer.append(&snapshot(0, None, None)).unwrap_err();

        assert!(matches!(err, RepCounterError::LogWrite(_)));
        assert_eq!(writer.written(), 0);
    }

    /// Rejects the first write outright, then accepts everything.
    #[derive(Default)]
    struct FailsOnce {
        failed: bool,
        written: Vec<u8>,
    }

    impl Write for FailsOnce {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.failed {
                self.failed = true;
                return Err(io::Error::new(io::ErrorKind::Other, "disk busy"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_record_is_dropped_not_delivered_later() {
        let mut writer = SessionLogWriter::new(FailsOnce::default());

        let err = writer.append(&snapshot(0, Some(92.5), None)).unwrap_err();
        assert!(matches!(err, RepCounterError::LogWrite(_)));
        writer.append(&snapshot(33, Some(95.0), None)).unwrap();
        assert_eq!(writer.written(), 1);

        let records = read_records(Cursor::new(writer.into_inner().written)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ms, 33);
    }

    #[test]
    fn opened_file_holds_only_successful_records() {
        let path = std::env::temp_dir().join(format!(
            "rep-counter-log-{}-{:?}.jsonl",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);

        let mut writer = SessionLogWriter::open(&path).unwrap();
        writer.append(&snapshot(0, Some(92.5), None)).unwrap();
        writer.append(&snapshot(33, None, None)).unwrap();
        drop(writer);

        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn reading_reports_bad_line_number() {
        let input = "{\"timestamp_ms\":0,\"angles\":{}}\n\n{oops}\n";
        let err = read_records(Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }
}
