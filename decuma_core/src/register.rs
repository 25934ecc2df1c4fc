//! Append-only recovery log.
//!
//! Every durable state change — a series being created, renamed, moved, or
//! deleted, or a segment's on-disk shape changing — is appended here before
//! it is considered complete. `replay` reconstructs the last-known-good
//! state of the whole database by folding records in file order; later
//! records for the same id always win. `purge` rewrites the log from a
//! caller-supplied snapshot of live state, dropping superseded records.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const SERIES_MARKER: u8 = 1;
const SEGMENT_MARKER: u8 = 2;

const REGISTER_FILE_NAME: &str = "register.log";

#[derive(Debug, Serialize, Deserialize)]
struct SeriesPayload {
    serial: u64,
    path: String,
    /// `None` marks the series as deleted (a tombstone).
    fields: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentPayload {
    id: u64,
    start: Option<i64>,
    end: Option<i64>,
    size: u64,
}

/// A series' last-known state, as reconstructed by [`Register::replay`].
#[derive(Debug, Clone)]
pub struct SeriesEntry {
    pub serial: u64,
    /// `None` means the series was deleted.
    pub fields: Option<Vec<String>>,
}

/// A segment's last-known shape, as reconstructed by [`Register::replay`].
#[derive(Debug, Clone, Copy)]
pub struct SegmentEntry {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub size: usize,
}

/// Folded state of the whole register, keyed by path and by segment id.
#[derive(Debug, Default)]
pub struct ReplayState {
    pub series: HashMap<String, SeriesEntry>,
    pub segments: HashMap<u64, SegmentEntry>,
}

/// The append-only recovery log.
pub struct Register {
    file: File,
    path: PathBuf,
}

fn serialize_err(e: bincode::Error) -> StorageError {
    StorageError::InvariantViolation {
        what: format!("failed to encode register record: {e}"),
    }
}

fn deserialize_err(e: bincode::Error) -> StorageError {
    StorageError::InvariantViolation {
        what: format!("register record is corrupt: {e}"),
    }
}

impl Register {
    fn register_path(data_dir: &Path) -> PathBuf {
        data_dir.join(REGISTER_FILE_NAME)
    }

    /// Open (creating if absent) the register file for appending.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        let path = Self::register_path(data_dir);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StorageError::IoFailure {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Register { file, path })
    }

    fn append(&mut self, marker: u8, payload: &[u8]) -> StorageResult<()> {
        let io_err = |source: std::io::Error| StorageError::IoFailure {
            path: self.path.display().to_string(),
            source,
        };
        self.file.write_all(&[marker]).map_err(io_err)?;
        self.file
            .write_all(&(payload.len() as u64).to_be_bytes())
            .map_err(io_err)?;
        self.file.write_all(payload).map_err(io_err)?;
        self.file.flush().map_err(io_err)?;
        Ok(())
    }

    /// Record a series' current field list (create, rename, or move-target).
    pub fn record_series(
        &mut self,
        serial: u64,
        path: &str,
        fields: Option<&[String]>,
    ) -> StorageResult<()> {
        let payload = SeriesPayload {
            serial,
            path: path.to_string(),
            fields: fields.map(|f| f.to_vec()),
        };
        let bytes = bincode::serialize(&payload).map_err(serialize_err)?;
        self.append(SERIES_MARKER, &bytes)
    }

    /// Record that a series was deleted — a tombstone record replay treats
    /// as "this path no longer exists".
    pub fn record_series_deleted(&mut self, serial: u64, path: &str) -> StorageResult<()> {
        self.record_series(serial, path, None)
    }

    /// Record a segment's current `(start, end, size)`, including the
    /// zero-size shape written when a segment is deleted.
    pub fn record_segment(
        &mut self,
        id: u64,
        start: Option<i64>,
        end: Option<i64>,
        size: usize,
    ) -> StorageResult<()> {
        let payload = SegmentPayload {
            id,
            start,
            end,
            size: size as u64,
        };
        let bytes = bincode::serialize(&payload).map_err(serialize_err)?;
        self.append(SEGMENT_MARKER, &bytes)
    }

    /// Replay the register file into a folded [`ReplayState`]. Used once,
    /// at startup, by `Database::open`.
    pub fn replay(data_dir: &Path) -> StorageResult<ReplayState> {
        let path = Self::register_path(data_dir);
        let mut state = ReplayState::default();

        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
            Err(source) => {
                return Err(StorageError::IoFailure {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let mut reader = BufReader::new(file);
        let io_err = |source: std::io::Error| StorageError::IoFailure {
            path: path.display().to_string(),
            source,
        };

        loop {
            let mut marker = [0u8; 1];
            match reader.read_exact(&mut marker) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(source) => return Err(io_err(source)),
            }

            let mut len_buf = [0u8; 8];
            if reader.read_exact(&mut len_buf).is_err() {
                // Truncated trailing record (process died mid-append):
                // stop replay here rather than erroring out.
                break;
            }
            let len = u64::from_be_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }

            match marker[0] {
                SERIES_MARKER => {
                    let rec: SeriesPayload =
                        bincode::deserialize(&payload).map_err(deserialize_err)?;
                    state.series.insert(
                        rec.path,
                        SeriesEntry {
                            serial: rec.serial,
                            fields: rec.fields,
                        },
                    );
                }
                SEGMENT_MARKER => {
                    let rec: SegmentPayload =
                        bincode::deserialize(&payload).map_err(deserialize_err)?;
                    state.segments.insert(
                        rec.id,
                        SegmentEntry {
                            start: rec.start,
                            end: rec.end,
                            size: rec.size as usize,
                        },
                    );
                }
                other => {
                    return Err(StorageError::InvariantViolation {
                        what: format!("unknown register record marker {other}"),
                    })
                }
            }
        }

        debug!(
            series = state.series.len(),
            segments = state.segments.len(),
            "replayed register"
        );
        Ok(state)
    }

    /// Rewrite the register from scratch using the caller's live snapshot,
    /// dropping every superseded or tombstoned record.
    pub fn purge<'a>(
        &mut self,
        live_series: impl Iterator<Item = (u64, &'a str, &'a [String])>,
        live_segments: impl Iterator<Item = (u64, Option<i64>, Option<i64>, usize)>,
    ) -> StorageResult<()> {
        let io_err = |source: std::io::Error| StorageError::IoFailure {
            path: self.path.display().to_string(),
            source,
        };

        // Write the compacted log to a side file, then atomically replace.
        let tmp_path = self.path.with_extension("log.compact");
        let mut tmp = File::create(&tmp_path).map_err(io_err)?;

        let mut write = |marker: u8, payload: &[u8]| -> StorageResult<()> {
            tmp.write_all(&[marker]).map_err(io_err)?;
            tmp.write_all(&(payload.len() as u64).to_be_bytes())
                .map_err(io_err)?;
            tmp.write_all(payload).map_err(io_err)?;
            Ok(())
        };

        for (serial, path, fields) in live_series {
            let payload = SeriesPayload {
                serial,
                path: path.to_string(),
                fields: Some(fields.to_vec()),
            };
            let bytes = bincode::serialize(&payload).map_err(serialize_err)?;
            write(SERIES_MARKER, &bytes)?;
        }
        for (id, start, end, size) in live_segments {
            let payload = SegmentPayload {
                id,
                start,
                end,
                size: size as u64,
            };
            let bytes = bincode::serialize(&payload).map_err(serialize_err)?;
            write(SEGMENT_MARKER, &bytes)?;
        }
        tmp.flush().map_err(io_err)?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        debug!(path = %self.path.display(), "compacted register");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replay_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let state = Register::replay(dir.path()).unwrap();
        assert!(state.series.is_empty());
        assert!(state.segments.is_empty());
    }

    #[test]
    fn replay_folds_last_write_wins() {
        let dir = tempdir().unwrap();
        let mut reg = Register::open(dir.path()).unwrap();
        let fields = vec!["x".to_string()];
        reg.record_series(1, "/a", Some(&fields)).unwrap();
        reg.record_segment(100_000_001, Some(0), Some(10), 5)
            .unwrap();
        reg.record_segment(100_000_001, Some(0), Some(20), 8)
            .unwrap();

        let state = Register::replay(dir.path()).unwrap();
        let seg = state.segments.get(&100_000_001).unwrap();
        assert_eq!(seg.end, Some(20));
        assert_eq!(seg.size, 8);
        assert_eq!(state.series.get("/a").unwrap().serial, 1);
    }

    #[test]
    fn tombstone_clears_fields_on_replay() {
        let dir = tempdir().unwrap();
        let mut reg = Register::open(dir.path()).unwrap();
        let fields = vec!["x".to_string()];
        reg.record_series(1, "/a", Some(&fields)).unwrap();
        reg.record_series_deleted(1, "/a").unwrap();

        let state = Register::replay(dir.path()).unwrap();
        assert!(state.series.get("/a").unwrap().fields.is_none());
    }

    #[test]
    fn truncated_trailing_record_is_ignored() {
        let dir = tempdir().unwrap();
        {
            let mut reg = Register::open(dir.path()).unwrap();
            let fields = vec!["x".to_string()];
            reg.record_series(1, "/a", Some(&fields)).unwrap();
        }
        // Simulate a crash mid-append: a marker byte with a length header
        // but no payload.
        let path = dir.path().join(REGISTER_FILE_NAME);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[SEGMENT_MARKER]).unwrap();
        f.write_all(&100u64.to_be_bytes()).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();

        let state = Register::replay(dir.path()).unwrap();
        assert_eq!(state.series.len(), 1);
        assert!(state.segments.is_empty());
    }

    #[test]
    fn purge_rewrites_log_from_live_snapshot() {
        let dir = tempdir().unwrap();
        let mut reg = Register::open(dir.path()).unwrap();
        let fields = vec!["x".to_string()];
        reg.record_series(1, "/a", Some(&fields)).unwrap();
        reg.record_series_deleted(1, "/a").unwrap();
        reg.record_series(2, "/b", Some(&fields)).unwrap();

        reg.purge(
            std::iter::once((2u64, "/b", fields.as_slice())),
            std::iter::empty(),
        )
        .unwrap();

        let state = Register::replay(dir.path()).unwrap();
        assert!(!state.series.contains_key("/a"));
        assert!(state.series.get("/b").unwrap().fields.is_some());
    }
}
