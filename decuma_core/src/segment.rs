//! A contiguous, time-ordered run of records, persisted as one file.
//!
//! A segment is either fully resident (both `t_buf` and `x_buf` populated),
//! or evicted (buffers dropped, metadata only). `load_from_disk` /
//! `write_to_disk` are the only two operations that touch the filesystem;
//! everything else operates purely on the in-memory buffers and assumes
//! the caller already ensured residency.

use crate::error::{StorageError, StorageResult};
use crate::register::Register;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// A record timestamp. Spec treats this as an opaque comparable scalar;
/// we fix it to a 64-bit integer (nanoseconds, or any monotonic unit the
/// caller chooses).
pub type Timestamp = i64;

const MAGIC: u32 = 0x4445_4331; // "DEC1"

/// How [`Segment::get`] resolves a timestamp that isn't present exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum When {
    /// First record with timestamp >= t.
    After,
    /// Last record with timestamp <= t.
    Before,
    /// Record with timestamp == t, or not found.
    Exact,
}

/// How [`Segment::insert`] handles a timestamp that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conflict {
    /// Insert the new record immediately before the existing one.
    KeepBoth,
    /// Overwrite the existing record in place.
    Replace,
    /// Leave the segment unchanged.
    Skip,
}

/// A contiguous, time-ordered slice of a series.
#[derive(Debug)]
pub struct Segment {
    /// Unique id across the whole database. `id / 10^8` is the owning
    /// series' serial.
    pub id: u64,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub size: usize,
    field_count: usize,
    t_buf: Option<Vec<Timestamp>>,
    /// Row-major, `size * field_count` entries.
    x_buf: Option<Vec<f64>>,
    /// True iff `t_buf`/`x_buf` reflect the on-disk file.
    pub mem_synced: bool,
    /// True iff the on-disk file reflects the current in-memory state.
    pub disk_synced: bool,
    file_path: PathBuf,
}

/// Every segment of every series with serial `s` lives at `id = s * ID_SPACE + k`.
pub const ID_SPACE: u64 = 100_000_000;

impl Segment {
    fn file_path_for(data_dir: &Path, id: u64) -> PathBuf {
        data_dir.join(format!("{id}.seg"))
    }

    /// Construct a segment from on-disk metadata during recovery. Buffers
    /// are absent until [`Segment::load_from_disk`] is called.
    pub fn from_disk_metadata(
        id: u64,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
        size: usize,
        field_count: usize,
        data_dir: &Path,
    ) -> Self {
        Segment {
            id,
            start,
            end,
            size,
            field_count,
            t_buf: None,
            x_buf: None,
            mem_synced: false,
            disk_synced: true,
            file_path: Self::file_path_for(data_dir, id),
        }
    }

    /// Construct a new, not-yet-persisted segment from initial data.
    /// `t` must be sorted ascending; `x` must have `t.len() * field_count`
    /// entries, row-major.
    pub fn from_initial_data(
        id: u64,
        t: Vec<Timestamp>,
        x: Vec<f64>,
        field_count: usize,
        data_dir: &Path,
    ) -> Self {
        let start = t.first().copied();
        let end = t.last().copied();
        let size = t.len();
        Segment {
            id,
            start,
            end,
            size,
            field_count,
            t_buf: Some(t),
            x_buf: Some(x),
            mem_synced: true,
            disk_synced: false,
            file_path: Self::file_path_for(data_dir, id),
        }
    }

    /// Single-record convenience constructor.
    pub fn from_single(id: u64, t: Timestamp, x: Vec<f64>, data_dir: &Path) -> Self {
        let field_count = x.len();
        Self::from_initial_data(id, vec![t], x, field_count, data_dir)
    }

    /// Byte size of the resident buffers. Zero when evicted.
    pub fn memory_consumption(&self) -> usize {
        match (&self.t_buf, &self.x_buf) {
            (Some(t), Some(x)) => {
                t.len() * std::mem::size_of::<Timestamp>() + x.len() * std::mem::size_of::<f64>()
            }
            _ => 0,
        }
    }

    /// `true` iff this segment strictly precedes `other` in time: this
    /// segment's last record is no later than the other's first.
    pub fn precedes(&self, other: &Segment) -> bool {
        match (self.end, other.start) {
            (Some(e), Some(s)) => e <= s,
            _ => true,
        }
    }

    fn row(&self, i: usize, columns: Option<&[usize]>) -> Vec<f64> {
        let x = self.x_buf.as_ref().expect("segment must be resident");
        let base = i * self.field_count;
        match columns {
            None => x[base..base + self.field_count].to_vec(),
            Some(cols) => cols.iter().map(|&c| x[base + c]).collect(),
        }
    }

    /// Find and return a single record.
    pub fn get(
        &mut self,
        t: Timestamp,
        columns: Option<&[usize]>,
        when: When,
    ) -> StorageResult<(Timestamp, Vec<f64>)> {
        self.load_from_disk()?;
        let t_buf = self.t_buf.as_ref().expect("resident after load");
        let lower = t_buf.partition_point(|&x| x < t);

        let found = match when {
            When::After => {
                if lower == self.size {
                    return Err(StorageError::NotFound {
                        what: format!("no record at or after {t} in segment {}", self.id),
                    });
                }
                lower
            }
            When::Before => {
                let mut i = lower;
                if i == self.size || t_buf[i] != t {
                    if i == 0 {
                        return Err(StorageError::NotFound {
                            what: format!("no record at or before {t} in segment {}", self.id),
                        });
                    }
                    i -= 1;
                }
                i
            }
            When::Exact => {
                if lower == self.size || t_buf[lower] != t {
                    return Err(StorageError::NotFound {
                        what: format!("no record with exact timestamp {t} in segment {}", self.id),
                    });
                }
                lower
            }
        };

        Ok((t_buf[found], self.row(found, columns)))
    }

    /// Return all records with `start <= t <= end` (half-open on the
    /// underlying search, but inclusive on both bounds of the result).
    pub fn get_range(
        &mut self,
        start: Timestamp,
        end: Timestamp,
        columns: Option<&[usize]>,
    ) -> StorageResult<(Vec<Timestamp>, Vec<Vec<f64>>)> {
        self.load_from_disk()?;
        let t_buf = self.t_buf.as_ref().expect("resident after load");
        let i0 = t_buf.partition_point(|&x| x < start);
        let i1 = t_buf.partition_point(|&x| x <= end);
        let times = t_buf[i0..i1].to_vec();
        let rows = (i0..i1).map(|i| self.row(i, columns)).collect();
        Ok((times, rows))
    }

    /// Insert a record. Returns `true` iff `start` or `end` changed.
    pub fn insert(&mut self, t: Timestamp, x: Vec<f64>, conflict: Conflict) -> StorageResult<bool> {
        self.load_from_disk()?;
        debug_assert_eq!(x.len(), self.field_count);

        if self.size == 0 {
            self.t_buf = Some(vec![t]);
            self.x_buf = Some(x);
            self.start = Some(t);
            self.end = Some(t);
            self.size = 1;
            self.disk_synced = false;
            return Ok(true);
        }

        let start = self.start.expect("non-empty segment has a start");
        let end = self.end.expect("non-empty segment has an end");

        if t < start {
            self.t_buf.as_mut().unwrap().insert(0, t);
            splice_row(self.x_buf.as_mut().unwrap(), 0, &x, self.field_count);
            self.start = Some(t);
            self.size += 1;
            self.disk_synced = false;
            return Ok(true);
        }

        if t > end {
            let tb = self.t_buf.as_mut().unwrap();
            tb.push(t);
            self.x_buf.as_mut().unwrap().extend_from_slice(&x);
            self.end = Some(t);
            self.size += 1;
            self.disk_synced = false;
            return Ok(true);
        }

        let idx = self.t_buf.as_ref().unwrap().partition_point(|&v| v < t);
        let tb = self.t_buf.as_ref().unwrap();
        if tb[idx] != t {
            self.t_buf.as_mut().unwrap().insert(idx, t);
            splice_row(self.x_buf.as_mut().unwrap(), idx, &x, self.field_count);
            self.size += 1;
            self.disk_synced = false;
        } else {
            match conflict {
                Conflict::KeepBoth => {
                    self.t_buf.as_mut().unwrap().insert(idx, t);
                    splice_row(self.x_buf.as_mut().unwrap(), idx, &x, self.field_count);
                    self.size += 1;
                    self.disk_synced = false;
                }
                Conflict::Replace => {
                    let base = idx * self.field_count;
                    self.x_buf.as_mut().unwrap()[base..base + self.field_count]
                        .copy_from_slice(&x);
                    self.disk_synced = false;
                }
                Conflict::Skip => {}
            }
        }
        Ok(false)
    }

    /// Partition the segment into `new_ids.len()` contiguous, as-equal-as-
    /// possible pieces, then delete this segment.
    pub fn split(&mut self, new_ids: &[u64], data_dir: &Path) -> StorageResult<Vec<Segment>> {
        self.load_from_disk()?;
        let n = new_ids.len();
        let t_buf = self.t_buf.as_ref().expect("resident after load");
        let x_buf = self.x_buf.as_ref().expect("resident after load");

        let mut segments = Vec::with_capacity(n);
        for (k, &id) in new_ids.iter().enumerate() {
            let i0 = k * self.size / n;
            let i1 = (k + 1) * self.size / n;
            let t_slice = t_buf[i0..i1].to_vec();
            let x_slice = x_buf[i0 * self.field_count..i1 * self.field_count].to_vec();
            segments.push(Segment::from_initial_data(
                id,
                t_slice,
                x_slice,
                self.field_count,
                data_dir,
            ));
        }

        self.delete();
        Ok(segments)
    }

    /// Clear the segment's contents. The zero-size record is the deletion
    /// tombstone observed by the register on the next `write_to_disk`.
    pub fn delete(&mut self) {
        self.t_buf = Some(Vec::new());
        self.x_buf = Some(Vec::new());
        self.size = 0;
        self.start = None;
        self.end = None;
        self.mem_synced = true;
        self.disk_synced = false;
    }

    /// Flush in-memory state to disk and append a recovery record.
    /// No-op if already `disk_synced`.
    pub fn write_to_disk(&mut self, register: &mut Register) -> StorageResult<()> {
        if self.disk_synced {
            return Ok(());
        }

        if self.size > 0 {
            self.write_file()?;
        } else if self.file_path.exists() {
            fs::remove_file(&self.file_path).map_err(|source| StorageError::IoFailure {
                path: self.file_path.display().to_string(),
                source,
            })?;
        }

        register.record_segment(self.id, self.start, self.end, self.size)?;
        self.disk_synced = true;
        Ok(())
    }

    fn write_file(&self) -> StorageResult<()> {
        let t_buf = self.t_buf.as_ref().expect("resident segment has buffers");
        let x_buf = self.x_buf.as_ref().expect("resident segment has buffers");

        let io_err = |source: std::io::Error| StorageError::IoFailure {
            path: self.file_path.display().to_string(),
            source,
        };

        let mut f = fs::File::create(&self.file_path).map_err(io_err)?;
        f.write_all(&MAGIC.to_le_bytes()).map_err(io_err)?;
        f.write_all(&(self.field_count as u32).to_le_bytes())
            .map_err(io_err)?;
        f.write_all(&(t_buf.len() as u64).to_le_bytes())
            .map_err(io_err)?;
        for t in t_buf {
            f.write_all(&t.to_le_bytes()).map_err(io_err)?;
        }
        for x in x_buf {
            f.write_all(&x.to_le_bytes()).map_err(io_err)?;
        }
        Ok(())
    }

    /// Load buffers from disk if not already resident, then refresh
    /// `start`/`end`/`size` from what was read.
    pub fn load_from_disk(&mut self) -> StorageResult<()> {
        if self.mem_synced {
            return Ok(());
        }

        let io_err = |source: std::io::Error| StorageError::IoFailure {
            path: self.file_path.display().to_string(),
            source,
        };
        let invariant = |what: String| StorageError::InvariantViolation { what };

        let mut f = fs::File::open(&self.file_path).map_err(io_err)?;
        let mut magic_buf = [0u8; 4];
        f.read_exact(&mut magic_buf).map_err(io_err)?;
        if u32::from_le_bytes(magic_buf) != MAGIC {
            return Err(invariant(format!(
                "segment file {} has bad magic",
                self.file_path.display()
            )));
        }

        let mut u32_buf = [0u8; 4];
        f.read_exact(&mut u32_buf).map_err(io_err)?;
        let field_count = u32::from_le_bytes(u32_buf) as usize;

        let mut u64_buf = [0u8; 8];
        f.read_exact(&mut u64_buf).map_err(io_err)?;
        let record_count = u64::from_le_bytes(u64_buf) as usize;

        let mut t_buf = Vec::with_capacity(record_count);
        for _ in 0..record_count {
            let mut buf = [0u8; 8];
            f.read_exact(&mut buf).map_err(io_err)?;
            t_buf.push(i64::from_le_bytes(buf));
        }

        let mut x_buf = Vec::with_capacity(record_count * field_count);
        for _ in 0..record_count * field_count {
            let mut buf = [0u8; 8];
            f.read_exact(&mut buf).map_err(io_err)?;
            x_buf.push(f64::from_le_bytes(buf));
        }

        self.start = t_buf.first().copied();
        self.end = t_buf.last().copied();
        self.size = t_buf.len();
        self.field_count = field_count;
        self.t_buf = Some(t_buf);
        self.x_buf = Some(x_buf);
        self.mem_synced = true;
        self.disk_synced = true;
        Ok(())
    }

    /// Drop resident buffers, as performed by the memory manager on
    /// eviction. Caller must have already committed any dirty state.
    pub fn release_buffers(&mut self) {
        self.t_buf = None;
        self.x_buf = None;
        self.mem_synced = false;
        self.disk_synced = true;
    }
}

fn splice_row(x_buf: &mut Vec<f64>, row_index: usize, row: &[f64], field_count: usize) {
    let at = row_index * field_count;
    x_buf.splice(at..at, row.iter().copied());
}
