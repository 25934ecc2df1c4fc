//! An ordered, non-overlapping collection of segments backing one named
//! time series.

use crate::error::{StorageError, StorageResult};
use crate::segment::{Conflict, Segment, Timestamp, When, ID_SPACE};
use std::path::{Path, PathBuf};

/// Segment ids touched by a [`Series::insert`], for the caller to register
/// with the memory manager.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Ids that now hold dirty, resident data.
    pub touched: Vec<u64>,
    /// Ids created by this insert (either the series' first segment, or
    /// the pieces of a split). Empty unless a segment was created.
    pub created: Vec<u64>,
    /// Whether the series' overall `start` or `end` changed.
    pub changed: bool,
}

pub struct Series {
    pub serial: u64,
    pub path: String,
    fields: Vec<String>,
    segments: Vec<Segment>,
    next_local_id: u64,
    n_splits: usize,
    data_dir: PathBuf,
}

impl Series {
    /// Create a brand-new, empty series.
    pub fn new(serial: u64, path: String, fields: Vec<String>, data_dir: &Path, n_splits: usize) -> Self {
        Series {
            serial,
            path,
            fields,
            segments: Vec::new(),
            next_local_id: 1,
            n_splits,
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Reconstruct a series from recovered segment metadata. `segments`
    /// must already be sorted by start time.
    pub fn from_recovery(
        serial: u64,
        path: String,
        fields: Vec<String>,
        segments: Vec<Segment>,
        data_dir: &Path,
        n_splits: usize,
    ) -> Self {
        let next_local_id = segments
            .iter()
            .map(|s| s.id - serial * ID_SPACE)
            .max()
            .map(|m| m + 1)
            .unwrap_or(1);
        Series {
            serial,
            path,
            fields,
            segments,
            next_local_id,
            n_splits,
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn rename_fields(&mut self, new_fields: Vec<String>) -> StorageResult<()> {
        if new_fields.len() != self.fields.len() {
            return Err(StorageError::InvalidArgument {
                what: format!(
                    "cannot rename {} fields to {} names",
                    self.fields.len(),
                    new_fields.len()
                ),
            });
        }
        self.fields = new_fields;
        Ok(())
    }

    pub fn start(&self) -> Option<Timestamp> {
        self.segments.first().and_then(|s| s.start)
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.segments.last().and_then(|s| s.end)
    }

    pub fn segment_ids(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.id).collect()
    }

    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    /// Replace the segment list wholesale, used by defragmentation.
    pub fn replace_segments(&mut self, segments: Vec<Segment>) {
        self.segments = segments;
    }

    /// `(id, start, end, size)` for every segment, for register compaction.
    pub fn segment_shapes(&self) -> Vec<(u64, Option<Timestamp>, Option<Timestamp>, usize)> {
        self.segments
            .iter()
            .map(|s| (s.id, s.start, s.end, s.size))
            .collect()
    }

    pub fn segment_memory_consumption(&self, id: u64) -> Option<usize> {
        self.segments.iter().find(|s| s.id == id).map(|s| s.memory_consumption())
    }

    pub fn memory_consumption(&self) -> usize {
        self.segments.iter().map(|s| s.memory_consumption()).sum()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.serial * ID_SPACE + self.next_local_id;
        self.next_local_id += 1;
        id
    }

    /// Mint a fresh segment id without creating a segment, for callers
    /// (like defragmentation) that build the `Segment` themselves.
    pub fn allocate_id(&mut self) -> u64 {
        self.next_id()
    }

    /// Index of the last segment whose `start <= t`, or `None` if `t`
    /// precedes every segment (or there are no segments).
    fn candidate_index(&self, t: Timestamp) -> Option<usize> {
        if self.segments.is_empty() {
            return None;
        }
        let idx = self
            .segments
            .partition_point(|s| s.start.map(|st| st <= t).unwrap_or(true));
        idx.checked_sub(1)
    }

    fn field_columns(&self, names: Option<&[String]>) -> StorageResult<Option<Vec<usize>>> {
        match names {
            None => Ok(None),
            Some(names) => {
                let mut cols = Vec::with_capacity(names.len());
                for name in names {
                    let idx = self.fields.iter().position(|f| f == name).ok_or_else(|| {
                        StorageError::NotFound {
                            what: format!("field {name} not found in series {}", self.path),
                        }
                    })?;
                    cols.push(idx);
                }
                Ok(Some(cols))
            }
        }
    }

    pub fn get(
        &mut self,
        t: Timestamp,
        columns: Option<&[String]>,
        when: When,
    ) -> StorageResult<(Timestamp, Vec<f64>)> {
        let cols = self.field_columns(columns)?;
        let cols = cols.as_deref();
        let not_found = || StorageError::NotFound {
            what: format!("no matching record in series {}", self.path),
        };

        match when {
            When::Exact => {
                let idx = self.candidate_index(t).ok_or_else(not_found)?;
                self.segments[idx].get(t, cols, When::Exact)
            }
            When::After => {
                let start_idx = self.candidate_index(t).unwrap_or(0);
                for idx in start_idx..self.segments.len() {
                    match self.segments[idx].get(t, cols, When::After) {
                        Ok(v) => return Ok(v),
                        Err(StorageError::NotFound { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(not_found())
            }
            When::Before => {
                let start_idx = match self.candidate_index(t) {
                    Some(i) => i,
                    None => return Err(not_found()),
                };
                for idx in (0..=start_idx).rev() {
                    match self.segments[idx].get(t, cols, When::Before) {
                        Ok(v) => return Ok(v),
                        Err(StorageError::NotFound { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(not_found())
            }
        }
    }

    pub fn get_range(
        &mut self,
        start: Timestamp,
        end: Timestamp,
        columns: Option<&[String]>,
    ) -> StorageResult<(Vec<Timestamp>, Vec<Vec<f64>>)> {
        let cols = self.field_columns(columns)?;
        let cols = cols.as_deref();
        let mut times = Vec::new();
        let mut rows = Vec::new();
        for seg in self.segments.iter_mut() {
            let overlaps = match (seg.start, seg.end) {
                (Some(s), Some(e)) => s <= end && e >= start,
                _ => false,
            };
            if !overlaps {
                continue;
            }
            let (t, x) = seg.get_range(start, end, cols)?;
            times.extend(t);
            rows.extend(x);
        }
        Ok((times, rows))
    }

    pub fn get_all(
        &mut self,
        columns: Option<&[String]>,
    ) -> StorageResult<(Vec<Timestamp>, Vec<Vec<f64>>)> {
        match (self.start(), self.end()) {
            (Some(s), Some(e)) => self.get_range(s, e, columns),
            _ => Ok((Vec::new(), Vec::new())),
        }
    }

    /// Insert a record, splitting the target segment if it grows past
    /// `max_segment_size`. Returns the ids the caller must register with
    /// the memory manager.
    pub fn insert(
        &mut self,
        t: Timestamp,
        x: Vec<f64>,
        conflict: Conflict,
        max_segment_size: usize,
    ) -> StorageResult<InsertOutcome> {
        if x.len() != self.fields.len() {
            return Err(StorageError::InvalidArgument {
                what: format!("expected {} fields, got {}", self.fields.len(), x.len()),
            });
        }

        if self.segments.is_empty() {
            let id = self.next_id();
            self.segments.push(Segment::from_single(id, t, x, &self.data_dir));
            return Ok(InsertOutcome {
                touched: vec![id],
                created: vec![id],
                changed: true,
            });
        }

        let idx = self.candidate_index(t).unwrap_or(0);
        let changed = self.segments[idx].insert(t, x, conflict)?;
        let touched_id = self.segments[idx].id;
        let mut outcome = InsertOutcome {
            touched: vec![touched_id],
            created: Vec::new(),
            changed,
        };

        if self.segments[idx].memory_consumption() > max_segment_size {
            let new_ids: Vec<u64> = (0..self.n_splits).map(|_| self.next_id()).collect();
            let pieces = self.segments[idx].split(&new_ids, &self.data_dir)?;
            self.segments.splice(idx..idx + 1, pieces);
            outcome.created = new_ids.clone();
            outcome.touched = new_ids;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn series(dir: &Path) -> Series {
        Series::new(1, "/a".to_string(), vec!["v".to_string()], dir, 2)
    }

    #[test]
    fn first_insert_creates_a_segment() {
        let dir = tempdir().unwrap();
        let mut s = series(dir.path());
        let outcome = s.insert(100, vec![1.0], Conflict::KeepBoth, 1000).unwrap();
        assert_eq!(outcome.created.len(), 1);
        assert_eq!(s.start(), Some(100));
        assert_eq!(s.end(), Some(100));
    }

    #[test]
    fn overflow_triggers_split_into_n_splits_pieces() {
        let dir = tempdir().unwrap();
        let mut s = series(dir.path());
        // one field costs 16 bytes/record (8-byte timestamp + 8-byte
        // value); a 40-byte ceiling splits once a segment holds 3 records.
        for t in 0..5 {
            s.insert(t, vec![t as f64], Conflict::KeepBoth, 40).unwrap();
        }
        assert!(s.segment_ids().len() > 1);
        let (times, _) = s.get_all(None).unwrap();
        assert_eq!(times, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn get_range_spans_multiple_segments() {
        let dir = tempdir().unwrap();
        let mut s = series(dir.path());
        for t in [0, 10, 20, 30, 40] {
            s.insert(t, vec![t as f64], Conflict::KeepBoth, 2).unwrap();
        }
        let (times, rows) = s.get_range(10, 30, None).unwrap();
        assert_eq!(times, vec![10, 20, 30]);
        assert_eq!(rows, vec![vec![10.0], vec![20.0], vec![30.0]]);
    }

    #[test]
    fn field_projection_by_name() {
        let dir = tempdir().unwrap();
        let mut s = Series::new(
            1,
            "/a".to_string(),
            vec!["x".to_string(), "y".to_string()],
            dir.path(),
            2,
        );
        s.insert(0, vec![1.0, 2.0], Conflict::KeepBoth, 1000).unwrap();
        let (_, row) = s.get(0, Some(&["y".to_string()]), When::Exact).unwrap();
        assert_eq!(row, vec![2.0]);
    }

    #[test]
    fn rename_fields_rejects_length_mismatch() {
        let dir = tempdir().unwrap();
        let mut s = series(dir.path());
        assert!(s
            .rename_fields(vec!["a".to_string(), "b".to_string()])
            .is_err());
        assert!(s.rename_fields(vec!["renamed".to_string()]).is_ok());
        assert_eq!(s.fields(), &["renamed".to_string()]);
    }
}
