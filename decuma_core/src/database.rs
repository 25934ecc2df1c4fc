//! Top-level handle: owns every series, the shared memory manager, and the
//! recovery register for one data directory.

use crate::config::EngineConfig;
use crate::error::{StorageError, StorageResult};
use crate::memory::{MemoryManager, SegmentStore};
use crate::register::Register;
use crate::segment::{Conflict, Segment, Timestamp, When, ID_SPACE};
use crate::series::Series;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// A leaf entry of [`Database::toc`]'s hierarchy — one series' snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub path: String,
    pub fields: Vec<String>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub segment_count: usize,
}

/// A node of the directory view [`Database::toc`] builds: a folder keyed by
/// path component, holding either child folders, a series (if this path is
/// itself a series), or both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TocNode {
    pub children: HashMap<String, TocNode>,
    pub series: Option<SeriesInfo>,
}

fn path_components(path: &str) -> Vec<String> {
    path.split('/').filter(|c| !c.is_empty()).map(str::to_string).collect()
}

fn insert_toc_entry(node: &mut TocNode, remaining: &[String], info: SeriesInfo) {
    match remaining.split_first() {
        None => node.series = Some(info),
        Some((head, rest)) => {
            insert_toc_entry(node.children.entry(head.clone()).or_default(), rest, info);
        }
    }
}

pub struct Database {
    data_dir: PathBuf,
    max_segment_size: usize,
    n_splits: usize,
    series: HashMap<String, Series>,
    /// serial -> path, so a bare segment id (which encodes its serial) can
    /// find its owning series without scanning the whole map.
    serial_index: HashMap<u64, String>,
    next_serial: u64,
    memory: MemoryManager,
    register: Register,
}

impl Database {
    /// Open a data directory, replaying its register to recover series and
    /// segment metadata.
    pub fn open(config: &EngineConfig) -> StorageResult<Self> {
        config.ensure_data_dir()?;
        let register = Register::open(&config.data_dir)?;
        let replay = Register::replay(&config.data_dir)?;

        let mut series: HashMap<String, Series> = HashMap::new();
        let mut serial_index = HashMap::new();
        let mut next_serial = 1;

        for (path, entry) in replay.series.iter() {
            next_serial = next_serial.max(entry.serial + 1);
            let Some(fields) = entry.fields.clone() else {
                continue; // tombstoned: series was deleted
            };

            let mut segments: Vec<Segment> = replay
                .segments
                .iter()
                .filter(|(id, _)| **id / ID_SPACE == entry.serial)
                .filter(|(_, seg)| seg.size > 0)
                .map(|(&id, seg)| {
                    Segment::from_disk_metadata(
                        id,
                        seg.start,
                        seg.end,
                        seg.size,
                        fields.len(),
                        &config.data_dir,
                    )
                })
                .collect();
            segments.sort_by_key(|s| s.start);

            series.insert(
                path.clone(),
                Series::from_recovery(
                    entry.serial,
                    path.clone(),
                    fields,
                    segments,
                    &config.data_dir,
                    config.n_splits,
                ),
            );
            serial_index.insert(entry.serial, path.clone());
        }

        info!(
            data_dir = %config.data_dir.display(),
            series = series.len(),
            "recovered database from register"
        );

        Ok(Database {
            data_dir: config.data_dir.clone(),
            max_segment_size: config.max_segment_size,
            n_splits: config.n_splits,
            series,
            serial_index,
            next_serial,
            memory: MemoryManager::new(config.max_segments_in_memory),
            register,
        })
    }

    /// Run `f` with the memory manager detached from `self`, so `self` can
    /// still be passed in as the `&mut dyn SegmentStore` it implements.
    fn with_memory<R>(&mut self, f: impl FnOnce(&mut MemoryManager, &mut Database) -> R) -> R {
        let mut memory = std::mem::replace(&mut self.memory, MemoryManager::new(1));
        let result = f(&mut memory, self);
        self.memory = memory;
        result
    }

    fn series_mut(&mut self, path: &str) -> StorageResult<&mut Series> {
        self.series.get_mut(path).ok_or_else(|| StorageError::NotFound {
            what: format!("series {path} not found"),
        })
    }

    pub fn new_series(&mut self, path: &str, fields: Vec<String>) -> StorageResult<()> {
        if self.series.contains_key(path) {
            return Err(StorageError::AlreadyExists {
                what: format!("series {path} already exists"),
            });
        }
        if fields.is_empty() {
            return Err(StorageError::InvalidArgument {
                what: "a series needs at least one field".to_string(),
            });
        }
        let serial = self.next_serial;
        self.next_serial += 1;

        self.register.record_series(serial, path, Some(&fields))?;
        self.series.insert(
            path.to_string(),
            Series::new(serial, path.to_string(), fields, &self.data_dir, self.n_splits),
        );
        self.serial_index.insert(serial, path.to_string());
        debug!(path, serial, "series created");
        Ok(())
    }

    pub fn delete_series(&mut self, path: &str) -> StorageResult<()> {
        let (serial, ids) = {
            let series = self.series_mut(path)?;
            let ids = series.segment_ids();
            for seg in series.segments_mut() {
                seg.delete();
            }
            (series.serial, ids)
        };

        for id in &ids {
            let id = *id;
            self.with_memory(|mem, db| mem.record_write(id, db))?;
        }
        self.with_memory(|mem, db| mem.force_commit_all(db))?;
        for id in &ids {
            self.memory.forget(*id);
        }

        self.register.record_series_deleted(serial, path)?;
        self.series.remove(path);
        self.serial_index.remove(&serial);
        debug!(path, serial, "series deleted");
        Ok(())
    }

    pub fn get_fields(&self, path: &str) -> StorageResult<Vec<String>> {
        self.series
            .get(path)
            .map(|s| s.fields().to_vec())
            .ok_or_else(|| StorageError::NotFound {
                what: format!("series {path} not found"),
            })
    }

    pub fn rename_fields(&mut self, path: &str, new_fields: Vec<String>) -> StorageResult<()> {
        self.series_mut(path)?.rename_fields(new_fields)
    }

    /// Move a series to a new path. Recorded as a deletion of the old path
    /// followed by a creation of the new one, so the register keeps its
    /// two-record-kind shape.
    pub fn move_series(&mut self, old_path: &str, new_path: &str) -> StorageResult<()> {
        if self.series.contains_key(new_path) {
            return Err(StorageError::AlreadyExists {
                what: format!("series {new_path} already exists"),
            });
        }
        let mut series = self
            .series
            .remove(old_path)
            .ok_or_else(|| StorageError::NotFound {
                what: format!("series {old_path} not found"),
            })?;

        self.register.record_series_deleted(series.serial, old_path)?;
        self.register
            .record_series(series.serial, new_path, Some(series.fields()))?;

        self.serial_index.insert(series.serial, new_path.to_string());
        series.path = new_path.to_string();
        self.series.insert(new_path.to_string(), series);
        Ok(())
    }

    /// Consolidate every segment of a series into one, forcing it all
    /// resident and rewriting it as a single contiguous segment.
    pub fn defragment_series(&mut self, path: &str) -> StorageResult<()> {
        let old_ids = self.series_mut(path)?.segment_ids();
        if old_ids.len() <= 1 {
            return Ok(());
        }

        let (all_t, all_x) = self.series_mut(path)?.get_all(None)?;
        let field_count = self.get_fields(path)?.len();
        let flat_x: Vec<f64> = all_x.into_iter().flatten().collect();

        let data_dir = self.data_dir.clone();
        let new_id = {
            let series = self.series_mut(path)?;
            for seg in series.segments_mut() {
                seg.delete();
            }
            let new_id = series.allocate_id();
            let merged =
                Segment::from_initial_data(new_id, all_t, flat_x, field_count, &data_dir);
            series.replace_segments(vec![merged]);
            new_id
        };

        for id in &old_ids {
            let id = *id;
            self.with_memory(|mem, db| mem.record_write(id, db))?;
        }
        self.with_memory(|mem, db| mem.force_commit_all(db))?;
        for id in old_ids {
            self.memory.forget(id);
        }
        self.with_memory(|mem, db| mem.record_write(new_id, db))?;
        self.with_memory(|mem, db| mem.force_commit_all(db))?;
        Ok(())
    }

    pub fn get(
        &mut self,
        path: &str,
        t: Timestamp,
        columns: Option<&[String]>,
        when: When,
    ) -> StorageResult<(Timestamp, Vec<f64>)> {
        self.touch_before_read(path)?;
        self.series_mut(path)?.get(t, columns, when)
    }

    pub fn get_range(
        &mut self,
        path: &str,
        start: Timestamp,
        end: Timestamp,
        columns: Option<&[String]>,
    ) -> StorageResult<(Vec<Timestamp>, Vec<Vec<f64>>)> {
        self.touch_before_read(path)?;
        self.series_mut(path)?.get_range(start, end, columns)
    }

    pub fn get_all(
        &mut self,
        path: &str,
        columns: Option<&[String]>,
    ) -> StorageResult<(Vec<Timestamp>, Vec<Vec<f64>>)> {
        self.touch_before_read(path)?;
        self.series_mut(path)?.get_all(columns)
    }

    /// Register a read access for every segment of `path` with the memory
    /// manager before delegating the actual lookup to the series. This is
    /// coarser than per-segment tracking but keeps the cache coupling at
    /// the database boundary rather than threading it through `Series`.
    fn touch_before_read(&mut self, path: &str) -> StorageResult<()> {
        let ids = self.series_mut(path)?.segment_ids();
        for id in ids {
            self.with_memory(|mem, db| mem.record_read(id, db))?;
        }
        Ok(())
    }

    pub fn insert(
        &mut self,
        path: &str,
        t: Timestamp,
        x: Vec<f64>,
        conflict: Conflict,
    ) -> StorageResult<bool> {
        let max_segment_size = self.max_segment_size;
        let outcome = self.series_mut(path)?.insert(t, x, conflict, max_segment_size)?;
        for id in outcome.touched {
            self.with_memory(|mem, db| mem.record_write(id, db))?;
        }
        Ok(outcome.changed)
    }

    /// Build a nested directory view rooted at `prefix` over every series
    /// whose path begins with it. An empty `prefix` returns the whole tree.
    pub fn toc(&self, prefix: &[String]) -> TocNode {
        let mut root = TocNode::default();
        for s in self.series.values() {
            let components = path_components(&s.path);
            if components.len() < prefix.len() || components[..prefix.len()] != *prefix {
                continue;
            }
            let info = SeriesInfo {
                path: s.path.clone(),
                fields: s.fields().to_vec(),
                start: s.start(),
                end: s.end(),
                segment_count: s.segment_ids().len(),
            };
            insert_toc_entry(&mut root, &components[prefix.len()..], info);
        }
        root
    }

    pub fn memory_consumption(&self) -> usize {
        self.memory.total_memory_consumption(self)
    }

    /// Flush up to `n` dirty segments. Called on idle server ticks.
    pub fn commit(&mut self, n: usize) -> StorageResult<usize> {
        self.with_memory(|mem, db| mem.commit(n, db))
    }

    /// Flush everything and leave the database ready to be dropped.
    pub fn shutdown(&mut self) -> StorageResult<()> {
        self.with_memory(|mem, db| mem.force_commit_all(db))
    }

    /// Rewrite the register from the database's current live state,
    /// dropping superseded and tombstoned records.
    pub fn compact_register(&mut self) -> StorageResult<()> {
        self.shutdown()?;
        let live_series: Vec<(u64, String, Vec<String>)> = self
            .series
            .values()
            .map(|s| (s.serial, s.path.clone(), s.fields().to_vec()))
            .collect();
        let live_segments: Vec<(u64, Option<Timestamp>, Option<Timestamp>, usize)> = self
            .series
            .values()
            .flat_map(|s| s.segment_shapes())
            .collect();
        self.register.purge(
            live_series
                .iter()
                .map(|(serial, path, fields)| (*serial, path.as_str(), fields.as_slice())),
            live_segments.into_iter(),
        )
    }
}

impl SegmentStore for Database {
    fn write_back(&mut self, id: u64) -> StorageResult<()> {
        let serial = id / ID_SPACE;
        let path = self
            .serial_index
            .get(&serial)
            .cloned()
            .ok_or_else(|| StorageError::InvariantViolation {
                what: format!("segment {id} has no owning series"),
            })?;
        let Database { series, register, .. } = self;
        let s = series.get_mut(&path).ok_or_else(|| StorageError::InvariantViolation {
            what: format!("series {path} missing for segment {id}"),
        })?;
        let seg = s
            .segments_mut()
            .iter_mut()
            .find(|seg| seg.id == id)
            .ok_or_else(|| StorageError::InvariantViolation {
                what: format!("segment {id} not found in series {path}"),
            })?;
        seg.write_to_disk(register)
    }

    fn release_buffers(&mut self, id: u64) {
        let serial = id / ID_SPACE;
        if let Some(path) = self.serial_index.get(&serial).cloned() {
            if let Some(s) = self.series.get_mut(&path) {
                if let Some(seg) = s.segments_mut().iter_mut().find(|seg| seg.id == id) {
                    if seg.disk_synced {
                        seg.release_buffers();
                    }
                }
            }
        }
    }

    fn memory_consumption(&self, id: u64) -> usize {
        let serial = id / ID_SPACE;
        self.serial_index
            .get(&serial)
            .and_then(|path| self.series.get(path))
            .and_then(|s| s.segment_memory_consumption(id))
            .unwrap_or(0)
    }
}
