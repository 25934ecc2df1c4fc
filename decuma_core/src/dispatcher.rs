//! Tagged request/response shapes for the storage engine's command surface.
//!
//! A `Request` is a plain data value — no string command name, no
//! positional-argument tuple — so the wire adapter in `decuma_server` only
//! has to (de)serialize it, never interpret it. [`Dispatcher::handle`] is
//! the single place that maps a `Request` onto a [`Database`] call.

use crate::database::{Database, TocNode};
use crate::error::StorageError;
use crate::segment::{Conflict, Timestamp, When};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Echo { payload: String },
    Shutdown,
    /// Build a nested directory view rooted at `prefix` (empty for the
    /// whole tree).
    Toc { prefix: Vec<String> },
    MemoryConsumption,
    GetFields { path: String },
    CreateSeries { path: String, fields: Vec<String> },
    DeleteSeries { path: String },
    DefragmentSeries { path: String },
    MoveSeries { old_path: String, new_path: String },
    RenameFields { path: String, fields: Vec<String> },
    Get {
        path: String,
        t: Timestamp,
        columns: Option<Vec<String>>,
        when: When,
    },
    GetRange {
        path: String,
        start: Timestamp,
        end: Timestamp,
        columns: Option<Vec<String>>,
    },
    GetAll {
        path: String,
        columns: Option<Vec<String>>,
    },
    Insert {
        path: String,
        t: Timestamp,
        x: Vec<f64>,
        conflict: Conflict,
    },
    CompactRegister,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Echo { payload: String },
    Toc { root: TocNode },
    MemoryConsumption { bytes: usize },
    Fields { fields: Vec<String> },
    Record { t: Timestamp, x: Vec<f64> },
    Series {
        times: Vec<Timestamp>,
        rows: Vec<Vec<f64>>,
    },
    Inserted { boundary_changed: bool },
    Error { message: String },
    ShuttingDown,
}

/// `true` once a [`Request::Shutdown`] has been handled, signaling the
/// server loop to stop accepting new work.
pub struct Dispatcher {
    db: Database,
    shutting_down: bool,
}

impl Dispatcher {
    pub fn new(db: Database) -> Self {
        Dispatcher {
            db,
            shutting_down: false,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    pub fn handle(&mut self, request: Request) -> Response {
        let result = self.dispatch(request);
        match result {
            Ok(response) => response,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Response, StorageError> {
        match request {
            Request::Echo { payload } => Ok(Response::Echo { payload }),
            Request::Shutdown => {
                self.db.shutdown()?;
                self.shutting_down = true;
                Ok(Response::ShuttingDown)
            }
            Request::Toc { prefix } => Ok(Response::Toc {
                root: self.db.toc(&prefix),
            }),
            Request::MemoryConsumption => Ok(Response::MemoryConsumption {
                bytes: self.db.memory_consumption(),
            }),
            Request::GetFields { path } => Ok(Response::Fields {
                fields: self.db.get_fields(&path)?,
            }),
            Request::CreateSeries { path, fields } => {
                self.db.new_series(&path, fields)?;
                Ok(Response::Ok)
            }
            Request::DeleteSeries { path } => {
                self.db.delete_series(&path)?;
                Ok(Response::Ok)
            }
            Request::DefragmentSeries { path } => {
                self.db.defragment_series(&path)?;
                Ok(Response::Ok)
            }
            Request::MoveSeries { old_path, new_path } => {
                self.db.move_series(&old_path, &new_path)?;
                Ok(Response::Ok)
            }
            Request::RenameFields { path, fields } => {
                self.db.rename_fields(&path, fields)?;
                Ok(Response::Ok)
            }
            Request::Get { path, t, columns, when } => {
                let (t, x) = self.db.get(&path, t, columns.as_deref(), when)?;
                Ok(Response::Record { t, x })
            }
            Request::GetRange { path, start, end, columns } => {
                let (times, rows) = self.db.get_range(&path, start, end, columns.as_deref())?;
                Ok(Response::Series { times, rows })
            }
            Request::GetAll { path, columns } => {
                let (times, rows) = self.db.get_all(&path, columns.as_deref())?;
                Ok(Response::Series { times, rows })
            }
            Request::Insert { path, t, x, conflict } => {
                let changed = self.db.insert(&path, t, x, conflict)?;
                Ok(Response::Inserted { boundary_changed: changed })
            }
            Request::CompactRegister => {
                self.db.compact_register()?;
                Ok(Response::Ok)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::tempdir;

    fn dispatcher(dir: &std::path::Path) -> Dispatcher {
        let mut cfg = EngineConfig::default();
        cfg.data_dir = dir.to_path_buf();
        Dispatcher::new(Database::open(&cfg).unwrap())
    }

    #[test]
    fn create_insert_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let mut d = dispatcher(dir.path());

        let r = d.handle(Request::CreateSeries {
            path: "/temp".to_string(),
            fields: vec!["celsius".to_string()],
        });
        assert!(matches!(r, Response::Ok));

        let r = d.handle(Request::Insert {
            path: "/temp".to_string(),
            t: 1000,
            x: vec![21.5],
            conflict: Conflict::KeepBoth,
        });
        assert!(matches!(r, Response::Inserted { boundary_changed: true }));

        let r = d.handle(Request::Get {
            path: "/temp".to_string(),
            t: 1000,
            columns: None,
            when: When::Exact,
        });
        match r {
            Response::Record { t, x } => {
                assert_eq!(t, 1000);
                assert_eq!(x, vec![21.5]);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn unknown_series_surfaces_as_error_response() {
        let dir = tempdir().unwrap();
        let mut d = dispatcher(dir.path());
        let r = d.handle(Request::GetFields {
            path: "/missing".to_string(),
        });
        assert!(matches!(r, Response::Error { .. }));
    }

    #[test]
    fn toc_request_returns_nested_hierarchy() {
        let dir = tempdir().unwrap();
        let mut d = dispatcher(dir.path());
        d.handle(Request::CreateSeries {
            path: "/temp".to_string(),
            fields: vec!["celsius".to_string()],
        });

        let r = d.handle(Request::Toc { prefix: Vec::new() });
        match r {
            Response::Toc { root } => {
                let leaf = root.children.get("temp").unwrap();
                assert_eq!(leaf.series.as_ref().unwrap().path, "/temp");
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn shutdown_flips_shutting_down_flag() {
        let dir = tempdir().unwrap();
        let mut d = dispatcher(dir.path());
        assert!(!d.is_shutting_down());
        d.handle(Request::Shutdown);
        assert!(d.is_shutting_down());
    }
}
