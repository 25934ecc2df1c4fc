//! Segmented time-series storage engine.
//!
//! A [`database::Database`] owns a set of named [`series::Series`], each a
//! time-ordered, non-overlapping run of [`segment::Segment`]s. A
//! [`memory::MemoryManager`] bounds how many segments stay resident, and a
//! [`register::Register`] makes every durable change replayable after a
//! crash. [`dispatcher::Dispatcher`] exposes the whole thing as a single
//! request/response surface for a network front end to drive.

pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod register;
pub mod segment;
pub mod series;

pub use config::EngineConfig;
pub use database::Database;
pub use dispatcher::{Dispatcher, Request, Response};
pub use error::{StorageError, StorageResult};
pub use segment::{Conflict, Timestamp, When};
