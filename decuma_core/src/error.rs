//! Error types for the storage engine.

use thiserror::Error;

/// Errors that can occur during storage engine operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested path, timestamp, or field does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Human-readable description of what was missing.
        what: String,
    },

    /// Create or move conflicted with an existing path.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// Human-readable description of the conflicting entity.
        what: String,
    },

    /// Field-length mismatch, bad `conflict`/`when` value, or missing
    /// required command parameters.
    #[error("invalid argument: {what}")]
    InvalidArgument {
        /// Human-readable description of the violated constraint.
        what: String,
    },

    /// A segment file could not be read or written.
    #[error("io failure on {path}: {source}")]
    IoFailure {
        /// Path of the file the operation was attempted on.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Segment or register data was malformed in a way that should not
    /// occur at runtime (corrupt segment file, truncated header, etc).
    #[error("invariant violation: {what}")]
    InvariantViolation {
        /// Human-readable description of the broken invariant.
        what: String,
    },
}

/// Result type for storage engine operations.
pub type StorageResult<T> = Result<T, StorageError>;
