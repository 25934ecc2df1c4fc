//! Errors specific to the network front end.

use decuma_core::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    /// The storage engine itself returned an error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A frame's length prefix or payload could not be decoded.
    #[error("malformed frame from {peer}: {reason}")]
    MalformedFrame { peer: String, reason: String },

    /// The client closed the connection (or never sent a complete frame).
    #[error("connection closed by {peer}")]
    ConnectionClosed { peer: String },

    /// A listener or connection-level I/O operation failed.
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration failed validation.
    #[error("invalid server configuration: {what}")]
    InvalidConfig { what: String },
}

pub type ServerResult<T> = Result<T, ServerError>;
