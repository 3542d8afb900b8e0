//! Error types for the entrysync library
//!
//! Malformed client messages are not errors at this level: the classifier
//! turns them into `ClientRequest::Invalid` and the dispatcher answers with
//! an error envelope. The variants here cover the failures that cross module
//! boundaries: serialization, transport setup, the storage collaborator, and
//! inbound events that cannot be attributed to a known connection.

use thiserror::Error;

use crate::registry::ConnectionId;

/// The main Error type for the entrysync library
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-related errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failure reported by the storage collaborator
    #[error("Storage error: {0}")]
    Storage(String),

    /// An inbound event could not be attributed to a registered connection
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
