use std::path::PathBuf;

use loam_chunk::ChunkError;
use thiserror::Error;

/// Errors from object, database, and root operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failure in the underlying chunk store. `ChunkError::Full` surfaces
    /// here unchanged and is recoverable by retrying against another chunk.
    #[error("chunk store error: {0}")]
    Chunk(#[from] ChunkError),

    /// I/O failure outside the chunk store (directory skeleton, root files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The database directory was written by an incompatible version.
    #[error("database version {actual} is not supported (expected {expected})")]
    UnsupportedVersion { expected: u32, actual: u32 },

    /// The database's `version` file does not parse as a version number.
    #[error("database at {path} has an unreadable version tag {text:?}")]
    BadVersionTag { path: PathBuf, text: String },

    /// An object cannot hold more than 65 535 references.
    #[error("object holds too many references: {0} (limit 65535)")]
    TooManyReferences(usize),

    /// A root file exists but fails its size or checksum validation.
    #[error("root file {path} is corrupt: {reason}")]
    CorruptRoot { path: PathBuf, reason: String },

    /// Operation on an entity whose retain count already reached zero.
    #[error("entity has been torn down")]
    Defunct,

    /// A transient object's reference slot holds neither a handle nor an id.
    #[error("reference slot {index} holds neither a handle nor an id")]
    MissingReference { index: usize },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
