use loam_types::ChunkId;
use thiserror::Error;

/// Errors from chunk file operations.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The record does not fit in the chunk's remaining data region.
    /// Recoverable: the caller may retry against a different chunk.
    #[error("chunk {id} is full: {needed} bytes requested, {available} available")]
    Full {
        id: ChunkId,
        needed: usize,
        available: usize,
    },

    /// The file carries an unsupported format version. The format has no
    /// migration path, so this is unrecoverable for the database.
    #[error("unsupported chunk format version: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Append attempted on a chunk opened read-only.
    #[error("chunk {id} is read-only")]
    ReadOnly { id: ChunkId },

    /// The slot is not present in the chunk index.
    #[error("unknown slot {slot} in chunk {id}")]
    UnknownSlot { id: ChunkId, slot: u32 },

    /// Read-only open of a chunk file that does not exist.
    #[error("chunk {id} does not exist")]
    Missing { id: ChunkId },

    /// Structural damage in the chunk file (bad sizes, broken index).
    #[error("corrupt chunk {id}: {reason}")]
    Corrupt { id: ChunkId, reason: String },

    /// A record or header that cannot be decoded.
    #[error("malformed chunk data: {0}")]
    Malformed(String),

    /// I/O failure from the filesystem or the mapping.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for chunk operations.
pub type ChunkResult<T> = Result<T, ChunkError>;
