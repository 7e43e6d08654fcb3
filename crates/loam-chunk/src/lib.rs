//! Append-only chunk storage for the Loam object store.
//!
//! A chunk is a single memory-mapped file holding immutable object records:
//! a fixed header, a data region of concatenated records, and an index
//! mapping record slots to byte offsets. Records are only ever appended;
//! once written, a record's bytes never change, so reads are zero-copy views
//! into the mapping ([`ChunkSlice`]) that stay valid under concurrent
//! appends.
//!
//! Chunks open read-write (mutable in-memory index, periodically flushed
//! back into the file) or read-only (index taken from the file as-is). The
//! data region has a fixed size chosen at creation; a record that does not
//! fit is reported as [`ChunkError::Full`] and left to the caller.

pub mod chunk;
pub mod error;
pub mod format;
pub mod slice;

pub use chunk::{Chunk, ChunkConfig, ChunkMode, Record};
pub use error::{ChunkError, ChunkResult};
pub use slice::ChunkSlice;
