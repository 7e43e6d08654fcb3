use std::fmt;

use crate::chunk::Chunk;

/// Zero-copy view of a payload inside a chunk's mapping.
///
/// The slice keeps its chunk open: the mapping is released only after the
/// last view (and every other chunk handle) is gone. Access is scoped
/// through [`read`](ChunkSlice::read) so the borrowed bytes cannot outlive
/// the view.
#[derive(Clone)]
pub struct ChunkSlice {
    chunk: Chunk,
    offset: usize,
    len: usize,
}

impl ChunkSlice {
    pub(crate) fn new(chunk: Chunk, offset: usize, len: usize) -> Self {
        Self { chunk, offset, len }
    }

    /// Length of the viewed payload in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The chunk backing this view.
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Apply `f` to the viewed bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.chunk.mapped_bytes(self.offset, self.len))
    }

    /// Copy the viewed bytes into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read(|bytes| bytes.to_vec())
    }
}

impl fmt::Debug for ChunkSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChunkSlice({}, offset={}, len={})",
            self.chunk.id(),
            self.offset,
            self.len
        )
    }
}
