use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IdError;

/// Identifier of a single chunk file within a database.
///
/// Chunk ids are dense small integers; the id doubles as the chunk's
/// filename under the database's `chunks/` directory (lower hex).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(u32);

impl ChunkId {
    /// Create a chunk id from its raw value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw numeric value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Filename of this chunk under the database's `chunks/` directory.
    pub fn file_name(&self) -> String {
        format!("{:08x}", self.0)
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({:08x})", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for ChunkId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Durable address of a persisted object: the chunk that holds its record
/// and the record's slot in that chunk's index.
///
/// An `ObjectId` is assigned exactly once, when the object is appended to a
/// chunk, and identifies the object for the lifetime of the database.
/// Transient (never persisted) objects have no `ObjectId`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// The chunk holding the object's record.
    pub chunk: ChunkId,
    /// The record's slot in the chunk index.
    pub slot: u32,
}

impl ObjectId {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Reserved sentinel meaning "no object". Never assigned to a record;
    /// used by root files to encode the unbound state.
    pub const UNBOUND: Self = Self {
        chunk: ChunkId(u32::MAX),
        slot: u32::MAX,
    };

    /// Create an object id from its parts.
    pub const fn new(chunk: ChunkId, slot: u32) -> Self {
        Self { chunk, slot }
    }

    /// Returns `true` if this is the reserved unbound sentinel.
    pub fn is_unbound(&self) -> bool {
        *self == Self::UNBOUND
    }

    /// Encode as 8 little-endian bytes (chunk, then slot).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&self.chunk.0.to_le_bytes());
        buf[4..].copy_from_slice(&self.slot.to_le_bytes());
        buf
    }

    /// Decode from exactly 8 little-endian bytes.
    pub fn from_bytes(buf: [u8; Self::SIZE]) -> Self {
        let chunk = u32::from_le_bytes(buf[..4].try_into().expect("4-byte slice"));
        let slot = u32::from_le_bytes(buf[4..].try_into().expect("4-byte slice"));
        Self {
            chunk: ChunkId(chunk),
            slot,
        }
    }

    /// Decode from a byte slice, checking the length.
    pub fn from_slice(data: &[u8]) -> Result<Self, IdError> {
        let buf: [u8; Self::SIZE] = data.try_into().map_err(|_| IdError::InvalidLength {
            expected: Self::SIZE,
            actual: data.len(),
        })?;
        Ok(Self::from_bytes(buf))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}/{})", self.chunk, self.slot)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chunk, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_file_name_is_lower_hex() {
        assert_eq!(ChunkId::new(0).file_name(), "00000000");
        assert_eq!(ChunkId::new(0xdead_beef).file_name(), "deadbeef");
    }

    #[test]
    fn object_id_byte_roundtrip() {
        let id = ObjectId::new(ChunkId::new(7), 42);
        let decoded = ObjectId::from_bytes(id.to_bytes());
        assert_eq!(id, decoded);
    }

    #[test]
    fn object_id_from_slice_checks_length() {
        let err = ObjectId::from_slice(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            IdError::InvalidLength {
                expected: 8,
                actual: 3
            }
        );
    }

    #[test]
    fn unbound_sentinel_roundtrips() {
        let id = ObjectId::UNBOUND;
        assert!(id.is_unbound());
        assert!(ObjectId::from_bytes(id.to_bytes()).is_unbound());
        assert!(!ObjectId::new(ChunkId::new(0), 0).is_unbound());
    }

    #[test]
    fn display_is_chunk_slash_slot() {
        let id = ObjectId::new(ChunkId::new(0x0a), 3);
        assert_eq!(format!("{id}"), "0000000a/3");
    }

    #[test]
    fn serde_roundtrip() {
        let id = ObjectId::new(ChunkId::new(2), 9);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ordering_is_chunk_major() {
        let a = ObjectId::new(ChunkId::new(0), 100);
        let b = ObjectId::new(ChunkId::new(1), 0);
        assert!(a < b);
    }
}
