//! Binary layout of a chunk file.
//!
//! ```text
//! [header: 16 bytes]
//!     version:u32  chunk_id:u32  index_length:u32  index_offset:u32
//! [data region]
//!     record*      payload_len:u32  ref_count:u32  refs:[ObjectId; ref_count]  payload
//!     index        index_length u32 entries at data-relative offset index_offset
//! ```
//!
//! All integers are little-endian. Index entries are record start offsets
//! relative to the data region; `index_offset` doubles as the next free
//! offset, so entry `i+1` minus entry `i` is the exact encoded size of
//! record `i`.

use loam_types::ObjectId;

use crate::error::{ChunkError, ChunkResult};

/// Current chunk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the fixed chunk header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Size of one serialized index entry in bytes.
pub const INDEX_ENTRY_SIZE: usize = 4;

/// Size of the fixed per-record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 8;

/// The fixed header at the start of every chunk file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u32,
    pub chunk_id: u32,
    pub index_length: u32,
    pub index_offset: u32,
}

impl ChunkHeader {
    /// Encode into the fixed 16-byte layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.chunk_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.index_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.index_offset.to_le_bytes());
        buf
    }

    /// Decode from the start of a mapped chunk file.
    ///
    /// Version checking is left to the caller: a zero version marks a chunk
    /// that was created but never flushed and is reinitialized on open.
    pub fn decode(buf: &[u8]) -> ChunkResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ChunkError::Malformed(format!(
                "chunk header truncated: {} bytes",
                buf.len()
            )));
        }
        let word = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().expect("4-byte slice"));
        Ok(Self {
            version: word(0),
            chunk_id: word(4),
            index_length: word(8),
            index_offset: word(12),
        })
    }
}

/// Encoded size of a record with the given shape.
pub fn record_size(ref_count: usize, payload_len: usize) -> usize {
    RECORD_HEADER_SIZE + ref_count * ObjectId::SIZE + payload_len
}

/// Encode a record into a fresh buffer.
pub fn encode_record(refs: &[ObjectId], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record_size(refs.len(), payload.len()));
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(refs.len() as u32).to_le_bytes());
    for id in refs {
        buf.extend_from_slice(&id.to_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// A decoded record: reference ids plus the payload's position inside the
/// record buffer (the payload itself stays in the mapping).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedRecord {
    pub refs: Vec<ObjectId>,
    pub payload_offset: usize,
    pub payload_len: usize,
}

/// Decode one record from its exact byte range.
pub fn decode_record(buf: &[u8]) -> ChunkResult<DecodedRecord> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(ChunkError::Malformed(format!(
            "record truncated: {} bytes",
            buf.len()
        )));
    }
    let payload_len = u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice")) as usize;
    let ref_count = u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice")) as usize;

    // Validate before allocating anything sized by untrusted fields.
    let expected =
        RECORD_HEADER_SIZE as u64 + ref_count as u64 * ObjectId::SIZE as u64 + payload_len as u64;
    if buf.len() as u64 != expected {
        return Err(ChunkError::Malformed(format!(
            "record size mismatch: {} bytes on disk, header describes {expected}",
            buf.len()
        )));
    }

    let refs_end = RECORD_HEADER_SIZE + ref_count * ObjectId::SIZE;
    let mut refs = Vec::with_capacity(ref_count);
    for raw in buf[RECORD_HEADER_SIZE..refs_end].chunks_exact(ObjectId::SIZE) {
        let id = ObjectId::from_slice(raw)
            .map_err(|err| ChunkError::Malformed(format!("bad reference id: {err}")))?;
        refs.push(id);
    }

    Ok(DecodedRecord {
        refs,
        payload_offset: refs_end,
        payload_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_types::ChunkId;
    use proptest::prelude::*;

    fn oid(chunk: u32, slot: u32) -> ObjectId {
        ObjectId::new(ChunkId::new(chunk), slot)
    }

    #[test]
    fn header_roundtrip() {
        let header = ChunkHeader {
            version: FORMAT_VERSION,
            chunk_id: 3,
            index_length: 17,
            index_offset: 4096,
        };
        let decoded = ChunkHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn header_decode_truncated() {
        let err = ChunkHeader::decode(&[0u8; 7]).unwrap_err();
        assert!(matches!(err, ChunkError::Malformed(_)));
    }

    #[test]
    fn record_roundtrip_with_refs() {
        let refs = vec![oid(0, 1), oid(0, 2), oid(1, 0)];
        let payload = b"hello chunk";
        let buf = encode_record(&refs, payload);
        assert_eq!(buf.len(), record_size(refs.len(), payload.len()));

        let decoded = decode_record(&buf).unwrap();
        assert_eq!(decoded.refs, refs);
        assert_eq!(
            &buf[decoded.payload_offset..decoded.payload_offset + decoded.payload_len],
            payload
        );
    }

    #[test]
    fn record_roundtrip_empty() {
        let buf = encode_record(&[], b"");
        let decoded = decode_record(&buf).unwrap();
        assert!(decoded.refs.is_empty());
        assert_eq!(decoded.payload_len, 0);
    }

    #[test]
    fn decode_rejects_truncated_record() {
        let buf = encode_record(&[oid(0, 0)], b"payload");
        let err = decode_record(&buf[..buf.len() - 1]).unwrap_err();
        assert!(matches!(err, ChunkError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_oversized_ref_count() {
        let mut buf = encode_record(&[], b"x");
        // Claim more references than the record can hold.
        buf[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = decode_record(&buf).unwrap_err();
        assert!(matches!(err, ChunkError::Malformed(_)));
    }

    proptest! {
        #[test]
        fn record_roundtrip_property(
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            raw_refs in proptest::collection::vec((0u32..8, 0u32..1024), 0..32),
        ) {
            let refs: Vec<ObjectId> =
                raw_refs.into_iter().map(|(c, s)| oid(c, s)).collect();
            let buf = encode_record(&refs, &payload);
            let decoded = decode_record(&buf).unwrap();
            prop_assert_eq!(&decoded.refs, &refs);
            prop_assert_eq!(
                &buf[decoded.payload_offset..decoded.payload_offset + decoded.payload_len],
                payload.as_slice()
            );
        }
    }
}
