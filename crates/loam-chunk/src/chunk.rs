use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use memmap2::{Mmap, MmapRaw};
use tracing::{debug, warn};

use loam_dispatch::SerialQueue;
use loam_types::{ChunkId, ObjectId};

use crate::error::{ChunkError, ChunkResult};
use crate::format::{self, ChunkHeader, FORMAT_VERSION, HEADER_SIZE, INDEX_ENTRY_SIZE};
use crate::slice::ChunkSlice;

/// How a chunk file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkMode {
    /// Mutable in-memory index, records may be appended, flush persists.
    ReadWrite,
    /// Index read from the file as-is; appends are rejected.
    ReadOnly,
}

/// Tunables for chunk creation.
#[derive(Clone, Debug)]
pub struct ChunkConfig {
    /// Size of the data region for newly created chunks (default: 1 MiB).
    /// Existing files keep the size they were created with.
    pub data_size: usize,
    /// Extra index capacity reserved in memory on read-write open.
    pub index_headroom: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            data_size: 1024 * 1024,
            index_headroom: 100,
        }
    }
}

/// One record read back from a chunk.
#[derive(Clone, Debug)]
pub struct Record {
    /// Ids of the objects this record references, in slot order.
    pub refs: Vec<ObjectId>,
    /// Zero-copy view of the record's payload bytes.
    pub payload: ChunkSlice,
}

/// An append-only, memory-mapped chunk file.
///
/// A chunk holds variable-length object records in a fixed-size data region
/// plus an index mapping slots to record offsets. Writes only ever append
/// past the index sentinel; existing bytes are never rewritten, which is
/// what makes concurrent zero-copy reads of finished records safe.
///
/// The in-memory index and the mapping are mutated only by tasks on the
/// chunk's own serial queue ([`append`](Chunk::append) and
/// [`flush`](Chunk::flush) submit there and block for the result).
#[derive(Clone)]
pub struct Chunk {
    inner: Arc<ChunkInner>,
}

struct ChunkInner {
    id: ChunkId,
    path: PathBuf,
    mode: ChunkMode,
    /// Size of the data region; derived from the file for existing chunks.
    data_size: usize,
    map: Map,
    queue: SerialQueue,
    state: Mutex<ChunkState>,
    /// Keeps the descriptor alive for the mapping's lifetime.
    _file: File,
}

enum Map {
    ReadWrite(MmapRaw),
    ReadOnly(Mmap),
}

struct ChunkState {
    /// Record start offsets relative to the data region, with one trailing
    /// sentinel entry holding the next free offset.
    index: Vec<u32>,
    dirty: bool,
}

impl Chunk {
    /// Open the chunk file for `id` under `dir`, creating and zero-extending
    /// it in read-write mode if absent.
    ///
    /// Returns [`ChunkError::VersionMismatch`] for files written by an
    /// incompatible format version (the caller decides how hard to fail) and
    /// [`ChunkError::Missing`] for a read-only open of a file that does not
    /// exist.
    pub fn open_or_create(
        dir: &Path,
        id: ChunkId,
        mode: ChunkMode,
        config: &ChunkConfig,
    ) -> ChunkResult<Self> {
        let path = dir.join(id.file_name());
        match mode {
            ChunkMode::ReadWrite => Self::open_read_write(path, id, config),
            ChunkMode::ReadOnly => Self::open_read_only(path, id, config),
        }
    }

    fn open_read_write(path: PathBuf, id: ChunkId, config: &ChunkConfig) -> ChunkResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len() as usize;

        let fresh = len == 0;
        let data_size = if fresh {
            file.set_len((HEADER_SIZE + config.data_size) as u64)?;
            config.data_size
        } else {
            if len < HEADER_SIZE {
                return Err(ChunkError::Corrupt {
                    id,
                    reason: format!("file is {len} bytes, smaller than the header"),
                });
            }
            len - HEADER_SIZE
        };

        let map = MmapRaw::map_raw(&file)?;

        // Safety: the mapping is private to this function until the handle
        // is constructed; no other thread can observe these writes.
        let header_bytes =
            unsafe { std::slice::from_raw_parts(map.as_ptr(), HEADER_SIZE) };
        let mut header = ChunkHeader::decode(header_bytes)?;

        // A zero version marks a chunk that was created but never flushed
        // (fresh file, or a crash between create and first flush).
        if header.version == 0 {
            header = ChunkHeader {
                version: FORMAT_VERSION,
                chunk_id: id.as_u32(),
                index_length: 0,
                index_offset: 0,
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    header.encode().as_ptr(),
                    map.as_mut_ptr(),
                    HEADER_SIZE,
                );
            }
            map.flush_range(0, HEADER_SIZE)?;
        }
        Self::check_header(&header, id)?;

        let data = unsafe {
            std::slice::from_raw_parts(map.as_ptr().add(HEADER_SIZE), data_size)
        };
        let mut index = load_index(data, &header, id, config.index_headroom)?;
        index.push(header.index_offset);

        debug!(chunk = %id, records = index.len() - 1, "chunk opened read-write");
        Ok(Self {
            inner: Arc::new(ChunkInner {
                id,
                path,
                mode: ChunkMode::ReadWrite,
                data_size,
                map: Map::ReadWrite(map),
                queue: SerialQueue::new("chunk"),
                state: Mutex::new(ChunkState { index, dirty: true }),
                _file: file,
            }),
        })
    }

    fn open_read_only(path: PathBuf, id: ChunkId, config: &ChunkConfig) -> ChunkResult<Self> {
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ChunkError::Missing { id });
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(ChunkError::Corrupt {
                id,
                reason: format!("file is {len} bytes, smaller than the header"),
            });
        }
        let data_size = len - HEADER_SIZE;

        // Safety: standard read-only mapping; the file descriptor is held
        // for the mapping's lifetime.
        let map = unsafe { Mmap::map(&file)? };

        let header = ChunkHeader::decode(&map[..HEADER_SIZE])?;
        Self::check_header(&header, id)?;

        let mut index = load_index(&map[HEADER_SIZE..], &header, id, config.index_headroom)?;
        index.push(header.index_offset);

        debug!(chunk = %id, records = index.len() - 1, "chunk opened read-only");
        Ok(Self {
            inner: Arc::new(ChunkInner {
                id,
                path,
                mode: ChunkMode::ReadOnly,
                data_size,
                map: Map::ReadOnly(map),
                queue: SerialQueue::new("chunk"),
                state: Mutex::new(ChunkState {
                    index,
                    dirty: false,
                }),
                _file: file,
            }),
        })
    }

    fn check_header(header: &ChunkHeader, id: ChunkId) -> ChunkResult<()> {
        if header.version != FORMAT_VERSION {
            return Err(ChunkError::VersionMismatch {
                expected: FORMAT_VERSION,
                actual: header.version,
            });
        }
        if header.chunk_id != id.as_u32() {
            return Err(ChunkError::Corrupt {
                id,
                reason: format!("file claims chunk id {:08x}", header.chunk_id),
            });
        }
        Ok(())
    }

    /// This chunk's id.
    pub fn id(&self) -> ChunkId {
        self.inner.id
    }

    /// How the chunk was opened.
    pub fn mode(&self) -> ChunkMode {
        self.inner.mode
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of records currently in the chunk.
    pub fn len(&self) -> usize {
        self.lock_state().index.len() - 1
    }

    /// Returns `true` if the chunk holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a record and return its slot.
    ///
    /// Serialized on the chunk's queue; blocks until the append is applied.
    /// Fails with [`ChunkError::Full`] when the record (plus the serialized
    /// index) would overflow the data region, and with
    /// [`ChunkError::ReadOnly`] on read-only chunks.
    pub fn append(&self, refs: Vec<ObjectId>, payload: Bytes) -> ChunkResult<u32> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue_sync(move || inner.append_task(&refs, &payload))
    }

    /// Read the record at `slot`.
    ///
    /// The returned payload is a zero-copy view into the mapping; the chunk
    /// stays open for as long as the view (or any clone of it) lives.
    pub fn record(&self, slot: u32) -> ChunkResult<Record> {
        let (start, end) = {
            let state = self.lock_state();
            let at = slot as usize;
            if at + 1 >= state.index.len() {
                return Err(ChunkError::UnknownSlot {
                    id: self.inner.id,
                    slot,
                });
            }
            (state.index[at] as usize, state.index[at + 1] as usize)
        };
        let decoded = format::decode_record(self.mapped_bytes(start, end - start))?;
        Ok(Record {
            refs: decoded.refs,
            payload: ChunkSlice::new(
                self.clone(),
                start + decoded.payload_offset,
                decoded.payload_len,
            ),
        })
    }

    /// Persist the header and index and synchronize the mapping to stable
    /// storage. Idempotent; a no-op for read-only chunks and for chunks
    /// already clean.
    pub fn flush(&self) -> ChunkResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue_sync(move || inner.flush_task())
    }

    /// Bytes at a data-region-relative offset. Only called for ranges below
    /// the append sentinel (finished records), which never change again.
    pub(crate) fn mapped_bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.inner.data(offset, len)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChunkState> {
        self.inner.state.lock().expect("chunk state lock poisoned")
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({}, {:?})", self.inner.id, self.inner.mode)
    }
}

impl ChunkInner {
    fn data(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.data_size);
        match &self.map {
            Map::ReadOnly(map) => &map[HEADER_SIZE + offset..HEADER_SIZE + offset + len],
            // Safety: callers only read finished records, which live below
            // the append sentinel and are never rewritten; appends touch
            // only offsets at or past the sentinel.
            Map::ReadWrite(map) => unsafe {
                std::slice::from_raw_parts(map.as_ptr().add(HEADER_SIZE + offset), len)
            },
        }
    }

    fn append_task(&self, refs: &[ObjectId], payload: &[u8]) -> ChunkResult<u32> {
        let Map::ReadWrite(map) = &self.map else {
            warn!(chunk = %self.id, "append on read-only chunk");
            return Err(ChunkError::ReadOnly { id: self.id });
        };

        let mut state = self.state.lock().expect("chunk state lock poisoned");
        let tail = *state.index.last().expect("index sentinel") as usize;
        let needed = format::record_size(refs.len(), payload.len());
        // The serialized index (including the new entry) must still fit
        // behind the record at flush time.
        let index_bytes = state.index.len() * INDEX_ENTRY_SIZE;
        let available = self.data_size.saturating_sub(tail + index_bytes);
        if needed > available {
            debug!(chunk = %self.id, needed, available, "chunk is full");
            return Err(ChunkError::Full {
                id: self.id,
                needed,
                available,
            });
        }

        let record = format::encode_record(refs, payload);
        // Safety: [tail, tail + record.len()) is past the sentinel, so no
        // reader can observe it, and this queue task is the only writer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                record.as_ptr(),
                map.as_mut_ptr().add(HEADER_SIZE + tail),
                record.len(),
            );
        }

        let slot = (state.index.len() - 1) as u32;
        state.index.push((tail + record.len()) as u32);
        state.dirty = true;
        debug!(chunk = %self.id, slot, bytes = record.len(), "record appended");
        Ok(slot)
    }

    fn flush_task(&self) -> ChunkResult<()> {
        let Map::ReadWrite(map) = &self.map else {
            return Ok(());
        };
        let mut state = self.state.lock().expect("chunk state lock poisoned");
        if !state.dirty {
            return Ok(());
        }

        let records = state.index.len() - 1;
        let tail = state.index[records] as usize;

        let mut index_bytes = Vec::with_capacity(records * INDEX_ENTRY_SIZE);
        for &offset in &state.index[..records] {
            index_bytes.extend_from_slice(&offset.to_le_bytes());
        }

        let header = ChunkHeader {
            version: FORMAT_VERSION,
            chunk_id: self.id.as_u32(),
            index_length: records as u32,
            index_offset: tail as u32,
        };

        // Safety: the index lands at the sentinel offset (space reserved by
        // every append), the header in its fixed slot; neither range is
        // readable record data.
        unsafe {
            std::ptr::copy_nonoverlapping(
                index_bytes.as_ptr(),
                map.as_mut_ptr().add(HEADER_SIZE + tail),
                index_bytes.len(),
            );
            std::ptr::copy_nonoverlapping(header.encode().as_ptr(), map.as_mut_ptr(), HEADER_SIZE);
        }
        map.flush()?;

        state.dirty = false;
        debug!(chunk = %self.id, records, "chunk flushed");
        Ok(())
    }
}

impl Drop for ChunkInner {
    fn drop(&mut self) {
        if let Err(err) = self.flush_task() {
            tracing::error!(chunk = %self.id, %err, "flush on close failed");
        }
        debug!(chunk = %self.id, "chunk closed");
    }
}

/// Copy the persisted index out of the data region, validating its shape.
fn load_index(
    data: &[u8],
    header: &ChunkHeader,
    id: ChunkId,
    headroom: usize,
) -> ChunkResult<Vec<u32>> {
    let count = header.index_length as usize;
    let start = header.index_offset as usize;
    let end = count
        .checked_mul(INDEX_ENTRY_SIZE)
        .and_then(|bytes| start.checked_add(bytes))
        .filter(|&end| end <= data.len())
        .ok_or_else(|| ChunkError::Corrupt {
            id,
            reason: format!("index ({count} entries at {start}) exceeds the data region"),
        })?;

    let mut index = Vec::with_capacity(count + 1 + headroom);
    let mut previous = 0u32;
    for raw in data[start..end].chunks_exact(INDEX_ENTRY_SIZE) {
        let offset = u32::from_le_bytes(raw.try_into().expect("4-byte slice"));
        if offset < previous || offset > header.index_offset {
            return Err(ChunkError::Corrupt {
                id,
                reason: format!("index entry {offset} out of order"),
            });
        }
        index.push(offset);
        previous = offset;
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn oid(chunk: u32, slot: u32) -> ObjectId {
        ObjectId::new(ChunkId::new(chunk), slot)
    }

    fn rw_chunk(dir: &Path) -> Chunk {
        Chunk::open_or_create(dir, ChunkId::new(0), ChunkMode::ReadWrite, &ChunkConfig::default())
            .unwrap()
    }

    #[test]
    fn append_assigns_sequential_slots() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = rw_chunk(dir.path());
        assert!(chunk.is_empty());

        let a = chunk.append(vec![], Bytes::from_static(b"Foo")).unwrap();
        let b = chunk.append(vec![], Bytes::from_static(b"Bar")).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(chunk.len(), 2);
    }

    #[test]
    fn record_roundtrip_in_session() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = rw_chunk(dir.path());

        let refs = vec![oid(0, 7), oid(2, 1)];
        let slot = chunk
            .append(refs.clone(), Bytes::from_static(b"payload"))
            .unwrap();

        let record = chunk.record(slot).unwrap();
        assert_eq!(record.refs, refs);
        assert_eq!(record.payload.to_vec(), b"payload");
    }

    #[test]
    fn reopen_read_write_resumes_slots() {
        let dir = tempfile::tempdir().unwrap();
        {
            let chunk = rw_chunk(dir.path());
            assert_eq!(chunk.append(vec![], Bytes::from_static(b"one")).unwrap(), 0);
            chunk.flush().unwrap();
        }
        let chunk = rw_chunk(dir.path());
        assert_eq!(chunk.len(), 1);
        assert_eq!(chunk.record(0).unwrap().payload.to_vec(), b"one");
        assert_eq!(chunk.append(vec![], Bytes::from_static(b"two")).unwrap(), 1);
    }

    #[test]
    fn reopen_read_only_reads_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let chunk = rw_chunk(dir.path());
            chunk.append(vec![oid(0, 0)], Bytes::from_static(b"ro")).unwrap();
            chunk.flush().unwrap();
        }
        let chunk = Chunk::open_or_create(
            dir.path(),
            ChunkId::new(0),
            ChunkMode::ReadOnly,
            &ChunkConfig::default(),
        )
        .unwrap();
        assert_eq!(chunk.len(), 1);
        let record = chunk.record(0).unwrap();
        assert_eq!(record.refs, vec![oid(0, 0)]);
        assert_eq!(record.payload.to_vec(), b"ro");
    }

    #[test]
    fn read_only_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let chunk = rw_chunk(dir.path());
            chunk.flush().unwrap();
        }
        let chunk = Chunk::open_or_create(
            dir.path(),
            ChunkId::new(0),
            ChunkMode::ReadOnly,
            &ChunkConfig::default(),
        )
        .unwrap();
        let err = chunk.append(vec![], Bytes::from_static(b"nope")).unwrap_err();
        assert!(matches!(err, ChunkError::ReadOnly { .. }));
    }

    #[test]
    fn read_only_open_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Chunk::open_or_create(
            dir.path(),
            ChunkId::new(9),
            ChunkMode::ReadOnly,
            &ChunkConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ChunkError::Missing { .. }));
    }

    #[test]
    fn full_chunk_reports_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChunkConfig {
            data_size: 256,
            ..ChunkConfig::default()
        };
        let chunk =
            Chunk::open_or_create(dir.path(), ChunkId::new(0), ChunkMode::ReadWrite, &config)
                .unwrap();

        chunk.append(vec![], Bytes::from(vec![0u8; 100])).unwrap();
        let err = chunk.append(vec![], Bytes::from(vec![0u8; 200])).unwrap_err();
        match err {
            ChunkError::Full { needed, available, .. } => {
                assert_eq!(needed, 208);
                assert!(available < 200);
            }
            other => panic!("expected Full, got {other:?}"),
        }
        // The chunk stays usable for smaller records.
        chunk.append(vec![], Bytes::from(vec![0u8; 16])).unwrap();
    }

    #[test]
    fn unknown_slot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = rw_chunk(dir.path());
        let err = chunk.record(3).unwrap_err();
        assert!(matches!(err, ChunkError::UnknownSlot { slot: 3, .. }));
    }

    #[test]
    fn flush_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = rw_chunk(dir.path());
        chunk.append(vec![], Bytes::from_static(b"x")).unwrap();
        chunk.flush().unwrap();
        chunk.flush().unwrap();
        chunk.flush().unwrap();
        assert_eq!(chunk.len(), 1);
    }

    #[test]
    fn version_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let chunk = rw_chunk(dir.path());
            chunk.flush().unwrap();
            chunk.path().to_path_buf()
        };
        // Bump the version field in place.
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&99u32.to_le_bytes()).unwrap();
        file.sync_all().unwrap();

        let err = Chunk::open_or_create(
            dir.path(),
            ChunkId::new(0),
            ChunkMode::ReadWrite,
            &ChunkConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ChunkError::VersionMismatch {
                expected: FORMAT_VERSION,
                actual: 99
            }
        ));
    }

    #[test]
    fn mismatched_chunk_id_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let chunk = rw_chunk(dir.path());
            chunk.flush().unwrap();
        }
        // Reopen the same file under a different id.
        std::fs::rename(
            dir.path().join(ChunkId::new(0).file_name()),
            dir.path().join(ChunkId::new(5).file_name()),
        )
        .unwrap();
        let err = Chunk::open_or_create(
            dir.path(),
            ChunkId::new(5),
            ChunkMode::ReadWrite,
            &ChunkConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ChunkError::Corrupt { .. }));
    }

    #[test]
    fn slice_keeps_the_chunk_alive() {
        let dir = tempfile::tempdir().unwrap();
        let payload = {
            let chunk = rw_chunk(dir.path());
            let slot = chunk.append(vec![], Bytes::from_static(b"still here")).unwrap();
            chunk.record(slot).unwrap().payload
        };
        // The original handle is gone; the view still reads the mapping.
        assert_eq!(payload.to_vec(), b"still here");
    }

    #[test]
    fn empty_payload_and_many_refs() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = rw_chunk(dir.path());
        let refs: Vec<ObjectId> = (0..100).map(|slot| oid(0, slot)).collect();
        let slot = chunk.append(refs.clone(), Bytes::new()).unwrap();
        let record = chunk.record(slot).unwrap();
        assert_eq!(record.refs, refs);
        assert!(record.payload.is_empty());
    }
}
