use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use loam_chunk::{Chunk, ChunkConfig, ChunkError, ChunkMode};
use loam_dispatch::{spawn_tracked, SerialQueue};
use loam_types::{ChunkId, ObjectId};

use crate::error::{StoreError, StoreResult};
use crate::handle::Managed;
use crate::object::Object;
use crate::root::Root;

/// Version tag written to a database directory on creation.
pub const DATABASE_VERSION: u32 = 1;

/// How many sibling writers fan out at one level of the graph.
const WRITE_FANOUT: usize = 16;

/// Tunables for opening a database.
#[derive(Clone, Debug, Default)]
pub struct DatabaseConfig {
    /// Chunk creation parameters.
    pub chunk: ChunkConfig,
}

/// Handle to an on-disk object database.
///
/// A database owns its chunk files and mediates all object persistence:
/// [`write_object`](Database::write_object) appends a transient graph
/// bottom-up, [`read_object`](Database::read_object) materializes persisted
/// objects, [`root`](Database::root) opens named entry points.
///
/// Directory layout: `version` (text tag), `chunks/<id>` (record files,
/// chunk 0 is the write chunk), `index/<digest>` (root files).
///
/// Handles are cheap to clone; the logical lifetime is governed by the
/// retain count ([`Managed`]). The final release flushes and closes the
/// chunks on a background task.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    path: PathBuf,
    version: u32,
    config: DatabaseConfig,
    queue: SerialQueue,
    state: Mutex<Option<DatabaseState>>,
}

struct DatabaseState {
    rc: u32,
    write_chunk: Chunk,
    /// Read-only chunks opened on demand, by id.
    read_chunks: HashMap<ChunkId, Chunk>,
}

impl Database {
    /// Open (or create) the database at `path` with default configuration.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Database> {
        Self::open_with(path, DatabaseConfig::default())
    }

    /// Open (or create) the database at `path`.
    ///
    /// A missing directory is created with the current version tag and an
    /// empty chunk 0. An existing directory must carry a supported version.
    ///
    /// # Panics
    ///
    /// If an existing chunk file was written by an incompatible chunk format
    /// version. The format has no migration path, so continuing would only
    /// corrupt the store.
    pub fn open_with(path: impl AsRef<Path>, config: DatabaseConfig) -> StoreResult<Database> {
        let path = path.as_ref().to_path_buf();
        let version_file = path.join("version");

        let version = match fs::read_to_string(&version_file) {
            Ok(text) => {
                let version =
                    text.trim()
                        .parse::<u32>()
                        .map_err(|_| StoreError::BadVersionTag {
                            path: path.clone(),
                            text: text.clone(),
                        })?;
                if version != DATABASE_VERSION {
                    error!(
                        path = %path.display(),
                        version,
                        "database version is not supported"
                    );
                    return Err(StoreError::UnsupportedVersion {
                        expected: DATABASE_VERSION,
                        actual: version,
                    });
                }
                version
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "creating database directory skeleton");
                fs::create_dir_all(&path)?;
                fs::create_dir_all(path.join("chunks"))?;
                fs::create_dir_all(path.join("index"))?;
                fs::write(&version_file, DATABASE_VERSION.to_string())?;
                DATABASE_VERSION
            }
            Err(err) => {
                error!(path = %path.display(), %err, "could not read database version tag");
                return Err(err.into());
            }
        };

        let write_chunk = open_chunk(
            &path.join("chunks"),
            ChunkId::new(0),
            ChunkMode::ReadWrite,
            &config.chunk,
        )?;

        info!(path = %path.display(), version, "database opened");
        Ok(Database {
            inner: Arc::new(DatabaseInner {
                path,
                version,
                config,
                queue: SerialQueue::new("database"),
                state: Mutex::new(Some(DatabaseState {
                    rc: 1,
                    write_chunk,
                    read_chunks: HashMap::new(),
                })),
            }),
        })
    }

    /// The database's version tag.
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// The database directory.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Open the root handle for `name`, loading its persisted binding.
    pub fn root(&self, name: &str) -> StoreResult<Root> {
        Root::open(self.clone(), name)
    }

    /// Materialize the persisted object at `id`.
    ///
    /// The object's references stay unresolved until navigated; its payload
    /// is a zero-copy view into the chunk's mapping.
    pub fn read_object(&self, id: ObjectId) -> StoreResult<Object> {
        let chunk = self.chunk_for(id.chunk)?;
        let record = chunk.record(id.slot)?;
        Ok(Object::unmarshal(self.clone(), id, record.refs, record.payload))
    }

    /// Durably write a transient object graph and return the root's id.
    ///
    /// Idempotent: a persisted object returns its existing id without a
    /// second append, and concurrent writers racing to persist the same
    /// transient object perform the write exactly once (per-object gate).
    /// Every not-yet-persisted descendant is written before its parent;
    /// independent siblings are written in parallel. A full write chunk
    /// surfaces as [`ChunkError::Full`] for the caller to handle.
    pub fn write_object(&self, obj: &Object) -> StoreResult<ObjectId> {
        if let Some(id) = obj.id() {
            return Ok(id);
        }

        let gate = obj.write_gate();
        let _guard = gate.lock().expect("object write gate poisoned");
        if let Some(id) = obj.id() {
            // Another writer persisted the object while we waited.
            return Ok(id);
        }

        let (payload, slots) = obj.write_snapshot()?;

        let mut refs: Vec<ObjectId> = vec![ObjectId::UNBOUND; slots.len()];
        let mut pending: Vec<(usize, Object)> = Vec::new();
        for (index, (known_id, cached)) in slots.into_iter().enumerate() {
            if let Some(id) = known_id {
                refs[index] = id;
                continue;
            }
            let Some(child) = cached else {
                return Err(StoreError::MissingReference { index });
            };
            match child.id() {
                Some(id) => refs[index] = id,
                None => pending.push((index, child)),
            }
        }

        if pending.len() == 1 {
            // A lone pending child is written inline, so chains of objects
            // recurse on this thread instead of hopping across workers.
            let (index, child) = &pending[0];
            refs[*index] = self.write_object(child)?;
        } else if !pending.is_empty() {
            for (index, id) in self.write_children(&pending)? {
                refs[index] = id;
            }
        }
        debug_assert!(refs.iter().all(|id| !id.is_unbound()));

        let chunk = {
            let guard = self.lock_state();
            let Some(state) = guard.as_ref() else {
                return Err(StoreError::Defunct);
            };
            state.write_chunk.clone()
        };

        let slot = chunk.append(refs.clone(), payload)?;
        let id = ObjectId::new(chunk.id(), slot);
        let record = chunk.record(slot)?;
        obj.mark_persisted(self.clone(), id, record.payload, refs);
        debug!(object = %id, "object written");
        Ok(id)
    }

    /// Write independent sibling objects in parallel.
    ///
    /// Siblings have no ordering constraints among themselves; they are
    /// spread over at most [`WRITE_FANOUT`] scoped worker threads, each
    /// writing its share sequentially.
    fn write_children(&self, pending: &[(usize, Object)]) -> StoreResult<Vec<(usize, ObjectId)>> {
        let stride = pending.len().div_ceil(WRITE_FANOUT);
        std::thread::scope(|scope| {
            let mut workers = Vec::new();
            for batch in pending.chunks(stride) {
                workers.push(scope.spawn(move || {
                    batch
                        .iter()
                        .map(|(index, child)| Ok((*index, self.write_object(child)?)))
                        .collect::<StoreResult<Vec<_>>>()
                }));
            }
            let mut written = Vec::with_capacity(pending.len());
            for worker in workers {
                let batch = worker
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
                written.extend(batch);
            }
            Ok(written)
        })
    }

    /// The chunk holding `cid`, opening it read-only on first use.
    fn chunk_for(&self, cid: ChunkId) -> StoreResult<Chunk> {
        let mut guard = self.lock_state();
        let Some(state) = guard.as_mut() else {
            return Err(StoreError::Defunct);
        };
        if state.write_chunk.id() == cid {
            return Ok(state.write_chunk.clone());
        }
        if let Some(chunk) = state.read_chunks.get(&cid) {
            return Ok(chunk.clone());
        }
        let chunk = open_chunk(
            &self.inner.path.join("chunks"),
            cid,
            ChunkMode::ReadOnly,
            &self.inner.config.chunk,
        )?;
        state.read_chunks.insert(cid, chunk.clone());
        Ok(chunk)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<DatabaseState>> {
        self.inner
            .state
            .lock()
            .expect("database state lock poisoned")
    }
}

impl Managed for Database {
    fn retain(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            match inner
                .state
                .lock()
                .expect("database state lock poisoned")
                .as_mut()
            {
                Some(state) => state.rc += 1,
                None => debug!("retain on closed database"),
            }
        });
    }

    fn release(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            let reached_zero = {
                let mut guard = inner.state.lock().expect("database state lock poisoned");
                match guard.as_mut() {
                    Some(state) if state.rc > 1 => {
                        state.rc -= 1;
                        false
                    }
                    Some(state) => {
                        state.rc = 0;
                        true
                    }
                    None => {
                        debug!("release on closed database");
                        false
                    }
                }
            };
            if reached_zero {
                let inner = Arc::clone(&inner);
                spawn_tracked(move || close(&inner));
            }
        });
    }

    fn retain_count(&self) -> u32 {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue_sync(move || {
            inner
                .state
                .lock()
                .expect("database state lock poisoned")
                .as_ref()
                .map(|state| state.rc)
                .unwrap_or(0)
        })
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Database({})", self.inner.path.display())
    }
}

/// Background task flushing and closing the chunks exactly once.
fn close(inner: &Arc<DatabaseInner>) {
    let taken = inner
        .state
        .lock()
        .expect("database state lock poisoned")
        .take();
    let Some(state) = taken else {
        return;
    };
    if let Err(err) = state.write_chunk.flush() {
        error!(path = %inner.path.display(), %err, "flush on database close failed");
    }
    debug!(path = %inner.path.display(), "database closed");
    // Dropping the state releases the chunk handles; mappings unmap once
    // the last object payload view is gone as well.
}

/// Open a chunk, escalating a format version mismatch.
fn open_chunk(
    dir: &Path,
    id: ChunkId,
    mode: ChunkMode,
    config: &ChunkConfig,
) -> StoreResult<Chunk> {
    match Chunk::open_or_create(dir, id, mode, config) {
        Ok(chunk) => Ok(chunk),
        Err(err @ ChunkError::VersionMismatch { .. }) => {
            // The chunk format has no migration path; a mismatch means this
            // build must not touch the store at all.
            error!(chunk = %id, %err, "chunk format is incompatible; aborting");
            panic!("loam: {err}");
        }
        Err(err) => {
            error!(chunk = %id, %err, "could not open chunk");
            Err(err.into())
        }
    }
}
