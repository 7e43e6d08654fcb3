use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use loam_dispatch::{spawn_tracked, SerialQueue};
use loam_types::ObjectId;

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::handle::Managed;
use crate::names;
use crate::object::Object;

/// Size of the on-disk root record: an [`ObjectId`] plus a CRC32.
const RECORD_SIZE: usize = ObjectId::SIZE + 4;

/// A named, durable pointer to the current top object of a graph.
///
/// A root is either *unbound* (fresh, or after [`delete`](Root::delete)) or
/// *bound* to one persisted object id. The binding lives in a tiny record
/// file under the database's `index/` directory, rewritten and fsynced on
/// every change, so it survives process restarts; the file name is a digest
/// of the root's name.
///
/// All transitions run on the root's serial queue, serializing concurrent
/// get/set/delete. Each operation has a synchronous variant (blocks until
/// durable) and an asynchronous one (returns immediately, observable via
/// [`loam_dispatch::wait_for_completion`]).
#[derive(Clone)]
pub struct Root {
    inner: Arc<RootInner>,
}

struct RootInner {
    name: String,
    path: PathBuf,
    queue: SerialQueue,
    state: Mutex<Option<RootState>>,
}

struct RootState {
    rc: u32,
    db: Database,
    bound: Option<ObjectId>,
    /// Retained handle to the currently bound object, once materialized.
    cached: Option<Object>,
}

impl Root {
    /// Open the root `name`, loading its persisted binding if any.
    pub(crate) fn open(db: Database, name: &str) -> StoreResult<Root> {
        let path = db.path().join("index").join(names::root_key(name));
        let bound = read_record(&path)?;
        db.retain();
        debug!(root = name, bound = ?bound, "root handle opened");
        Ok(Root {
            inner: Arc::new(RootInner {
                name: name.to_string(),
                path,
                queue: SerialQueue::new("root"),
                state: Mutex::new(Some(RootState {
                    rc: 1,
                    db,
                    bound,
                    cached: None,
                })),
            }),
        })
    }

    /// The root's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound object, retained for the caller, or `None` when unbound.
    ///
    /// The first call after open reads the object from the database and
    /// caches the handle; later calls return the cached instance.
    pub fn get(&self) -> Option<Object> {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue_sync(move || get_task(&inner))
    }

    /// Asynchronous [`get`](Root::get): `f` receives the retained handle
    /// (or `None`) on the root's queue.
    pub fn get_async(&self, f: impl FnOnce(Option<Object>) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || f(get_task(&inner)));
    }

    /// Bind `obj` as the root object, persisting it first.
    ///
    /// A no-op when `obj` is already the bound object. Otherwise the whole
    /// graph under `obj` is written through the database, the root record
    /// is durably rewritten, and the cached retain moves to `obj`. Blocks
    /// until the record is on stable storage.
    pub fn set(&self, obj: &Object) -> StoreResult<()> {
        let inner = Arc::clone(&self.inner);
        let obj = obj.clone();
        self.inner.queue.enqueue_sync(move || set_task(&inner, &obj))
    }

    /// Asynchronous [`set`](Root::set); failures are logged. Completion is
    /// observable through [`loam_dispatch::wait_for_completion`].
    pub fn set_async(&self, obj: &Object) {
        let inner = Arc::clone(&self.inner);
        let obj = obj.clone();
        self.inner.queue.enqueue(move || {
            if let Err(err) = set_task(&inner, &obj) {
                error!(root = %inner.name, %err, "asynchronous root update failed");
            }
        });
    }

    /// Unbind the root, durably recording the unbound state.
    pub fn delete(&self) -> StoreResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue_sync(move || delete_task(&inner))
    }

    /// Asynchronous [`delete`](Root::delete); failures are logged.
    pub fn delete_async(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            if let Err(err) = delete_task(&inner) {
                error!(root = %inner.name, %err, "asynchronous root delete failed");
            }
        });
    }

    fn lock_state(inner: &RootInner) -> std::sync::MutexGuard<'_, Option<RootState>> {
        inner.state.lock().expect("root state lock poisoned")
    }
}

impl Managed for Root {
    fn retain(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            match Root::lock_state(&inner).as_mut() {
                Some(state) => state.rc += 1,
                None => debug!("retain on torn-down root"),
            }
        });
    }

    fn release(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            let reached_zero = {
                let mut guard = Root::lock_state(&inner);
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
                        debug!("release on torn-down root");
                        false
                    }
                }
            };
            if reached_zero {
                let inner = Arc::clone(&inner);
                spawn_tracked(move || teardown(&inner));
            }
        });
    }

    fn retain_count(&self) -> u32 {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue_sync(move || {
            Root::lock_state(&inner)
                .as_ref()
                .map(|state| state.rc)
                .unwrap_or(0)
        })
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root({})", self.inner.name)
    }
}

/// Background task releasing the cached object and the database handle.
fn teardown(inner: &Arc<RootInner>) {
    let taken = Root::lock_state(inner).take();
    let Some(state) = taken else {
        return;
    };
    if let Some(cached) = &state.cached {
        cached.release();
    }
    state.db.release();
    debug!(root = %inner.name, "root handle torn down");
}

/// Queue task materializing and returning the bound object.
fn get_task(inner: &Arc<RootInner>) -> Option<Object> {
    let mut guard = Root::lock_state(inner);
    let Some(state) = guard.as_mut() else {
        debug!("get on torn-down root");
        return None;
    };
    if state.cached.is_none() {
        let id = state.bound?;
        match state.db.read_object(id) {
            Ok(obj) => state.cached = Some(obj),
            Err(err) => {
                error!(root = %inner.name, object = %id, %err, "could not read root object");
                return None;
            }
        }
    }
    let obj = state.cached.clone()?;
    // The cache keeps its own retain; the caller gets one of their own.
    obj.retain();
    debug!(root = %inner.name, object = ?obj.id(), "root object handed out");
    Some(obj)
}

/// Queue task binding a new root object.
fn set_task(inner: &Arc<RootInner>, obj: &Object) -> StoreResult<()> {
    let db = {
        let guard = Root::lock_state(inner);
        let Some(state) = guard.as_ref() else {
            return Err(StoreError::Defunct);
        };
        let already_bound = match &state.cached {
            Some(current) => current.same(obj),
            None => state.bound.is_some() && state.bound == obj.id(),
        };
        if already_bound {
            debug!(root = %inner.name, "object is already the bound root");
            return Ok(());
        }
        state.db.clone()
    };

    // Persist the graph and the record before touching the binding, so a
    // failure leaves the previous state intact.
    let id = db.write_object(obj)?;
    write_record(&inner.path, id)?;

    let mut guard = Root::lock_state(inner);
    let Some(state) = guard.as_mut() else {
        return Err(StoreError::Defunct);
    };
    if let Some(previous) = state.cached.take() {
        previous.release();
    }
    obj.retain();
    state.cached = Some(obj.clone());
    state.bound = Some(id);
    info!(root = %inner.name, object = %id, "root updated");
    Ok(())
}

/// Queue task unbinding the root.
fn delete_task(inner: &Arc<RootInner>) -> StoreResult<()> {
    if Root::lock_state(inner).is_none() {
        return Err(StoreError::Defunct);
    }

    // Record the unbound state before touching the binding, so a failure
    // leaves the previous state intact.
    write_record(&inner.path, ObjectId::UNBOUND)?;

    let mut guard = Root::lock_state(inner);
    let Some(state) = guard.as_mut() else {
        return Err(StoreError::Defunct);
    };
    if let Some(previous) = state.cached.take() {
        previous.release();
    }
    state.bound = None;
    info!(root = %inner.name, "root deleted");
    Ok(())
}

/// Load the persisted binding: `Ok(None)` for a missing file or the unbound
/// sentinel, an error for a record that fails validation.
fn read_record(path: &Path) -> StoreResult<Option<ObjectId>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if data.len() != RECORD_SIZE {
        return Err(StoreError::CorruptRoot {
            path: path.to_path_buf(),
            reason: format!("{} bytes, expected {RECORD_SIZE}", data.len()),
        });
    }
    let id_bytes: [u8; ObjectId::SIZE] = data[..ObjectId::SIZE]
        .try_into()
        .expect("record size checked above");
    let stored = u32::from_le_bytes(
        data[ObjectId::SIZE..]
            .try_into()
            .expect("record size checked above"),
    );
    let actual = crc32fast::hash(&id_bytes);
    if stored != actual {
        return Err(StoreError::CorruptRoot {
            path: path.to_path_buf(),
            reason: format!("checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"),
        });
    }
    let id = ObjectId::from_bytes(id_bytes);
    Ok(if id.is_unbound() { None } else { Some(id) })
}

/// Durably overwrite the root record with `id` (fsynced before returning).
fn write_record(path: &Path, id: ObjectId) -> StoreResult<()> {
    let mut data = [0u8; RECORD_SIZE];
    let id_bytes = id.to_bytes();
    data[..ObjectId::SIZE].copy_from_slice(&id_bytes);
    data[ObjectId::SIZE..].copy_from_slice(&crc32fast::hash(&id_bytes).to_le_bytes());

    let mut file = fs::File::create(path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    Ok(())
}
