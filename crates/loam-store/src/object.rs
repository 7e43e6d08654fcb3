use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, error};

use loam_chunk::ChunkSlice;
use loam_dispatch::{spawn_tracked, SerialQueue};
use loam_types::ObjectId;

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::handle::Managed;

/// Maximum number of references one object may hold.
pub const MAX_REFERENCES: usize = u16::MAX as usize;

/// Handle to an immutable payload blob plus ordered references to other
/// objects.
///
/// An object is *transient* (in-memory only, freshly built with
/// [`Object::new`]) until it is written through a database, after which it
/// is *persisted*: it has a durable [`ObjectId`], its payload bytes live in
/// the chunk's mapping, and its references resolve lazily on first access.
/// Payload and references never change once the object exists.
///
/// Handles are cheap to clone; the logical lifetime is governed by the
/// retain count ([`Managed`]). When the count reaches zero a background
/// task releases the cached referenced objects, the database handle, and
/// the payload storage; later operations through surviving clones yield
/// absent results.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

struct ObjectInner {
    queue: SerialQueue,
    /// Guards the persist path so racing writers store the object once.
    write_gate: Mutex<()>,
    /// `None` once the retain count has reached zero and teardown ran.
    state: Mutex<Option<ObjectState>>,
}

struct ObjectState {
    rc: u32,
    payload: Payload,
    slots: Vec<RefSlot>,
    origin: Option<Origin>,
}

/// Where the payload bytes currently live.
#[derive(Clone)]
enum Payload {
    /// Heap buffer owned by the object until it is persisted.
    Inline(Bytes),
    /// Zero-copy view into the chunk holding the persisted record.
    Mapped(ChunkSlice),
}

/// Binding of a persisted object to its database.
struct Origin {
    db: Database,
    id: ObjectId,
}

/// One reference slot: the child's persisted id (if known) and the
/// lazily-populated handle cache.
struct RefSlot {
    id: Option<ObjectId>,
    cached: Option<Object>,
}

impl Object {
    /// Create a transient object from payload bytes and references.
    ///
    /// The references are retained immediately; the new object starts with
    /// a retain count of 1. Fails if more than [`MAX_REFERENCES`] references
    /// are given.
    pub fn new(payload: impl Into<Bytes>, references: &[Object]) -> StoreResult<Object> {
        if references.len() > MAX_REFERENCES {
            return Err(StoreError::TooManyReferences(references.len()));
        }
        let slots = references
            .iter()
            .map(|child| {
                child.retain();
                RefSlot {
                    id: None,
                    cached: Some(child.clone()),
                }
            })
            .collect();
        debug!(references = references.len(), "transient object created");
        Ok(Self::from_state(ObjectState {
            rc: 1,
            payload: Payload::Inline(payload.into()),
            slots,
            origin: None,
        }))
    }

    /// Materialize a persisted object from a chunk record.
    ///
    /// References stay unresolved until first navigation. The database
    /// handle is retained for the object's lifetime; the payload view keeps
    /// the backing chunk mapped.
    pub(crate) fn unmarshal(
        db: Database,
        id: ObjectId,
        refs: Vec<ObjectId>,
        payload: ChunkSlice,
    ) -> Object {
        db.retain();
        let slots = refs
            .into_iter()
            .map(|child_id| RefSlot {
                id: Some(child_id),
                cached: None,
            })
            .collect();
        debug!(object = %id, "object unmarshalled");
        Self::from_state(ObjectState {
            rc: 1,
            payload: Payload::Mapped(payload),
            slots,
            origin: Some(Origin { db, id }),
        })
    }

    fn from_state(state: ObjectState) -> Object {
        Object {
            inner: Arc::new(ObjectInner {
                queue: SerialQueue::new("object"),
                write_gate: Mutex::new(()),
                state: Mutex::new(Some(state)),
            }),
        }
    }

    /// The durable id, if the object has been persisted.
    pub fn id(&self) -> Option<ObjectId> {
        self.lock_state()
            .as_ref()
            .and_then(|state| state.origin.as_ref().map(|origin| origin.id))
    }

    /// Returns `true` once the object has a durable id.
    pub fn is_persisted(&self) -> bool {
        self.id().is_some()
    }

    /// Identity check: `true` for the identical in-memory instance, or for
    /// two persisted objects with equal ids.
    pub fn same(&self, other: &Object) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Number of reference slots.
    pub fn num_references(&self) -> usize {
        self.lock_state()
            .as_ref()
            .map(|state| state.slots.len())
            .unwrap_or(0)
    }

    /// Resolve the reference at `index` without retaining it.
    ///
    /// The first access reads the referenced object from the database and
    /// caches the handle; later accesses (from any thread) hit the cache.
    /// The returned handle borrows the cache's retain; callers that keep
    /// it must retain it themselves or use [`reference`](Object::reference).
    /// An out-of-range index yields `None`.
    pub fn weak_reference(&self, index: usize) -> Option<Object> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue_sync(move || resolve_slot(&inner, index))
    }

    /// Resolve the reference at `index` and retain it for the caller.
    pub fn reference(&self, index: usize) -> Option<Object> {
        let child = self.weak_reference(index)?;
        child.retain();
        Some(child)
    }

    /// Apply `f` to the payload bytes.
    ///
    /// Returns `None` if the object has already been torn down. The bytes
    /// stay valid for the duration of the call regardless of concurrent
    /// releases: the closure operates on its own handle to the payload
    /// storage.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let payload = match self.lock_state().as_ref() {
            Some(state) => state.payload.clone(),
            None => {
                debug!("payload access on torn-down object");
                return None;
            }
        };
        Some(payload.apply(f))
    }

    /// Schedule `f` on the object's queue with scoped access to the payload
    /// bytes, returning immediately.
    ///
    /// Ordered after all previously enqueued operations on this object;
    /// observable through [`loam_dispatch::wait_for_completion`].
    pub fn with_payload_async(&self, f: impl FnOnce(&[u8]) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            let payload = match inner.state.lock().expect("object state lock poisoned").as_ref() {
                Some(state) => state.payload.clone(),
                None => {
                    debug!("payload access on torn-down object");
                    return;
                }
            };
            payload.apply(f);
        });
    }

    /// Payload length in bytes, or `None` after teardown.
    pub fn payload_len(&self) -> Option<usize> {
        self.lock_state().as_ref().map(|state| match &state.payload {
            Payload::Inline(bytes) => bytes.len(),
            Payload::Mapped(slice) => slice.len(),
        })
    }

    /// The gate serializing concurrent persist attempts.
    pub(crate) fn write_gate(&self) -> &Mutex<()> {
        &self.inner.write_gate
    }

    /// Payload bytes and per-slot `(id, handle)` pairs for the persist path.
    pub(crate) fn write_snapshot(
        &self,
    ) -> StoreResult<(Bytes, Vec<(Option<ObjectId>, Option<Object>)>)> {
        let guard = self.lock_state();
        let Some(state) = guard.as_ref() else {
            return Err(StoreError::Defunct);
        };
        let payload = match &state.payload {
            Payload::Inline(bytes) => bytes.clone(),
            // Persisted objects take the idempotent fast path before this
            // is reached; copying keeps the fallback correct regardless.
            Payload::Mapped(slice) => Bytes::from(slice.to_vec()),
        };
        let slots = state
            .slots
            .iter()
            .map(|slot| (slot.id, slot.cached.clone()))
            .collect();
        Ok((payload, slots))
    }

    /// Record the assigned id, repoint the payload into the chunk mapping,
    /// and fill in the reference ids. Runs on the object's queue.
    pub(crate) fn mark_persisted(
        &self,
        db: Database,
        id: ObjectId,
        payload: ChunkSlice,
        child_ids: Vec<ObjectId>,
    ) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue_sync(move || {
            let mut guard = inner.state.lock().expect("object state lock poisoned");
            let Some(state) = guard.as_mut() else {
                debug!(object = %id, "object torn down during write");
                return;
            };
            db.retain();
            state.origin = Some(Origin { db, id });
            // The transient buffer is dropped here; reads now come straight
            // from the mapping, tying the object's lifetime to the chunk's.
            state.payload = Payload::Mapped(payload);
            for (slot, child_id) in state.slots.iter_mut().zip(child_ids) {
                slot.id = Some(child_id);
            }
            debug!(object = %id, "object persisted");
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<ObjectState>> {
        self.inner.state.lock().expect("object state lock poisoned")
    }
}

impl Payload {
    fn apply<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            Payload::Inline(bytes) => f(bytes),
            Payload::Mapped(slice) => slice.read(f),
        }
    }
}

impl Managed for Object {
    fn retain(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            match inner.state.lock().expect("object state lock poisoned").as_mut() {
                Some(state) => state.rc += 1,
                None => debug!("retain on torn-down object"),
            }
        });
    }

    fn release(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || release_task(&inner));
    }

    fn retain_count(&self) -> u32 {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue_sync(move || {
            inner
                .state
                .lock()
                .expect("object state lock poisoned")
                .as_ref()
                .map(|state| state.rc)
                .unwrap_or(0)
        })
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "Object({id})"),
            None => write!(f, "Object(transient)"),
        }
    }
}

/// Queue task applying one release.
fn release_task(inner: &Arc<ObjectInner>) {
    let reached_zero = {
        let mut guard = inner.state.lock().expect("object state lock poisoned");
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
                debug!("release on torn-down object");
                false
            }
        }
    };
    if reached_zero {
        // Teardown runs on a background task, not inline: it releases other
        // entities, which would re-enter their queues from this one.
        let inner = Arc::clone(inner);
        spawn_tracked(move || teardown(&inner));
    }
}

/// Background task freeing the object's resources exactly once.
fn teardown(inner: &Arc<ObjectInner>) {
    let taken = inner
        .state
        .lock()
        .expect("object state lock poisoned")
        .take();
    let Some(state) = taken else {
        return;
    };
    for slot in &state.slots {
        if let Some(child) = &slot.cached {
            child.release();
        }
    }
    match &state.origin {
        Some(origin) => {
            origin.db.release();
            debug!(object = %origin.id, "persisted object torn down");
        }
        None => debug!("transient object torn down"),
    }
    // Dropping the state frees the payload buffer or the chunk view.
}

/// Queue task resolving (and caching) one reference slot.
fn resolve_slot(inner: &Arc<ObjectInner>, index: usize) -> Option<Object> {
    let (child_id, db) = {
        let guard = inner.state.lock().expect("object state lock poisoned");
        let Some(state) = guard.as_ref() else {
            debug!("reference access on torn-down object");
            return None;
        };
        let Some(slot) = state.slots.get(index) else {
            debug!(
                index,
                num_references = state.slots.len(),
                "reference index out of range"
            );
            return None;
        };
        if let Some(child) = &slot.cached {
            return Some(child.clone());
        }
        let Some(child_id) = slot.id else {
            debug!(index, "reference slot holds neither a handle nor an id");
            return None;
        };
        let Some(origin) = &state.origin else {
            debug!(index, "reference id without a database");
            return None;
        };
        (child_id, origin.db.clone())
    };

    match db.read_object(child_id) {
        Ok(child) => {
            let mut guard = inner.state.lock().expect("object state lock poisoned");
            match guard.as_mut() {
                Some(state) => state.slots[index].cached = Some(child.clone()),
                // Torn down while reading; balance the fresh handle's count.
                None => child.release(),
            }
            Some(child)
        }
        Err(err) => {
            error!(object = %child_id, %err, "could not read referenced object");
            None
        }
    }
}
