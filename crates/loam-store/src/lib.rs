//! Embedded persistent object store: immutable payload blobs linked into
//! graphs by ordered references, appended to memory-mapped chunk files,
//! with lazy reference resolution and named durable root pointers.
//!
//! # Model
//!
//! - [`Object`]: an immutable payload plus ordered references to other
//!   objects, reference-counted through its own serial queue. Transient
//!   until written, persisted (addressable by [`ObjectId`]) afterwards.
//! - [`Database`]: owns the chunk files of one store directory and
//!   mediates all object reads and writes. Writing an object first writes
//!   every not-yet-persisted descendant (bottom-up, siblings in parallel,
//!   each object exactly once).
//! - [`Root`]: a named durable pointer to the current top object of a
//!   graph; the entry point for readers after a restart.
//!
//! # Design rules
//!
//! 1. Records are write-once: payload bytes and reference ids never change
//!    after persistence. Reads are zero-copy views into the mapping.
//! 2. Every entity's state is mutated only on its own serial queue; no
//!    global lock. Retain/release return immediately.
//! 3. Teardown at retain count zero is deferred to a background task;
//!    [`wait_for_completion`] is the barrier that observes it.
//! 4. Failures surface as absent results or typed errors; only an
//!    incompatible chunk format aborts.
//!
//! ```no_run
//! use loam_store::{Database, Managed, Object, wait_for_completion};
//!
//! let db = Database::open("./example.db")?;
//! let root = db.root("index")?;
//!
//! let leaf = Object::new("payload bytes", &[])?;
//! let top = Object::new("list head", &[leaf.clone()])?;
//! root.set(&top)?;
//!
//! leaf.release();
//! top.release();
//! root.release();
//! db.release();
//! wait_for_completion();
//! # Ok::<(), loam_store::StoreError>(())
//! ```

pub mod database;
pub mod error;
pub mod handle;
mod names;
pub mod object;
pub mod root;

pub use database::{Database, DatabaseConfig, DATABASE_VERSION};
pub use error::{StoreError, StoreResult};
pub use handle::Managed;
pub use object::{Object, MAX_REFERENCES};
pub use root::Root;

// The pieces of the lower layers that appear in this crate's public API.
pub use loam_chunk::ChunkConfig;
pub use loam_dispatch::wait_for_completion;
pub use loam_types::{ChunkId, ObjectId};
