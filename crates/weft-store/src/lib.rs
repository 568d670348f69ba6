//! Key-value object store binding for Weft.
//!
//! The connector never talks to storage directly; every primitive it issues
//! goes through the [`KvStore`] trait. Objects hold a two-level key space:
//! distribution keys (dkeys) each holding attribute keys (akeys) that map to
//! opaque values.
//!
//! # Storage Backends
//!
//! - [`InMemoryKvStore`] -- `HashMap`/`BTreeMap`-based store for tests and
//!   the `weft` demo binary, with one-shot fault injection and per-operation
//!   issue counters.
//!
//! # Design Rules
//!
//! 1. Writes issued under a transaction are invisible to other transactions
//!    until commit, and are discarded on abort.
//! 2. A transaction handle must be closed exactly once, after commit or abort.
//! 3. Listing is resumable: an [`Anchor`] records where the previous page
//!    stopped.
//! 4. A page whose first key does not fit the caller's buffer fails with
//!    [`StoreError::KeyTooBig`] so the caller can grow the buffer and retry.

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryKvStore;
pub use traits::KvStore;
pub use types::{
    Anchor, ContainerHandle, KeyDescriptor, ObjectHandle, PoolHandle, PoolInfo, StoreOp, TxHandle,
};
