use uuid::Uuid;
use weft_types::ObjectId;

use crate::error::StoreResult;
use crate::types::{
    Anchor, ContainerHandle, KeyDescriptor, ObjectHandle, PoolHandle, PoolInfo, TxHandle,
};

/// Key-value object store.
///
/// Every method is one store primitive. The orchestration layer issues
/// them from inside engine tasks and never assumes anything about their
/// cost beyond "returns without waiting on other tasks".
///
/// Implementations must satisfy these invariants:
/// - Handles are never reused while open, and `0` is never a valid handle.
/// - Writes made under a transaction become visible to others only on
///   [`tx_commit`](KvStore::tx_commit).
/// - Listing returns keys in ascending byte order, each key exactly once
///   across the pages of one anchor.
pub trait KvStore: Send + Sync {
    /// Connect to a pool through the named server group.
    fn pool_connect(&self, pool: Uuid, group: &str) -> StoreResult<PoolHandle>;

    fn pool_disconnect(&self, poh: PoolHandle) -> StoreResult<()>;

    fn pool_query(&self, poh: PoolHandle) -> StoreResult<PoolInfo>;

    /// Open a container by label, creating it first when `create` is set.
    fn cont_open(&self, poh: PoolHandle, label: &str, create: bool)
        -> StoreResult<ContainerHandle>;

    fn cont_close(&self, coh: ContainerHandle) -> StoreResult<()>;

    /// Reserve `count` consecutive object indices; returns the first one.
    fn alloc_oids(&self, coh: ContainerHandle, count: u64) -> StoreResult<u64>;

    fn tx_open(&self, coh: ContainerHandle) -> StoreResult<TxHandle>;

    fn tx_commit(&self, th: TxHandle) -> StoreResult<()>;

    fn tx_abort(&self, th: TxHandle) -> StoreResult<()>;

    /// Release a transaction handle. Uncommitted writes are discarded.
    fn tx_close(&self, th: TxHandle) -> StoreResult<()>;

    fn obj_open(&self, coh: ContainerHandle, oid: ObjectId) -> StoreResult<ObjectHandle>;

    fn obj_close(&self, oh: ObjectHandle) -> StoreResult<()>;

    /// Write `records` (akey, value) under `dkey`.
    fn update(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        dkey: &[u8],
        records: &[(Vec<u8>, Vec<u8>)],
    ) -> StoreResult<()>;

    /// Size of the value at `dkey`/`akey`, or `None` if absent.
    fn fetch_size(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        dkey: &[u8],
        akey: &[u8],
    ) -> StoreResult<Option<usize>>;

    /// The value at `dkey`/`akey`, or `None` if absent.
    fn fetch(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        dkey: &[u8],
        akey: &[u8],
    ) -> StoreResult<Option<Vec<u8>>>;

    /// List up to `max` dkeys after `anchor`, packed back to back into `buf`.
    fn list_dkeys(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        anchor: &mut Anchor,
        max: usize,
        buf: &mut [u8],
    ) -> StoreResult<Vec<KeyDescriptor>>;

    /// List up to `max` akeys of `dkey` after `anchor`, packed into `buf`.
    fn list_akeys(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        dkey: &[u8],
        anchor: &mut Anchor,
        max: usize,
        buf: &mut [u8],
    ) -> StoreResult<Vec<KeyDescriptor>>;
}
