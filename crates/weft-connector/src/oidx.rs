//! Object index leases and identifier generation.
//!
//! Indices come from the store in batches. Each file keeps a local lease
//! per collectiveness class and only goes back to the store once the lease
//! is used up. A collective replenishment is performed by the coordinator
//! and broadcast, so every participant holds the same lease window.

use std::sync::Arc;

use tracing::debug;
use weft_engine::{Run, TaskContext, TaskOps};
use weft_types::{FailureCode, ObjectClass, ObjectId, ObjectKind, TaskError, TaskResult};

use crate::bcast::{broadcast, BroadcastPayload};
use crate::chain::Chain;
use crate::error::ConnectorResult;
use crate::file::FileContext;
use crate::request::{Request, RequestRef};
use crate::slot::Slot;
use crate::steps::store_failure;

/// Indices requested from the store per replenishment.
pub const OIDX_BATCH: u64 = 1024;

/// Indices below this value are reserved for the container itself.
pub const FIRST_USER_INDEX: u64 = 3;

/// Flag word of a lease broadcast carrying a batch start.
const LEASE_GRANTED: u64 = 0;

/// Flag word telling receivers the coordinator could not replenish.
const LEASE_FAILED: u64 = 1;

/// A locally held range `next..=max` of unused indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Lease {
    next: u64,
    max: u64,
}

impl Lease {
    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.max == 0 || self.next > self.max
    }

    /// Install a fresh batch starting at `start`, skipping reserved indices.
    ///
    /// Returns `false` and leaves the lease untouched when the batch would
    /// run past the index space.
    pub fn replenish(&mut self, start: u64) -> bool {
        let Some(end) = start.checked_add(OIDX_BATCH) else {
            return false;
        };
        self.next = start.max(FIRST_USER_INDEX);
        self.max = end - 1;
        true
    }

    pub fn take(&mut self) -> Option<u64> {
        if self.is_exhausted() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(index)
    }
}

fn replenish_and_take(file: &FileContext, collective: bool, start: u64) -> Option<u64> {
    file.with_lease(collective, |lease| {
        if !lease.replenish(start) {
            debug!(start, "index batch overflows the index space");
            return None;
        }
        lease.take()
    })
}

struct AllocOids {
    req: RequestRef,
    collective: bool,
    /// First index of the new batch, for the broadcast that follows.
    start: Slot<u64>,
    /// Set when no broadcast follows and the index is taken here.
    out: Option<Slot<u64>>,
}

impl TaskOps for AllocOids {
    fn name(&self) -> &str {
        "object index allocation"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let file = self.req.file();
        match file.store().alloc_oids(file.container(), OIDX_BATCH) {
            Ok(start) => {
                debug!(start, collective = self.collective, "reserved index batch");
                self.start.set(start);
                Run::Done(Ok(()))
            }
            Err(err) => Run::Done(Err(store_failure(&err))),
        }
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        if result.is_ok() {
            if let (Some(out), Some(start)) = (&self.out, self.start.get()) {
                match replenish_and_take(self.req.file(), self.collective, start) {
                    Some(index) => out.set(index),
                    None => {
                        self.req.record_failure(FailureCode::Resource, self.name());
                    }
                }
            }
        }
        self.req.record_result(result, self.name());
    }
}

struct LeaseBroadcast {
    start: Slot<u64>,
    out: Slot<u64>,
}

impl BroadcastPayload for LeaseBroadcast {
    fn name(&self) -> &str {
        "object index lease broadcast"
    }

    /// Two little-endian words: the flag, then the batch start.
    fn outgoing(&mut self, _req: &Request, root: bool) -> Option<Vec<u8>> {
        let (flag, start) = match (root, self.start.get()) {
            (true, Some(start)) => (LEASE_GRANTED, start),
            (true, None) => (LEASE_FAILED, 0),
            (false, _) => (0, 0),
        };
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&flag.to_le_bytes());
        buf.extend_from_slice(&start.to_le_bytes());
        Some(buf)
    }

    fn received(&mut self, req: &Request, buf: Vec<u8>, root: bool) -> TaskResult {
        if buf.len() != 16 {
            return Err(TaskError::Failed(FailureCode::Truncated));
        }
        let mut flag = [0u8; 8];
        let mut start = [0u8; 8];
        flag.copy_from_slice(&buf[..8]);
        start.copy_from_slice(&buf[8..]);
        let (flag, start) = (u64::from_le_bytes(flag), u64::from_le_bytes(start));
        match flag {
            LEASE_GRANTED => {}
            // The coordinator recorded its own failure already.
            LEASE_FAILED if root => return Ok(()),
            LEASE_FAILED => return Err(TaskError::Failed(FailureCode::Remote)),
            _ => return Err(TaskError::Failed(FailureCode::BadValue)),
        }
        let index = replenish_and_take(req.file(), true, start)
            .ok_or(TaskError::Failed(FailureCode::Resource))?;
        self.out.set(index);
        Ok(())
    }
}

/// Take the next index into `out`.
///
/// A lease with indices left is served while the chain is built. An
/// exhausted lease is replenished from the store first; when collective
/// with more than one participant, the coordinator replenishes and
/// broadcasts the batch start.
pub(crate) fn allocate_index(
    chain: &mut Chain,
    req: &Request,
    collective: bool,
    out: Slot<u64>,
) -> ConnectorResult<()> {
    let file = req.file().clone();
    if let Some(index) = file.with_lease(collective, Lease::take) {
        out.set(index);
        return Ok(());
    }

    let shared = collective && file.exec().comm().size() > 1;
    let start = Slot::new();
    if !shared || file.is_coordinator() {
        let out = (!shared).then(|| out.clone());
        let start = start.clone();
        chain.append(req, |req| {
            Box::new(AllocOids {
                req,
                collective,
                start,
                out,
            })
        })?;
    }
    if shared {
        broadcast(chain, req, Box::new(LeaseBroadcast { start, out }))?;
    }
    Ok(())
}

struct Encode {
    req: RequestRef,
    index: Slot<u64>,
    kind: ObjectKind,
    class: ObjectClass,
    out: Slot<ObjectId>,
}

impl TaskOps for Encode {
    fn name(&self) -> &str {
        "object identifier encode"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        match self.index.take() {
            Some(index) => {
                self.out.set(ObjectId::encode(index, self.kind, self.class));
                Run::Done(Ok(()))
            }
            None => Run::Done(Err(TaskError::Failed(FailureCode::BadValue))),
        }
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

/// Allocate an index and encode it as an identifier of `kind` into `out`.
///
/// The placement class is the first of `explicit`, `creation`, the
/// container default and the kind default.
pub(crate) fn generate_oid(
    chain: &mut Chain,
    req: &Request,
    kind: ObjectKind,
    explicit: Option<ObjectClass>,
    creation: Option<ObjectClass>,
    collective: bool,
    out: Slot<ObjectId>,
) -> ConnectorResult<()> {
    let class = req.file().resolver().resolve(kind, explicit, creation);
    let index = Slot::new();
    allocate_index(chain, req, collective, index.clone())?;

    // Served from the lease: nothing to wait for.
    if let Some(i) = index.get() {
        out.set(ObjectId::encode(i, kind, class));
        return Ok(());
    }
    chain.append(req, |req| {
        Box::new(Encode {
            req,
            index,
            kind,
            class,
            out,
        })
    })?;
    Ok(())
}

/// Encode an identifier from an index the caller already holds.
pub fn encode_oid(file: &Arc<FileContext>, index: u64, kind: ObjectKind, explicit: Option<ObjectClass>) -> ObjectId {
    ObjectId::encode(index, kind, file.resolver().resolve(kind, explicit, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ---- Lease arithmetic ----

    #[test]
    fn default_lease_is_exhausted() {
        assert!(Lease::default().is_exhausted());
        assert_eq!(Lease::default().take(), None);
    }

    #[test]
    fn first_batch_skips_reserved_indices() {
        let mut lease = Lease::default();
        assert!(lease.replenish(0));
        assert_eq!(lease.take(), Some(FIRST_USER_INDEX));
        assert_eq!(lease.max(), OIDX_BATCH - 1);
    }

    #[test]
    fn lease_runs_out_after_batch() {
        let mut lease = Lease::default();
        assert!(lease.replenish(OIDX_BATCH));
        let taken: Vec<_> = std::iter::from_fn(|| lease.take()).collect();
        assert_eq!(taken.len() as u64, OIDX_BATCH);
        assert_eq!(taken.first(), Some(&OIDX_BATCH));
        assert_eq!(taken.last(), Some(&(2 * OIDX_BATCH - 1)));
        assert!(lease.is_exhausted());
    }

    #[test]
    fn batch_past_index_space_is_refused() {
        let mut lease = Lease::default();
        assert!(!lease.replenish(u64::MAX - 10));
        assert!(lease.is_exhausted());

        // The last batch that fits ends one short of the top.
        assert!(lease.replenish(u64::MAX - OIDX_BATCH));
        assert_eq!(lease.max(), u64::MAX - 1);
        let last = std::iter::from_fn(|| lease.take()).last();
        assert_eq!(last, Some(u64::MAX - 1));
    }

    fn lease_words(flag: u64, start: u64) -> Vec<u8> {
        let mut buf = flag.to_le_bytes().to_vec();
        buf.extend_from_slice(&start.to_le_bytes());
        buf
    }

    #[test]
    fn lease_broadcast_flags_coordinator_failure() {
        let owner = Request::create(FileContext::detached(), "create");
        let mut payload = LeaseBroadcast {
            start: Slot::new(),
            out: Slot::new(),
        };
        assert_eq!(payload.outgoing(&owner, true), Some(lease_words(LEASE_FAILED, 0)));
        assert_eq!(payload.received(&owner, lease_words(LEASE_FAILED, 0), true), Ok(()));
        assert_eq!(
            payload.received(&owner, lease_words(LEASE_FAILED, 0), false),
            Err(TaskError::Failed(FailureCode::Remote))
        );
        assert!(!payload.out.is_set());
    }

    #[test]
    fn lease_broadcast_carries_any_start() {
        let owner = Request::create(FileContext::detached(), "create");
        let mut payload = LeaseBroadcast {
            start: Slot::filled(2 * OIDX_BATCH),
            out: Slot::new(),
        };
        let buf = payload.outgoing(&owner, true).unwrap();
        assert_eq!(buf, lease_words(LEASE_GRANTED, 2 * OIDX_BATCH));
        assert_eq!(payload.received(&owner, buf, false), Ok(()));
        assert_eq!(payload.out.get(), Some(2 * OIDX_BATCH));

        assert_eq!(
            payload.received(&owner, lease_words(LEASE_GRANTED, u64::MAX), false),
            Err(TaskError::Failed(FailureCode::Resource))
        );
        assert_eq!(
            payload.received(&owner, vec![0; 8], false),
            Err(TaskError::Failed(FailureCode::Truncated))
        );
    }

    proptest! {
        #[test]
        fn consecutive_batches_never_repeat(batches in 1usize..4, per_batch in 1u64..50) {
            let mut lease = Lease::default();
            let mut last = None;
            for b in 0..batches as u64 {
                prop_assert!(lease.replenish(b * OIDX_BATCH));
                for _ in 0..per_batch {
                    let index = lease.take().unwrap();
                    prop_assert!(last.map_or(true, |l| index > l));
                    last = Some(index);
                }
            }
        }
    }

    // ---- Encoding ----

    #[test]
    fn encode_uses_container_default_class() {
        let file = FileContext::detached();
        let oid = encode_oid(&file, 42, ObjectKind::Map, None);
        assert_eq!(oid.index(), 42);
        assert_eq!(oid.kind(), ObjectKind::Map);
        assert_eq!(oid.class_id(), ObjectKind::Map.default_class().id());

        let oid = encode_oid(&file, 42, ObjectKind::Map, Some(ObjectClass::S4));
        assert_eq!(oid.class_id(), ObjectClass::S4.id());
    }
}
