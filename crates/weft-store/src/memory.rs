use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

use tracing::debug;
use uuid::Uuid;
use weft_types::ObjectId;

use crate::error::{StoreError, StoreResult};
use crate::traits::KvStore;
use crate::types::{
    Anchor, ContainerHandle, KeyDescriptor, ObjectHandle, PoolHandle, PoolInfo, StoreOp, TxHandle,
};

/// dkey -> akey -> value.
type Records = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Default)]
struct Container {
    next_oid: u64,
    objects: HashMap<ObjectId, Records>,
}

#[derive(Default)]
struct Pool {
    containers: HashMap<String, Container>,
}

enum Handle {
    Pool {
        pool: Uuid,
        group: String,
    },
    Container {
        poh: u64,
        pool: Uuid,
        label: String,
    },
    Tx {
        coh: u64,
        open: bool,
        writes: HashMap<ObjectId, Records>,
    },
    Object {
        coh: u64,
        oid: ObjectId,
    },
}

struct State {
    pools: HashMap<Uuid, Pool>,
    handles: HashMap<u64, Handle>,
    next_handle: u64,
}

impl State {
    fn insert(&mut self, handle: Handle) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.handles.insert(raw, handle);
        raw
    }

    fn pool_of(&self, poh: PoolHandle) -> StoreResult<(Uuid, &str)> {
        match self.handles.get(&poh.0) {
            Some(Handle::Pool { pool, group }) => Ok((*pool, group.as_str())),
            _ => Err(invalid(PoolHandle::KIND, poh.0)),
        }
    }

    fn container_of(&self, coh: u64) -> StoreResult<(Uuid, &str)> {
        match self.handles.get(&coh) {
            Some(Handle::Container { pool, label, .. }) => Ok((*pool, label.as_str())),
            _ => Err(invalid(ContainerHandle::KIND, coh)),
        }
    }

    fn container_mut(&mut self, coh: u64) -> StoreResult<&mut Container> {
        let (pool, label) = self.container_of(coh)?;
        let label = label.to_string();
        self.pools
            .get_mut(&pool)
            .and_then(|p| p.containers.get_mut(&label))
            .ok_or(StoreError::ContainerNotFound(label))
    }

    fn object_of(&self, oh: ObjectHandle) -> StoreResult<(u64, ObjectId)> {
        match self.handles.get(&oh.0) {
            Some(Handle::Object { coh, oid }) => Ok((*coh, *oid)),
            _ => Err(invalid(ObjectHandle::KIND, oh.0)),
        }
    }

    /// Committed records of an object overlaid with the transaction's writes.
    fn view(&self, th: Option<TxHandle>, oh: ObjectHandle) -> StoreResult<Records> {
        let (coh, oid) = self.object_of(oh)?;
        let (pool, label) = self.container_of(coh)?;
        let mut records = self
            .pools
            .get(&pool)
            .and_then(|p| p.containers.get(label))
            .and_then(|c| c.objects.get(&oid))
            .cloned()
            .unwrap_or_default();
        if let Some(th) = th {
            match self.handles.get(&th.0) {
                Some(Handle::Tx { open: true, writes, .. }) => {
                    if let Some(pending) = writes.get(&oid) {
                        merge(&mut records, pending.clone());
                    }
                }
                Some(Handle::Tx { open: false, .. }) => return Err(StoreError::TxNotOpen(th.0)),
                _ => return Err(invalid(TxHandle::KIND, th.0)),
            }
        }
        Ok(records)
    }

    fn finish_tx(&mut self, th: TxHandle, commit: bool) -> StoreResult<()> {
        let (coh, writes) = match self.handles.get_mut(&th.0) {
            Some(Handle::Tx { coh, open, writes }) => {
                if !*open {
                    return Err(StoreError::TxNotOpen(th.0));
                }
                *open = false;
                (*coh, std::mem::take(writes))
            }
            _ => return Err(invalid(TxHandle::KIND, th.0)),
        };
        if commit {
            let container = self.container_mut(coh)?;
            for (oid, records) in writes {
                merge(container.objects.entry(oid).or_default(), records);
            }
        }
        Ok(())
    }
}

fn invalid(kind: &'static str, raw: u64) -> StoreError {
    StoreError::InvalidHandle { kind, raw }
}

fn merge(into: &mut Records, from: Records) {
    for (dkey, akeys) in from {
        into.entry(dkey).or_default().extend(akeys);
    }
}

/// Pack the keys that follow `anchor` into `buf`, at most `max` of them.
fn page(
    keys: BTreeSet<Vec<u8>>,
    anchor: &mut Anchor,
    max: usize,
    buf: &mut [u8],
) -> StoreResult<Vec<KeyDescriptor>> {
    let after = anchor.last_key().map(<[u8]>::to_vec);
    let mut remaining = keys
        .into_iter()
        .filter(|k| after.as_deref().map_or(true, |last| k.as_slice() > last))
        .peekable();

    let mut kds = Vec::new();
    let mut offset = 0;
    let mut last = None;
    while kds.len() < max {
        let Some(key) = remaining.peek() else { break };
        if offset + key.len() > buf.len() {
            if kds.is_empty() {
                return Err(StoreError::KeyTooBig {
                    required: key.len(),
                });
            }
            break;
        }
        buf[offset..offset + key.len()].copy_from_slice(key);
        offset += key.len();
        kds.push(KeyDescriptor { key_len: key.len() });
        last = remaining.next();
    }
    let eof = remaining.peek().is_none();
    anchor.advance(last, eof);
    Ok(kds)
}

/// In-memory key-value store.
///
/// Intended for tests and the demo binary. All state lives behind a
/// `RwLock`. Faults can be armed per operation kind and fire exactly once;
/// every call is counted whether or not it succeeds.
pub struct InMemoryKvStore {
    state: RwLock<State>,
    faults: Mutex<HashMap<StoreOp, (usize, u32)>>,
    issued: Mutex<HashMap<StoreOp, usize>>,
}

impl InMemoryKvStore {
    /// Create a store with no pools.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                pools: HashMap::new(),
                handles: HashMap::new(),
                next_handle: 0,
            }),
            faults: Mutex::new(HashMap::new()),
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store holding one empty pool.
    pub fn with_pool(pool: Uuid) -> Self {
        let store = Self::new();
        store.create_pool(pool);
        store
    }

    /// Create an empty pool. No-op if it already exists.
    pub fn create_pool(&self, pool: Uuid) {
        let mut state = self.state.write().expect("lock poisoned");
        state.pools.entry(pool).or_default();
    }

    /// Make the next call to `op` fail with store error `code`.
    pub fn inject_fault(&self, op: StoreOp, code: u32) {
        self.inject_fault_after(op, 0, code);
    }

    /// Let `skip` calls to `op` succeed, then fail the next one with `code`.
    pub fn inject_fault_after(&self, op: StoreOp, skip: usize, code: u32) {
        self.faults
            .lock()
            .expect("fault table poisoned")
            .insert(op, (skip, code));
    }

    /// Number of times `op` has been issued, including failed calls.
    pub fn issued(&self, op: StoreOp) -> usize {
        self.issued
            .lock()
            .expect("counter table poisoned")
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Number of handles of any kind that are still open.
    pub fn open_handles(&self) -> usize {
        self.state.read().expect("lock poisoned").handles.len()
    }

    /// Committed value at `oid`/`dkey`/`akey` in container `label`.
    pub fn committed_value(
        &self,
        pool: Uuid,
        label: &str,
        oid: ObjectId,
        dkey: &[u8],
        akey: &[u8],
    ) -> Option<Vec<u8>> {
        let state = self.state.read().expect("lock poisoned");
        state
            .pools
            .get(&pool)?
            .containers
            .get(label)?
            .objects
            .get(&oid)?
            .get(dkey)?
            .get(akey)
            .cloned()
    }

    fn enter(&self, op: StoreOp) -> StoreResult<()> {
        *self
            .issued
            .lock()
            .expect("counter table poisoned")
            .entry(op)
            .or_insert(0) += 1;

        let mut faults = self.faults.lock().expect("fault table poisoned");
        if let Some((skip, code)) = faults.get_mut(&op) {
            if *skip > 0 {
                *skip -= 1;
                return Ok(());
            }
            let code = *code;
            faults.remove(&op);
            debug!(%op, code, "injected store fault");
            return Err(StoreError::Injected { op, code });
        }
        Ok(())
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for InMemoryKvStore {
    fn pool_connect(&self, pool: Uuid, group: &str) -> StoreResult<PoolHandle> {
        self.enter(StoreOp::PoolConnect)?;
        let mut state = self.state.write().expect("lock poisoned");
        if !state.pools.contains_key(&pool) {
            return Err(StoreError::PoolNotFound(pool));
        }
        let raw = state.insert(Handle::Pool {
            pool,
            group: group.to_string(),
        });
        Ok(PoolHandle(raw))
    }

    fn pool_disconnect(&self, poh: PoolHandle) -> StoreResult<()> {
        self.enter(StoreOp::PoolDisconnect)?;
        let mut state = self.state.write().expect("lock poisoned");
        state.pool_of(poh)?;
        let busy = state
            .handles
            .values()
            .any(|h| matches!(h, Handle::Container { poh: p, .. } if *p == poh.0));
        if busy {
            return Err(StoreError::Busy {
                kind: PoolHandle::KIND,
                raw: poh.0,
            });
        }
        state.handles.remove(&poh.0);
        Ok(())
    }

    fn pool_query(&self, poh: PoolHandle) -> StoreResult<PoolInfo> {
        self.enter(StoreOp::PoolQuery)?;
        let state = self.state.read().expect("lock poisoned");
        let (uuid, group) = state.pool_of(poh)?;
        let containers = state.pools.get(&uuid).map_or(0, |p| p.containers.len());
        let connections = state
            .handles
            .values()
            .filter(|h| matches!(h, Handle::Pool { pool, .. } if *pool == uuid))
            .count();
        Ok(PoolInfo {
            uuid,
            group: group.to_string(),
            containers,
            connections,
        })
    }

    fn cont_open(
        &self,
        poh: PoolHandle,
        label: &str,
        create: bool,
    ) -> StoreResult<ContainerHandle> {
        self.enter(StoreOp::ContainerOpen)?;
        let mut state = self.state.write().expect("lock poisoned");
        let (pool, _) = state.pool_of(poh)?;
        let containers = &mut state
            .pools
            .get_mut(&pool)
            .ok_or(StoreError::PoolNotFound(pool))?
            .containers;
        if !containers.contains_key(label) {
            if !create {
                return Err(StoreError::ContainerNotFound(label.to_string()));
            }
            containers.insert(label.to_string(), Container::default());
        }
        let raw = state.insert(Handle::Container {
            poh: poh.0,
            pool,
            label: label.to_string(),
        });
        Ok(ContainerHandle(raw))
    }

    fn cont_close(&self, coh: ContainerHandle) -> StoreResult<()> {
        self.enter(StoreOp::ContainerClose)?;
        let mut state = self.state.write().expect("lock poisoned");
        state.container_of(coh.0)?;
        state.handles.remove(&coh.0);
        Ok(())
    }

    fn alloc_oids(&self, coh: ContainerHandle, count: u64) -> StoreResult<u64> {
        self.enter(StoreOp::AllocOids)?;
        let mut state = self.state.write().expect("lock poisoned");
        let container = state.container_mut(coh.0)?;
        let start = container.next_oid;
        container.next_oid += count;
        Ok(start)
    }

    fn tx_open(&self, coh: ContainerHandle) -> StoreResult<TxHandle> {
        self.enter(StoreOp::TxOpen)?;
        let mut state = self.state.write().expect("lock poisoned");
        state.container_of(coh.0)?;
        let raw = state.insert(Handle::Tx {
            coh: coh.0,
            open: true,
            writes: HashMap::new(),
        });
        Ok(TxHandle(raw))
    }

    fn tx_commit(&self, th: TxHandle) -> StoreResult<()> {
        self.enter(StoreOp::TxCommit)?;
        self.state
            .write()
            .expect("lock poisoned")
            .finish_tx(th, true)
    }

    fn tx_abort(&self, th: TxHandle) -> StoreResult<()> {
        self.enter(StoreOp::TxAbort)?;
        self.state
            .write()
            .expect("lock poisoned")
            .finish_tx(th, false)
    }

    fn tx_close(&self, th: TxHandle) -> StoreResult<()> {
        self.enter(StoreOp::TxClose)?;
        let mut state = self.state.write().expect("lock poisoned");
        match state.handles.get(&th.0) {
            Some(Handle::Tx { .. }) => {
                state.handles.remove(&th.0);
                Ok(())
            }
            _ => Err(invalid(TxHandle::KIND, th.0)),
        }
    }

    fn obj_open(&self, coh: ContainerHandle, oid: ObjectId) -> StoreResult<ObjectHandle> {
        self.enter(StoreOp::ObjectOpen)?;
        let mut state = self.state.write().expect("lock poisoned");
        state.container_of(coh.0)?;
        let raw = state.insert(Handle::Object { coh: coh.0, oid });
        Ok(ObjectHandle(raw))
    }

    fn obj_close(&self, oh: ObjectHandle) -> StoreResult<()> {
        self.enter(StoreOp::ObjectClose)?;
        let mut state = self.state.write().expect("lock poisoned");
        state.object_of(oh)?;
        state.handles.remove(&oh.0);
        Ok(())
    }

    fn update(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        dkey: &[u8],
        records: &[(Vec<u8>, Vec<u8>)],
    ) -> StoreResult<()> {
        self.enter(StoreOp::Update)?;
        let mut state = self.state.write().expect("lock poisoned");
        let (coh, oid) = state.object_of(oh)?;
        let mut batch = Records::new();
        batch
            .entry(dkey.to_vec())
            .or_default()
            .extend(records.iter().cloned());

        match th {
            Some(th) => match state.handles.get_mut(&th.0) {
                Some(Handle::Tx {
                    open: true, writes, ..
                }) => {
                    merge(writes.entry(oid).or_default(), batch);
                    Ok(())
                }
                Some(Handle::Tx { open: false, .. }) => Err(StoreError::TxNotOpen(th.0)),
                _ => Err(invalid(TxHandle::KIND, th.0)),
            },
            None => {
                let container = state.container_mut(coh)?;
                merge(container.objects.entry(oid).or_default(), batch);
                Ok(())
            }
        }
    }

    fn fetch_size(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        dkey: &[u8],
        akey: &[u8],
    ) -> StoreResult<Option<usize>> {
        self.enter(StoreOp::FetchSize)?;
        let state = self.state.read().expect("lock poisoned");
        let records = state.view(th, oh)?;
        Ok(records.get(dkey).and_then(|a| a.get(akey)).map(Vec::len))
    }

    fn fetch(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        dkey: &[u8],
        akey: &[u8],
    ) -> StoreResult<Option<Vec<u8>>> {
        self.enter(StoreOp::Fetch)?;
        let state = self.state.read().expect("lock poisoned");
        let records = state.view(th, oh)?;
        Ok(records.get(dkey).and_then(|a| a.get(akey)).cloned())
    }

    fn list_dkeys(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        anchor: &mut Anchor,
        max: usize,
        buf: &mut [u8],
    ) -> StoreResult<Vec<KeyDescriptor>> {
        self.enter(StoreOp::ListDkeys)?;
        let state = self.state.read().expect("lock poisoned");
        let records = state.view(th, oh)?;
        page(records.into_keys().collect(), anchor, max, buf)
    }

    fn list_akeys(
        &self,
        th: Option<TxHandle>,
        oh: ObjectHandle,
        dkey: &[u8],
        anchor: &mut Anchor,
        max: usize,
        buf: &mut [u8],
    ) -> StoreResult<Vec<KeyDescriptor>> {
        self.enter(StoreOp::ListAkeys)?;
        let state = self.state.read().expect("lock poisoned");
        let mut records = state.view(th, oh)?;
        let akeys = records
            .remove(dkey)
            .map(|a| a.into_keys().collect())
            .unwrap_or_default();
        page(akeys, anchor, max, buf)
    }
}

impl std::fmt::Debug for InMemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("lock poisoned");
        f.debug_struct("InMemoryKvStore")
            .field("pools", &state.pools.len())
            .field("open_handles", &state.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use weft_types::{ObjectClass, ObjectKind};

    fn open_object(store: &InMemoryKvStore) -> (PoolHandle, ContainerHandle, ObjectHandle) {
        let pool = Uuid::from_u128(7);
        store.create_pool(pool);
        let poh = store.pool_connect(pool, "test").unwrap();
        let coh = store.cont_open(poh, "c", true).unwrap();
        let oid = ObjectId::encode(3, ObjectKind::Group, ObjectClass::S1);
        let oh = store.obj_open(coh, oid).unwrap();
        (poh, coh, oh)
    }

    fn put(store: &InMemoryKvStore, oh: ObjectHandle, dkey: &str) {
        store
            .update(None, oh, dkey.as_bytes(), &[(b"a".to_vec(), b"v".to_vec())])
            .unwrap();
    }

    fn collect_keys(buf: &[u8], kds: &[KeyDescriptor]) -> Vec<String> {
        let mut offset = 0;
        kds.iter()
            .map(|kd| {
                let key = String::from_utf8_lossy(&buf[offset..offset + kd.key_len]).into_owned();
                offset += kd.key_len;
                key
            })
            .collect()
    }

    // ---- Pools and containers ----

    #[test]
    fn connect_to_missing_pool_fails() {
        let store = InMemoryKvStore::new();
        let err = store.pool_connect(Uuid::from_u128(1), "g").unwrap_err();
        assert_eq!(err, StoreError::PoolNotFound(Uuid::from_u128(1)));
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn container_open_without_create_fails() {
        let store = InMemoryKvStore::with_pool(Uuid::from_u128(1));
        let poh = store.pool_connect(Uuid::from_u128(1), "g").unwrap();
        assert!(matches!(
            store.cont_open(poh, "missing", false),
            Err(StoreError::ContainerNotFound(_))
        ));
        store.cont_open(poh, "made", true).unwrap();
        assert_eq!(store.pool_query(poh).unwrap().containers, 1);
    }

    #[test]
    fn disconnect_with_open_container_is_busy() {
        let store = InMemoryKvStore::new();
        let (poh, coh, oh) = open_object(&store);
        assert!(matches!(
            store.pool_disconnect(poh),
            Err(StoreError::Busy { .. })
        ));
        store.obj_close(oh).unwrap();
        store.cont_close(coh).unwrap();
        store.pool_disconnect(poh).unwrap();
        assert_eq!(store.open_handles(), 0);
    }

    #[test]
    fn alloc_oids_hands_out_consecutive_batches() {
        let store = InMemoryKvStore::new();
        let (_, coh, _) = open_object(&store);
        assert_eq!(store.alloc_oids(coh, 1024).unwrap(), 0);
        assert_eq!(store.alloc_oids(coh, 1024).unwrap(), 1024);
    }

    // ---- Transactions ----

    #[test]
    fn commit_publishes_writes() {
        let store = InMemoryKvStore::new();
        let (_, coh, oh) = open_object(&store);
        let th = store.tx_open(coh).unwrap();
        store
            .update(Some(th), oh, b"d", &[(b"a".to_vec(), b"1".to_vec())])
            .unwrap();
        assert_eq!(store.fetch(None, oh, b"d", b"a").unwrap(), None);
        assert_eq!(
            store.fetch(Some(th), oh, b"d", b"a").unwrap(),
            Some(b"1".to_vec())
        );
        store.tx_commit(th).unwrap();
        store.tx_close(th).unwrap();
        assert_eq!(store.fetch(None, oh, b"d", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.fetch_size(None, oh, b"d", b"a").unwrap(), Some(1));
    }

    #[test]
    fn abort_discards_writes() {
        let store = InMemoryKvStore::new();
        let (_, coh, oh) = open_object(&store);
        let th = store.tx_open(coh).unwrap();
        store
            .update(Some(th), oh, b"d", &[(b"a".to_vec(), b"1".to_vec())])
            .unwrap();
        store.tx_abort(th).unwrap();
        assert_eq!(store.tx_commit(th), Err(StoreError::TxNotOpen(th.0)));
        store.tx_close(th).unwrap();
        assert_eq!(store.fetch(None, oh, b"d", b"a").unwrap(), None);
    }

    // ---- Listing ----

    #[test]
    fn listing_pages_through_all_keys() {
        let store = InMemoryKvStore::new();
        let (_, _, oh) = open_object(&store);
        for key in ["a", "b", "c", "d", "e"] {
            put(&store, oh, key);
        }

        let mut anchor = Anchor::new();
        let mut buf = [0u8; 64];
        let mut seen = Vec::new();
        let mut pages = 0;
        while !anchor.is_eof() {
            let kds = store.list_dkeys(None, oh, &mut anchor, 2, &mut buf).unwrap();
            seen.extend(collect_keys(&buf, &kds));
            pages += 1;
        }
        assert_eq!(pages, 3);
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn exact_last_page_sets_eof() {
        let store = InMemoryKvStore::new();
        let (_, _, oh) = open_object(&store);
        put(&store, oh, "x");
        put(&store, oh, "y");
        let mut anchor = Anchor::new();
        let mut buf = [0u8; 8];
        let kds = store.list_dkeys(None, oh, &mut anchor, 2, &mut buf).unwrap();
        assert_eq!(kds.len(), 2);
        assert!(anchor.is_eof());
    }

    #[test]
    fn oversized_first_key_reports_required_size() {
        let store = InMemoryKvStore::new();
        let (_, _, oh) = open_object(&store);
        put(&store, oh, "a-rather-long-key");
        let mut anchor = Anchor::new();
        let mut buf = [0u8; 4];
        let err = store
            .list_dkeys(None, oh, &mut anchor, 8, &mut buf)
            .unwrap_err();
        assert_eq!(err, StoreError::KeyTooBig { required: 17 });
        assert!(!anchor.is_eof());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn paging_returns_every_key_once_in_order(
            keys in proptest::collection::btree_set("[a-z]{1,8}", 0..24),
            max in 1usize..6,
            buf_len in 8usize..32,
        ) {
            let store = InMemoryKvStore::new();
            let (_, _, oh) = open_object(&store);
            for key in &keys {
                put(&store, oh, key);
            }

            let mut anchor = Anchor::new();
            let mut buf = vec![0u8; buf_len];
            let mut seen = Vec::new();
            while !anchor.is_eof() {
                let kds = store.list_dkeys(None, oh, &mut anchor, max, &mut buf).unwrap();
                prop_assert!(kds.len() <= max);
                prop_assert!(!kds.is_empty() || anchor.is_eof());
                seen.extend(collect_keys(&buf, &kds));
            }
            prop_assert_eq!(seen, keys.into_iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn list_akeys_of_missing_dkey_is_empty() {
        let store = InMemoryKvStore::new();
        let (_, _, oh) = open_object(&store);
        let mut anchor = Anchor::new();
        let mut buf = [0u8; 8];
        let kds = store
            .list_akeys(None, oh, b"nope", &mut anchor, 4, &mut buf)
            .unwrap();
        assert!(kds.is_empty());
        assert!(anchor.is_eof());
    }

    // ---- Fault injection ----

    #[test]
    fn injected_fault_fires_once_and_is_counted() {
        let store = InMemoryKvStore::new();
        let (_, coh, _) = open_object(&store);
        store.inject_fault(StoreOp::TxOpen, 42);
        let err = store.tx_open(coh).unwrap_err();
        assert_eq!(err.code(), 42);
        store.tx_open(coh).unwrap();
        assert_eq!(store.issued(StoreOp::TxOpen), 2);
    }

    #[test]
    fn fault_after_skips_earlier_calls() {
        let store = InMemoryKvStore::new();
        let (_, _, oh) = open_object(&store);
        store.inject_fault_after(StoreOp::Update, 2, 9);
        put(&store, oh, "a");
        put(&store, oh, "b");
        assert!(store
            .update(None, oh, b"c", &[(b"a".to_vec(), b"v".to_vec())])
            .is_err());
        put(&store, oh, "d");
        assert_eq!(store.issued(StoreOp::Update), 4);
    }
}
