//! One chain step per store operation.
//!
//! Each step holds its own [`RequestRef`] and the arguments it needs. The
//! prepare callback performs the short-circuit check and resolves
//! arguments produced by earlier steps; the completion callback records the
//! step's failure, cleans up and releases the reference by dropping it.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;
use weft_engine::{Run, TaskContext, TaskId, TaskOps};
use weft_store::{PoolInfo, StoreError, StoreResult};
use weft_types::{FailureCode, ObjectId, TaskError, TaskResult};

use crate::chain::Chain;
use crate::error::ConnectorResult;
use crate::object::{ObjectCell, ObjectMetadata, CPL_AKEY, METADATA_DKEY, SPACE_AKEY, TYPE_AKEY};
use crate::request::{Request, RequestRef};
use crate::slot::Slot;

pub(crate) fn store_failure(err: &StoreError) -> TaskError {
    TaskError::Failed(FailureCode::Store(err.code()))
}

fn done(result: StoreResult<()>) -> Run {
    Run::Done(result.map_err(|e| store_failure(&e)))
}

fn bad_value() -> TaskError {
    TaskError::Failed(FailureCode::BadValue)
}

// ---------------------------------------------------------------
// Pool
// ---------------------------------------------------------------

struct PoolConnect {
    req: RequestRef,
    pool: Uuid,
    group: String,
}

impl TaskOps for PoolConnect {
    fn name(&self) -> &str {
        "pool connect"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()?;
        if self.pool.is_nil() {
            return Err(bad_value());
        }
        Ok(())
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let file = self.req.file();
        done(file.store().pool_connect(self.pool, &self.group).map(|poh| {
            debug!(pool = %self.pool, %poh, "connected to pool");
            file.set_pool(poh);
        }))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

pub(crate) fn pool_connect(chain: &mut Chain, req: &Request, pool: Uuid, group: &str) -> ConnectorResult<TaskId> {
    let group = group.to_string();
    chain.append(req, |req| Box::new(PoolConnect { req, pool, group }))
}

struct PoolDisconnect {
    req: RequestRef,
}

impl TaskOps for PoolDisconnect {
    fn name(&self) -> &str {
        "pool disconnect"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let file = self.req.file();
        let poh = file.pool();
        if !poh.is_valid() {
            return Run::Done(Ok(()));
        }
        done(file.store().pool_disconnect(poh).map(|()| file.set_pool(Default::default())))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

pub(crate) fn pool_disconnect(chain: &mut Chain, req: &Request) -> ConnectorResult<TaskId> {
    chain.append(req, |req| Box::new(PoolDisconnect { req }))
}

struct PoolQuery {
    req: RequestRef,
    out: Slot<PoolInfo>,
}

impl TaskOps for PoolQuery {
    fn name(&self) -> &str {
        "pool query"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let file = self.req.file();
        done(file.store().pool_query(file.pool()).map(|info| self.out.set(info)))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

pub(crate) fn pool_query(chain: &mut Chain, req: &Request, out: Slot<PoolInfo>) -> ConnectorResult<TaskId> {
    chain.append(req, |req| Box::new(PoolQuery { req, out }))
}

// ---------------------------------------------------------------
// Container
// ---------------------------------------------------------------

struct ContainerOpen {
    req: RequestRef,
    label: String,
    create: bool,
}

impl TaskOps for ContainerOpen {
    fn name(&self) -> &str {
        "container open"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()?;
        if self.label.is_empty() {
            return Err(bad_value());
        }
        Ok(())
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let file = self.req.file();
        done(
            file.store()
                .cont_open(file.pool(), &self.label, self.create)
                .map(|coh| file.set_container(coh)),
        )
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

pub(crate) fn container_open(chain: &mut Chain, req: &Request, label: &str, create: bool) -> ConnectorResult<TaskId> {
    let label = label.to_string();
    chain.append(req, |req| Box::new(ContainerOpen { req, label, create }))
}

struct ContainerClose {
    req: RequestRef,
}

impl TaskOps for ContainerClose {
    fn name(&self) -> &str {
        "container close"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let file = self.req.file();
        let coh = file.container();
        if !coh.is_valid() {
            return Run::Done(Ok(()));
        }
        done(file.store().cont_close(coh).map(|()| file.set_container(Default::default())))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

pub(crate) fn container_close(chain: &mut Chain, req: &Request) -> ConnectorResult<TaskId> {
    chain.append(req, |req| Box::new(ContainerClose { req }))
}

// ---------------------------------------------------------------
// Objects
// ---------------------------------------------------------------

struct ObjectOpen {
    req: RequestRef,
    cell: Arc<ObjectCell>,
    oid: Option<Slot<ObjectId>>,
}

impl TaskOps for ObjectOpen {
    fn name(&self) -> &str {
        "object open"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()?;
        // The identifier may only exist once an earlier step allocated it.
        if let Some(oid) = self.oid.as_ref().and_then(Slot::get) {
            self.cell.set_oid(oid);
        }
        if self.cell.oid().is_null() {
            return Err(bad_value());
        }
        Ok(())
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let file = self.req.file();
        done(
            file.store()
                .obj_open(file.container(), self.cell.oid())
                .map(|oh| self.cell.set_handle(oh)),
        )
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

/// Open `cell`'s object. With `oid` given, the identifier is read from it
/// once the step is about to run.
pub(crate) fn object_open(
    chain: &mut Chain,
    req: &Request,
    cell: Arc<ObjectCell>,
    oid: Option<Slot<ObjectId>>,
) -> ConnectorResult<TaskId> {
    chain.append(req, |req| Box::new(ObjectOpen { req, cell, oid }))
}

fn open_handle(cell: &ObjectCell) -> TaskResult {
    if cell.is_open() {
        Ok(())
    } else {
        Err(bad_value())
    }
}

// ---------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------

struct MetadataWrite {
    req: RequestRef,
    cell: Arc<ObjectCell>,
    dkey: Vec<u8>,
    records: Vec<(Vec<u8>, Vec<u8>)>,
}

impl TaskOps for MetadataWrite {
    fn name(&self) -> &str {
        "metadata write"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()?;
        open_handle(&self.cell)
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let th = match self.req.transaction() {
            Ok(th) => th,
            Err(code) => return Run::Done(Err(TaskError::Failed(code))),
        };
        done(
            self.req
                .file()
                .store()
                .update(Some(th), self.cell.handle(), &self.dkey, &self.records),
        )
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

/// Write `records` under `dkey` inside the request's transaction.
pub(crate) fn metadata_write(
    chain: &mut Chain,
    req: &Request,
    cell: Arc<ObjectCell>,
    dkey: &[u8],
    records: Vec<(Vec<u8>, Vec<u8>)>,
) -> ConnectorResult<TaskId> {
    let dkey = dkey.to_vec();
    chain.append(req, |req| {
        Box::new(MetadataWrite {
            req,
            cell,
            dkey,
            records,
        })
    })
}

struct MetadataRead {
    req: RequestRef,
    cell: Arc<ObjectCell>,
    dkey: Vec<u8>,
    akey: Vec<u8>,
    out: Slot<Option<Vec<u8>>>,
}

impl TaskOps for MetadataRead {
    fn name(&self) -> &str {
        "metadata read"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()?;
        open_handle(&self.cell)
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let th = self.req.current_tx();
        done(
            self.req
                .file()
                .store()
                .fetch(th, self.cell.handle(), &self.dkey, &self.akey)
                .map(|value| self.out.set(value)),
        )
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

pub(crate) fn metadata_read(
    chain: &mut Chain,
    req: &Request,
    cell: Arc<ObjectCell>,
    dkey: &[u8],
    akey: &[u8],
    out: Slot<Option<Vec<u8>>>,
) -> ConnectorResult<TaskId> {
    let dkey = dkey.to_vec();
    let akey = akey.to_vec();
    chain.append(req, |req| {
        Box::new(MetadataRead {
            req,
            cell,
            dkey,
            akey,
            out,
        })
    })
}

struct ObjectInfoRead {
    req: RequestRef,
    cell: Arc<ObjectCell>,
    out: Slot<ObjectMetadata>,
}

impl ObjectInfoRead {
    /// Size the record first, then fetch it.
    fn record(&self, akey: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let store = self.req.file().store();
        let oh = self.cell.handle();
        match store.fetch_size(None, oh, METADATA_DKEY, akey)? {
            None | Some(0) => Ok(None),
            Some(_) => store.fetch(None, oh, METADATA_DKEY, akey),
        }
    }

    fn read(&self) -> Result<ObjectMetadata, TaskError> {
        let fetch = |akey: &[u8]| self.record(akey).map_err(|e| store_failure(&e));
        let type_info = fetch(TYPE_AKEY)?.ok_or_else(bad_value)?;
        Ok(ObjectMetadata {
            type_info,
            space_info: fetch(SPACE_AKEY)?.unwrap_or_default(),
            creation_props: fetch(CPL_AKEY)?.unwrap_or_default(),
        })
    }
}

impl TaskOps for ObjectInfoRead {
    fn name(&self) -> &str {
        "object metadata read"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()?;
        open_handle(&self.cell)
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        Run::Done(self.read().map(|md| self.out.set(md)))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
    }
}

/// Read the three metadata records of an open object.
pub(crate) fn object_info_read(
    chain: &mut Chain,
    req: &Request,
    cell: Arc<ObjectCell>,
    out: Slot<ObjectMetadata>,
) -> ConnectorResult<TaskId> {
    chain.append(req, |req| Box::new(ObjectInfoRead { req, cell, out }))
}
