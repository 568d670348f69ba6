//! Open files and the operations issued against them.
//!
//! A [`File`] is one open container. Every public operation builds a
//! chain of steps for a fresh [`Request`], terminates it with the
//! transaction finalizer and drives the engine until the request has been
//! reclaimed. The first failure recorded by any step is returned as
//! [`ConnectorError::OperationFailed`].

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use weft_comm::SoloComm;
use weft_engine::Scheduler;
use weft_store::{ContainerHandle, InMemoryKvStore, KvStore, PoolHandle, PoolInfo};
use weft_types::{ClassResolver, ObjectClass, ObjectId, ObjectKind, Status};

use crate::chain::Chain;
use crate::collective;
use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::finalize;
use crate::list::{self, KeyVisitor, ListOptions, ListStats};
use crate::object::{Object, ObjectCell, ObjectMetadata, LINK_AKEY, METADATA_DKEY};
use crate::oidx::{self, Lease};
use crate::progress::{ExecContext, ProgressPump, Timeout, Until};
use crate::request::Request;
use crate::slot::Slot;
use crate::steps;

#[derive(Debug, Default)]
struct Handles {
    pool: PoolHandle,
    container: ContainerHandle,
}

#[derive(Debug, Default)]
struct Leases {
    collective: Lease,
    independent: Lease,
}

/// State shared by every request issued against one file.
pub struct FileContext {
    label: String,
    store: Arc<dyn KvStore>,
    exec: ExecContext,
    config: ConnectorConfig,
    resolver: ClassResolver,
    handles: Mutex<Handles>,
    leases: Mutex<Leases>,
}

impl FileContext {
    pub fn new(
        label: impl Into<String>,
        store: Arc<dyn KvStore>,
        exec: ExecContext,
        config: ConnectorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            store,
            exec,
            resolver: ClassResolver::new(config.default_object_class),
            config,
            handles: Mutex::new(Handles::default()),
            leases: Mutex::new(Leases::default()),
        })
    }

    /// A context over a private in-memory store and a single participant.
    pub fn detached() -> Arc<Self> {
        Self::new(
            "detached",
            Arc::new(InMemoryKvStore::new()),
            ExecContext::new(Scheduler::new("detached"), Arc::new(SoloComm)),
            ConnectorConfig::default(),
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn exec(&self) -> &ExecContext {
        &self.exec
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ClassResolver {
        &self.resolver
    }

    /// Returns `true` on the participant that performs collective side
    /// effects once.
    pub fn is_coordinator(&self) -> bool {
        self.exec.comm().rank() == 0
    }

    pub fn pool(&self) -> PoolHandle {
        self.handles.lock().expect("file handles poisoned").pool
    }

    pub fn container(&self) -> ContainerHandle {
        self.handles.lock().expect("file handles poisoned").container
    }

    pub(crate) fn set_pool(&self, poh: PoolHandle) {
        self.handles.lock().expect("file handles poisoned").pool = poh;
    }

    pub(crate) fn set_container(&self, coh: ContainerHandle) {
        self.handles.lock().expect("file handles poisoned").container = coh;
    }

    /// Snapshot of the collective or independent index lease.
    pub fn lease(&self, collective: bool) -> Lease {
        self.with_lease(collective, |lease| *lease)
    }

    pub(crate) fn with_lease<R>(&self, collective: bool, f: impl FnOnce(&mut Lease) -> R) -> R {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        if collective {
            f(&mut leases.collective)
        } else {
            f(&mut leases.independent)
        }
    }
}

impl std::fmt::Debug for FileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileContext")
            .field("label", &self.label)
            .field("pool", &self.pool())
            .field("container", &self.container())
            .finish()
    }
}

/// Options for [`File::create_object`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Placement class named by the creation call.
    pub class: Option<ObjectClass>,
    /// Every participant creates the same object together.
    pub collective: bool,
}

/// One open container.
#[derive(Debug)]
pub struct File {
    ctx: Arc<FileContext>,
    pump: ProgressPump,
    open: bool,
}

impl File {
    pub(crate) fn new(ctx: Arc<FileContext>) -> Self {
        let pump = ProgressPump::new(ctx.config().poll_interval());
        Self {
            ctx,
            pump,
            open: false,
        }
    }

    pub fn context(&self) -> &Arc<FileContext> {
        &self.ctx
    }

    pub fn exec(&self) -> &ExecContext {
        self.ctx.exec()
    }

    pub fn label(&self) -> &str {
        self.ctx.label()
    }

    // ---------------------------------------------------------------
    // Request execution
    // ---------------------------------------------------------------

    /// Build a request's chain and start it. Returns the request handle
    /// and the finalizer's construction result.
    fn submit<F>(&self, operation: &str, collective: bool, build: F) -> ConnectorResult<(Request, ConnectorResult<()>)>
    where
        F: FnOnce(&Request, &mut Chain) -> ConnectorResult<()>,
    {
        let owner = Request::create(self.ctx.clone(), operation);
        let req = owner.handle();
        let mut chain = Chain::new(self.exec().scheduler().clone());

        if let Err(err) = build(&req, &mut chain) {
            req.record_failure(err.failure_code(), "chain construction");
        }
        // Collective checks are built even after a local failure so every
        // participant issues the same broadcasts.
        if collective {
            if let Err(err) = collective::error_check(&mut chain, &req) {
                req.record_failure(err.failure_code(), "collective error check");
            }
        }
        let finalized = finalize::append(&mut chain, owner).map(|_| ());
        chain.start()?;
        Ok((req, finalized))
    }

    fn settle(&self, req: &Request, finalized: ConnectorResult<()>) -> ConnectorResult<()> {
        finalized?;
        match req.status() {
            Status::Failed(code) => Err(ConnectorError::OperationFailed {
                code,
                task: req.failed_task().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    fn timed_out(req: &Request) -> ConnectorError {
        // Remaining steps skip their work; the graph drains on the next pump.
        req.cancel();
        ConnectorError::Timeout(req.operation().to_string())
    }

    fn execute<F>(&self, operation: &str, collective: bool, build: F) -> ConnectorResult<()>
    where
        F: FnOnce(&Request, &mut Chain) -> ConnectorResult<()>,
    {
        let (req, finalized) = self.submit(operation, collective, build)?;
        let timeout = Timeout::from_option(self.ctx.config().operation_timeout());
        if !self.pump.run_until(&[self.exec()], Until::Reclaimed(&req), timeout) {
            return Err(Self::timed_out(&req));
        }
        self.settle(&req, finalized)
    }

    async fn execute_async<F>(&self, operation: &str, collective: bool, build: F) -> ConnectorResult<()>
    where
        F: FnOnce(&Request, &mut Chain) -> ConnectorResult<()>,
    {
        let (req, finalized) = self.submit(operation, collective, build)?;
        let timeout = Timeout::from_option(self.ctx.config().operation_timeout());
        if !self
            .pump
            .run_async(self.exec(), Until::Reclaimed(&req), timeout)
            .await
        {
            return Err(Self::timed_out(&req));
        }
        self.settle(&req, finalized)
    }

    // ---------------------------------------------------------------
    // File lifecycle
    // ---------------------------------------------------------------

    /// Connect to the pool and open (or create) the container.
    pub(crate) fn open(&mut self, create: bool) -> ConnectorResult<()> {
        let config = self.ctx.config().clone();
        let label = self.ctx.label().to_string();
        let opened = self.execute("file open", true, |req, chain| {
            steps::pool_connect(chain, req, config.pool, &config.group)?;
            steps::container_open(chain, req, &label, create)?;
            Ok(())
        });
        // A half-open file still holds a pool connection to give back.
        self.open = self.ctx.pool().is_valid();
        opened?;
        info!(label = %self.label(), pool = %config.pool, "opened file");
        Ok(())
    }

    /// Close the container and disconnect from the pool.
    pub fn close(mut self) -> ConnectorResult<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> ConnectorResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.execute("file close", false, |req, chain| {
            steps::container_close(chain, req)?;
            steps::pool_disconnect(chain, req)?;
            Ok(())
        })?;
        debug!(label = %self.label(), "closed file");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------

    pub fn query(&self) -> ConnectorResult<PoolInfo> {
        let out = Slot::new();
        self.execute("pool query", false, |req, chain| {
            steps::pool_query(chain, req, out.clone())?;
            Ok(())
        })?;
        out.take()
            .ok_or_else(|| ConnectorError::InvalidArgument("pool query produced no answer".into()))
    }

    /// [`File::query`], yielding to the tokio runtime while it waits.
    pub async fn query_async(&self) -> ConnectorResult<PoolInfo> {
        let out = Slot::new();
        self.execute_async("pool query", false, |req, chain| {
            steps::pool_query(chain, req, out.clone())?;
            Ok(())
        })
        .await?;
        out.take()
            .ok_or_else(|| ConnectorError::InvalidArgument("pool query produced no answer".into()))
    }

    /// Take the next object index from the file's lease.
    ///
    /// With `collective` set every participant must call this together and
    /// receives the same index.
    pub fn allocate_index(&self, collective: bool) -> ConnectorResult<u64> {
        let out = Slot::new();
        self.execute("allocate index", collective, |req, chain| {
            oidx::allocate_index(chain, req, collective, out.clone())
        })?;
        out.take()
            .ok_or_else(|| ConnectorError::InvalidArgument("no index was allocated".into()))
    }

    /// Allocate an index and encode it as an identifier of `kind`.
    pub fn generate_oid(
        &self,
        kind: ObjectKind,
        class: Option<ObjectClass>,
        collective: bool,
    ) -> ConnectorResult<ObjectId> {
        let out = Slot::new();
        self.execute("generate identifier", collective, |req, chain| {
            oidx::generate_oid(chain, req, kind, class, None, collective, out.clone())
        })?;
        out.take()
            .ok_or_else(|| ConnectorError::InvalidArgument("no identifier was generated".into()))
    }

    /// Create an object and store its metadata records.
    ///
    /// A collective create allocates the same identifier everywhere; only
    /// the coordinator writes the metadata.
    pub fn create_object(
        &self,
        kind: ObjectKind,
        opts: CreateOptions,
        metadata: ObjectMetadata,
    ) -> ConnectorResult<Object> {
        metadata.validate()?;
        let cell = ObjectCell::unopened(self.ctx.store().clone(), ObjectId::null());
        let oid = Slot::new();
        let write = !opts.collective || self.ctx.is_coordinator();
        self.execute("object create", opts.collective, |req, chain| {
            oidx::generate_oid(chain, req, kind, None, opts.class, opts.collective, oid.clone())?;
            steps::object_open(chain, req, cell.clone(), Some(oid.clone()))?;
            if write {
                steps::metadata_write(chain, req, cell.clone(), METADATA_DKEY, metadata.records())?;
            }
            Ok(())
        })?;
        debug!(oid = %cell.oid(), %kind, "created object");
        Ok(Object::new(cell, metadata))
    }

    /// Open an existing object and read its metadata.
    ///
    /// With `collective_metadata` configured and more than one participant,
    /// only the coordinator reads the metadata and broadcasts it.
    pub fn open_object(&self, oid: ObjectId) -> ConnectorResult<Object> {
        if oid.is_null() {
            return Err(ConnectorError::InvalidArgument("cannot open the null identifier".into()));
        }
        let cell = ObjectCell::unopened(self.ctx.store().clone(), oid);
        let metadata = Slot::new();
        let shared = self.ctx.config().collective_metadata && self.exec().comm().size() > 1;
        // A shared open is collective: a local open failure on any
        // participant must fail it everywhere.
        self.execute("object open", shared, |req, chain| {
            if shared {
                collective::open_object(chain, req, cell.clone(), metadata.clone())
            } else {
                steps::object_open(chain, req, cell.clone(), None)?;
                steps::object_info_read(chain, req, cell.clone(), metadata.clone())?;
                Ok(())
            }
        })?;
        let metadata = metadata
            .take()
            .ok_or_else(|| ConnectorError::InvalidArgument(format!("no metadata for {oid}")))?;
        Ok(Object::new(cell, metadata))
    }

    /// Write `records` (akey, value) under `dkey` in one transaction.
    pub fn write_metadata(
        &self,
        object: &Object,
        dkey: &[u8],
        records: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> ConnectorResult<()> {
        self.execute("metadata write", false, |req, chain| {
            steps::metadata_write(chain, req, object.cell().clone(), dkey, records)?;
            Ok(())
        })
    }

    pub fn read_metadata(
        &self,
        object: &Object,
        dkey: &[u8],
        akey: &[u8],
    ) -> ConnectorResult<Option<Vec<u8>>> {
        let out = Slot::new();
        self.execute("metadata read", false, |req, chain| {
            steps::metadata_read(chain, req, object.cell().clone(), dkey, akey, out.clone())?;
            Ok(())
        })?;
        Ok(out.take().flatten())
    }

    /// Record `child` under `name` in the group `parent`.
    pub fn link(&self, parent: &Object, name: &str, child: ObjectId) -> ConnectorResult<()> {
        if parent.kind() != ObjectKind::Group {
            return Err(ConnectorError::InvalidArgument(format!(
                "links live in groups, not in a {}",
                parent.kind()
            )));
        }
        let records = vec![(LINK_AKEY.to_vec(), child.to_token().to_vec())];
        self.execute("link create", false, |req, chain| {
            steps::metadata_write(chain, req, parent.cell().clone(), name.as_bytes(), records)?;
            Ok(())
        })
    }

    /// Enumerate the keys of `object`, feeding each one to `visitor`.
    ///
    /// Returns the visitor together with the listing's statistics.
    pub fn list_keys<V>(&self, object: &Object, opts: ListOptions, visitor: V) -> ConnectorResult<(V, ListStats)>
    where
        V: KeyVisitor + 'static,
    {
        let visitor = Arc::new(Mutex::new(visitor));
        let stats = Arc::new(Mutex::new(ListStats::default()));
        self.execute("key listing", false, |req, chain| {
            list::start_listing(chain, req, object.cell().clone(), &opts, visitor.clone(), stats.clone())?;
            Ok(())
        })?;
        let stats = *stats.lock().expect("listing stats poisoned");
        let visitor = Arc::try_unwrap(visitor)
            .map_err(|_| ConnectorError::InvalidArgument("listing is still running".into()))?
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok((visitor, stats))
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Err(err) = self.close_inner() {
            warn!(label = %self.label(), %err, "failed to close file on drop");
        }
    }
}
