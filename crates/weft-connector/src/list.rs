//! Paginated, optionally recursive key enumeration.
//!
//! A listing is a sequence of page tasks per object, each issued from the
//! previous page's completion callback, and a finish task that completes
//! the level once its last page and all its nested levels are done. The
//! finish task is reserved up front and becomes the chain's tail, so later
//! steps wait for the whole enumeration.
//!
//! Recursive listings follow link records: a dkey whose `link` akey holds
//! the token of a group starts a nested listing of that group. The
//! outermost level owns the set of groups already visited; nested levels
//! share it and it is released exactly once, when the outermost level
//! finishes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, trace};
use weft_engine::{Run, Scheduler, TaskContext, TaskId, TaskOps};
use weft_store::{Anchor, KeyDescriptor, StoreError};
use weft_types::{FailureCode, ObjectId, ObjectKind, Status, TaskError, TaskResult};

use crate::chain::Chain;
use crate::error::ConnectorResult;
use crate::object::{ObjectCell, LINK_AKEY};
use crate::request::{Request, RequestRef};
use crate::steps::{self, store_failure};

/// Which keys of an object to enumerate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum KeyScope {
    #[default]
    Dkeys,
    /// The akeys stored under one dkey.
    Akeys { dkey: Vec<u8> },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub scope: KeyScope,
    /// Descend into groups reachable through link records. Dkeys only.
    pub recursive: bool,
}

/// Returned by a visitor to continue or end the enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterControl {
    Continue,
    /// Stop early. The request still succeeds.
    Stop,
}

/// One enumerated key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    /// Object the key belongs to.
    pub object: ObjectId,
    pub key: Vec<u8>,
    /// Nesting level; the listed object itself is depth 0.
    pub depth: usize,
}

/// Receives every enumerated key. A returned error fails the request.
pub trait KeyVisitor: Send {
    fn visit(&mut self, entry: &KeyEntry) -> Result<IterControl, FailureCode>;
}

impl<F> KeyVisitor for F
where
    F: FnMut(&KeyEntry) -> Result<IterControl, FailureCode> + Send,
{
    fn visit(&mut self, entry: &KeyEntry) -> Result<IterControl, FailureCode> {
        self(entry)
    }
}

/// Visitor collecting keys, optionally stopping after `limit` of them.
#[derive(Clone, Debug, Default)]
pub struct KeyCollector {
    pub entries: Vec<KeyEntry>,
    pub limit: Option<usize>,
}

impl KeyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit: Some(limit),
        }
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }
}

impl KeyVisitor for KeyCollector {
    fn visit(&mut self, entry: &KeyEntry) -> Result<IterControl, FailureCode> {
        self.entries.push(entry.clone());
        match self.limit {
            Some(limit) if self.entries.len() >= limit => Ok(IterControl::Stop),
            _ => Ok(IterControl::Continue),
        }
    }
}

/// Counters describing one enumeration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListStats {
    /// Page requests issued to the store.
    pub pages: usize,
    /// Keys handed to the visitor.
    pub keys: usize,
    /// Times a page buffer had to grow.
    pub growths: usize,
    /// Levels finished, the outermost one included.
    pub levels: usize,
    /// Times the shared visited set was released.
    pub visited_released: usize,
}

/// State shared by every level of one enumeration.
struct IterShared {
    visitor: Arc<Mutex<dyn KeyVisitor>>,
    visited: Mutex<Option<HashSet<ObjectId>>>,
    stats: Arc<Mutex<ListStats>>,
    recursive: bool,
    prefetch: usize,
    /// Set when this enumeration moved the request to `ShortCircuit`.
    stopped: AtomicBool,
    /// Hold on the outermost object until the enumeration finishes.
    root: Mutex<Option<Arc<ObjectCell>>>,
}

impl IterShared {
    fn stats(&self) -> std::sync::MutexGuard<'_, ListStats> {
        self.stats.lock().expect("listing stats poisoned")
    }

    /// Returns `true` if `oid` was not visited before.
    fn visit_group(&self, oid: ObjectId) -> bool {
        self.visited
            .lock()
            .expect("visited set poisoned")
            .as_mut()
            .map_or(false, |set| set.insert(oid))
    }
}

/// One object's enumeration, handed from page to page.
struct Level {
    shared: Arc<IterShared>,
    target: Arc<ObjectCell>,
    scope: KeyScope,
    depth: usize,
    anchor: Anchor,
    buf: Vec<u8>,
    /// Finish task of this level.
    finish: TaskId,
    /// Link reads spawned by this level's pages.
    children: Vec<TaskId>,
}

impl Level {
    /// Visit the keys of one page. Returns `false` once iteration should end.
    fn visit(&mut self, req: &Request, scheduler: &Scheduler, kds: &[KeyDescriptor]) -> bool {
        let mut offset = 0;
        for kd in kds {
            let key = self.buf[offset..offset + kd.key_len].to_vec();
            offset += kd.key_len;
            let entry = KeyEntry {
                object: self.target.oid(),
                key,
                depth: self.depth,
            };
            self.shared.stats().keys += 1;

            let control = self
                .shared
                .visitor
                .lock()
                .expect("key visitor poisoned")
                .visit(&entry);
            match control {
                Ok(IterControl::Continue) => {}
                Ok(IterControl::Stop) => {
                    if req.short_circuit() {
                        self.shared.stopped.store(true, Ordering::SeqCst);
                    }
                    return false;
                }
                Err(code) => {
                    req.record_failure(code, "key visitor");
                    return false;
                }
            }

            if self.shared.recursive && self.scope == KeyScope::Dkeys {
                if let Err(err) = self.spawn_link_read(req, scheduler, entry.key) {
                    req.record_failure(err, "link read");
                    return false;
                }
            }
        }
        true
    }

    fn spawn_link_read(&mut self, req: &Request, scheduler: &Scheduler, dkey: Vec<u8>) -> Result<(), FailureCode> {
        let id = scheduler.reserve(&[]).map_err(|_| FailureCode::Engine)?;
        let read = LinkRead {
            req: req.retain(),
            shared: self.shared.clone(),
            parent: self.target.clone(),
            parent_finish: self.finish,
            dkey,
            depth: self.depth + 1,
            child: None,
        };
        if let Err(err) = scheduler.install(id, Box::new(read)).and_then(|()| scheduler.schedule(id)) {
            debug!(%err, "engine refused link read");
            scheduler.complete(id, Err(TaskError::Failed(FailureCode::Engine)));
            return Err(FailureCode::Engine);
        }
        self.children.push(id);
        Ok(())
    }

    /// Let the finish task run once every child is done.
    fn close(self, req: &Request, scheduler: &Scheduler) {
        close_level(self.finish, &self.children, req, scheduler);
    }
}

fn close_level(finish: TaskId, children: &[TaskId], req: &Request, scheduler: &Scheduler) {
    let wired = scheduler
        .add_dependencies(finish, children)
        .and_then(|()| scheduler.schedule(finish));
    if let Err(err) = wired {
        error!(%err, "could not schedule listing finish");
        req.record_failure(FailureCode::Engine, "key listing");
        scheduler.complete(finish, Err(TaskError::Failed(FailureCode::Engine)));
    }
}

struct Page {
    req: RequestRef,
    level: Option<Level>,
    kds: Vec<KeyDescriptor>,
    grow_to: Option<usize>,
}

impl TaskOps for Page {
    fn name(&self) -> &str {
        "key listing page"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()?;
        match &self.level {
            Some(level) if level.target.is_open() => Ok(()),
            _ => Err(TaskError::Failed(FailureCode::BadValue)),
        }
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let store = self.req.file().store().clone();
        let Some(level) = self.level.as_mut() else {
            return Run::Done(Err(TaskError::Failed(FailureCode::BadValue)));
        };
        let prefetch = level.shared.prefetch;
        level.shared.stats().pages += 1;
        let oh = level.target.handle();
        // The last byte of the buffer is never handed to the store.
        let usable = level.buf.len().saturating_sub(1);
        let listed = match &level.scope {
            KeyScope::Dkeys => store.list_dkeys(None, oh, &mut level.anchor, prefetch, &mut level.buf[..usable]),
            KeyScope::Akeys { dkey } => {
                store.list_akeys(None, oh, dkey, &mut level.anchor, prefetch, &mut level.buf[..usable])
            }
        };
        match listed {
            Ok(kds) => {
                self.kds = kds;
                Run::Done(Ok(()))
            }
            Err(StoreError::KeyTooBig { required }) => {
                self.grow_to = Some(required);
                Run::Done(Ok(()))
            }
            Err(err) => Run::Done(Err(store_failure(&err))),
        }
    }

    fn complete(mut self: Box<Self>, ctx: &TaskContext, result: TaskResult) {
        let scheduler = ctx.scheduler();
        let Some(mut level) = self.level.take() else {
            return;
        };

        let more = match result {
            Err(err) => {
                self.req.record_result(Err(err), "key listing page");
                false
            }
            Ok(()) => match self.grow_to {
                Some(required) => {
                    let size = (level.buf.len() * 2).max(required + 1);
                    trace!(from = level.buf.len(), to = size, "growing key buffer");
                    level.buf.resize(size, 0);
                    level.shared.stats().growths += 1;
                    true
                }
                None => {
                    let kds = std::mem::take(&mut self.kds);
                    level.visit(&self.req, scheduler, &kds)
                        && !level.anchor.is_eof()
                        && self.req.status() == Status::Incomplete
                }
            },
        };

        if !more {
            level.close(&self.req, scheduler);
            return;
        }
        // Pages of one object are strictly sequential.
        match scheduler.reserve(&[]) {
            Ok(id) => {
                let (finish, children) = (level.finish, level.children.clone());
                let next = Page {
                    req: self.req.retain(),
                    level: Some(level),
                    kds: Vec::new(),
                    grow_to: None,
                };
                if let Err(err) = scheduler.install(id, Box::new(next)) {
                    // The level went down with the page; close it by its ids.
                    error!(%err, "could not install next listing page");
                    self.req.record_failure(FailureCode::Engine, "key listing page");
                    scheduler.complete(id, Err(TaskError::Failed(FailureCode::Engine)));
                    close_level(finish, &children, &self.req, scheduler);
                } else if let Err(err) = scheduler.schedule(id) {
                    // Completing the page closes its level.
                    error!(%err, "could not submit next listing page");
                    self.req.record_failure(FailureCode::Engine, "key listing page");
                    scheduler.complete(id, Err(TaskError::Failed(FailureCode::Engine)));
                }
            }
            Err(err) => {
                debug!(%err, "engine refused next listing page");
                self.req.record_failure(FailureCode::Engine, "key listing page");
                level.close(&self.req, scheduler);
            }
        }
    }
}

/// Reads one dkey's link record and descends into the linked group.
struct LinkRead {
    req: RequestRef,
    shared: Arc<IterShared>,
    parent: Arc<ObjectCell>,
    parent_finish: TaskId,
    dkey: Vec<u8>,
    depth: usize,
    child: Option<ObjectId>,
}

impl TaskOps for LinkRead {
    fn name(&self) -> &str {
        "link read"
    }

    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        self.req.check()?;
        Ok(())
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let store = self.req.file().store();
        match store.fetch(None, self.parent.handle(), &self.dkey, LINK_AKEY) {
            Ok(value) => {
                self.child = value
                    .and_then(|token| ObjectId::from_token(&token).ok())
                    .filter(|oid| oid.kind() == ObjectKind::Group);
                Run::Done(Ok(()))
            }
            Err(err) => Run::Done(Err(store_failure(&err))),
        }
    }

    fn complete(self: Box<Self>, ctx: &TaskContext, result: TaskResult) {
        if let Err(err) = result {
            self.req.record_result(Err(err), self.name());
            return;
        }
        let Some(oid) = self.child else { return };
        if !self.shared.visit_group(oid) {
            trace!(%oid, "group already visited");
            return;
        }

        let cell = ObjectCell::unopened(self.req.file().store().clone(), oid);
        let mut chain = Chain::resume(ctx.scheduler().clone(), None);
        let nested = steps::object_open(&mut chain, &self.req, cell.clone(), None)
            .and_then(|_| start_level(&mut chain, &self.req, cell, self.shared.clone(), KeyScope::Dkeys, self.depth));
        let wired = nested.and_then(|finish| Ok(ctx.scheduler().add_dependencies(self.parent_finish, &[finish])?));
        if let Err(err) = wired {
            self.req.record_failure(err.failure_code(), "nested key listing");
        }
    }
}

/// Completes one level: runs after its last page and all nested levels.
struct Finish {
    req: RequestRef,
    shared: Arc<IterShared>,
    target: Arc<ObjectCell>,
    base: bool,
}

impl TaskOps for Finish {
    fn name(&self) -> &str {
        "key listing finish"
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        Run::Done(Ok(()))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.req.record_result(result, self.name());
        self.shared.stats().levels += 1;
        if !self.base {
            if let Err(err) = self.target.close() {
                self.req.record_failure(FailureCode::Close, "nested key listing close");
                debug!(%err, "failed to close listed group");
            }
            return;
        }

        if self.shared.stopped.swap(false, Ordering::SeqCst) {
            self.req.clear_short_circuit();
        }
        if self.shared.visited.lock().expect("visited set poisoned").take().is_some() {
            self.shared.stats().visited_released += 1;
        }
        self.shared.root.lock().expect("listing root poisoned").take();
        debug!(stats = ?*self.shared.stats(), "key listing finished");
    }
}

/// Reserve a level's finish task and start its first page.
///
/// Returns the finish task, which becomes the chain's tail.
fn start_level(
    chain: &mut Chain,
    req: &Request,
    target: Arc<ObjectCell>,
    shared: Arc<IterShared>,
    scope: KeyScope,
    depth: usize,
) -> ConnectorResult<TaskId> {
    let scheduler = chain.scheduler().clone();
    let finish = chain.reserve()?;
    let installed = scheduler.install(
        finish,
        Box::new(Finish {
            req: req.retain(),
            shared: shared.clone(),
            target: target.clone(),
            base: depth == 0,
        }),
    );
    if let Err(err) = installed {
        scheduler.complete(finish, Err(TaskError::Failed(FailureCode::Engine)));
        return Err(err.into());
    }

    let buf = vec![0; req.file().config().key_buffer_size];
    let level = Level {
        shared,
        target,
        scope,
        depth,
        anchor: Anchor::new(),
        buf,
        finish,
        children: Vec::new(),
    };
    let first = chain.append(req, |req| {
        Box::new(Page {
            req,
            level: Some(level),
            kds: Vec::new(),
            grow_to: None,
        })
    });
    if let Err(err) = first {
        scheduler.complete(finish, Err(TaskError::Failed(err.failure_code())));
        return Err(err);
    }
    chain.set_tail(finish);
    Ok(finish)
}

/// Start enumerating `target`'s keys.
pub(crate) fn start_listing(
    chain: &mut Chain,
    req: &Request,
    target: Arc<ObjectCell>,
    opts: &ListOptions,
    visitor: Arc<Mutex<dyn KeyVisitor>>,
    stats: Arc<Mutex<ListStats>>,
) -> ConnectorResult<TaskId> {
    let mut visited = HashSet::new();
    visited.insert(target.oid());
    let shared = Arc::new(IterShared {
        visitor,
        visited: Mutex::new(Some(visited)),
        stats,
        recursive: opts.recursive,
        prefetch: req.file().config().key_prefetch_size,
        stopped: AtomicBool::new(false),
        root: Mutex::new(Some(target.clone())),
    });
    start_level(chain, req, target, shared, opts.scope.clone(), 0)
}
