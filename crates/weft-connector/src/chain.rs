//! Building chains of dependent tasks.
//!
//! Every step appended through [`Chain::append`] follows one contract:
//!
//! 1. The task is reserved in the engine, after the chain's current tail.
//!    If the engine rejects it, nothing else happens: no private data is
//!    built and the request's reference count is untouched.
//! 2. Only then is a counted request reference taken and the step's private
//!    data built around it and attached to the task.
//! 3. The first task of a brand-new chain is held back until
//!    [`Chain::start`], so the whole graph exists before anything runs.
//!    Later tasks are submitted immediately.
//! 4. The new task becomes the chain's tail.
//!
//! The step itself is responsible for the short-circuit check in its
//! prepare callback and for recording its own failure and releasing its
//! reference in its completion callback.

use tracing::{debug, trace};
use weft_engine::{Run, Scheduler, TaskContext, TaskId, TaskOps};
use weft_types::{FailureCode, TaskError, TaskResult};

use crate::error::{ConnectorError, ConnectorResult};
use crate::request::{Request, RequestRef};

/// Incrementally built chain of tasks sharing one request.
#[derive(Debug)]
pub struct Chain {
    scheduler: Scheduler,
    first: Option<TaskId>,
    tail: Option<TaskId>,
    running: bool,
}

impl Chain {
    /// Start a brand-new chain. Its first task is deferred until `start`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            first: None,
            tail: None,
            running: false,
        }
    }

    /// Continue a chain that is already running, after `tail`.
    pub fn resume(scheduler: Scheduler, tail: Option<TaskId>) -> Self {
        Self {
            scheduler,
            first: None,
            tail,
            running: true,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The deferred first task, if the chain has not started yet.
    pub fn first(&self) -> Option<TaskId> {
        self.first
    }

    pub fn tail(&self) -> Option<TaskId> {
        self.tail
    }

    fn deps(&self) -> Vec<TaskId> {
        self.tail.into_iter().collect()
    }

    /// Reserve a task after the tail without attaching callbacks.
    pub(crate) fn reserve(&self) -> ConnectorResult<TaskId> {
        Ok(self.scheduler.reserve(&self.deps())?)
    }

    /// Submit `id`, or hold it back as the chain's first task.
    pub(crate) fn submit(&mut self, id: TaskId) -> ConnectorResult<()> {
        if self.first.is_none() && !self.running {
            self.first = Some(id);
        } else {
            self.scheduler.schedule(id)?;
        }
        Ok(())
    }

    /// Replace the tail, e.g. with a meta task marking logical completion.
    pub(crate) fn set_tail(&mut self, id: TaskId) {
        self.tail = Some(id);
    }

    /// Attach `ops` to the reserved `id` and submit it.
    ///
    /// If the engine refuses either call, `id` is force-completed with an
    /// engine failure so no reserved task is left behind in the graph.
    pub(crate) fn install_and_submit(&mut self, id: TaskId, ops: Box<dyn TaskOps>) -> ConnectorResult<()> {
        let installed = self.scheduler.install(id, ops);
        let submitted = installed
            .map_err(ConnectorError::from)
            .and_then(|()| self.submit(id));
        if let Err(err) = submitted {
            debug!(task = %id, %err, "engine refused step");
            self.scheduler
                .complete(id, Err(TaskError::Failed(FailureCode::Engine)));
            return Err(err);
        }
        Ok(())
    }

    /// Append one step. `make` receives the step's request reference.
    pub fn append<F>(&mut self, req: &Request, make: F) -> ConnectorResult<TaskId>
    where
        F: FnOnce(RequestRef) -> Box<dyn TaskOps>,
    {
        let id = self.reserve()?;
        let ops = make(req.retain());
        trace!(task = %id, name = ops.name(), "appending step");
        self.install_and_submit(id, ops)?;
        self.tail = Some(id);
        Ok(id)
    }

    /// Drop `value` once the current tail completes.
    ///
    /// The release task runs even if an earlier step failed and does not
    /// become the tail, so later steps do not wait on it.
    pub fn release_after<T: Send + 'static>(&mut self, name: &str, value: T) -> ConnectorResult<TaskId> {
        let id = self.reserve()?;
        self.install_and_submit(
            id,
            Box::new(Release {
                name: name.to_string(),
                value: Some(value),
            }),
        )?;
        Ok(id)
    }

    /// Continue this chain on `target`.
    ///
    /// An empty task in `target` becomes the new tail; a task in the
    /// current scheduler, after the old tail, completes it.
    pub fn link_to(&mut self, target: &Scheduler) -> ConnectorResult<()> {
        if self.scheduler.same_as(target) {
            return Ok(());
        }
        let landing = target.reserve(&[])?;
        target.schedule(landing)?;

        let linked = self.reserve().and_then(|id| {
            self.install_and_submit(
                id,
                Box::new(Link {
                    target: target.clone(),
                    landing,
                }),
            )
        });
        if let Err(err) = linked {
            target.complete(landing, Err(TaskError::Failed(FailureCode::Engine)));
            return Err(err);
        }

        // The old scheduler's first task still needs starting; everything
        // appended from now on lives in the target and is submitted directly.
        if let Some(first) = self.first.take() {
            self.scheduler.schedule(first)?;
        }
        self.scheduler = target.clone();
        self.tail = Some(landing);
        self.running = true;
        Ok(())
    }

    /// Submit the deferred first task, if any. Returns it.
    pub fn start(&mut self) -> ConnectorResult<Option<TaskId>> {
        self.running = true;
        let first = self.first.take();
        if let Some(first) = first {
            self.scheduler.schedule(first)?;
        }
        Ok(first)
    }
}

struct Release<T> {
    name: String,
    value: Option<T>,
}

impl<T: Send> TaskOps for Release<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        self.value = None;
        Run::Done(Ok(()))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, _result: TaskResult) {}
}

struct Link {
    target: Scheduler,
    landing: TaskId,
}

impl TaskOps for Link {
    fn name(&self) -> &str {
        "scheduler link"
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        Run::Done(Ok(()))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        self.target.complete(self.landing, result);
    }
}
