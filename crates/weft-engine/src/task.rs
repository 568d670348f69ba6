use std::fmt;

use weft_types::TaskResult;

use crate::scheduler::Scheduler;

/// Identifier of a task within one [`Scheduler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Outcome of [`TaskOps::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Run {
    /// The operation finished with this result.
    Done(TaskResult),
    /// The operation was issued; someone else completes the task later.
    Pending,
}

/// Handle passed to every callback.
#[derive(Clone)]
pub struct TaskContext {
    scheduler: Scheduler,
    id: TaskId,
}

impl TaskContext {
    pub(crate) fn new(scheduler: Scheduler, id: TaskId) -> Self {
        Self { scheduler, id }
    }

    /// The task this callback belongs to.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The scheduler the task lives in.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

/// Private data and callbacks of one task.
///
/// The value is owned by the engine from [`Scheduler::install`] until
/// `complete` consumes it, so dropping it is the task's final cleanup.
pub trait TaskOps: Send {
    /// Human-readable label, used for failure attribution.
    fn name(&self) -> &str;

    /// Called once every predecessor has completed, just before `run`.
    ///
    /// Returning an error finishes the task with that result; `run` is
    /// then never called.
    fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
        Ok(())
    }

    /// Issue the task's underlying operation.
    fn run(&mut self, ctx: &TaskContext) -> Run;

    /// Called exactly once with the task's final result.
    fn complete(self: Box<Self>, ctx: &TaskContext, result: TaskResult);
}

/// A task that succeeds as soon as its predecessors are done.
#[derive(Debug, Clone)]
pub struct Barrier {
    name: String,
}

impl Barrier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TaskOps for Barrier {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        Run::Done(Ok(()))
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, _result: TaskResult) {}
}
