//! Non-blocking task engine for Weft.
//!
//! A [`Scheduler`] holds a graph of tasks. Each task carries one private
//! [`TaskOps`] value (its prepare, run and completion callbacks) and waits
//! on an explicit list of predecessor tasks. Nothing runs until
//! [`Scheduler::progress`] is called; the engine never spawns threads.
//!
//! # Task lifecycle
//!
//! 1. [`Scheduler::reserve`] creates the task and wires its predecessors.
//!    This is the only step that can be rejected.
//! 2. [`Scheduler::install`] attaches the private data. A task without
//!    private data is a *meta task*: it never runs and only completes when
//!    someone calls [`Scheduler::complete`] on it.
//! 3. [`Scheduler::schedule`] submits the task. It becomes ready once every
//!    predecessor has completed.
//! 4. On progress, `prepare` runs first and may finish the task without
//!    running it; otherwise `run` either finishes the task or leaves it in
//!    flight for an external [`Scheduler::complete`].
//! 5. Completion callbacks run before any dependent is released.
//!
//! Callbacks always run with the scheduler unlocked, so they may create,
//! schedule and complete other tasks.

pub mod error;
pub mod scheduler;
pub mod task;

pub use error::{EngineError, EngineResult};
pub use scheduler::Scheduler;
pub use task::{Barrier, Run, TaskContext, TaskId, TaskOps};
