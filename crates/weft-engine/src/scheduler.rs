use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use weft_types::TaskResult;

use crate::error::{EngineError, EngineResult};
use crate::task::{Run, TaskContext, TaskId, TaskOps};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Created, not yet ready to run.
    Created,
    /// In the ready queue.
    Ready,
    /// Callbacks are executing right now.
    Running,
    /// Meta task whose predecessors are done; waits for `complete`.
    Idle,
    /// `run` returned [`Run::Pending`]; waits for `complete`.
    InFlight,
    /// Completion callbacks are executing.
    Completing,
}

struct Slot {
    state: State,
    ops: Option<Box<dyn TaskOps>>,
    scheduled: bool,
    pending: usize,
    dependents: Vec<TaskId>,
    /// Result handed to `complete` while the task's callbacks were running.
    forced: Option<TaskResult>,
}

struct Inner {
    next_id: u64,
    slots: HashMap<TaskId, Slot>,
    ready: VecDeque<TaskId>,
    reject_after: Option<usize>,
    reject_install_after: Option<usize>,
    completed: u64,
}

impl Inner {
    /// Mark `id` ready if it is scheduled and has no pending predecessors.
    fn try_ready(&mut self, id: TaskId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            if slot.state == State::Created && slot.scheduled && slot.pending == 0 {
                slot.state = State::Ready;
                self.ready.push_back(id);
            }
        }
    }

    fn check_issued(&self, id: TaskId) -> EngineResult<()> {
        if id.0 == 0 || id.0 > self.next_id {
            return Err(EngineError::UnknownTask(id));
        }
        Ok(())
    }

    /// Wire `id` after `deps`. Completed predecessors are skipped.
    fn link(&mut self, id: TaskId, deps: &[TaskId]) -> usize {
        let mut pending = 0;
        for dep in deps {
            if let Some(slot) = self.slots.get_mut(dep) {
                slot.dependents.push(id);
                pending += 1;
            }
        }
        pending
    }
}

/// A task graph driven by explicit calls to [`Scheduler::progress`].
///
/// `Scheduler` is a cheap handle; clones share the same graph.
#[derive(Clone)]
pub struct Scheduler {
    name: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                slots: HashMap::new(),
                ready: VecDeque::new(),
                reject_after: None,
                reject_install_after: None,
                completed: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if both handles refer to the same graph.
    pub fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---------------------------------------------------------------
    // Graph construction
    // ---------------------------------------------------------------

    /// Create a task that waits on `deps`. It has no callbacks yet.
    pub fn reserve(&self, deps: &[TaskId]) -> EngineResult<TaskId> {
        let mut inner = self.inner.lock().expect("scheduler poisoned");
        if let Some(remaining) = inner.reject_after.as_mut() {
            if *remaining == 0 {
                inner.reject_after = None;
                debug!(scheduler = %self.name, "rejecting task creation");
                return Err(EngineError::Rejected(self.name.to_string()));
            }
            *remaining -= 1;
        }
        for dep in deps {
            inner.check_issued(*dep)?;
        }

        inner.next_id += 1;
        let id = TaskId(inner.next_id);
        let pending = inner.link(id, deps);
        inner.slots.insert(
            id,
            Slot {
                state: State::Created,
                ops: None,
                scheduled: false,
                pending,
                dependents: Vec::new(),
                forced: None,
            },
        );
        trace!(scheduler = %self.name, task = %id, pending, "reserved task");
        Ok(id)
    }

    /// Attach private data and callbacks to a reserved task.
    ///
    /// On refusal `ops` is dropped and the task stays reserved; the caller
    /// must complete it.
    pub fn install(&self, id: TaskId, ops: Box<dyn TaskOps>) -> EngineResult<()> {
        let mut inner = self.inner.lock().expect("scheduler poisoned");
        if let Some(remaining) = inner.reject_install_after.as_mut() {
            if *remaining == 0 {
                inner.reject_install_after = None;
                debug!(scheduler = %self.name, task = %id, "rejecting task callbacks");
                return Err(EngineError::InstallRejected(id));
            }
            *remaining -= 1;
        }
        let slot = inner.slots.get_mut(&id).ok_or(EngineError::UnknownTask(id))?;
        if slot.ops.is_some() {
            return Err(EngineError::AlreadyInstalled(id));
        }
        if slot.state != State::Created {
            return Err(EngineError::AlreadyStarted(id));
        }
        slot.ops = Some(ops);
        Ok(())
    }

    /// Reserve and install in one call.
    pub fn create(&self, deps: &[TaskId], ops: Box<dyn TaskOps>) -> EngineResult<TaskId> {
        let id = self.reserve(deps)?;
        self.install(id, ops)?;
        Ok(id)
    }

    /// Make a not-yet-started task also wait on `deps`.
    pub fn add_dependencies(&self, id: TaskId, deps: &[TaskId]) -> EngineResult<()> {
        let mut inner = self.inner.lock().expect("scheduler poisoned");
        for dep in deps {
            inner.check_issued(*dep)?;
        }
        match inner.slots.get(&id) {
            Some(slot) if slot.state == State::Created => {}
            Some(_) => return Err(EngineError::AlreadyStarted(id)),
            None => return Err(EngineError::UnknownTask(id)),
        }
        let added = inner.link(id, deps);
        if let Some(slot) = inner.slots.get_mut(&id) {
            slot.pending += added;
        }
        Ok(())
    }

    /// Submit a task. It runs once every predecessor has completed.
    pub fn schedule(&self, id: TaskId) -> EngineResult<()> {
        let mut inner = self.inner.lock().expect("scheduler poisoned");
        let slot = inner.slots.get_mut(&id).ok_or(EngineError::UnknownTask(id))?;
        slot.scheduled = true;
        inner.try_ready(id);
        Ok(())
    }

    /// Force-complete a task with `result`.
    ///
    /// Works in any state before completion: a task that never ran skips
    /// `prepare` and `run` but still gets its completion callback. Returns
    /// `false` if the task had already completed.
    pub fn complete(&self, id: TaskId, result: TaskResult) -> bool {
        let ops = {
            let mut inner = self.inner.lock().expect("scheduler poisoned");
            let Some(slot) = inner.slots.get_mut(&id) else {
                return false;
            };
            match slot.state {
                State::Completing => return false,
                State::Running => {
                    slot.forced.get_or_insert(result);
                    return true;
                }
                State::Created | State::Ready | State::Idle | State::InFlight => {
                    slot.state = State::Completing;
                    slot.ops.take()
                }
            }
        };
        self.finish(id, ops, result);
        true
    }

    fn finish(&self, id: TaskId, ops: Option<Box<dyn TaskOps>>, result: TaskResult) {
        if let Some(ops) = ops {
            trace!(scheduler = %self.name, task = %id, name = ops.name(), ?result, "completing task");
            let ctx = TaskContext::new(self.clone(), id);
            ops.complete(&ctx, result);
        }

        let mut inner = self.inner.lock().expect("scheduler poisoned");
        let Some(slot) = inner.slots.remove(&id) else {
            return;
        };
        inner.completed += 1;
        for dependent in slot.dependents {
            if let Some(dep_slot) = inner.slots.get_mut(&dependent) {
                dep_slot.pending = dep_slot.pending.saturating_sub(1);
            }
            inner.try_ready(dependent);
        }
    }

    // ---------------------------------------------------------------
    // Progress
    // ---------------------------------------------------------------

    /// Run ready tasks for up to `slice`, returning `true` if the graph is
    /// empty afterwards.
    ///
    /// Every task that is ready when the call starts gets a chance to run
    /// even with a zero slice. If nothing was ready, the call waits out the
    /// slice so external completions can arrive.
    pub fn progress(&self, slice: Duration) -> bool {
        let deadline = Instant::now() + slice;
        let mut ran = 0usize;

        loop {
            let next = {
                let mut inner = self.inner.lock().expect("scheduler poisoned");
                let mut found = None;
                while let Some(id) = inner.ready.pop_front() {
                    if let Some(slot) = inner.slots.get_mut(&id) {
                        if slot.state != State::Ready {
                            continue;
                        }
                        match slot.ops.take() {
                            Some(ops) => {
                                slot.state = State::Running;
                                found = Some((id, ops));
                                break;
                            }
                            None => slot.state = State::Idle,
                        }
                    }
                }
                found
            };

            let Some((id, ops)) = next else { break };
            self.execute(id, ops);
            ran += 1;
            if Instant::now() >= deadline && !self.has_ready() {
                break;
            }
        }

        let empty = self.is_empty();
        if ran == 0 && !empty && !slice.is_zero() {
            std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
        }
        empty
    }

    fn execute(&self, id: TaskId, mut ops: Box<dyn TaskOps>) {
        let ctx = TaskContext::new(self.clone(), id);
        let outcome = match ops.prepare(&ctx) {
            Err(err) => {
                trace!(task = %id, name = ops.name(), %err, "prepare finished task early");
                Some(Err(err))
            }
            Ok(()) => match ops.run(&ctx) {
                Run::Done(result) => Some(result),
                Run::Pending => None,
            },
        };

        let result = {
            let mut inner = self.inner.lock().expect("scheduler poisoned");
            let Some(slot) = inner.slots.get_mut(&id) else {
                return;
            };
            match (slot.forced.take(), outcome) {
                (Some(forced), _) => {
                    slot.state = State::Completing;
                    forced
                }
                (None, Some(result)) => {
                    slot.state = State::Completing;
                    result
                }
                (None, None) => {
                    slot.state = State::InFlight;
                    slot.ops = Some(ops);
                    return;
                }
            }
        };
        self.finish(id, Some(ops), result);
    }

    fn has_ready(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("scheduler poisoned")
            .ready
            .is_empty()
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Returns `true` if no task remains in the graph.
    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("scheduler poisoned")
            .slots
            .is_empty()
    }

    /// Number of tasks not yet completed.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("scheduler poisoned").slots.len()
    }

    /// Returns `true` once `id` has completed.
    pub fn is_complete(&self, id: TaskId) -> bool {
        let inner = self.inner.lock().expect("scheduler poisoned");
        id.0 != 0 && id.0 <= inner.next_id && !inner.slots.contains_key(&id)
    }

    /// Total number of tasks completed so far.
    pub fn completed(&self) -> u64 {
        self.inner.lock().expect("scheduler poisoned").completed
    }

    /// Let `after` more task creations succeed, then reject the next one.
    pub fn inject_rejection(&self, after: usize) {
        self.inner.lock().expect("scheduler poisoned").reject_after = Some(after);
    }

    /// Let `after` more installs succeed, then reject the next one.
    pub fn inject_install_rejection(&self, after: usize) {
        self.inner.lock().expect("scheduler poisoned").reject_install_after = Some(after);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("scheduler poisoned");
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("tasks", &inner.slots.len())
            .field("ready", &inner.ready.len())
            .field("completed", &inner.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Barrier;
    use std::sync::Mutex as StdMutex;
    use weft_types::{FailureCode, TaskError};

    type Log = Arc<StdMutex<Vec<String>>>;

    struct Step {
        name: String,
        log: Log,
        prep: TaskResult,
        run: Option<TaskResult>,
    }

    impl Step {
        fn ok(name: &str, log: &Log) -> Box<Self> {
            Box::new(Self {
                name: name.into(),
                log: log.clone(),
                prep: Ok(()),
                run: Some(Ok(())),
            })
        }
    }

    impl TaskOps for Step {
        fn name(&self) -> &str {
            &self.name
        }

        fn prepare(&mut self, _ctx: &TaskContext) -> TaskResult {
            self.log.lock().unwrap().push(format!("prep {}", self.name));
            self.prep
        }

        fn run(&mut self, _ctx: &TaskContext) -> Run {
            self.log.lock().unwrap().push(format!("run {}", self.name));
            match self.run {
                Some(result) => Run::Done(result),
                None => Run::Pending,
            }
        }

        fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
            self.log
                .lock()
                .unwrap()
                .push(format!("done {} {:?}", self.name, result));
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    // ---- Ordering ----

    #[test]
    fn predecessors_complete_before_dependents_prepare() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let a = sched.create(&[], Step::ok("a", &log)).unwrap();
        let b = sched.create(&[a], Step::ok("b", &log)).unwrap();
        sched.schedule(b).unwrap();
        sched.schedule(a).unwrap();

        assert!(sched.progress(Duration::ZERO));
        assert_eq!(
            entries(&log),
            vec!["prep a", "run a", "done a Ok(())", "prep b", "run b", "done b Ok(())"]
        );
    }

    #[test]
    fn unscheduled_task_never_runs() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let a = sched.create(&[], Step::ok("a", &log)).unwrap();
        assert!(!sched.progress(Duration::ZERO));
        assert!(entries(&log).is_empty());
        assert!(!sched.is_complete(a));
    }

    #[test]
    fn dependency_on_completed_task_is_satisfied() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let a = sched.create(&[], Step::ok("a", &log)).unwrap();
        sched.schedule(a).unwrap();
        sched.progress(Duration::ZERO);
        assert!(sched.is_complete(a));

        let b = sched.create(&[a], Step::ok("b", &log)).unwrap();
        sched.schedule(b).unwrap();
        assert!(sched.progress(Duration::ZERO));
        assert!(sched.is_complete(b));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let sched = Scheduler::new("test");
        assert_eq!(
            sched.reserve(&[TaskId(99)]),
            Err(EngineError::UnknownTask(TaskId(99)))
        );
    }

    // ---- Prepare and completion ----

    #[test]
    fn failing_prepare_skips_run_but_completes() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let mut step = Step::ok("a", &log);
        step.prep = Err(TaskError::Propagated);
        let a = sched.create(&[], step).unwrap();
        sched.schedule(a).unwrap();
        sched.progress(Duration::ZERO);
        assert_eq!(entries(&log), vec!["prep a", "done a Err(Propagated)"]);
    }

    #[test]
    fn pending_task_waits_for_external_completion() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let mut step = Step::ok("a", &log);
        step.run = None;
        let a = sched.create(&[], step).unwrap();
        let b = sched.create(&[a], Step::ok("b", &log)).unwrap();
        sched.schedule(a).unwrap();
        sched.schedule(b).unwrap();

        assert!(!sched.progress(Duration::ZERO));
        assert_eq!(entries(&log), vec!["prep a", "run a"]);

        let code = Err(TaskError::Failed(FailureCode::Messaging));
        assert!(sched.complete(a, code));
        assert!(!sched.complete(a, Ok(())));
        assert!(sched.progress(Duration::ZERO));
        assert_eq!(entries(&log)[2], "done a Err(Failed(Messaging))");
        assert_eq!(entries(&log)[3], "prep b");
    }

    #[test]
    fn force_completion_skips_prepare() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let a = sched.create(&[], Step::ok("a", &log)).unwrap();
        sched.complete(a, Err(TaskError::ShortCircuit));
        assert_eq!(entries(&log), vec!["done a Err(ShortCircuit)"]);
        assert!(sched.is_empty());
    }

    #[test]
    fn meta_task_waits_until_completed() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let meta = sched.reserve(&[]).unwrap();
        sched.schedule(meta).unwrap();
        let after = sched.create(&[meta], Step::ok("after", &log)).unwrap();
        sched.schedule(after).unwrap();

        assert!(!sched.progress(Duration::ZERO));
        assert!(entries(&log).is_empty());
        sched.complete(meta, Ok(()));
        assert!(sched.progress(Duration::ZERO));
        assert_eq!(entries(&log).len(), 3);
    }

    #[test]
    fn barrier_completes_after_all_predecessors() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let a = sched.create(&[], Step::ok("a", &log)).unwrap();
        let b = sched.create(&[], Step::ok("b", &log)).unwrap();
        let barrier = sched.create(&[a, b], Box::new(Barrier::new("join"))).unwrap();
        for id in [a, b, barrier] {
            sched.schedule(id).unwrap();
        }
        assert!(sched.progress(Duration::ZERO));
        assert!(sched.is_complete(barrier));
        assert_eq!(sched.completed(), 3);
    }

    #[test]
    fn added_dependency_delays_task() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let meta = sched.reserve(&[]).unwrap();
        let a = sched.create(&[], Step::ok("a", &log)).unwrap();
        sched.add_dependencies(a, &[meta]).unwrap();
        sched.schedule(a).unwrap();
        sched.progress(Duration::ZERO);
        assert!(entries(&log).is_empty());
        sched.complete(meta, Ok(()));
        sched.progress(Duration::ZERO);
        assert!(sched.is_complete(a));
    }

    // ---- Rejection ----

    #[test]
    fn injected_rejection_fires_once() {
        let sched = Scheduler::new("test");
        sched.inject_rejection(1);
        assert!(sched.reserve(&[]).is_ok());
        assert!(matches!(sched.reserve(&[]), Err(EngineError::Rejected(_))));
        assert!(sched.reserve(&[]).is_ok());
    }

    #[test]
    fn rejected_install_leaves_task_reserved() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        sched.inject_install_rejection(0);
        let a = sched.reserve(&[]).unwrap();
        assert_eq!(
            sched.install(a, Step::ok("a", &log)),
            Err(EngineError::InstallRejected(a))
        );
        assert!(!sched.progress(Duration::ZERO));
        assert!(sched.complete(a, Ok(())));
        assert!(sched.progress(Duration::ZERO));
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn install_twice_is_an_error() {
        let sched = Scheduler::new("test");
        let log = Log::default();
        let a = sched.create(&[], Step::ok("a", &log)).unwrap();
        assert_eq!(
            sched.install(a, Step::ok("again", &log)),
            Err(EngineError::AlreadyInstalled(a))
        );
    }
}
