//! Driving the engine and the messaging layer to completion.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use weft_comm::{CommError, Communicator, PendingBroadcast};
use weft_engine::{Scheduler, TaskId};
use weft_types::{FailureCode, TaskError, TaskResult};

use crate::request::Request;
use crate::slot::Slot;

/// A broadcast started by a task and not yet observed complete.
struct InFlight {
    scheduler: Scheduler,
    task: TaskId,
    pending: Box<dyn PendingBroadcast>,
    sink: Slot<Vec<u8>>,
}

/// A scheduler paired with the broadcasts its tasks have in flight.
///
/// Each context tracks its own broadcasts, so several contexts can be
/// progressed independently.
#[derive(Clone)]
pub struct ExecContext {
    scheduler: Scheduler,
    comm: Arc<dyn Communicator>,
    in_flight: Arc<Mutex<VecDeque<InFlight>>>,
}

impl ExecContext {
    pub fn new(scheduler: Scheduler, comm: Arc<dyn Communicator>) -> Self {
        Self {
            scheduler,
            comm,
            in_flight: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// Track a started broadcast; `task` is completed when it finishes.
    pub(crate) fn post(
        &self,
        scheduler: Scheduler,
        task: TaskId,
        pending: Box<dyn PendingBroadcast>,
        sink: Slot<Vec<u8>>,
    ) {
        self.in_flight
            .lock()
            .expect("in-flight queue poisoned")
            .push_back(InFlight {
                scheduler,
                task,
                pending,
                sink,
            });
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().expect("in-flight queue poisoned").len()
    }

    /// Poll every in-flight broadcast once, completing the finished ones.
    ///
    /// Returns the number of tasks completed.
    pub fn poll_broadcasts(&self) -> usize {
        let mut finished: Vec<(Scheduler, TaskId, TaskResult)> = Vec::new();
        {
            let mut queue = self.in_flight.lock().expect("in-flight queue poisoned");
            let mut still = VecDeque::with_capacity(queue.len());
            while let Some(mut entry) = queue.pop_front() {
                match entry.pending.test() {
                    Ok(Some(buf)) => {
                        entry.sink.set(buf);
                        finished.push((entry.scheduler, entry.task, Ok(())));
                    }
                    Ok(None) => still.push_back(entry),
                    Err(err) => {
                        debug!(task = %entry.task, %err, "broadcast failed");
                        finished.push((entry.scheduler, entry.task, Err(comm_failure(&err))));
                    }
                }
            }
            *queue = still;
        }

        let count = finished.len();
        for (scheduler, task, result) in finished {
            trace!(task = %task, ?result, "broadcast finished");
            scheduler.complete(task, result);
        }
        count
    }
}

pub(crate) fn comm_failure(err: &CommError) -> TaskError {
    match err {
        CommError::LengthMismatch { .. } => TaskError::Failed(FailureCode::Truncated),
        _ => TaskError::Failed(FailureCode::Messaging),
    }
}

/// How long the pump may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// One non-blocking pass.
    Kick,
    /// No limit.
    Wait,
    After(Duration),
}

impl Timeout {
    pub fn from_option(timeout: Option<Duration>) -> Self {
        timeout.map_or(Timeout::Wait, Timeout::After)
    }
}

/// What the pump waits for.
#[derive(Clone, Copy, Debug)]
pub enum Until<'a> {
    /// The request's status leaves `Incomplete`/`ShortCircuit`.
    Status(&'a Request),
    /// Every reference to the request has been released.
    Reclaimed(&'a Request),
    /// The scheduler is empty and nothing is in flight.
    Empty,
}

/// Drives one or more execution contexts until a condition holds.
///
/// This is the only place where the connector waits.
#[derive(Clone, Copy, Debug)]
pub struct ProgressPump {
    poll_interval: Duration,
}

impl ProgressPump {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Pump until `req` (or, with `None`, the whole context) is done.
    ///
    /// Returns `true` if the condition was reached before the timeout.
    pub fn run(&self, exec: &ExecContext, req: Option<&Request>, timeout: Timeout) -> bool {
        let until = match req {
            Some(req) => Until::Status(req),
            None => Until::Empty,
        };
        self.run_until(&[exec], until, timeout)
    }

    /// Pump two contexts together, for chains linked across schedulers.
    pub fn run_pair(
        &self,
        first: &ExecContext,
        second: &ExecContext,
        req: Option<&Request>,
        timeout: Timeout,
    ) -> bool {
        let until = match req {
            Some(req) => Until::Status(req),
            None => Until::Empty,
        };
        self.run_until(&[first, second], until, timeout)
    }

    pub fn run_until(&self, execs: &[&ExecContext], until: Until<'_>, timeout: Timeout) -> bool {
        let deadline = match timeout {
            Timeout::After(limit) => Some(Instant::now() + limit),
            _ => None,
        };

        loop {
            let mut empty = true;
            for exec in execs {
                exec.poll_broadcasts();
                let slice = match (timeout, deadline) {
                    (Timeout::Kick, _) => Duration::ZERO,
                    (_, Some(deadline)) => self
                        .poll_interval
                        .min(deadline.saturating_duration_since(Instant::now())),
                    (_, None) => self.poll_interval,
                };
                // Split the slice so one idle context does not starve the other.
                let slice = slice / execs.len().max(1) as u32;
                let sched_empty = exec.scheduler().progress(slice);
                empty &= sched_empty && exec.in_flight() == 0;
            }

            if Self::reached(until, empty) {
                return true;
            }
            match (timeout, deadline) {
                (Timeout::Kick, _) => return false,
                (_, Some(deadline)) if Instant::now() >= deadline => return false,
                _ => {}
            }
        }
    }

    /// Async variant of [`ProgressPump::run_until`] that yields to tokio
    /// between non-blocking passes.
    pub async fn run_async(&self, exec: &ExecContext, until: Until<'_>, timeout: Timeout) -> bool {
        let started = Instant::now();
        loop {
            exec.poll_broadcasts();
            let empty = exec.scheduler().progress(Duration::ZERO) && exec.in_flight() == 0;
            if Self::reached(until, empty) {
                return true;
            }
            match timeout {
                Timeout::Kick => return false,
                Timeout::After(limit) if started.elapsed() >= limit => return false,
                _ => {}
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn reached(until: Until<'_>, empty: bool) -> bool {
        match until {
            Until::Status(req) => !req.status().is_in_progress(),
            Until::Reclaimed(req) => req.is_reclaimed(),
            Until::Empty => empty,
        }
    }
}

impl Default for ProgressPump {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::file::FileContext;
    use crate::request::RequestRef;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_comm::SoloComm;
    use weft_engine::{Run, TaskContext, TaskOps};
    use weft_types::TaskResult;

    struct Step {
        req: RequestRef,
        ran: Arc<AtomicUsize>,
        hang: bool,
    }

    impl TaskOps for Step {
        fn name(&self) -> &str {
            "step"
        }

        fn run(&mut self, _ctx: &TaskContext) -> Run {
            self.ran.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                Run::Pending
            } else {
                Run::Done(Ok(()))
            }
        }

        fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
            self.req.record_result(result, "step");
        }
    }

    fn step(ran: &Arc<AtomicUsize>, hang: bool) -> impl FnOnce(RequestRef) -> Box<dyn TaskOps> {
        let ran = ran.clone();
        move |req| Box::new(Step { req, ran, hang }) as Box<dyn TaskOps>
    }

    fn context(name: &str) -> ExecContext {
        ExecContext::new(Scheduler::new(name), Arc::new(SoloComm))
    }

    #[test]
    fn pair_drives_chain_linked_across_contexts() {
        let first = context("first");
        let second = context("second");
        let owner = Request::create(FileContext::detached(), "op");
        let ran = Arc::new(AtomicUsize::new(0));

        let mut chain = Chain::new(first.scheduler().clone());
        chain.append(&owner, step(&ran, false)).unwrap();
        chain.link_to(second.scheduler()).unwrap();
        chain.append(&owner, step(&ran, false)).unwrap();
        chain.start().unwrap();

        let pump = ProgressPump::default();
        assert!(pump.run_pair(&first, &second, None, Timeout::After(Duration::from_secs(5))));
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(owner.status().is_in_progress());
    }

    #[test]
    fn kick_makes_one_pass_and_reports_unfinished() {
        let exec = context("kick");
        let owner = Request::create(FileContext::detached(), "op");
        let ran = Arc::new(AtomicUsize::new(0));
        let mut chain = Chain::new(exec.scheduler().clone());
        chain.append(&owner, step(&ran, true)).unwrap();
        chain.start().unwrap();

        let pump = ProgressPump::default();
        assert!(!pump.run(&exec, None, Timeout::Kick));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bounded_wait_gives_up_at_deadline() {
        let exec = context("bounded");
        let owner = Request::create(FileContext::detached(), "op");
        let ran = Arc::new(AtomicUsize::new(0));
        let mut chain = Chain::new(exec.scheduler().clone());
        chain.append(&owner, step(&ran, true)).unwrap();
        chain.start().unwrap();

        let started = Instant::now();
        let pump = ProgressPump::new(Duration::from_millis(2));
        assert!(!pump.run(&exec, Some(&owner), Timeout::After(Duration::from_millis(20))));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn timeout_from_option() {
        assert_eq!(Timeout::from_option(None), Timeout::Wait);
        assert_eq!(
            Timeout::from_option(Some(Duration::from_millis(5))),
            Timeout::After(Duration::from_millis(5))
        );
    }
}
