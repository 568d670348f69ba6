//! Request lifecycle and reference counting.
//!
//! A [`Request`] is the unit of work threaded through every task of one
//! logical operation. It owns the overall status, failure attribution, the
//! lazily opened transaction and the completion notification.
//!
//! Tasks never hold a bare `Request`: they hold a [`RequestRef`], obtained
//! from [`Request::retain`], whose drop performs the matching release. The
//! request's resources are reclaimed when the last reference goes away.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use weft_store::TxHandle;
use weft_types::{FailureCode, Status, TaskError, TaskResult};

use crate::file::FileContext;

/// Outcome reported to a request's notify callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Canceled,
    Failed,
}

type NotifyFn = Box<dyn FnOnce(Outcome) + Send>;

struct State {
    status: Status,
    failed_task: Option<String>,
    ref_count: usize,
    tx: Option<TxHandle>,
    tx_open: bool,
    notify: Option<NotifyFn>,
    notified: bool,
    reclaimed: bool,
}

struct Inner {
    operation: String,
    file: Arc<FileContext>,
    state: Mutex<State>,
    retains: AtomicUsize,
    releases: AtomicUsize,
    reclaims: AtomicUsize,
    contract_violations: AtomicUsize,
}

/// Snapshot of a request's reference accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefStats {
    /// References taken, counting the one handed out at creation.
    pub retains: usize,
    pub releases: usize,
    /// Times the request's resources were reclaimed. At most one.
    pub reclaims: usize,
    /// Releases that reached zero while a transaction was still open.
    pub contract_violations: usize,
}

/// Shared, uncounted handle to a request.
///
/// Clones observe the same request but do not keep its resources alive;
/// use [`Request::retain`] for that.
#[derive(Clone)]
pub struct Request(Arc<Inner>);

impl Request {
    /// Start a new request for `operation` against `file`.
    ///
    /// The request starts `Incomplete` with a reference count of one; the
    /// returned [`RequestRef`] is that first reference and is normally
    /// handed to the transaction finalizer.
    pub fn create(file: Arc<FileContext>, operation: impl Into<String>) -> RequestRef {
        let operation = operation.into();
        debug!(operation = %operation, "created request");
        let req = Request(Arc::new(Inner {
            operation,
            file,
            state: Mutex::new(State {
                status: Status::Incomplete,
                failed_task: None,
                ref_count: 1,
                tx: None,
                tx_open: false,
                notify: None,
                notified: false,
                reclaimed: false,
            }),
            retains: AtomicUsize::new(1),
            releases: AtomicUsize::new(0),
            reclaims: AtomicUsize::new(0),
            contract_violations: AtomicUsize::new(0),
        }));
        RequestRef { req }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.0.state.lock().expect("request state poisoned")
    }

    pub fn operation(&self) -> &str {
        &self.0.operation
    }

    pub(crate) fn file(&self) -> &Arc<FileContext> {
        &self.0.file
    }

    // ---------------------------------------------------------------
    // Reference counting
    // ---------------------------------------------------------------

    /// Take a counted reference.
    pub fn retain(&self) -> RequestRef {
        let mut state = self.state();
        state.ref_count += 1;
        self.0.retains.fetch_add(1, Ordering::SeqCst);
        RequestRef { req: self.clone() }
    }

    /// Drop one reference. The last one reclaims the request; a
    /// transaction left open at that point is closed here.
    fn release(&self) {
        let leaked = {
            let mut state = self.state();
            self.0.releases.fetch_add(1, Ordering::SeqCst);
            state.ref_count = state.ref_count.saturating_sub(1);
            if state.ref_count > 0 {
                return;
            }
            let leaked = if state.tx_open {
                self.0.contract_violations.fetch_add(1, Ordering::SeqCst);
                error!(
                    operation = %self.0.operation,
                    "request released with its transaction still open"
                );
                state.tx_open = false;
                state.tx
            } else {
                None
            };
            if !state.reclaimed {
                state.reclaimed = true;
                state.notify = None;
                self.0.reclaims.fetch_add(1, Ordering::SeqCst);
                debug!(operation = %self.0.operation, status = %state.status, "reclaimed request");
            }
            leaked
        };
        if let Some(th) = leaked {
            if let Err(err) = self.0.file.store().tx_close(th) {
                warn!(%th, %err, "failed to close leaked transaction");
            }
        }
    }

    pub fn ref_count(&self) -> usize {
        self.state().ref_count
    }

    pub fn ref_stats(&self) -> RefStats {
        RefStats {
            retains: self.0.retains.load(Ordering::SeqCst),
            releases: self.0.releases.load(Ordering::SeqCst),
            reclaims: self.0.reclaims.load(Ordering::SeqCst),
            contract_violations: self.0.contract_violations.load(Ordering::SeqCst),
        }
    }

    /// Returns `true` once the last reference was released.
    pub fn is_reclaimed(&self) -> bool {
        self.state().reclaimed
    }

    // ---------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------

    pub fn status(&self) -> Status {
        self.state().status
    }

    /// Label of the first task that failed.
    pub fn failed_task(&self) -> Option<String> {
        self.state().failed_task.clone()
    }

    /// Record a failure unless one is already recorded.
    ///
    /// Returns `true` if this call's failure became the request's status.
    pub fn record_failure(&self, code: FailureCode, task: &str) -> bool {
        let mut state = self.state();
        if state.status.is_unrecoverable() {
            debug!(task, %code, first = ?state.failed_task, "ignoring later failure");
            return false;
        }
        state.status = Status::Failed(code);
        state.failed_task = Some(task.to_string());
        error!(operation = %self.0.operation, task, %code, "task failed");
        true
    }

    /// Record a task's result if it carries a recordable failure.
    pub fn record_result(&self, result: TaskResult, task: &str) {
        if let Err(err) = result {
            if let Some(code) = err.recordable() {
                self.record_failure(code, task);
            }
        }
    }

    /// The error a prepare callback should finish with, if any.
    ///
    /// This is the short-circuit check every step performs.
    pub fn check(&self) -> TaskResult {
        match self.status() {
            Status::ShortCircuit => Err(TaskError::ShortCircuit),
            status if status.is_unrecoverable() => Err(TaskError::Propagated),
            _ => Ok(()),
        }
    }

    /// Move from `Incomplete` to `ShortCircuit`. Returns `true` on change.
    pub fn short_circuit(&self) -> bool {
        let mut state = self.state();
        if state.status == Status::Incomplete {
            state.status = Status::ShortCircuit;
            return true;
        }
        false
    }

    /// Undo [`Request::short_circuit`] once draining has finished.
    pub fn clear_short_circuit(&self) {
        let mut state = self.state();
        if state.status == Status::ShortCircuit {
            state.status = Status::Incomplete;
        }
    }

    /// Cancel the request. Has no effect once a failure is recorded.
    pub fn cancel(&self) -> bool {
        self.record_failure(FailureCode::Canceled, "cancel")
    }

    /// Mark a drained request complete. Failed requests keep their status.
    pub(crate) fn mark_complete(&self) {
        let mut state = self.state();
        if state.status.is_in_progress() {
            state.status = Status::Complete;
        }
    }

    // ---------------------------------------------------------------
    // Transaction
    // ---------------------------------------------------------------

    /// The open transaction, opening one on first use.
    pub(crate) fn transaction(&self) -> Result<TxHandle, FailureCode> {
        let mut state = self.state();
        if let Some(th) = state.tx {
            return Ok(th);
        }
        let coh = self.0.file.container();
        let th = self
            .0
            .file
            .store()
            .tx_open(coh)
            .map_err(|e| FailureCode::Store(e.code()))?;
        debug!(operation = %self.0.operation, %th, "opened transaction");
        state.tx = Some(th);
        state.tx_open = true;
        Ok(th)
    }

    /// The transaction, if one was opened.
    pub fn current_tx(&self) -> Option<TxHandle> {
        let state = self.state();
        state.tx.filter(|_| state.tx_open)
    }

    pub fn tx_open(&self) -> bool {
        self.state().tx_open
    }

    /// Forget the transaction after it was closed.
    pub(crate) fn mark_tx_closed(&self) {
        self.state().tx_open = false;
    }

    // ---------------------------------------------------------------
    // Notification
    // ---------------------------------------------------------------

    /// Register the callback invoked once the request drains.
    pub fn on_complete<F>(&self, notify: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.state().notify = Some(Box::new(notify));
    }

    /// Channel resolved with the outcome once the request drains.
    pub fn completion(&self) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx
    }

    /// Outcome implied by the current status.
    pub fn outcome(&self) -> Outcome {
        match self.status() {
            Status::Failed(FailureCode::Canceled) => Outcome::Canceled,
            Status::Failed(_) => Outcome::Failed,
            _ => Outcome::Succeeded,
        }
    }

    /// Invoke the notify callback. Only the first call has any effect.
    pub(crate) fn notify(&self) -> bool {
        let outcome = self.outcome();
        let callback = {
            let mut state = self.state();
            if state.notified {
                return false;
            }
            state.notified = true;
            state.notify.take()
        };
        if let Some(callback) = callback {
            callback(outcome);
        }
        true
    }

    pub fn is_notified(&self) -> bool {
        self.state().notified
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Request")
            .field("operation", &self.0.operation)
            .field("status", &state.status)
            .field("failed_task", &state.failed_task)
            .field("ref_count", &state.ref_count)
            .finish()
    }
}

/// Counted reference to a [`Request`]. Dropping it releases the reference.
pub struct RequestRef {
    req: Request,
}

impl RequestRef {
    /// Uncounted handle for observing the request.
    pub fn handle(&self) -> Request {
        self.req.clone()
    }
}

impl std::ops::Deref for RequestRef {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.req
    }
}

impl Drop for RequestRef {
    fn drop(&mut self) {
        self.req.release();
    }
}

impl fmt::Debug for RequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.req.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileContext;
    use std::sync::atomic::AtomicBool;

    fn request() -> RequestRef {
        Request::create(FileContext::detached(), "test op")
    }

    // ---- Reference counting ----

    #[test]
    fn starts_incomplete_with_one_reference() {
        let req = request();
        assert_eq!(req.status(), Status::Incomplete);
        assert_eq!(req.ref_count(), 1);
        assert!(!req.tx_open());
    }

    #[test]
    fn retain_and_release_balance() {
        let owner = request();
        let handle = owner.handle();
        let a = owner.retain();
        let b = a.retain();
        assert_eq!(handle.ref_count(), 3);
        drop(a);
        drop(b);
        assert!(!handle.is_reclaimed());
        drop(owner);
        assert!(handle.is_reclaimed());
        let stats = handle.ref_stats();
        assert_eq!(stats.retains, stats.releases);
        assert_eq!(stats.reclaims, 1);
    }

    // ---- Failure capture ----

    #[test]
    fn first_failure_wins() {
        let req = request();
        assert!(req.record_failure(FailureCode::Store(3), "step three"));
        assert!(!req.record_failure(FailureCode::Store(4), "step four"));
        assert_eq!(req.status(), Status::Failed(FailureCode::Store(3)));
        assert_eq!(req.failed_task().as_deref(), Some("step three"));
    }

    #[test]
    fn propagated_results_are_not_recorded() {
        let req = request();
        req.record_result(Err(TaskError::Propagated), "skipped");
        req.record_result(Err(TaskError::ShortCircuit), "skipped");
        assert_eq!(req.status(), Status::Incomplete);
        assert_eq!(req.check(), Ok(()));
        req.record_result(Err(TaskError::Failed(FailureCode::Close)), "close");
        assert_eq!(req.check(), Err(TaskError::Propagated));
    }

    #[test]
    fn check_stops_short_circuited_steps() {
        let req = request();
        req.short_circuit();
        assert_eq!(req.check(), Err(TaskError::ShortCircuit));
        req.clear_short_circuit();
        assert_eq!(req.check(), Ok(()));
    }

    #[test]
    fn failure_overrides_short_circuit() {
        let req = request();
        assert!(req.short_circuit());
        assert!(!req.short_circuit());
        assert_eq!(req.status(), Status::ShortCircuit);
        req.record_failure(FailureCode::Remote, "peer");
        req.clear_short_circuit();
        assert_eq!(req.status(), Status::Failed(FailureCode::Remote));
    }

    #[test]
    fn cancel_is_a_distinguished_failure() {
        let req = request();
        assert!(req.cancel());
        assert_eq!(req.outcome(), Outcome::Canceled);
        assert!(!req.cancel());
    }

    // ---- Notification ----

    #[test]
    fn notify_fires_once() {
        let req = request();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        req.on_complete(move |outcome| {
            assert_eq!(outcome, Outcome::Succeeded);
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        assert!(req.notify());
        assert!(!req.notify());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn completion_channel_reports_outcome() {
        let req = request();
        let rx = req.completion();
        req.record_failure(FailureCode::Messaging, "bcast");
        req.notify();
        assert_eq!(rx.await.unwrap(), Outcome::Failed);
    }

    #[test]
    fn mark_complete_keeps_failures() {
        let req = request();
        req.mark_complete();
        assert_eq!(req.status(), Status::Complete);

        let failed = request();
        failed.record_failure(FailureCode::BadValue, "prep");
        failed.mark_complete();
        assert_eq!(failed.status(), Status::Failed(FailureCode::BadValue));
    }
}
