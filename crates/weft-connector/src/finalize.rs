//! The terminal step of every request.
//!
//! The finalizer waits on the whole chain. If the request opened a
//! transaction it commits it, or aborts it when a failure was recorded,
//! then closes the handle. Only after that does the request get its
//! single notification and lose the finalizer's reference.

use tracing::{debug, error, warn};
use weft_engine::{Run, TaskContext, TaskId, TaskOps};
use weft_store::TxHandle;
use weft_types::{FailureCode, Status, TaskError, TaskResult};

use crate::chain::Chain;
use crate::error::{ConnectorError, ConnectorResult};
use crate::request::{Request, RequestRef};
use crate::slot::Slot;
use crate::steps::store_failure;

const FINALIZER: &str = "transaction finalizer";

/// Notify a drained request.
fn settle(req: &Request) {
    if let Status::Failed(code) = req.status() {
        let task = req.failed_task().unwrap_or_default();
        error!(operation = req.operation(), %code, "operation failed in task \"{task}\"");
    }
    req.mark_complete();
    req.notify();
}

/// Close the transaction without going through the engine.
fn close_now(req: &Request, th: TxHandle) {
    if let Err(err) = req.file().store().tx_close(th) {
        warn!(%th, %err, "failed to close transaction");
        req.record_failure(FailureCode::Close, "transaction close");
    }
    req.mark_tx_closed();
}

/// Give up on a request the engine would not finalize: end its
/// transaction here and notify it.
fn refuse(owner: RequestRef) {
    owner.record_failure(FailureCode::Engine, FINALIZER);
    if let Some(th) = owner.current_tx() {
        close_now(&owner, th);
    }
    settle(&owner);
}

struct Finalize {
    /// The creation reference. Shared with the commit or abort step so a
    /// refused install never loses it.
    owner: Slot<RequestRef>,
    req: Request,
}

impl TaskOps for Finalize {
    fn name(&self) -> &str {
        FINALIZER
    }

    fn run(&mut self, ctx: &TaskContext) -> Run {
        let Some(th) = self.req.current_tx() else {
            return Run::Done(Ok(()));
        };
        let scheduler = ctx.scheduler();
        let id = match scheduler.reserve(&[]) {
            Ok(id) => id,
            Err(err) => {
                debug!(%err, "engine refused transaction end, closing synchronously");
                self.req.record_failure(FailureCode::Engine, FINALIZER);
                close_now(&self.req, th);
                return Run::Done(Ok(()));
            }
        };

        let end = TxEnd {
            owner: self.owner.clone(),
            req: self.req.clone(),
            th,
            commit: !self.req.status().is_unrecoverable(),
            finalize: ctx.id(),
        };
        if let Err(err) = scheduler.install(id, Box::new(end)).and_then(|()| scheduler.schedule(id)) {
            error!(%err, "could not submit transaction end");
            scheduler.complete(id, Err(TaskError::Failed(FailureCode::Engine)));
            if self.owner.is_set() {
                // The transaction end never got its callbacks.
                self.req.record_failure(FailureCode::Engine, FINALIZER);
                if let Some(th) = self.req.current_tx() {
                    close_now(&self.req, th);
                }
                return Run::Done(Ok(()));
            }
        }
        Run::Pending
    }

    fn complete(self: Box<Self>, _ctx: &TaskContext, result: TaskResult) {
        let Some(req) = self.owner.take() else { return };
        req.record_result(result, FINALIZER);
        // Force-completed before it could run.
        if let Some(th) = req.current_tx() {
            close_now(&req, th);
        }
        settle(&req);
    }
}

/// Commit or abort, then close the transaction.
struct TxEnd {
    owner: Slot<RequestRef>,
    req: Request,
    th: TxHandle,
    commit: bool,
    finalize: TaskId,
}

impl TxEnd {
    fn label(&self) -> &'static str {
        if self.commit {
            "transaction commit"
        } else {
            "transaction abort"
        }
    }
}

impl TaskOps for TxEnd {
    fn name(&self) -> &str {
        self.label()
    }

    // No short-circuit check: an aborted transaction still has to end.

    fn run(&mut self, _ctx: &TaskContext) -> Run {
        let store = self.req.file().store();
        let ended = if self.commit {
            store.tx_commit(self.th)
        } else {
            store.tx_abort(self.th)
        };
        Run::Done(ended.map_err(|err| store_failure(&err)))
    }

    fn complete(self: Box<Self>, ctx: &TaskContext, result: TaskResult) {
        let label = self.label();
        let TxEnd { owner, th, finalize, .. } = *self;
        let Some(req) = owner.take() else {
            ctx.scheduler().complete(finalize, result);
            return;
        };
        req.record_result(result, label);
        close_now(&req, th);
        debug!(operation = req.operation(), %th, label, "transaction ended");
        settle(&req);
        ctx.scheduler().complete(finalize, Ok(()));
        drop(req);
    }
}

/// Append the finalizer after the chain's tail. It takes over `owner`,
/// the reference handed out when the request was created.
///
/// If the engine refuses the finalizer, the request is settled right away
/// and the refusal is returned.
pub(crate) fn append(chain: &mut Chain, owner: RequestRef) -> ConnectorResult<TaskId> {
    let id = match chain.reserve() {
        Ok(id) => id,
        Err(err) => {
            refuse(owner);
            return Err(err);
        }
    };
    let req = owner.handle();
    let held = Slot::filled(owner);
    let finalize = Finalize { owner: held.clone(), req };
    let installed = chain.scheduler().install(id, Box::new(finalize));
    let submitted = installed
        .map_err(ConnectorError::from)
        .and_then(|()| chain.submit(id));
    if let Err(err) = submitted {
        // An installed finalizer settles from its completion callback.
        chain
            .scheduler()
            .complete(id, Err(TaskError::Failed(FailureCode::Engine)));
        if let Some(owner) = held.take() {
            refuse(owner);
        }
        return Err(err);
    }
    chain.set_tail(id);
    Ok(id)
}
