//! Replicating a byte buffer from one participant to all others.

use tracing::{debug, trace};
use weft_engine::{Run, TaskContext, TaskId, TaskOps};
use weft_types::TaskResult;

use crate::chain::Chain;
use crate::error::ConnectorResult;
use crate::progress::comm_failure;
use crate::request::{Request, RequestRef};
use crate::slot::Slot;

/// What one broadcast carries.
///
/// Every participant builds the same sequence of broadcasts; the payload
/// decides per participant what to send and what to do with the result.
pub(crate) trait BroadcastPayload: Send {
    fn name(&self) -> &str;

    /// Rank that sends. Defaults to the coordinator.
    fn root(&self) -> usize {
        0
    }

    /// The buffer handed to the messaging layer. On the root it holds the
    /// data; elsewhere its length is the number of bytes expected.
    ///
    /// `None` skips the hop. The decision must be the same everywhere.
    fn outgoing(&mut self, req: &Request, root: bool) -> Option<Vec<u8>>;

    /// Consume the completed buffer.
    fn received(&mut self, req: &Request, buf: Vec<u8>, root: bool) -> TaskResult;
}

struct Broadcast {
    req: RequestRef,
    payload: Box<dyn BroadcastPayload>,
    meta: TaskId,
    sink: Slot<Vec<u8>>,
    root: bool,
}

impl TaskOps for Broadcast {
    fn name(&self) -> &str {
        self.payload.name()
    }

    // No short-circuit check: a participant that already failed must still
    // take part, or the others would wait forever.

    fn run(&mut self, ctx: &TaskContext) -> Run {
        let exec = self.req.file().exec().clone();
        let root = self.payload.root();
        self.root = exec.comm().rank() == root;
        let Some(buf) = self.payload.outgoing(&self.req, self.root) else {
            trace!(name = self.payload.name(), "skipping broadcast");
            return Run::Done(Ok(()));
        };
        match exec.comm().ibcast(buf, root) {
            Ok(pending) => {
                exec.post(ctx.scheduler().clone(), ctx.id(), pending, self.sink.clone());
                Run::Pending
            }
            Err(err) => {
                debug!(name = self.payload.name(), %err, "broadcast could not start");
                Run::Done(Err(comm_failure(&err)))
            }
        }
    }

    fn complete(self: Box<Self>, ctx: &TaskContext, result: TaskResult) {
        let Broadcast {
            req,
            mut payload,
            meta,
            sink,
            root,
        } = *self;
        let result = result.and_then(|()| match sink.take() {
            Some(buf) => payload.received(&req, buf, root),
            None => Ok(()),
        });
        req.record_result(result, payload.name());
        ctx.scheduler().complete(meta, Ok(()));
    }
}

/// Append a broadcast of `payload` to the chain.
///
/// The chain's tail becomes a meta task completed by the broadcast's
/// completion callback, so dependents wait for the logical broadcast
/// rather than for the task that started it.
pub(crate) fn broadcast(
    chain: &mut Chain,
    req: &Request,
    payload: Box<dyn BroadcastPayload>,
) -> ConnectorResult<TaskId> {
    let scheduler = chain.scheduler().clone();
    let meta = scheduler.reserve(&[])?;
    scheduler.schedule(meta)?;

    let appended = chain.append(req, |req| {
        Box::new(Broadcast {
            req,
            payload,
            meta,
            sink: Slot::new(),
            root: false,
        })
    });
    if let Err(err) = appended {
        scheduler.complete(meta, Ok(()));
        return Err(err);
    }
    chain.set_tail(meta);
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileContext;
    use crate::progress::{ExecContext, ProgressPump, Timeout};
    use std::sync::{Arc, Mutex};
    use weft_comm::{Communicator, InMemoryComm, InMemoryGroup, SoloComm};
    use weft_engine::Scheduler;
    use weft_store::InMemoryKvStore;
    use weft_types::{FailureCode, Status, TaskError};

    struct Echo {
        data: Vec<u8>,
        got: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl BroadcastPayload for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn outgoing(&mut self, _req: &Request, root: bool) -> Option<Vec<u8>> {
            Some(if root {
                self.data.clone()
            } else {
                vec![0; self.data.len()]
            })
        }

        fn received(&mut self, _req: &Request, buf: Vec<u8>, _root: bool) -> TaskResult {
            *self.got.lock().unwrap() = Some(buf);
            Ok(())
        }
    }

    fn file_for(comm: InMemoryComm) -> Arc<FileContext> {
        let exec = ExecContext::new(Scheduler::new("bcast"), Arc::new(comm));
        FileContext::new("c", Arc::new(InMemoryKvStore::new()), exec, Default::default())
    }

    fn run_echo(file: Arc<FileContext>, data: Vec<u8>) -> (Request, Option<Vec<u8>>) {
        let got = Arc::new(Mutex::new(None));
        let owner = Request::create(file.clone(), "bcast");
        let req = owner.handle();
        let mut chain = Chain::new(file.exec().scheduler().clone());
        broadcast(&mut chain, &req, Box::new(Echo { data, got: got.clone() })).unwrap();
        chain.start().unwrap();
        drop(owner);
        assert!(ProgressPump::default().run(file.exec(), None, Timeout::Wait));
        let got = got.lock().unwrap().take();
        (req, got)
    }

    #[test]
    fn solo_broadcast_hands_buffer_back() {
        let exec = ExecContext::new(Scheduler::new("solo"), Arc::new(SoloComm));
        let file = FileContext::new("c", Arc::new(InMemoryKvStore::new()), exec, Default::default());
        let (req, got) = run_echo(file, b"lease".to_vec());
        assert_eq!(got.as_deref(), Some(&b"lease"[..]));
        assert_eq!(req.status(), Status::Incomplete);
        assert!(req.is_reclaimed());
    }

    #[test]
    fn every_participant_receives_root_buffer() {
        let handles: Vec<_> = InMemoryGroup::new(3)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let data = if comm.rank() == 0 { b"abc".to_vec() } else { b"xyz".to_vec() };
                    run_echo(file_for(comm), data).1
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().as_deref(), Some(&b"abc"[..]));
        }
    }

    #[test]
    fn size_mismatch_is_truncation() {
        let handles: Vec<_> = InMemoryGroup::new(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let data = if comm.rank() == 0 { vec![1; 8] } else { vec![0; 4] };
                    run_echo(file_for(comm), data).0.status()
                })
            })
            .collect();
        let statuses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(statuses[0], Status::Incomplete);
        assert_eq!(statuses[1], Status::Failed(FailureCode::Truncated));
    }

    #[test]
    fn failed_start_still_completes_meta_task() {
        let comm = InMemoryGroup::new(1).remove(0);
        comm.fail_next_broadcast();
        let (req, got) = run_echo(file_for(comm), vec![7]);
        assert_eq!(got, None);
        assert_eq!(req.status(), Status::Failed(FailureCode::Messaging));
        assert_eq!(req.failed_task().as_deref(), Some("echo"));
    }

    #[test]
    fn broadcast_runs_after_local_failure() {
        let file = FileContext::detached();
        let got = Arc::new(Mutex::new(None));
        let owner = Request::create(file.clone(), "bcast");
        owner.record_failure(FailureCode::Store(2), "earlier");
        let mut chain = Chain::new(file.exec().scheduler().clone());
        broadcast(&mut chain, &owner, Box::new(Echo { data: vec![1], got: got.clone() })).unwrap();
        chain.start().unwrap();
        assert!(ProgressPump::default().run(file.exec(), None, Timeout::Wait));
        assert_eq!(got.lock().unwrap().take(), Some(vec![1]));
        assert_eq!(owner.check(), Err(TaskError::Propagated));
    }
}
