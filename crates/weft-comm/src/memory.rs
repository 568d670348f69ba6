use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, trace};

use crate::error::{CommError, CommResult};
use crate::traits::{Communicator, PendingBroadcast};

/// One broadcast on the wire.
#[derive(Clone, Debug)]
struct Frame {
    root: usize,
    seq: u64,
    payload: Bytes,
}

/// Frames received but not yet claimed by a pending broadcast.
struct Inbox {
    rx: broadcast::Receiver<Frame>,
    stash: HashMap<u64, Bytes>,
}

impl Inbox {
    /// Move every queued frame sent by another participant into the stash.
    fn drain(&mut self, rank: usize) -> CommResult<()> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if frame.root != rank {
                        self.stash.insert(frame.seq, frame.payload);
                    }
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Lagged(missed)) => return Err(CommError::Lagged(missed)),
                Err(TryRecvError::Closed) => return Err(CommError::Disconnected),
            }
        }
    }
}

/// Builds the members of an in-process broadcast group.
pub struct InMemoryGroup;

impl InMemoryGroup {
    /// Frames buffered per participant before it starts lagging.
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Create `size` connected participants, ranks `0..size`.
    pub fn new(size: usize) -> Vec<InMemoryComm> {
        Self::with_capacity(size, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(size: usize, capacity: usize) -> Vec<InMemoryComm> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        (0..size)
            .map(|rank| InMemoryComm {
                rank,
                size,
                inbox: Arc::new(Mutex::new(Inbox {
                    rx: tx.subscribe(),
                    stash: HashMap::new(),
                })),
                tx: tx.clone(),
                next_seq: AtomicU64::new(0),
                fail_next: AtomicBool::new(false),
            })
            .collect()
    }
}

/// One participant of an [`InMemoryGroup`].
pub struct InMemoryComm {
    rank: usize,
    size: usize,
    tx: broadcast::Sender<Frame>,
    inbox: Arc<Mutex<Inbox>>,
    next_seq: AtomicU64,
    fail_next: AtomicBool,
}

impl InMemoryComm {
    /// Make the next broadcast started by this participant fail.
    pub fn fail_next_broadcast(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Communicator for InMemoryComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn ibcast(&self, buf: Vec<u8>, root: usize) -> CommResult<Box<dyn PendingBroadcast>> {
        if root >= self.size {
            return Err(CommError::InvalidRoot {
                root,
                size: self.size,
            });
        }
        // Consume the sequence number even on failure so later broadcasts
        // stay aligned with the rest of the group.
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            debug!(rank = self.rank, seq, "injected broadcast failure");
            return Err(CommError::Injected);
        }

        if self.rank == root {
            let frame = Frame {
                root,
                seq,
                payload: Bytes::copy_from_slice(&buf),
            };
            self.tx.send(frame).map_err(|_| CommError::Disconnected)?;
            trace!(rank = self.rank, seq, len = buf.len(), "sent broadcast");
            Ok(Box::new(Sent {
                rank: self.rank,
                buf: Some(buf),
                inbox: Arc::clone(&self.inbox),
            }))
        } else {
            Ok(Box::new(Receive {
                rank: self.rank,
                seq,
                expected: buf.len(),
                inbox: Arc::clone(&self.inbox),
            }))
        }
    }
}

impl std::fmt::Debug for InMemoryComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

/// Root side: the frame is on the wire as soon as the broadcast starts.
struct Sent {
    rank: usize,
    buf: Option<Vec<u8>>,
    inbox: Arc<Mutex<Inbox>>,
}

impl PendingBroadcast for Sent {
    fn test(&mut self) -> CommResult<Option<Vec<u8>>> {
        self.inbox
            .lock()
            .expect("inbox poisoned")
            .drain(self.rank)?;
        Ok(self.buf.take())
    }
}

/// Receiver side: waits for the root's frame with a matching sequence.
struct Receive {
    rank: usize,
    seq: u64,
    expected: usize,
    inbox: Arc<Mutex<Inbox>>,
}

impl PendingBroadcast for Receive {
    fn test(&mut self) -> CommResult<Option<Vec<u8>>> {
        let mut inbox = self.inbox.lock().expect("inbox poisoned");
        if !inbox.stash.contains_key(&self.seq) {
            inbox.drain(self.rank)?;
        }
        let Some(payload) = inbox.stash.remove(&self.seq) else {
            return Ok(None);
        };
        if payload.len() != self.expected {
            return Err(CommError::LengthMismatch {
                expected: self.expected,
                actual: payload.len(),
            });
        }
        trace!(rank = self.rank, seq = self.seq, len = payload.len(), "received broadcast");
        Ok(Some(payload.to_vec()))
    }
}

/// A group with a single participant.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloComm;

struct Ready(Option<Vec<u8>>);

impl PendingBroadcast for Ready {
    fn test(&mut self) -> CommResult<Option<Vec<u8>>> {
        Ok(self.0.take())
    }
}

impl Communicator for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn ibcast(&self, buf: Vec<u8>, root: usize) -> CommResult<Box<dyn PendingBroadcast>> {
        if root != 0 {
            return Err(CommError::InvalidRoot { root, size: 1 });
        }
        Ok(Box::new(Ready(Some(buf))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait(pending: &mut Box<dyn PendingBroadcast>) -> CommResult<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(buf) = pending.test()? {
                return Ok(buf);
            }
            assert!(Instant::now() < deadline, "broadcast never completed");
            thread::yield_now();
        }
    }

    #[test]
    fn solo_broadcast_completes_immediately() {
        let comm = SoloComm;
        let mut pending = comm.ibcast(vec![1, 2, 3], 0).unwrap();
        assert_eq!(pending.test().unwrap(), Some(vec![1, 2, 3]));
        assert!(matches!(
            comm.ibcast(vec![], 1),
            Err(CommError::InvalidRoot { root: 1, size: 1 })
        ));
    }

    #[test]
    fn root_payload_reaches_every_participant() {
        let comms = InMemoryGroup::new(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let buf = if comm.rank() == 0 {
                        b"lease".to_vec()
                    } else {
                        vec![0; 5]
                    };
                    let mut pending = comm.ibcast(buf, 0).unwrap();
                    wait(&mut pending).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"lease".to_vec());
        }
    }

    #[test]
    fn consecutive_broadcasts_match_by_sequence() {
        let mut comms = InMemoryGroup::new(2);
        let receiver = comms.pop().unwrap();
        let root = comms.pop().unwrap();

        // Root races ahead with two broadcasts before the receiver posts.
        let mut first = root.ibcast(vec![1], 0).unwrap();
        let mut second = root.ibcast(vec![2, 2], 0).unwrap();
        assert_eq!(wait(&mut first).unwrap(), vec![1]);
        assert_eq!(wait(&mut second).unwrap(), vec![2, 2]);

        let mut r1 = receiver.ibcast(vec![0], 0).unwrap();
        let mut r2 = receiver.ibcast(vec![0; 2], 0).unwrap();
        assert_eq!(wait(&mut r2).unwrap(), vec![2, 2]);
        assert_eq!(wait(&mut r1).unwrap(), vec![1]);
    }

    #[test]
    fn non_zero_root_is_supported() {
        let mut comms = InMemoryGroup::new(2);
        let one = comms.pop().unwrap();
        let zero = comms.pop().unwrap();
        let mut sent = one.ibcast(vec![9, 9], 1).unwrap();
        let mut got = zero.ibcast(vec![0, 0], 1).unwrap();
        assert_eq!(wait(&mut sent).unwrap(), vec![9, 9]);
        assert_eq!(wait(&mut got).unwrap(), vec![9, 9]);
    }

    #[test]
    fn short_receive_buffer_is_a_length_mismatch() {
        let mut comms = InMemoryGroup::new(2);
        let receiver = comms.pop().unwrap();
        let root = comms.pop().unwrap();
        root.ibcast(vec![1, 2, 3, 4], 0).unwrap();
        let mut pending = receiver.ibcast(vec![0; 2], 0).unwrap();
        assert_eq!(
            wait(&mut pending),
            Err(CommError::LengthMismatch {
                expected: 2,
                actual: 4
            })
        );
    }

    #[test]
    fn injected_failure_keeps_sequence_aligned() {
        let mut comms = InMemoryGroup::new(2);
        let receiver = comms.pop().unwrap();
        let root = comms.pop().unwrap();
        receiver.fail_next_broadcast();
        assert!(matches!(
            receiver.ibcast(vec![0], 0),
            Err(CommError::Injected)
        ));
        // Root's first broadcast is consumed by nobody; the second lines up.
        root.ibcast(vec![1], 0).unwrap();
        root.ibcast(vec![2], 0).unwrap();
        let mut pending = receiver.ibcast(vec![0], 0).unwrap();
        assert_eq!(wait(&mut pending).unwrap(), vec![2]);
    }

    #[test]
    fn lagging_participant_reports_it() {
        let mut comms = InMemoryGroup::with_capacity(2, 2);
        let receiver = comms.pop().unwrap();
        let root = comms.pop().unwrap();
        for i in 0..4u8 {
            root.ibcast(vec![i], 0).unwrap();
        }
        let mut pending = receiver.ibcast(vec![0], 0).unwrap();
        assert!(matches!(pending.test(), Err(CommError::Lagged(_))));
    }
}
