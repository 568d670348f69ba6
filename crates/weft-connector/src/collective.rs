//! Keeping participants of a collective operation in agreement.
//!
//! Two broadcast-based building blocks live here:
//!
//! - the collective error check, which replicates failure status so that a
//!   fault observed by one participant aborts the operation everywhere;
//! - the collective object open, where the coordinator reads an object's
//!   metadata once and broadcasts it to the others.

use std::sync::Arc;

use tracing::debug;
use weft_types::{FailureCode, ObjectId, Status, TaskError, TaskResult, REMOTE_FAILURE_THRESHOLD};

use crate::bcast::{broadcast, BroadcastPayload};
use crate::chain::Chain;
use crate::config::OBJECT_INFO_HEADER_LEN;
use crate::error::ConnectorResult;
use crate::object::{ObjectCell, ObjectMetadata};
use crate::request::Request;
use crate::slot::Slot;
use crate::steps;

/// Label recorded on a participant that adopts another one's failure.
pub const REMOTE_TASK: &str = "remote task";

const STATUS_LEN: usize = std::mem::size_of::<i64>();

// ---------------------------------------------------------------
// Collective error check
// ---------------------------------------------------------------

struct StatusRound {
    root: usize,
}

impl BroadcastPayload for StatusRound {
    fn name(&self) -> &str {
        "collective error check"
    }

    fn root(&self) -> usize {
        self.root
    }

    fn outgoing(&mut self, req: &Request, root: bool) -> Option<Vec<u8>> {
        Some(if root {
            req.status().to_wire().to_le_bytes().to_vec()
        } else {
            vec![0; STATUS_LEN]
        })
    }

    fn received(&mut self, req: &Request, buf: Vec<u8>, root: bool) -> TaskResult {
        if root {
            return Ok(());
        }
        let word: [u8; STATUS_LEN] = buf
            .try_into()
            .map_err(|_| TaskError::Failed(FailureCode::Truncated))?;
        if let Some(Status::Failed(code)) = adopted_status(i64::from_le_bytes(word)) {
            if req.record_failure(code, REMOTE_TASK) {
                debug!(root = self.root, %code, "adopted remote failure");
            }
        }
        Ok(())
    }
}

/// Append a collective error check. Returns `None` with one participant.
///
/// Each participant broadcasts its status in turn, coordinator first; a
/// receiver that sees a failure records the same failure code. After the
/// check every participant reports the first failure seen in rank order.
pub(crate) fn error_check(chain: &mut Chain, req: &Request) -> ConnectorResult<Option<usize>> {
    let size = req.file().exec().comm().size();
    if size <= 1 {
        return Ok(None);
    }
    for root in 0..size {
        broadcast(chain, req, Box::new(StatusRound { root }))?;
    }
    Ok(Some(size))
}

/// Status a receiver should adopt from a peer's wire word, if any.
pub fn adopted_status(word: i64) -> Option<Status> {
    (word <= REMOTE_FAILURE_THRESHOLD)
        .then(|| Status::Failed(FailureCode::from_wire(word).unwrap_or(FailureCode::Remote)))
}

// ---------------------------------------------------------------
// Collective object open
// ---------------------------------------------------------------

/// Fixed object-info header: identifier halves and record lengths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectInfoHeader {
    pub oid: ObjectId,
    pub lengths: [usize; 3],
}

impl ObjectInfoHeader {
    pub fn encode(&self) -> [u8; OBJECT_INFO_HEADER_LEN] {
        let words = [
            self.oid.lo,
            self.oid.hi,
            self.lengths[0] as u64,
            self.lengths[1] as u64,
            self.lengths[2] as u64,
        ];
        let mut out = [0u8; OBJECT_INFO_HEADER_LEN];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < OBJECT_INFO_HEADER_LEN {
            return None;
        }
        let mut words = [0u64; 5];
        for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(8)) {
            *word = u64::from_le_bytes(chunk.try_into().ok()?);
        }
        Some(Self {
            oid: ObjectId::from_parts(words[0], words[1]),
            lengths: [
                usize::try_from(words[2]).ok()?,
                usize::try_from(words[3]).ok()?,
                usize::try_from(words[4]).ok()?,
            ],
        })
    }

    pub fn total_len(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// A zero type length is how the coordinator reports failure.
    pub fn is_failure(&self) -> bool {
        self.lengths[0] == 0
    }
}

/// State shared by the two hops of one object-info exchange.
#[derive(Clone)]
struct Exchange {
    cell: Arc<ObjectCell>,
    metadata: Slot<ObjectMetadata>,
    static_size: usize,
    /// Header of a payload that did not fit the first hop.
    overflow: Slot<ObjectInfoHeader>,
}

struct InfoHop(Exchange);

impl BroadcastPayload for InfoHop {
    fn name(&self) -> &str {
        "object info broadcast"
    }

    fn outgoing(&mut self, req: &Request, root: bool) -> Option<Vec<u8>> {
        let ex = &self.0;
        let mut buf = vec![0; ex.static_size];
        if !root {
            return Some(buf);
        }
        // A failed coordinator sends an all-zero header.
        let md = match (req.status(), ex.metadata.get()) {
            (status, Some(md)) if !status.is_unrecoverable() => md,
            _ => return Some(buf),
        };
        let header = ObjectInfoHeader {
            oid: ex.cell.oid(),
            lengths: md.lengths(),
        };
        buf[..OBJECT_INFO_HEADER_LEN].copy_from_slice(&header.encode());
        let payload = md.concat();
        let inline = payload.len().min(ex.static_size - OBJECT_INFO_HEADER_LEN);
        buf[OBJECT_INFO_HEADER_LEN..OBJECT_INFO_HEADER_LEN + inline].copy_from_slice(&payload[..inline]);
        Some(buf)
    }

    fn received(&mut self, _req: &Request, buf: Vec<u8>, root: bool) -> TaskResult {
        let ex = &self.0;
        let header = ObjectInfoHeader::decode(&buf).ok_or(TaskError::Failed(FailureCode::Truncated))?;
        if header.is_failure() {
            return if root {
                Ok(())
            } else {
                Err(TaskError::Failed(FailureCode::Remote))
            };
        }
        if OBJECT_INFO_HEADER_LEN + header.total_len() > ex.static_size {
            ex.overflow.set(header);
            return Ok(());
        }
        if !root {
            let md = ObjectMetadata::split(&buf[OBJECT_INFO_HEADER_LEN..], header.lengths)
                .ok_or(TaskError::Failed(FailureCode::Truncated))?;
            ex.cell.set_oid(header.oid);
            ex.metadata.set(md);
        }
        Ok(())
    }
}

struct OverflowHop(Exchange);

impl BroadcastPayload for OverflowHop {
    fn name(&self) -> &str {
        "object info overflow broadcast"
    }

    fn outgoing(&mut self, _req: &Request, root: bool) -> Option<Vec<u8>> {
        let ex = &self.0;
        let header = ex.overflow.get()?;
        if root {
            ex.metadata.get().map(|md| md.concat())
        } else {
            Some(vec![0; header.total_len()])
        }
    }

    fn received(&mut self, _req: &Request, buf: Vec<u8>, root: bool) -> TaskResult {
        let ex = &self.0;
        let Some(header) = ex.overflow.take() else {
            return Ok(());
        };
        if !root {
            let md = ObjectMetadata::split(&buf, header.lengths)
                .ok_or(TaskError::Failed(FailureCode::Truncated))?;
            ex.cell.set_oid(header.oid);
            ex.metadata.set(md);
        }
        Ok(())
    }
}

/// Open an object with its metadata read once by the coordinator.
///
/// The coordinator opens the object and reads its records, then
/// broadcasts them; a second hop carries payloads that do not fit the
/// static buffer. The other participants open the object themselves once
/// the identifier has arrived.
pub(crate) fn open_object(
    chain: &mut Chain,
    req: &Request,
    cell: Arc<ObjectCell>,
    metadata: Slot<ObjectMetadata>,
) -> ConnectorResult<()> {
    let file = req.file().clone();
    let exchange = Exchange {
        cell: cell.clone(),
        metadata: metadata.clone(),
        static_size: file.config().broadcast_static_size,
        overflow: Slot::new(),
    };

    if file.is_coordinator() {
        steps::object_open(chain, req, cell.clone(), None)?;
        steps::object_info_read(chain, req, cell.clone(), metadata)?;
        broadcast(chain, req, Box::new(InfoHop(exchange.clone())))?;
        broadcast(chain, req, Box::new(OverflowHop(exchange)))?;
    } else {
        broadcast(chain, req, Box::new(InfoHop(exchange.clone())))?;
        broadcast(chain, req, Box::new(OverflowHop(exchange)))?;
        steps::object_open(chain, req, cell, None)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::{ObjectClass, ObjectKind};

    #[test]
    fn header_layout_is_five_little_endian_words() {
        let header = ObjectInfoHeader {
            oid: ObjectId::encode(11, ObjectKind::Dataset, ObjectClass::S2),
            lengths: [3, 0, 9],
        };
        let bytes = header.encode();
        assert_eq!(&bytes[..8], &11u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &3u64.to_le_bytes());
        assert_eq!(ObjectInfoHeader::decode(&bytes), Some(header));
        assert_eq!(header.total_len(), 12);
        assert!(!header.is_failure());
    }

    #[test]
    fn zeroed_header_means_coordinator_failed() {
        let header = ObjectInfoHeader::decode(&[0; OBJECT_INFO_HEADER_LEN]).unwrap();
        assert!(header.is_failure());
        assert!(ObjectInfoHeader::decode(&[0; 12]).is_none());
    }

    #[test]
    fn only_failures_are_adopted() {
        assert_eq!(adopted_status(Status::Incomplete.to_wire()), None);
        assert_eq!(adopted_status(Status::ShortCircuit.to_wire()), None);
        assert_eq!(adopted_status(0), None);
        assert_eq!(
            adopted_status(FailureCode::Store(12).to_wire()),
            Some(Status::Failed(FailureCode::Store(12)))
        );
        assert_eq!(
            adopted_status(FailureCode::Canceled.to_wire()),
            Some(Status::Failed(FailureCode::Canceled))
        );
    }
}
