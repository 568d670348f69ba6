//! Orchestration core of Weft.
//!
//! Every public operation is a chain of small tasks submitted to a
//! non-blocking task engine: one task per store primitive, ordered by
//! explicit dependencies and driven forward by a progress pump. The
//! connector owns the bookkeeping that makes such chains safe: a shared
//! request status with first-error-wins attribution, reference counting
//! so a request outlives its last task, collective agreement between
//! participants and a single transaction finalizer per request.
//!
//! # Key Types
//!
//! - [`Connector`] -- one participant's entry point; opens [`File`]s.
//! - [`File`] -- an open container and the operations issued against it.
//! - [`Request`] / [`RequestRef`] -- the unit of work threaded through a
//!   chain and the counted reference each task holds.
//! - [`Chain`] -- appends steps after a running tail.
//! - [`ProgressPump`] -- the only place that waits.
//!
//! # Design Rules
//!
//! 1. Every step checks the request status before doing any work; once a
//!    failure is recorded, later steps complete without touching the store.
//! 2. The first recorded failure wins and names the step that produced it.
//! 3. Broadcasts and collective checks run even after a local failure, so
//!    participants never disagree on the number of messages exchanged.
//! 4. A request's transaction is committed or aborted, then closed, exactly
//!    once, before the request is notified and reclaimed.

mod bcast;
pub mod chain;
pub mod collective;
pub mod config;
pub mod connector;
pub mod error;
pub mod file;
mod finalize;
pub mod list;
pub mod object;
pub mod oidx;
pub mod progress;
pub mod request;
pub mod slot;
mod steps;

pub use chain::Chain;
pub use collective::{adopted_status, ObjectInfoHeader, REMOTE_TASK};
pub use config::{ConnectorConfig, OBJECT_INFO_HEADER_LEN};
pub use connector::Connector;
pub use error::{ConnectorError, ConnectorResult};
pub use file::{CreateOptions, File, FileContext};
pub use list::{IterControl, KeyCollector, KeyEntry, KeyScope, KeyVisitor, ListOptions, ListStats};
pub use object::{Object, ObjectCell, ObjectMetadata, LINK_AKEY, METADATA_DKEY};
pub use oidx::{encode_oid, Lease, FIRST_USER_INDEX, OIDX_BATCH};
pub use progress::{ExecContext, ProgressPump, Timeout, Until};
pub use request::{Outcome, RefStats, Request, RequestRef};
pub use slot::Slot;

// Re-export the types callers pass through the connector API
pub use weft_store::{InMemoryKvStore, KvStore, PoolInfo, StoreOp};
pub use weft_types::{FailureCode, ObjectClass, ObjectId, ObjectKind, Status};
