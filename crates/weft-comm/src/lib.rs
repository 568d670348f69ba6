//! Non-blocking broadcast messaging for Weft.
//!
//! Cooperating processes ("participants") form a group. A broadcast copies
//! one participant's buffer to every other participant. Starting a
//! broadcast never blocks; the returned [`PendingBroadcast`] is polled until
//! it reports completion.
//!
//! # Implementations
//!
//! - [`SoloComm`] -- a group of one; every broadcast completes immediately
//! - [`InMemoryGroup`] -- an in-process group whose participants exchange
//!   frames over a `tokio::sync::broadcast` channel, one participant per
//!   thread
//!
//! Broadcasts are collective: every participant must start the same
//! broadcasts in the same order, exactly as with MPI.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{CommError, CommResult};
pub use memory::{InMemoryComm, InMemoryGroup, SoloComm};
pub use traits::{Communicator, PendingBroadcast};
