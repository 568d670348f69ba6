use crate::error::CommResult;

/// Membership of one participant in a broadcast group.
pub trait Communicator: Send + Sync {
    /// This participant's rank, `0..size()`.
    fn rank(&self) -> usize;

    /// Number of participants in the group.
    fn size(&self) -> usize;

    /// Start broadcasting from `root`.
    ///
    /// On the root `buf` holds the data to send. Elsewhere its length is
    /// the number of bytes expected; a different received length fails the
    /// broadcast with [`CommError::LengthMismatch`](crate::CommError::LengthMismatch).
    fn ibcast(&self, buf: Vec<u8>, root: usize) -> CommResult<Box<dyn PendingBroadcast>>;
}

/// A broadcast that has been started but not yet observed complete.
pub trait PendingBroadcast: Send {
    /// Poll without blocking. Returns the buffer once the broadcast is done.
    fn test(&mut self) -> CommResult<Option<Vec<u8>>>;
}
