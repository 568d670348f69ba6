/// Errors produced by the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommError {
    /// The root rank is not a member of the group.
    #[error("broadcast root {root} out of range for a group of {size}")]
    InvalidRoot { root: usize, size: usize },

    /// A received broadcast carried a different number of bytes than the
    /// receiver posted.
    #[error("broadcast length mismatch: expected {expected} bytes, received {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// This participant fell behind and frames were dropped.
    #[error("lagged behind the group by {0} messages")]
    Lagged(u64),

    /// Every other participant has left the group.
    #[error("group disconnected")]
    Disconnected,

    /// A failure armed through [`InMemoryComm::fail_next_broadcast`](crate::InMemoryComm::fail_next_broadcast).
    #[error("injected messaging failure")]
    Injected,
}

/// Result alias for messaging operations.
pub type CommResult<T> = Result<T, CommError>;
