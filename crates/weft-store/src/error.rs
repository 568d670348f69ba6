use uuid::Uuid;

use crate::types::StoreOp;

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No pool with this identifier exists.
    #[error("pool not found: {0}")]
    PoolNotFound(Uuid),

    /// A handle was closed, never opened, or of the wrong kind.
    #[error("invalid {kind} handle {raw}")]
    InvalidHandle { kind: &'static str, raw: u64 },

    /// The handle is still referenced by open children.
    #[error("{kind} handle {raw} is busy")]
    Busy { kind: &'static str, raw: u64 },

    /// The requested container does not exist and creation was not requested.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The transaction has already been committed or aborted.
    #[error("transaction {0} is no longer open")]
    TxNotOpen(u64),

    /// The next key does not fit the caller's buffer.
    #[error("key does not fit buffer: {required} bytes required")]
    KeyTooBig { required: usize },

    /// A fault armed through [`InMemoryKvStore::inject_fault`](crate::InMemoryKvStore::inject_fault).
    #[error("injected fault in {op}: code {code}")]
    Injected { op: StoreOp, code: u32 },
}

impl StoreError {
    /// Numeric store error code, as recorded on a failed request.
    pub fn code(&self) -> u32 {
        match self {
            StoreError::PoolNotFound(_) => 1,
            StoreError::InvalidHandle { .. } => 2,
            StoreError::Busy { .. } => 3,
            StoreError::ContainerNotFound(_) => 4,
            StoreError::TxNotOpen(_) => 5,
            StoreError::KeyTooBig { .. } => 6,
            StoreError::Injected { code, .. } => *code,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
