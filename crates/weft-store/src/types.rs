use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const KIND: &'static str = $kind;

            /// The invalid handle. Never returned by a store.
            pub const INVALID: $name = $name(0);

            pub fn is_valid(&self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

handle!(
    /// Connection to a storage pool.
    PoolHandle,
    "pool"
);
handle!(
    /// Open container within a pool.
    ContainerHandle,
    "container"
);
handle!(
    /// Open unit of work against a container.
    TxHandle,
    "tx"
);
handle!(
    /// Open object within a container.
    ObjectHandle,
    "object"
);

/// Result of a pool query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub uuid: Uuid,
    pub group: String,
    pub containers: usize,
    pub connections: usize,
}

/// Resumable cursor for key listing.
///
/// Starts at the beginning; each listing call moves it past the keys it
/// returned and marks it exhausted once no keys remain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Anchor {
    last: Option<Vec<u8>>,
    eof: bool,
}

impl Anchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the listing has returned every key.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn last_key(&self) -> Option<&[u8]> {
        self.last.as_deref()
    }

    pub(crate) fn advance(&mut self, last: Option<Vec<u8>>, eof: bool) {
        if last.is_some() {
            self.last = last;
        }
        self.eof = eof;
    }
}

/// Describes one key packed into a listing buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub key_len: usize,
}

/// Store operation kinds, used for fault injection and issue counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    PoolConnect,
    PoolDisconnect,
    PoolQuery,
    ContainerOpen,
    ContainerClose,
    AllocOids,
    TxOpen,
    TxCommit,
    TxAbort,
    TxClose,
    ObjectOpen,
    ObjectClose,
    Update,
    FetchSize,
    Fetch,
    ListDkeys,
    ListAkeys,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::PoolConnect => "pool_connect",
            StoreOp::PoolDisconnect => "pool_disconnect",
            StoreOp::PoolQuery => "pool_query",
            StoreOp::ContainerOpen => "cont_open",
            StoreOp::ContainerClose => "cont_close",
            StoreOp::AllocOids => "alloc_oids",
            StoreOp::TxOpen => "tx_open",
            StoreOp::TxCommit => "tx_commit",
            StoreOp::TxAbort => "tx_abort",
            StoreOp::TxClose => "tx_close",
            StoreOp::ObjectOpen => "obj_open",
            StoreOp::ObjectClose => "obj_close",
            StoreOp::Update => "obj_update",
            StoreOp::FetchSize => "obj_fetch_size",
            StoreOp::Fetch => "obj_fetch",
            StoreOp::ListDkeys => "obj_list_dkey",
            StoreOp::ListAkeys => "obj_list_akey",
        };
        f.write_str(name)
    }
}
