use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;
use weft_store::{KvStore, ObjectHandle, StoreResult};
use weft_types::{ObjectId, ObjectKind};

use crate::error::{ConnectorError, ConnectorResult};

/// Dkey holding an object's own metadata records.
pub const METADATA_DKEY: &[u8] = b"/internal/md";
/// Akey of the datatype record.
pub const TYPE_AKEY: &[u8] = b"type";
/// Akey of the dataspace record.
pub const SPACE_AKEY: &[u8] = b"space";
/// Akey of the creation property record.
pub const CPL_AKEY: &[u8] = b"cpl";
/// Akey under which a group stores the token of a linked object.
pub const LINK_AKEY: &[u8] = b"link";

/// An object handle shared by the steps of one or more chains.
///
/// The handle is closed exactly once: explicitly through
/// [`ObjectCell::close`], or when the last holder drops the cell.
pub struct ObjectCell {
    store: Arc<dyn KvStore>,
    oid: Mutex<ObjectId>,
    handle: Mutex<ObjectHandle>,
    closes: AtomicUsize,
}

impl ObjectCell {
    /// A cell for `oid` whose handle is opened later by a step.
    pub fn unopened(store: Arc<dyn KvStore>, oid: ObjectId) -> Arc<Self> {
        Arc::new(Self {
            store,
            oid: Mutex::new(oid),
            handle: Mutex::new(ObjectHandle::INVALID),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn oid(&self) -> ObjectId {
        *self.oid.lock().expect("object cell poisoned")
    }

    pub(crate) fn set_oid(&self, oid: ObjectId) {
        *self.oid.lock().expect("object cell poisoned") = oid;
    }

    pub fn kind(&self) -> ObjectKind {
        self.oid().kind()
    }

    pub fn handle(&self) -> ObjectHandle {
        *self.handle.lock().expect("object cell poisoned")
    }

    pub fn is_open(&self) -> bool {
        self.handle().is_valid()
    }

    pub(crate) fn set_handle(&self, oh: ObjectHandle) {
        *self.handle.lock().expect("object cell poisoned") = oh;
    }

    /// Close the handle if it is open. Returns `Ok(false)` if it was not.
    pub fn close(&self) -> StoreResult<bool> {
        let oh = std::mem::take(&mut *self.handle.lock().expect("object cell poisoned"));
        if !oh.is_valid() {
            return Ok(false);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.store.obj_close(oh)?;
        Ok(true)
    }

    /// Number of times a handle was actually closed through this cell.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Drop for ObjectCell {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(oid = %self.oid(), %err, "failed to close object handle");
        }
    }
}

impl fmt::Debug for ObjectCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCell")
            .field("oid", &self.oid())
            .field("handle", &self.handle())
            .finish()
    }
}

/// The three opaque metadata records every object carries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub type_info: Vec<u8>,
    pub space_info: Vec<u8>,
    pub creation_props: Vec<u8>,
}

impl ObjectMetadata {
    pub fn new(type_info: impl Into<Vec<u8>>) -> Self {
        Self {
            type_info: type_info.into(),
            ..Self::default()
        }
    }

    /// Minimal metadata naming the object's kind.
    pub fn for_kind(kind: ObjectKind) -> Self {
        Self::new(kind.to_string())
    }

    pub fn with_space(mut self, space_info: impl Into<Vec<u8>>) -> Self {
        self.space_info = space_info.into();
        self
    }

    pub fn with_creation_props(mut self, creation_props: impl Into<Vec<u8>>) -> Self {
        self.creation_props = creation_props.into();
        self
    }

    /// An empty type record marks a failed coordinator on the wire, so it
    /// can never be stored.
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.type_info.is_empty() {
            return Err(ConnectorError::InvalidArgument(
                "object metadata needs a non-empty type record".into(),
            ));
        }
        Ok(())
    }

    pub fn lengths(&self) -> [usize; 3] {
        [
            self.type_info.len(),
            self.space_info.len(),
            self.creation_props.len(),
        ]
    }

    pub fn total_len(&self) -> usize {
        self.lengths().iter().sum()
    }

    /// Records as written under [`METADATA_DKEY`].
    pub fn records(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (TYPE_AKEY.to_vec(), self.type_info.clone()),
            (SPACE_AKEY.to_vec(), self.space_info.clone()),
            (CPL_AKEY.to_vec(), self.creation_props.clone()),
        ]
    }

    /// The records back to back: type, space, creation properties.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        out.extend_from_slice(&self.type_info);
        out.extend_from_slice(&self.space_info);
        out.extend_from_slice(&self.creation_props);
        out
    }

    /// Split a [`concat`](Self::concat) buffer using the record lengths.
    pub fn split(buf: &[u8], lengths: [usize; 3]) -> Option<Self> {
        let [t, s, c] = lengths;
        if buf.len() < t + s + c {
            return None;
        }
        Some(Self {
            type_info: buf[..t].to_vec(),
            space_info: buf[t..t + s].to_vec(),
            creation_props: buf[t + s..t + s + c].to_vec(),
        })
    }
}

/// An open object returned by the file operations.
#[derive(Debug, Clone)]
pub struct Object {
    cell: Arc<ObjectCell>,
    metadata: ObjectMetadata,
}

impl Object {
    pub(crate) fn new(cell: Arc<ObjectCell>, metadata: ObjectMetadata) -> Self {
        Self { cell, metadata }
    }

    pub fn id(&self) -> ObjectId {
        self.cell.oid()
    }

    pub fn kind(&self) -> ObjectKind {
        self.cell.kind()
    }

    pub fn metadata(&self) -> &ObjectMetadata {
        &self.metadata
    }

    pub fn is_open(&self) -> bool {
        self.cell.is_open()
    }

    pub(crate) fn cell(&self) -> &Arc<ObjectCell> {
        &self.cell
    }

    /// Close the object's handle now instead of on drop.
    pub fn close(self) -> ConnectorResult<()> {
        self.cell.close()?;
        Ok(())
    }
}
