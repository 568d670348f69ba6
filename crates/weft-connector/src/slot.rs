use std::fmt;
use std::sync::{Arc, Mutex};

/// A value filled in by one task and read by the tasks after it.
///
/// Graph construction happens before any task runs, so arguments that
/// depend on a predecessor's result (a freshly opened handle, an allocated
/// index) travel through a shared slot instead of being passed directly.
pub struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    pub fn filled(value: T) -> Self {
        Self(Arc::new(Mutex::new(Some(value))))
    }

    pub fn set(&self, value: T) {
        *self.0.lock().expect("slot poisoned") = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.0.lock().expect("slot poisoned").take()
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().expect("slot poisoned").is_some()
    }
}

impl<T: Clone> Slot<T> {
    pub fn get(&self) -> Option<T> {
        self.0.lock().expect("slot poisoned").clone()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot")
            .field(&*self.0.lock().expect("slot poisoned"))
            .finish()
    }
}
