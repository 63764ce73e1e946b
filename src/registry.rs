//! Handle table for callers that address sessions by number.
//!
//! Foreign bindings hold a `u64` rather than a [`Session`]. Every operation
//! looks the handle up first; an unknown or closed handle is
//! [`ExportError::InvalidHandle`], status -1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::ExportError;
use crate::session::Session;

/// Open sessions keyed by handle.
#[derive(Debug, Default)]
pub struct Registry {
    next: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<Mutex<Session>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, Arc<Mutex<Session>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session` and return its handle. Handles start at 1 and are
    /// never reused.
    pub fn open(&self, session: Session) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.table().insert(handle, Arc::new(Mutex::new(session)));
        debug!(handle, "session registered");
        handle
    }

    /// Drop the session behind `handle`. Operations already running on it
    /// finish first.
    pub fn close(&self, handle: u64) -> Result<(), ExportError> {
        match self.table().remove(&handle) {
            Some(_) => {
                debug!(handle, "session closed");
                Ok(())
            }
            None => Err(ExportError::InvalidHandle { handle }),
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` on the session behind `handle`.
    ///
    /// Calls on one session are serialised; different sessions run in
    /// parallel.
    pub fn with_session<T>(
        &self,
        handle: u64,
        f: impl FnOnce(&mut Session) -> Result<T, ExportError>,
    ) -> Result<T, ExportError> {
        let session = self
            .table()
            .get(&handle)
            .cloned()
            .ok_or(ExportError::InvalidHandle { handle })?;
        let mut guard = session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Fold a result into the numeric convention: 0 on success, otherwise the
/// error's status code.
pub fn status<T>(result: &Result<T, ExportError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status_code(),
    }
}
