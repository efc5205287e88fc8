//! Exclusive access to the debug port.
//!
//! Flashing, erasing and debugger requests all drive the same debug port. A [`DapLock`]
//! is shared between them, and whoever wants to run an `Init`..`UnInit` bracket holds
//! the lock for its whole duration.

use crate::flashing::FlashError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A cloneable handle to the lock of one debug port.
#[derive(Debug, Clone, Default)]
pub struct DapLock {
    holder: Arc<Mutex<Option<String>>>,
}

impl DapLock {
    /// Create a new, unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    fn holder(&self) -> MutexGuard<'_, Option<String>> {
        // The protected value is a plain name, which stays consistent if a holder panicked.
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lock for `operation`.
    ///
    /// Fails with [`FlashError::TargetBusy`] while another operation holds it.
    pub fn try_lock(&self, operation: &str) -> Result<DapLockGuard, FlashError> {
        let mut holder = self.holder();
        if let Some(current) = holder.as_ref() {
            tracing::debug!("Debug port is locked by {}, rejecting {}", current, operation);
            return Err(FlashError::TargetBusy {
                holder: current.clone(),
            });
        }

        tracing::trace!("Debug port locked by {}", operation);
        *holder = Some(operation.to_string());

        Ok(DapLockGuard { lock: self.clone() })
    }

    /// The operation holding the lock, if any.
    pub fn current_holder(&self) -> Option<String> {
        self.holder().clone()
    }

    /// Returns `true` if an operation holds the lock.
    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }
}

/// Holds a [`DapLock`] until dropped.
#[derive(Debug)]
pub struct DapLockGuard {
    lock: DapLock,
}

impl Drop for DapLockGuard {
    fn drop(&mut self) {
        if let Some(operation) = self.lock.holder().take() {
            tracing::trace!("Debug port released by {}", operation);
        }
    }
}
