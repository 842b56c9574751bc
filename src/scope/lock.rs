use crate::core::{DbError, Result};
use std::sync::atomic::{AtomicU8, Ordering};

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
const DISPOSED: u8 = 2;

/// Single-owner lock that fails instead of blocking.
///
/// Contention means two flows are using one unit of work in parallel,
/// which is a programming error, so it is reported as [`DbError::LockError`].
/// Once disposed, every acquisition reports [`DbError::ObjectDisposed`].
#[derive(Debug)]
pub(crate) struct ExclusiveLock {
    state: AtomicU8,
    owner: &'static str,
}

impl ExclusiveLock {
    pub fn new(owner: &'static str) -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
            owner,
        }
    }

    pub fn acquire(&self) -> Result<ExclusiveLockGuard<'_>> {
        match self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Ok(ExclusiveLockGuard { lock: self }),
            Err(DISPOSED) => Err(self.disposed_error()),
            Err(_) => Err(self.contention_error()),
        }
    }

    /// Moves the lock to its terminal state.
    ///
    /// Returns `false` if it was already disposed.
    pub fn try_dispose(&self) -> Result<bool> {
        match self
            .state
            .compare_exchange(UNLOCKED, DISPOSED, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => Ok(true),
            Err(DISPOSED) => Ok(false),
            Err(_) => Err(self.contention_error()),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISPOSED
    }

    pub fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        Ok(())
    }

    fn disposed_error(&self) -> DbError {
        DbError::ObjectDisposed(self.owner.to_string())
    }

    fn contention_error(&self) -> DbError {
        DbError::LockError(format!(
            "The lock on {} was contested. This may indicate parallel use of a type that does not support it.",
            self.owner
        ))
    }
}

/// Releases the lock on drop
pub(crate) struct ExclusiveLockGuard<'a> {
    lock: &'a ExclusiveLock,
}

impl Drop for ExclusiveLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}
