use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{InterruptError, Result};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Register state is always left self-consistent between statements, so a
/// poisoned lock carries no more risk than a clean one.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Non-blocking variant of [`lock`]; contention is counted and surfaced as
/// [`InterruptError::Busy`].
pub(crate) fn try_lock<'a, T>(
    mutex: &'a Mutex<T>,
    contention: &AtomicU64,
) -> Result<MutexGuard<'a, T>> {
    match mutex.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => {
            contention.fetch_add(1, Ordering::Relaxed);
            Err(InterruptError::Busy)
        }
    }
}
