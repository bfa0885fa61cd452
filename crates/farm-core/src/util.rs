use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering from poison (prior panic in another thread).
///
/// A panicking handshake task must not wedge the pool for every other
/// device, so a poisoned guard is taken over as-is.
pub(crate) fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
