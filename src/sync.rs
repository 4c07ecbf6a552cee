//! Small synchronisation helpers

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a panicking listener poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
