//! Lock helpers.
//!
//! State guarded by these locks is only ever replaced wholesale, so a guard recovered from a poisoned lock still
//! points at a consistent value.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Poison-tolerant access to a [`RwLock`].
pub trait RwLockExt<T> {
    /// Acquires shared access.
    fn read_lock(&self) -> RwLockReadGuard<'_, T>;

    /// Acquires exclusive access.
    fn write_lock(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_lock(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poison-tolerant access to a [`Mutex`].
pub trait MutexExt<T> {
    /// Acquires the lock.
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
