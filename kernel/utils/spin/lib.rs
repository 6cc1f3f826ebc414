// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the kernel's spinlock, which panics rather than hang
//! when it appears to be deadlocked.
//!
//! Kernel critical sections are short and bounded, so a lock that
//! spins for a very long time indicates a deadlock. Rather than
//! hang silently, [`lock!`] gives up after [`MAX_LOCK_ATTEMPTS`]
//! spins and panics with both the site that failed to acquire the
//! lock and the site that last acquired it.

#![no_std]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use core::{fmt, hint};

/// The number of times a lock acquisition will spin before
/// the kernel declares a deadlock and panics.
///
/// The value trades false positives in slow-but-correct code
/// against the delay before a real deadlock is reported.
///
pub const MAX_LOCK_ATTEMPTS: usize = 500_000_000;

/// A spinlock providing mutually-exclusive access to data.
///
/// Acquire the lock with the [`lock!`] macro, which records
/// the call site for deadlock diagnostics.
///
pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    locked_at_file: UnsafeCell<&'static str>,
    locked_at_line: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

/// Grants access to the data guarded by a [`Mutex`], releasing
/// the lock when dropped.
///
pub struct MutexGuard<'lock, T: ?Sized + 'lock> {
    locked: &'lock AtomicBool,
    data: &'lock mut T,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    /// Returns a new unlocked mutex containing the given data.
    ///
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Mutex {
            locked: AtomicBool::new(false),
            locked_at_file: UnsafeCell::new("???"),
            locked_at_line: UnsafeCell::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Returns whether the mutex is currently locked.
    ///
    /// The return value is an unsynchronised hint; it may be
    /// stale by the time the caller observes it.
    ///
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Attempts to lock the mutex without spinning.
    ///
    #[inline(always)]
    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard {
                locked: &self.locked,
                data: unsafe { &mut *self.data.get() },
            })
        } else {
            None
        }
    }
}

/// Lock the mutex, panicking with a deadlock diagnosis if
/// it cannot be acquired after [`MAX_LOCK_ATTEMPTS`] spins.
///
#[macro_export]
macro_rules! lock {
    ($mutex:expr) => {{
        $crate::_lock(&$mutex, file!(), line!())
    }};
}

/// Lock the mutex, returning a guard that unlocks it when
/// dropped.
///
#[doc(hidden)]
pub fn _lock<'lock, T: ?Sized>(
    mutex: &'lock Mutex<T>,
    file: &'static str,
    line: u32,
) -> MutexGuard<'lock, T> {
    let mut attempts = 0_usize;
    while mutex
        .locked
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        while mutex.is_locked() {
            attempts += 1;
            if attempts > MAX_LOCK_ATTEMPTS {
                let held_file = unsafe { *mutex.locked_at_file.get() };
                let held_line = unsafe { *mutex.locked_at_line.get() };
                panic!(
                    "DEADLOCK: failed to lock at {}:{}, after mutex was locked at {}:{}",
                    file, line, held_file, held_line
                );
            }

            hint::spin_loop();
        }
    }

    // We hold the lock, so we can record where it
    // was taken for the next deadlock report.
    unsafe {
        *mutex.locked_at_file.get() = file;
        *mutex.locked_at_line.get() = line;
    }

    MutexGuard {
        locked: &mutex.locked,
        data: unsafe { &mut *mutex.data.get() },
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Mutex {{ data: ")
                .and_then(|()| (*guard).fmt(f))
                .and_then(|()| write!(f, " }}")),
            None => write!(f, "Mutex {{ <locked> }}"),
        }
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<'lock, T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'lock, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'lock, T: ?Sized> Deref for MutexGuard<'lock, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'lock, T: ?Sized> DerefMut for MutexGuard<'lock, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'lock, T: ?Sized> Drop for MutexGuard<'lock, T> {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}
