// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process mutex: a robust, process-shared pthread mutex stored in
// its own shared memory segment.

use std::io;

use crate::platform::PlatformMutex;

/// A named, inter-process mutex.
///
/// If the owner dies while holding it, the next `lock` marks it consistent
/// again and succeeds (not on macOS, which has no robust mutexes).
pub struct IpcMutex {
    inner: PlatformMutex,
}

impl IpcMutex {
    /// Open (or create) the mutex `name`.
    pub fn open(name: &str) -> io::Result<Self> {
        Ok(Self {
            inner: PlatformMutex::open(name)?,
        })
    }

    /// Lock, blocking indefinitely.
    pub fn lock(&self) -> io::Result<()> {
        self.inner.lock()
    }

    /// Lock without blocking. `Ok(false)` if another holder has it.
    pub fn try_lock(&self) -> io::Result<bool> {
        self.inner.try_lock()
    }

    pub fn unlock(&self) -> io::Result<()> {
        self.inner.unlock()
    }

    /// Remove the backing storage of the mutex `name`.
    pub fn clear_storage(name: &str) {
        PlatformMutex::clear_storage(name);
    }

    /// The `pthread_mutex_t` as raw bytes, for `pthread_cond_wait`.
    pub(crate) fn native_mutex_ptr(&self) -> *mut u8 {
        self.inner.native_ptr()
    }
}
