// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Word-sized spin lock that can live inside a shared segment.
// Used to serialise one-time construction of a segment header.

use std::sync::atomic::{AtomicU32, Ordering};

/// Adaptive backoff: busy spin, then CPU pause, then yield, then 1ms sleeps.
///
/// - k < 4:  busy spin
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn backoff(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A spin lock whose whole state is one `AtomicU32`.
///
/// Zeroed memory is an unlocked `SpinLock`, so a freshly created segment
/// needs no initialisation before the lock is used.
#[repr(C)]
pub struct SpinLock {
    lc: AtomicU32,
}

impl SpinLock {
    /// Create a new unlocked spin lock.
    pub const fn new() -> Self {
        Self {
            lc: AtomicU32::new(0),
        }
    }

    /// Acquire the lock, spinning with adaptive backoff.
    pub fn lock(&self) -> SpinGuard<'_> {
        let mut k = 0u32;
        while self.lc.swap(1, Ordering::Acquire) != 0 {
            backoff(&mut k);
        }
        SpinGuard { lock: self }
    }

    /// Try to acquire the lock once.
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self.lc.swap(1, Ordering::Acquire) == 0 {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.lc.load(Ordering::Relaxed) != 0
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the [`SpinLock`] on drop.
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.lc.store(0, Ordering::Release);
    }
}
