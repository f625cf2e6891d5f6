// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-word reader/writer lock, safe to place in shared memory.
// - High bit (W_FLAG) marks the exclusive/write lock.
// - Low 31 bits count concurrent shared/read locks.
//
// This is the structural lock of a channel: it lives in the segment header,
// so every thread of every process that maps the segment contends on the
// same word.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::spin_lock::backoff;

const W_MASK: u32 = i32::MAX as u32; // 0x7FFF_FFFF: reader count
const W_FLAG: u32 = W_MASK + 1; // 0x8000_0000: writer flag

/// A single-word atomic read-write lock.
///
/// Writers get exclusive access, readers may hold the lock concurrently.
/// Writers announce themselves first, so a steady stream of readers cannot
/// starve a writer.
#[repr(C)]
pub struct RwLock {
    lc: AtomicU32,
}

impl RwLock {
    /// Create a new unlocked read-write lock.
    pub const fn new() -> Self {
        Self {
            lc: AtomicU32::new(0),
        }
    }

    /// Acquire the exclusive (write) lock.
    pub fn write(&self) -> WriteGuard<'_> {
        let mut k = 0u32;
        loop {
            let old = self.lc.fetch_or(W_FLAG, Ordering::AcqRel);
            if old == 0 {
                return WriteGuard { lock: self };
            }
            if old & W_FLAG == 0 {
                break; // we own the flag, readers still draining
            }
            backoff(&mut k);
        }
        let mut k = 0u32;
        while self.lc.load(Ordering::Acquire) & W_MASK != 0 {
            backoff(&mut k);
        }
        WriteGuard { lock: self }
    }

    /// Acquire a shared (read) lock.
    pub fn read(&self) -> ReadGuard<'_> {
        let mut old = self.lc.load(Ordering::Acquire);
        let mut k = 0u32;
        loop {
            if old & W_FLAG != 0 {
                backoff(&mut k);
                old = self.lc.load(Ordering::Acquire);
                continue;
            }
            match self.lc.compare_exchange_weak(
                old,
                old + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ReadGuard { lock: self },
                Err(cur) => old = cur,
            }
        }
    }

    /// Number of readers currently holding the lock.
    pub fn readers(&self) -> u32 {
        self.lc.load(Ordering::Relaxed) & W_MASK
    }

    /// Whether a writer holds (or is waiting for) the lock.
    pub fn is_write_locked(&self) -> bool {
        self.lc.load(Ordering::Relaxed) & W_FLAG != 0
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access; released on drop.
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.lc.fetch_and(!W_FLAG, Ordering::Release);
    }
}

/// Shared access; released on drop.
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.lc.fetch_sub(1, Ordering::Release);
    }
}
