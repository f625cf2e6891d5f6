// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Condition variable + mutex pair that lets a consumer in one process sleep
// until a producer in another process publishes a frame.

use std::io;
use std::time::{Duration, Instant};

use crate::{IpcCondition, IpcMutex};

/// A named waiter: a condition variable and the mutex it waits with.
pub struct Waiter {
    cond: IpcCondition,
    lock: IpcMutex,
}

impl Waiter {
    /// Open the waiter `name`; the underlying objects are `<name>_COND_` and
    /// `<name>_LOCK_`.
    pub fn open(name: &str) -> io::Result<Self> {
        let cond = IpcCondition::open(&format!("{name}_COND_"))?;
        let lock = IpcMutex::open(&format!("{name}_LOCK_"))?;
        Ok(Self { cond, lock })
    }

    /// Block while `pred` returns `true`.
    ///
    /// Returns `Ok(false)` if `timeout_ms` elapsed with `pred` still true.
    /// `pred` is always evaluated with the waiter mutex held, so a
    /// [`broadcast`](Self::broadcast) issued after the state change cannot be
    /// missed.
    pub fn wait_while<F>(&self, pred: F, timeout_ms: Option<u64>) -> io::Result<bool>
    where
        F: Fn() -> bool,
    {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.lock.lock()?;
        let result = self.wait_locked(&pred, deadline);
        self.lock.unlock()?;
        result
    }

    fn wait_locked<F>(&self, pred: &F, deadline: Option<Instant>) -> io::Result<bool>
    where
        F: Fn() -> bool,
    {
        while pred() {
            let tm = match deadline {
                None => None,
                Some(dl) => {
                    let left = dl.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(false);
                    }
                    // Round up so a sub-millisecond remainder still waits.
                    Some((left.as_micros() as u64).div_ceil(1000))
                }
            };
            self.cond.wait(&self.lock, tm)?;
        }
        Ok(true)
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> io::Result<()> {
        // Taking the lock orders this wake-up after any waiter that already
        // evaluated its predicate has entered pthread_cond_wait.
        self.lock.lock()?;
        self.lock.unlock()?;
        self.cond.broadcast()
    }

    /// Remove the backing storage of the waiter `name`.
    pub fn clear_storage(name: &str) {
        IpcCondition::clear_storage(&format!("{name}_COND_"));
        IpcMutex::clear_storage(&format!("{name}_LOCK_"));
    }
}
