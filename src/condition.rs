// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process condition variable: a process-shared pthread_cond_t in
// its own shared memory segment.

use std::io;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::platform::posix::{self, CachedShm};
use crate::IpcMutex;

/// A named, inter-process condition variable.
pub struct IpcCondition {
    cached: Arc<CachedShm>,
    name: String,
}

impl IpcCondition {
    /// Open (or create) the condition variable `name`.
    pub fn open(name: &str) -> io::Result<Self> {
        let size = std::mem::size_of::<libc::pthread_cond_t>();
        let cached = posix::cached_acquire(posix::cond_cache(), name, size, |base| unsafe {
            init_shared_cond(base as *mut libc::pthread_cond_t)
        })?;
        Ok(Self {
            cached,
            name: name.to_string(),
        })
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.cached.shm.as_mut_ptr() as *mut libc::pthread_cond_t
    }

    /// Wait for a notification. `mtx` must be locked by the caller; it is
    /// released while waiting and re-acquired before returning.
    ///
    /// Returns `Ok(false)` if `timeout_ms` elapsed first.
    pub fn wait(&self, mtx: &IpcMutex, timeout_ms: Option<u64>) -> io::Result<bool> {
        let mtx_ptr = mtx.native_mutex_ptr() as *mut libc::pthread_mutex_t;
        let eno = match timeout_ms {
            None => unsafe { libc::pthread_cond_wait(self.raw(), mtx_ptr) },
            Some(ms) => {
                // pthread condattr default clock is CLOCK_REALTIME.
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let deadline = now + Duration::from_millis(ms);
                let ts = libc::timespec {
                    tv_sec: deadline.as_secs() as libc::time_t,
                    tv_nsec: deadline.subsec_nanos() as libc::c_long,
                };
                unsafe { libc::pthread_cond_timedwait(self.raw(), mtx_ptr, &ts) }
            }
        };
        match eno {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_cond_broadcast(self.raw()) })
    }

    /// Remove the backing storage of the condition `name`.
    pub fn clear_storage(name: &str) {
        posix::cached_purge(posix::cond_cache(), name);
        posix::PlatformShm::unlink_by_name(name);
    }
}

fn check(eno: libc::c_int) -> io::Result<()> {
    if eno == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(eno))
    }
}

/// # Safety
/// `cond` must point to writable memory for a `pthread_cond_t` that no other
/// thread is using yet.
unsafe fn init_shared_cond(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    ptr::write_bytes(cond, 0, 1);

    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    check(libc::pthread_condattr_init(&mut attr))?;
    let mut eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno == 0 {
        eno = libc::pthread_cond_init(cond, &attr);
    }
    libc::pthread_condattr_destroy(&mut attr);
    check(eno)
}

impl Drop for IpcCondition {
    fn drop(&mut self) {
        // See PlatformMutex::drop: no pthread_cond_destroy on a shared mapping.
        posix::cached_release(posix::cond_cache(), &self.name);
    }
}
