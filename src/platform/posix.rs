// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory and process-shared mutex primitives.
//
// A mapping is `shm_open` + `mmap` of the user size rounded up to 8 bytes,
// followed by an `AtomicI32` reference counter shared by every process that
// maps the object. The last handle to go away unlinks the name.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::shm_name;
use crate::spin_lock::backoff;

// ---------------------------------------------------------------------------
// Per-process cache of named synchronisation objects.
//
// Every thread of a process that opens the same named mutex or condition
// must use the same mapping: macOS pthread objects remember the virtual
// address they were initialised at.
// ---------------------------------------------------------------------------

pub(crate) struct CachedShm {
    pub(crate) shm: PlatformShm,
    local_refs: AtomicUsize,
}

pub(crate) type ShmCache = Mutex<HashMap<String, Arc<CachedShm>>>;

fn mutex_cache() -> &'static ShmCache {
    static CACHE: OnceLock<ShmCache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn cond_cache() -> &'static ShmCache {
    static CACHE: OnceLock<ShmCache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Open `name` through `cache`, running `init` on the memory if this call
/// created the object. `init` runs with the cache locked, so no other thread
/// of this process can observe the object half-initialised.
pub(crate) fn cached_acquire<F>(
    cache: &ShmCache,
    name: &str,
    size: usize,
    init: F,
) -> io::Result<Arc<CachedShm>>
where
    F: FnOnce(*mut u8) -> io::Result<()>,
{
    let mut map = cache.lock();
    if let Some(entry) = map.get(name) {
        entry.local_refs.fetch_add(1, Ordering::Relaxed);
        return Ok(Arc::clone(entry));
    }
    let shm = PlatformShm::acquire(name, size, ShmMode::CreateOrOpen)?;
    if shm.prev_ref_count() == 0 {
        init(shm.as_mut_ptr())?;
    }
    let entry = Arc::new(CachedShm {
        shm,
        local_refs: AtomicUsize::new(1),
    });
    map.insert(name.to_string(), Arc::clone(&entry));
    Ok(entry)
}

/// Drop one local reference; the last one evicts the entry.
pub(crate) fn cached_release(cache: &ShmCache, name: &str) {
    let mut map = cache.lock();
    let last = map
        .get(name)
        .map(|e| e.local_refs.fetch_sub(1, Ordering::AcqRel) <= 1)
        .unwrap_or(false);
    if last {
        map.remove(name);
    }
}

/// Forget a cached entry (after its backing object was unlinked).
pub(crate) fn cached_purge(cache: &ShmCache, name: &str) {
    cache.lock().remove(name);
}

// ---------------------------------------------------------------------------
// Robust mutex symbols: not exported by `libc` everywhere.
// macOS has no robust mutexes.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

// ---------------------------------------------------------------------------
// Mapping layout
// ---------------------------------------------------------------------------

const ALIGN: usize = 8;

/// User size rounded up to `ALIGN`, plus the trailing reference counter.
pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = user_size.div_ceil(ALIGN) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// The reference counter stored in the last four bytes of a mapping.
///
/// # Safety
/// `mem` must point to a live mapping of at least `total_size` bytes.
unsafe fn ref_counter<'a>(mem: *mut u8, total_size: usize) -> &'a AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

fn errno_result(eno: libc::c_int) -> io::Result<()> {
    if eno == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(eno))
    }
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

/// How to open a named segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    user_size: usize,
    name: String,
    prev_ref: i32,
}

// Safety: the mapping is meant to be shared; all synchronisation is done by
// the structures placed inside it.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let perms: libc::mode_t = 0o666;
        let total_size = calc_size(user_size);

        let open = |flags: libc::c_int| -> io::Result<libc::c_int> {
            let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, perms as libc::c_uint) };
            if fd == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(fd)
            }
        };
        let exclusive = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;

        // Only the creator truncates: on macOS ftruncate on an already sized
        // object may zero it before failing with EINVAL.
        let (fd, created) = match mode {
            ShmMode::Create => (open(exclusive)?, true),
            ShmMode::Open => (open(libc::O_RDWR)?, false),
            ShmMode::CreateOrOpen => match open(exclusive) {
                Ok(fd) => (fd, true),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => (open(libc::O_RDWR)?, false),
                Err(e) => return Err(e),
            },
        };

        unsafe { libc::fchmod(fd, perms) };

        let sized = if created {
            let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
            if ret == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        } else {
            check_existing_size(fd, total_size)
        };
        if let Err(e) = sized {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mem = mem as *mut u8;
        let prev = unsafe { ref_counter(mem, total_size).fetch_add(1, Ordering::AcqRel) };
        tracing::trace!(name = %posix_name, total_size, prev_refs = prev, "mapped shm");

        Ok(Self {
            mem,
            size: total_size,
            user_size,
            name: posix_name,
            prev_ref: prev,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn mapped_size(&self) -> usize {
        self.size
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference count before this handle's own increment; 0 means this
    /// handle was the first mapping.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { ref_counter(self.mem, self.size).load(Ordering::Acquire) }
    }

    fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

/// How long an opener waits for the creator to size a new object.
const SIZE_WAIT: Duration = Duration::from_millis(500);

/// An existing object must have exactly the size we are about to map: a
/// smaller one faults with SIGBUS past its end, and in a larger one the
/// trailing reference counter would land inside someone else's data.
///
/// A size of 0 means the creator has opened the name but not truncated it
/// yet, so that case is retried until `SIZE_WAIT` runs out.
fn check_existing_size(fd: libc::c_int, total_size: usize) -> io::Result<()> {
    let deadline = Instant::now() + SIZE_WAIT;
    let mut k = 0u32;
    loop {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let size = st.st_size as usize;
        if size == total_size {
            return Ok(());
        }
        if size != 0 || Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("existing segment is {size} bytes, {total_size} requested"),
            ));
        }
        backoff(&mut k);
    }
}

/// Whether process `pid` still exists. 0 stands for "unknown" and counts as
/// alive.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid == std::process::id() {
        return true;
    }
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    // EPERM: it exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        let prev = unsafe { ref_counter(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
            tracing::trace!(name = %self.name, "unlinked shm");
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformMutex: pthread_mutex_t living in its own named segment
// ---------------------------------------------------------------------------

pub struct PlatformMutex {
    cached: Arc<CachedShm>,
    name: String,
}

impl PlatformMutex {
    /// Open (or create) a process-shared, robust mutex named `name`.
    pub fn open(name: &str) -> io::Result<Self> {
        let size = std::mem::size_of::<libc::pthread_mutex_t>();
        let cached = cached_acquire(mutex_cache(), name, size, |base| unsafe {
            init_shared_mutex(base as *mut libc::pthread_mutex_t)
        })?;
        Ok(Self {
            cached,
            name: name.to_string(),
        })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.cached.shm.as_mut_ptr() as *mut libc::pthread_mutex_t
    }

    /// Restore a robust mutex whose previous owner died while holding it.
    #[cfg(not(target_os = "macos"))]
    fn recover(&self) -> io::Result<()> {
        tracing::warn!(mutex = %self.name, "previous owner died holding the mutex");
        errno_result(unsafe { pthread_mutex_consistent(self.raw()) })
    }

    pub fn lock(&self) -> io::Result<()> {
        match unsafe { libc::pthread_mutex_lock(self.raw()) } {
            0 => Ok(()),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => self.recover(),
            eno => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    pub fn try_lock(&self) -> io::Result<bool> {
        match unsafe { libc::pthread_mutex_trylock(self.raw()) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => self.recover().map(|()| true),
            eno => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    pub fn unlock(&self) -> io::Result<()> {
        errno_result(unsafe { libc::pthread_mutex_unlock(self.raw()) })
    }

    pub(crate) fn native_ptr(&self) -> *mut u8 {
        self.cached.shm.as_mut_ptr()
    }

    pub fn clear_storage(name: &str) {
        cached_purge(mutex_cache(), name);
        PlatformShm::unlink_by_name(name);
    }
}

/// # Safety
/// `mtx` must point to writable memory large enough for a `pthread_mutex_t`
/// that no other thread is using yet.
unsafe fn init_shared_mutex(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    ptr::write_bytes(mtx, 0, 1);

    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    errno_result(libc::pthread_mutexattr_init(&mut attr))?;

    let mut eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    #[cfg(not(target_os = "macos"))]
    if eno == 0 {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
    }
    if eno == 0 {
        eno = libc::pthread_mutex_init(mtx, &attr);
    }
    libc::pthread_mutexattr_destroy(&mut attr);
    errno_result(eno)
}

impl Drop for PlatformMutex {
    fn drop(&mut self) {
        // No pthread_mutex_destroy: after munmap the address may belong to
        // another segment. Unmapping and unlinking reclaim the memory.
        cached_release(mutex_cache(), &self.name);
    }
}
