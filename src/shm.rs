// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named, reference-counted shared memory handle (POSIX).

use std::io;

use crate::platform::posix::ShmMode;
use crate::platform::PlatformShm;

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively; fail if the name exists.
    Create,
    /// Open an existing segment; fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

impl From<ShmOpenMode> for ShmMode {
    fn from(mode: ShmOpenMode) -> Self {
        match mode {
            ShmOpenMode::Create => ShmMode::Create,
            ShmOpenMode::Open => ShmMode::Open,
            ShmOpenMode::CreateOrOpen => ShmMode::CreateOrOpen,
        }
    }
}

/// A named shared memory region mapped into this process.
///
/// The mapping carries a trailing `AtomicI32` counting the handles of every
/// process that maps it. Dropping the last handle unmaps the region and
/// unlinks the name. A freshly created region reads as zeroes.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Map `size` usable bytes of the segment `name`.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let inner = PlatformShm::acquire(name, size, mode.into())?;
        Ok(Self { inner })
    }

    /// Start of the usable region.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Total mapped size, reference counter included.
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// Usable size as requested at acquire time.
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// The POSIX name (leading '/') the segment was opened under.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Handles mapping this segment, across all processes.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Whether this handle created the segment (no other mapping existed).
    pub fn is_creator(&self) -> bool {
        self.inner.prev_ref_count() == 0
    }

    /// Remove a segment by name without mapping it.
    pub fn clear_storage(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}
