// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// OS primitives behind the shared-memory backend. Only POSIX is implemented;
// the process-local backend needs none of this.

#[cfg(unix)]
pub mod posix;

#[cfg(unix)]
pub use posix::{process_alive, PlatformMutex, PlatformShm};

/// Without a way to probe other processes every owner counts as alive.
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}
