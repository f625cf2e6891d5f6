// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-producer, multi-consumer frame channels over process-local heap
// memory or POSIX shared memory, plus the shared-memory primitives they are
// built from.

pub mod config;
pub mod error;
pub mod frame;
pub mod layout;
pub mod segment;
pub mod shm_name;

mod channel;
pub use channel::{open, ChannelStats, Consumer, Endpoint, FrameGuard, Producer};

pub use config::{Backend, ChannelConfig, Role};
pub use error::{Result, StreamError};
pub use frame::{Frame, FrameInfo};
pub use segment::{Callback, Segment, SegmentRegistry};

mod platform;

mod spin_lock;
pub use spin_lock::{SpinGuard, SpinLock};

mod rw_lock;
pub use rw_lock::{ReadGuard, RwLock, WriteGuard};

#[cfg(unix)]
mod shm;
#[cfg(unix)]
pub use shm::{ShmHandle, ShmOpenMode};

#[cfg(unix)]
mod mutex;
#[cfg(unix)]
pub use mutex::IpcMutex;

#[cfg(unix)]
mod condition;
#[cfg(unix)]
pub use condition::IpcCondition;

#[cfg(unix)]
mod waiter;
#[cfg(unix)]
pub use waiter::Waiter;
