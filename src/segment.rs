// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Backing memory of a channel and the registry that shares it.
//
// A `Segment` is one mapping of a channel in this process: either a
// zero-filled heap block (threads only) or a named POSIX shm object
// (threads and processes). The `SegmentRegistry` maps channel names to
// segments so that every handle for one name in one process shares a single
// `Segment`, in the same way the named-mutex cache shares one mapping per
// name.
//
// The slot table and descriptor ring are reached only through `Tables` /
// `TablesMut`, which hold the structural lock from the segment header for
// as long as they live.

use std::alloc;
use std::collections::HashMap;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::config::{Backend, ChannelConfig};
use crate::error::{Result, StreamError};
use crate::frame::FrameInfo;
use crate::layout::{FrameDescriptor, Layout, SegmentHeader, SlotEntry, SECTION_ALIGN};
use crate::rw_lock::{ReadGuard, WriteGuard};

#[cfg(unix)]
use crate::shm::{ShmHandle, ShmOpenMode};
#[cfg(unix)]
use crate::shm_name;
#[cfg(unix)]
use crate::waiter::Waiter;

/// Notification callback run by the producer for every frame it puts.
pub type Callback = Arc<dyn Fn(&FrameInfo, &[u8]) + Send + Sync>;

// ---------------------------------------------------------------------------
// Memory backends
// ---------------------------------------------------------------------------

enum Memory {
    Heap {
        ptr: NonNull<u8>,
        layout: alloc::Layout,
    },
    #[cfg(unix)]
    Shared(ShmHandle),
}

impl Memory {
    fn base(&self) -> *mut u8 {
        match self {
            Memory::Heap { ptr, .. } => ptr.as_ptr(),
            #[cfg(unix)]
            Memory::Shared(shm) => shm.as_mut_ptr(),
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Memory::Heap { ptr, layout } = self {
            unsafe { alloc::dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

fn alloc_heap(name: &str, size: usize) -> Result<Memory> {
    let creation = |source| StreamError::Creation {
        name: name.to_string(),
        source,
    };
    let layout = alloc::Layout::from_size_align(size, SECTION_ALIGN)
        .map_err(|e| creation(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let raw = unsafe { alloc::alloc_zeroed(layout) };
    let ptr = NonNull::new(raw)
        .ok_or_else(|| creation(io::Error::from(io::ErrorKind::OutOfMemory)))?;
    Ok(Memory::Heap { ptr, layout })
}

// ---------------------------------------------------------------------------
// Wake-ups for blocking consumers
// ---------------------------------------------------------------------------

enum Notifier {
    Local { lock: Mutex<()>, cond: Condvar },
    #[cfg(unix)]
    Shared(Waiter),
}

impl Notifier {
    fn local() -> Self {
        Notifier::Local {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn wait_while<F>(&self, pred: F, timeout_ms: Option<u64>) -> Result<bool>
    where
        F: Fn() -> bool,
    {
        match self {
            Notifier::Local { lock, cond } => {
                let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
                let mut guard = lock.lock();
                while pred() {
                    match deadline {
                        None => cond.wait(&mut guard),
                        Some(dl) => {
                            if cond.wait_until(&mut guard, dl).timed_out() {
                                return Ok(!pred());
                            }
                        }
                    }
                }
                Ok(true)
            }
            #[cfg(unix)]
            Notifier::Shared(waiter) => Ok(waiter.wait_while(pred, timeout_ms)?),
        }
    }

    fn broadcast(&self) -> Result<()> {
        match self {
            Notifier::Local { lock, cond } => {
                drop(lock.lock());
                cond.notify_all();
                Ok(())
            }
            #[cfg(unix)]
            Notifier::Shared(waiter) => Ok(waiter.broadcast()?),
        }
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// One channel's memory, as mapped into this process.
pub struct Segment {
    name: String,
    backend: Backend,
    layout: Layout,
    memory: Memory,
    notifier: Notifier,
    /// Callbacks registered by consumers of this process, keyed by slot, in
    /// registration order.
    callbacks: Mutex<Vec<(usize, Callback)>>,
}

// All shared state behind `memory` is reached through the in-segment
// structural lock or atomics.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocate or map the segment for `name` and make sure its header
    /// describes `layout`.
    pub(crate) fn create(name: &str, backend: Backend, layout: Layout) -> Result<Self> {
        let (memory, notifier) = match backend {
            Backend::ProcessLocalHeap => (alloc_heap(name, layout.total_size())?, Notifier::local()),
            #[cfg(unix)]
            Backend::OsSharedMemory => {
                let creation = |source| StreamError::Creation {
                    name: name.to_string(),
                    source,
                };
                let shm = ShmHandle::acquire(
                    &shm_name::segment_name(name),
                    layout.total_size(),
                    ShmOpenMode::CreateOrOpen,
                )
                .map_err(|e| match e.kind() {
                    // Size check on an existing object: another geometry.
                    io::ErrorKind::InvalidData => StreamError::LayoutMismatch {
                        name: name.to_string(),
                        detail: e.to_string(),
                    },
                    _ => creation(e),
                })?;
                debug!(channel = name, shm = %shm.name(), refs = shm.ref_count(), "shm mapped");
                let waiter = Waiter::open(&shm_name::waiter_name(name)).map_err(creation)?;
                (Memory::Shared(shm), Notifier::Shared(waiter))
            }
            #[cfg(not(unix))]
            Backend::OsSharedMemory => {
                return Err(StreamError::Unsupported(
                    "OS shared memory segments require a unix target",
                ))
            }
        };

        let seg = Self {
            name: name.to_string(),
            backend,
            layout,
            memory,
            notifier,
            callbacks: Mutex::new(Vec::new()),
        };
        let fresh = seg.construct_header();
        if !fresh {
            if let Some(detail) = layout.mismatch(seg.header()) {
                return Err(StreamError::LayoutMismatch {
                    name: name.to_string(),
                    detail,
                });
            }
        }
        info!(
            channel = name,
            ?backend,
            size = layout.total_size(),
            fresh,
            "segment mapped"
        );
        Ok(seg)
    }

    /// Stamp the geometry into a zero-filled header exactly once, across
    /// every thread and process mapping the segment. Returns whether this
    /// call did it.
    fn construct_header(&self) -> bool {
        let hdr = self.header_ptr();
        // The lock words are atomics; taking shared references to them is
        // fine while the plain geometry fields are written through `hdr`.
        let (constructed, init_lock) = unsafe { (&(*hdr).constructed, &(*hdr).init_lock) };
        if constructed.load(Ordering::Acquire) {
            return false;
        }
        let _guard = init_lock.lock();
        if constructed.load(Ordering::Relaxed) {
            return false;
        }
        unsafe { self.layout.stamp(hdr) };
        constructed.store(true, Ordering::Release);
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn header_ptr(&self) -> *mut SegmentHeader {
        self.memory.base() as *mut SegmentHeader
    }

    pub(crate) fn header(&self) -> &SegmentHeader {
        unsafe { &*self.header_ptr() }
    }

    /// Take the structural lock exclusively.
    pub(crate) fn write(&self) -> TablesMut<'_> {
        TablesMut {
            seg: self,
            _guard: self.header().lock.write(),
        }
    }

    /// Take the structural lock shared.
    pub(crate) fn read(&self) -> Tables<'_> {
        Tables {
            seg: self,
            _guard: self.header().lock.read(),
        }
    }

    fn slot_ptr(&self, index: usize) -> *mut SlotEntry {
        assert!(index < self.layout.slot_count(), "slot index out of range");
        unsafe {
            (self.memory.base().add(Layout::SLOTS_OFFSET) as *mut SlotEntry).add(index)
        }
    }

    fn desc_ptr(&self, index: usize) -> *mut FrameDescriptor {
        assert!(
            index < self.layout.frame_capacity() as usize,
            "descriptor index out of range"
        );
        unsafe {
            (self.memory.base().add(self.layout.descriptors_offset()) as *mut FrameDescriptor)
                .add(index)
        }
    }

    fn arena_ptr(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.layout.payload_bytes()),
            "arena range out of bounds"
        );
        unsafe { self.memory.base().add(self.layout.arena_offset() + offset) }
    }

    // -- callbacks ----------------------------------------------------------

    /// Register `cb` for `slot`, replacing (and re-ordering) an earlier one.
    pub(crate) fn set_callback(&self, slot: usize, cb: Callback) {
        let mut list = self.callbacks.lock();
        list.retain(|(s, _)| *s != slot);
        list.push((slot, cb));
    }

    /// Remove the callback of `slot`; returns whether there was one.
    pub(crate) fn clear_callback(&self, slot: usize) -> bool {
        let mut list = self.callbacks.lock();
        let before = list.len();
        list.retain(|(s, _)| *s != slot);
        list.len() != before
    }

    /// Snapshot of the registered callbacks, in registration order.
    pub(crate) fn callbacks(&self) -> Vec<Callback> {
        self.callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }

    // -- blocking -----------------------------------------------------------

    pub(crate) fn wait_while<F>(&self, pred: F, timeout_ms: Option<u64>) -> Result<bool>
    where
        F: Fn() -> bool,
    {
        self.notifier.wait_while(pred, timeout_ms)
    }

    pub(crate) fn broadcast(&self) -> Result<()> {
        self.notifier.broadcast()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        debug!(channel = %self.name, backend = ?self.backend, "segment unmapped");
    }
}

// ---------------------------------------------------------------------------
// Locked views of the tables
// ---------------------------------------------------------------------------

/// Shared view of the slot table and descriptor ring.
pub(crate) struct Tables<'a> {
    seg: &'a Segment,
    _guard: ReadGuard<'a>,
}

impl<'a> Tables<'a> {
    pub(crate) fn slot(&self, index: usize) -> &SlotEntry {
        unsafe { &*self.seg.slot_ptr(index) }
    }

    pub(crate) fn desc(&self, index: usize) -> &FrameDescriptor {
        unsafe { &*self.seg.desc_ptr(index) }
    }
}

/// Exclusive view of the slot table, descriptor ring and arena.
pub(crate) struct TablesMut<'a> {
    seg: &'a Segment,
    _guard: WriteGuard<'a>,
}

impl<'a> TablesMut<'a> {
    pub(crate) fn slot(&self, index: usize) -> &SlotEntry {
        unsafe { &*self.seg.slot_ptr(index) }
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut SlotEntry {
        unsafe { &mut *self.seg.slot_ptr(index) }
    }

    pub(crate) fn desc(&self, index: usize) -> &FrameDescriptor {
        unsafe { &*self.seg.desc_ptr(index) }
    }

    pub(crate) fn desc_mut(&mut self, index: usize) -> &mut FrameDescriptor {
        unsafe { &mut *self.seg.desc_ptr(index) }
    }

    /// Copy `bytes` into the arena at `offset`.
    pub(crate) fn write_payload(&mut self, offset: usize, bytes: &[u8]) {
        let dst = self.seg.arena_ptr(offset, bytes.len());
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    /// Borrow `len` arena bytes at `offset` beyond the lifetime of the lock.
    ///
    /// The producer never waits for readers, so the bytes may be rewritten
    /// once it laps this frame; callers detect that through the descriptor
    /// stamp.
    pub(crate) fn payload(&self, offset: usize, len: usize) -> &'a [u8] {
        let src = self.seg.arena_ptr(offset, len);
        unsafe { std::slice::from_raw_parts(src, len) }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Entry {
    refcount: usize,
    segment: Arc<Segment>,
}

/// Name → segment map shared by the channel handles of one process.
///
/// Every `open` of a channel takes one reference; dropping or detaching the
/// handle gives it back, and the last reference unmaps the segment. The
/// registry is bounded: opening a new name when `max_segments` names are
/// live fails with [`StreamError::RegistryFull`].
pub struct SegmentRegistry {
    max_segments: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SegmentRegistry {
    pub const DEFAULT_MAX_SEGMENTS: usize = 64;

    pub fn new() -> Self {
        Self::with_max_segments(Self::DEFAULT_MAX_SEGMENTS)
    }

    pub fn with_max_segments(max_segments: usize) -> Self {
        Self {
            max_segments,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Take a reference on the segment for `cfg.name`, creating it if this
    /// is the first one.
    pub(crate) fn acquire(&self, cfg: &ChannelConfig) -> Result<Arc<Segment>> {
        let layout = cfg.layout()?;
        let mut map = self.entries.lock();
        if let Some(entry) = map.get_mut(&cfg.name) {
            let seg = &entry.segment;
            if seg.backend() != cfg.backend {
                return Err(StreamError::LayoutMismatch {
                    name: cfg.name.clone(),
                    detail: format!(
                        "mapped with backend {:?}, requested {:?}",
                        seg.backend(),
                        cfg.backend
                    ),
                });
            }
            if let Some(detail) = layout.mismatch(seg.header()) {
                return Err(StreamError::LayoutMismatch {
                    name: cfg.name.clone(),
                    detail,
                });
            }
            entry.refcount += 1;
            debug!(channel = %cfg.name, refcount = entry.refcount, "segment shared");
            return Ok(Arc::clone(&entry.segment));
        }
        if map.len() >= self.max_segments {
            return Err(StreamError::RegistryFull {
                limit: self.max_segments,
            });
        }
        let segment = Arc::new(Segment::create(&cfg.name, cfg.backend, layout)?);
        map.insert(
            cfg.name.clone(),
            Entry {
                refcount: 1,
                segment: Arc::clone(&segment),
            },
        );
        Ok(segment)
    }

    /// Give back one reference on `name`.
    pub(crate) fn release(&self, name: &str) {
        let mut map = self.entries.lock();
        let Some(entry) = map.get_mut(name) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            map.remove(name);
            debug!(channel = name, "segment released");
        } else {
            debug!(channel = name, refcount = entry.refcount, "segment reference dropped");
        }
    }

    /// References held on `name`; 0 if it is not mapped.
    pub fn refcount(&self, name: &str) -> usize {
        self.entries.lock().get(name).map_or(0, |e| e.refcount)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// Number of mapped segments.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Whether some slot of channel `name` is held under `identifier`.
    ///
    /// Only channels mapped by this registry are looked at; the slot itself
    /// may belong to another process.
    pub fn is_attached(&self, name: &str, identifier: &str) -> bool {
        let Some(seg) = self.entries.lock().get(name).map(|e| Arc::clone(&e.segment)) else {
            return false;
        };
        let tables = seg.read();
        let attached = (0..seg.layout().slot_count()).any(|i| tables.slot(i).matches(identifier));
        attached
    }
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> ChannelConfig {
        ChannelConfig::producer(name, "p")
            .with_frame_capacity(4)
            .with_payload_bytes(256)
    }

    #[test]
    fn heap_segment_starts_zeroed_and_stamped() {
        let layout = cfg("seg_zero").layout().expect("layout");
        let seg = Segment::create("seg_zero", Backend::ProcessLocalHeap, layout).expect("create");
        assert!(layout.mismatch(seg.header()).is_none());
        let tables = seg.read();
        for i in 0..layout.slot_count() {
            assert!(!tables.slot(i).is_occupied());
            assert_eq!(tables.slot(i).cursor, 0);
        }
        assert_eq!(tables.desc(0).stamp, 0);
    }

    #[test]
    fn registry_shares_one_segment_per_name() {
        let reg = SegmentRegistry::new();
        let a = reg.acquire(&cfg("seg_share")).expect("first");
        let b = reg.acquire(&cfg("seg_share")).expect("second");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.refcount("seg_share"), 2);
        reg.release("seg_share");
        assert!(reg.contains("seg_share"));
        reg.release("seg_share");
        assert!(!reg.contains("seg_share"));
        assert!(reg.is_empty());
    }

    #[test]
    fn registry_rejects_other_geometry() {
        let reg = SegmentRegistry::new();
        let _a = reg.acquire(&cfg("seg_geom")).expect("first");
        let err = reg
            .acquire(&cfg("seg_geom").with_frame_capacity(8))
            .err()
            .expect("mismatch");
        assert!(matches!(err, StreamError::LayoutMismatch { .. }));
        assert_eq!(reg.refcount("seg_geom"), 1);
    }

    #[test]
    fn registry_is_bounded() {
        let reg = SegmentRegistry::with_max_segments(1);
        let _a = reg.acquire(&cfg("seg_b1")).expect("first");
        let err = reg.acquire(&cfg("seg_b2")).err().expect("full");
        assert!(matches!(err, StreamError::RegistryFull { limit: 1 }));
    }

    #[test]
    fn callbacks_keep_registration_order() {
        let layout = cfg("seg_cb").layout().expect("layout");
        let seg = Segment::create("seg_cb", Backend::ProcessLocalHeap, layout).expect("create");
        let noop: Callback = Arc::new(|_, _| {});
        seg.set_callback(2, Arc::clone(&noop));
        seg.set_callback(1, Arc::clone(&noop));
        seg.set_callback(2, noop);
        assert_eq!(seg.callbacks().len(), 2);
        assert_eq!(
            seg.callbacks.lock().iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(seg.clear_callback(1));
        assert!(!seg.clear_callback(1));
    }
}
