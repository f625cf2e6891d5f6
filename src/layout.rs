// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// In-segment layout of a channel.
//
//   [SegmentHeader][SlotEntry; consumer_limit + 1][FrameDescriptor; frame_capacity][arena]
//
// Every structure is `repr(C)` and valid when zeroed, so a fresh segment
// (zero-filled heap or a newly truncated shm object) needs no per-field
// initialisation. Slot 0 belongs to the producer and also carries the
// channel-wide producer state (cursor, arena write offset, consumer count).

use std::ptr;
use std::sync::atomic::AtomicBool;

use crate::frame::FrameInfo;
use crate::rw_lock::RwLock;
use crate::spin_lock::SpinLock;

/// Bytes reserved for an identifier, terminating NUL included.
pub const IDENT_LEN: usize = 32;

/// "SHMS" in little-endian.
pub const MAGIC: u32 = 0x534d_4853;
pub const LAYOUT_VERSION: u32 = 2;

/// Alignment of the table and arena starts.
pub(crate) const SECTION_ALIGN: usize = 64;

pub const SLOT_FREE: u32 = 0;
pub const SLOT_PRODUCER: u32 = 1;
pub const SLOT_CONSUMER: u32 = 2;

#[repr(C)]
pub struct SegmentHeader {
    /// Structural lock guarding the slot table and the descriptor ring.
    pub lock: RwLock,
    /// Serialises the one-time write of the geometry below.
    pub init_lock: SpinLock,
    pub constructed: AtomicBool,
    pub magic: u32,
    pub version: u32,
    pub consumer_limit: u32,
    pub frame_capacity: u32,
    _pad: u32,
    pub payload_bytes: u64,
}

#[repr(C)]
pub struct SlotEntry {
    id: [u8; IDENT_LEN],
    pub role: u32,
    /// Live handles attached under this identifier.
    pub handles: u32,
    /// Producer: frames written. Consumer: frames consumed.
    pub cursor: u64,
    /// Consumer: unread frames the producer overwrote.
    pub overwrites: u64,
    /// Non-zero while a notification callback is registered for the slot.
    pub has_callback: u32,
    /// Slot 0 only: attached consumers.
    pub consumers: u32,
    /// Slot 0 only: next free byte of the payload arena.
    pub write_offset: u64,
    /// Slot 0 only: frames written since the arena last wrapped.
    pub frames_since_wrap: u64,
    /// Slot 0 only: number of arena wraps.
    pub arena_wraps: u64,
    /// Process that claimed the slot.
    pub owner_pid: u32,
    _pad: u32,
}

impl SlotEntry {
    pub fn is_occupied(&self) -> bool {
        self.id[0] != 0
    }

    pub fn identifier(&self) -> &str {
        let end = self.id.iter().position(|&b| b == 0).unwrap_or(IDENT_LEN);
        std::str::from_utf8(&self.id[..end]).unwrap_or("")
    }

    pub fn matches(&self, identifier: &str) -> bool {
        self.is_occupied() && self.identifier() == identifier
    }

    /// Store `identifier`, truncated to `IDENT_LEN - 1` bytes.
    pub fn set_identifier(&mut self, identifier: &str) {
        let bytes = identifier.as_bytes();
        let len = bytes.len().min(IDENT_LEN - 1);
        self.id = [0; IDENT_LEN];
        self.id[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn clear_identifier(&mut self) {
        self.id = [0; IDENT_LEN];
        self.role = SLOT_FREE;
        self.handles = 0;
        self.has_callback = 0;
        self.owner_pid = 0;
    }
}

/// Whether some consumer currently holds a peek at a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Idle,
    Accessing,
}

#[repr(C)]
pub struct FrameDescriptor {
    /// Byte offset of the payload in the arena.
    pub offset: u64,
    pub length: u64,
    /// Producer cursor + 1 at the time this descriptor was written; 0 if
    /// never written.
    pub stamp: u64,
    /// Consumers currently peeking at this descriptor.
    pub readers: u32,
    /// Low 32 bits of the arena wrap count when the payload was written.
    pub arena_epoch: u32,
    pub info: FrameInfo,
}

/// Whether payload bytes written at `offset` during arena epoch `epoch` are
/// still in place, given the arena state now. `false` means they may have
/// been rewritten.
pub fn payload_in_place(epoch: u32, offset: u64, arena_wraps: u64, write_offset: u64) -> bool {
    match (arena_wraps as u32).wrapping_sub(epoch) {
        0 => true,
        1 => write_offset <= offset,
        _ => false,
    }
}

impl FrameDescriptor {
    pub fn access_status(&self) -> AccessStatus {
        if self.readers > 0 {
            AccessStatus::Accessing
        } else {
            AccessStatus::Idle
        }
    }
}

const fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) / align * align
}

/// Byte offsets of the sections of one channel geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    consumer_limit: u32,
    frame_capacity: u32,
    payload_bytes: usize,
    descriptors_offset: usize,
    arena_offset: usize,
    total_size: usize,
}

impl Layout {
    /// Offset of the slot table; fixed for every geometry.
    pub const SLOTS_OFFSET: usize = align_up(std::mem::size_of::<SegmentHeader>(), SECTION_ALIGN);

    /// Compute the layout, or `None` if the sizes overflow `usize`.
    pub fn new(consumer_limit: u32, frame_capacity: u32, payload_bytes: usize) -> Option<Self> {
        let slot_count = (consumer_limit as usize).checked_add(1)?;
        let slots_len = slot_count.checked_mul(std::mem::size_of::<SlotEntry>())?;
        let descriptors_offset = Self::SLOTS_OFFSET.checked_add(slots_len)?;
        let ring_len =
            (frame_capacity as usize).checked_mul(std::mem::size_of::<FrameDescriptor>())?;
        let arena_offset = descriptors_offset
            .checked_add(ring_len)?
            .checked_add(SECTION_ALIGN - 1)?
            / SECTION_ALIGN
            * SECTION_ALIGN;
        let total_size = arena_offset.checked_add(payload_bytes)?;
        Some(Self {
            consumer_limit,
            frame_capacity,
            payload_bytes,
            descriptors_offset,
            arena_offset,
            total_size,
        })
    }

    pub fn consumer_limit(&self) -> u32 {
        self.consumer_limit
    }

    /// Producer slot plus one slot per consumer.
    pub fn slot_count(&self) -> usize {
        self.consumer_limit as usize + 1
    }

    pub fn frame_capacity(&self) -> u32 {
        self.frame_capacity
    }

    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    pub fn descriptors_offset(&self) -> usize {
        self.descriptors_offset
    }

    pub fn arena_offset(&self) -> usize {
        self.arena_offset
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Describe how the geometry stored in `hdr` differs from `self`.
    pub fn mismatch(&self, hdr: &SegmentHeader) -> Option<String> {
        if hdr.magic != MAGIC || hdr.version != LAYOUT_VERSION {
            return Some(format!(
                "foreign segment (magic {:#x}, version {})",
                hdr.magic, hdr.version
            ));
        }
        let stored = (hdr.consumer_limit, hdr.frame_capacity, hdr.payload_bytes);
        let wanted = (
            self.consumer_limit,
            self.frame_capacity,
            self.payload_bytes as u64,
        );
        if stored != wanted {
            return Some(format!(
                "created with consumer_limit={} frame_capacity={} payload_bytes={}, \
                 requested consumer_limit={} frame_capacity={} payload_bytes={}",
                stored.0, stored.1, stored.2, wanted.0, wanted.1, wanted.2
            ));
        }
        None
    }

    /// Write this geometry into a zeroed header.
    ///
    /// # Safety
    /// `hdr` must point to a mapped header. The caller holds its `init_lock`
    /// and has not yet published `constructed`, so nobody reads the geometry
    /// fields concurrently.
    pub(crate) unsafe fn stamp(&self, hdr: *mut SegmentHeader) {
        ptr::addr_of_mut!((*hdr).magic).write(MAGIC);
        ptr::addr_of_mut!((*hdr).version).write(LAYOUT_VERSION);
        ptr::addr_of_mut!((*hdr).consumer_limit).write(self.consumer_limit);
        ptr::addr_of_mut!((*hdr).frame_capacity).write(self.frame_capacity);
        ptr::addr_of_mut!((*hdr).payload_bytes).write(self.payload_bytes as u64);
    }
}
