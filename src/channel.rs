// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-producer, multi-consumer frame channel.
//
// - `Producer`: slot 0; appends frames and never waits for readers.
// - `Consumer`: slots 1..=consumer_limit; each reads at its own cursor.
//
// Cursors are monotonically increasing frame counts kept in the slot table;
// the descriptor for frame `c` lives at ring index `c % frame_capacity`. A
// consumer more than `frame_capacity` frames behind has lost its oldest
// frames and is moved up to the oldest one still resident when it next
// reads.
//
// Every table mutation happens under the structural lock in the segment
// header. The producer copies the payload under that lock too and only then
// advances its cursor, so a frame is never visible half-written. A slice
// already handed out by `get`/`front` is not protected: once the producer
// laps it the bytes change underneath the reader.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::{ChannelConfig, Role};
use crate::error::{Result, StreamError};
use crate::frame::{Frame, FrameInfo};
use crate::layout::{payload_in_place, SLOT_CONSUMER, SLOT_PRODUCER};
use crate::platform;
use crate::segment::{Callback, Segment, SegmentRegistry, TablesMut};

/// Counters kept by the producer in slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Frames written since the segment was created.
    pub produced: u64,
    /// Attached consumers.
    pub consumers: u32,
    /// Times the payload arena wrapped back to offset 0.
    pub arena_wraps: u64,
    /// Next free byte of the payload arena.
    pub write_offset: u64,
}

// ---------------------------------------------------------------------------
// Attachment: one claimed slot plus one registry reference
// ---------------------------------------------------------------------------

struct Attachment {
    registry: Arc<SegmentRegistry>,
    segment: Arc<Segment>,
    slot: usize,
    identifier: String,
    role: Role,
    detached: bool,
}

impl Attachment {
    fn open(registry: &Arc<SegmentRegistry>, cfg: &ChannelConfig) -> Result<Self> {
        cfg.validate()?;
        let segment = registry.acquire(cfg)?;
        let claimed = match cfg.role {
            Role::Producer => Ok(claim_producer(&segment, &cfg.identifier)),
            Role::Consumer => claim_consumer(&segment, &cfg.identifier),
        };
        match claimed {
            Ok(slot) => Ok(Self {
                registry: Arc::clone(registry),
                segment,
                slot,
                identifier: cfg.identifier.clone(),
                role: cfg.role,
                detached: false,
            }),
            Err(e) => {
                drop(segment);
                registry.release(&cfg.name);
                Err(e)
            }
        }
    }

    fn frame_capacity(&self) -> u64 {
        u64::from(self.segment.layout().frame_capacity())
    }

    fn stats(&self) -> ChannelStats {
        let t = self.segment.read();
        let p = t.slot(0);
        ChannelStats {
            produced: p.cursor,
            consumers: p.consumers,
            arena_wraps: p.arena_wraps,
            write_offset: p.write_offset,
        }
    }

    fn readers(&self) -> u32 {
        self.segment.read().slot(0).consumers
    }

    /// Release the slot (once its last handle goes) and the registry
    /// reference. Safe to call more than once.
    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        let released = {
            let mut t = self.segment.write();
            let s = t.slot_mut(self.slot);
            let released = if s.matches(&self.identifier) {
                s.handles = s.handles.saturating_sub(1);
                if s.handles == 0 {
                    s.clear_identifier();
                    true
                } else {
                    false
                }
            } else {
                // The slot was taken over (a second producer attached).
                false
            };
            if released && self.role == Role::Consumer {
                let p = t.slot_mut(0);
                p.consumers = p.consumers.saturating_sub(1);
            }
            released
        };
        if released {
            if self.role == Role::Consumer {
                self.segment.clear_callback(self.slot);
            }
            info!(
                channel = %self.segment.name(),
                slot = self.slot,
                identifier = %self.identifier,
                "slot released"
            );
        }
        self.registry.release(self.segment.name());
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Free the slots of processes that exited without detaching. Otherwise a
/// killed producer would keep slot 0 and a killed consumer would count as a
/// reader for the life of the segment.
fn reclaim_dead_slots(seg: &Segment, t: &mut TablesMut<'_>) {
    let limit = seg.layout().consumer_limit() as usize;
    for i in 0..=limit {
        let s = t.slot_mut(i);
        if !s.is_occupied() || platform::process_alive(s.owner_pid) {
            continue;
        }
        warn!(
            channel = %seg.name(),
            slot = i,
            identifier = %s.identifier(),
            pid = s.owner_pid,
            "reclaiming slot of a dead process"
        );
        s.clear_identifier();
        if i != 0 {
            let p = t.slot_mut(0);
            p.consumers = p.consumers.saturating_sub(1);
        }
    }
}

/// Claim slot 0. A producer that was not already attached under
/// `identifier` re-bases every attached consumer onto the current producer
/// cursor, so a restarted producer never replays old frames.
fn claim_producer(seg: &Segment, identifier: &str) -> usize {
    let limit = seg.layout().consumer_limit() as usize;
    let mut t = seg.write();
    reclaim_dead_slots(seg, &mut t);
    let produced = t.slot(0).cursor;
    let rebase = !t.slot(0).matches(identifier);
    let mut consumers = 0u32;
    for i in 1..=limit {
        let s = t.slot_mut(i);
        if s.is_occupied() {
            if rebase {
                s.cursor = produced;
            }
            consumers += 1;
        }
    }

    let p = t.slot_mut(0);
    if rebase {
        if p.is_occupied() {
            warn!(
                channel = %seg.name(),
                previous = %p.identifier(),
                identifier,
                "producer slot taken over"
            );
        }
        p.set_identifier(identifier);
        p.owner_pid = std::process::id();
        p.handles = 1;
    } else {
        p.handles += 1;
    }
    p.role = SLOT_PRODUCER;
    p.consumers = consumers;
    info!(
        channel = %seg.name(),
        identifier,
        produced,
        consumers,
        handles = p.handles,
        "producer attached"
    );
    0
}

/// Re-use the slot already held under `identifier`, or claim the first free
/// one with its cursor at the current producer cursor.
fn claim_consumer(seg: &Segment, identifier: &str) -> Result<usize> {
    let limit = seg.layout().consumer_limit() as usize;
    let mut t = seg.write();
    reclaim_dead_slots(seg, &mut t);
    if let Some(i) = (1..=limit).find(|&i| t.slot(i).matches(identifier)) {
        let s = t.slot_mut(i);
        s.handles += 1;
        debug!(
            channel = %seg.name(),
            slot = i,
            identifier,
            handles = s.handles,
            "consumer re-attached"
        );
        return Ok(i);
    }

    let Some(i) = (1..=limit).find(|&i| !t.slot(i).is_occupied()) else {
        warn!(channel = %seg.name(), identifier, limit, "no free consumer slot");
        return Err(StreamError::AttachFull {
            name: seg.name().to_string(),
            limit: limit as u32,
        });
    };
    let produced = t.slot(0).cursor;
    let s = t.slot_mut(i);
    s.set_identifier(identifier);
    s.owner_pid = std::process::id();
    s.role = SLOT_CONSUMER;
    s.handles = 1;
    s.cursor = produced;
    s.overwrites = 0;
    s.has_callback = 0;
    let p = t.slot_mut(0);
    p.consumers += 1;
    info!(
        channel = %seg.name(),
        slot = i,
        identifier,
        consumers = p.consumers,
        "consumer attached"
    );
    Ok(i)
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// The writing end of a channel.
pub struct Producer {
    inner: Attachment,
}

impl Producer {
    /// Attach as the producer of `cfg.name`. `cfg.role` must be
    /// [`Role::Producer`].
    ///
    /// Only one producer per channel is supported; a second attach with a
    /// different identifier takes slot 0 over.
    pub fn attach(registry: &Arc<SegmentRegistry>, cfg: &ChannelConfig) -> Result<Self> {
        if cfg.role != Role::Producer {
            return Err(StreamError::WrongRole {
                expected: Role::Producer,
                actual: cfg.role,
            });
        }
        Ok(Self {
            inner: Attachment::open(registry, cfg)?,
        })
    }

    /// Append one frame.
    ///
    /// Returns `Ok(false)` without writing anything when no consumer is
    /// attached. Never blocks on readers: a consumer that has fallen
    /// `frame_capacity` frames behind loses its oldest frame.
    ///
    /// Callbacks registered by consumers of this process run before `put`
    /// returns, after the structural lock has been released.
    ///
    /// An `Err` means nothing was written. A failed wake-up of blocked
    /// consumers after the frame is published is only logged.
    pub fn put(&mut self, info: &FrameInfo, payload: &[u8]) -> Result<bool> {
        let seg = &self.inner.segment;
        let layout = seg.layout();
        let capacity = layout.payload_bytes();
        let len = payload.len();
        if len > capacity {
            return Err(StreamError::PayloadTooLarge { len, capacity });
        }
        let n = self.inner.frame_capacity();

        {
            let mut t = seg.write();
            if t.slot(0).consumers == 0 {
                trace!(channel = %seg.name(), seq = info.seq, "no readers, frame dropped");
                return Ok(false);
            }
            let produced = t.slot(0).cursor;
            let head = (produced % n) as usize;

            let peeked = t.desc(head).readers;
            let mut lapped = 0u32;
            for i in 1..=layout.consumer_limit() as usize {
                let s = t.slot_mut(i);
                if s.is_occupied() && produced.saturating_sub(s.cursor) >= n {
                    s.overwrites += 1;
                    lapped += 1;
                }
            }
            if peeked > 0 {
                warn!(
                    channel = %seg.name(),
                    head,
                    readers = peeked,
                    "overwriting a frame a consumer is still reading"
                );
            } else if lapped > 0 {
                debug!(
                    channel = %seg.name(),
                    head,
                    consumers = lapped,
                    "overwriting unread frame"
                );
            }

            let mut offset = t.slot(0).write_offset as usize;
            if offset + len > capacity {
                offset = 0;
                let p = t.slot_mut(0);
                p.arena_wraps += 1;
                if p.frames_since_wrap < n {
                    warn!(
                        channel = %seg.name(),
                        frames = p.frames_since_wrap,
                        frame_capacity = n,
                        "payload arena wrapped before a full ring rotation; payload_bytes is undersized"
                    );
                } else {
                    trace!(channel = %seg.name(), wraps = p.arena_wraps, "payload arena wrapped");
                }
                p.frames_since_wrap = 0;
            }
            t.write_payload(offset, payload);

            let epoch = t.slot(0).arena_wraps as u32;
            let d = t.desc_mut(head);
            d.offset = offset as u64;
            d.length = len as u64;
            d.stamp = produced + 1;
            d.arena_epoch = epoch;
            d.info = *info;

            let p = t.slot_mut(0);
            p.write_offset = (offset + len) as u64;
            p.frames_since_wrap += 1;
            p.cursor = produced + 1;
        }

        for cb in seg.callbacks() {
            cb(info, payload);
        }
        if let Err(e) = seg.broadcast() {
            warn!(
                channel = %seg.name(),
                seq = info.seq,
                error = %e,
                "frame published, wake-up failed"
            );
        }
        Ok(true)
    }

    /// Attached consumers.
    pub fn readers(&self) -> u32 {
        self.inner.readers()
    }

    pub fn stats(&self) -> ChannelStats {
        self.inner.stats()
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn name(&self) -> &str {
        self.inner.segment.name()
    }

    /// Give up slot 0. Dropping the producer does the same.
    pub fn detach(mut self) {
        self.inner.detach();
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("channel", &self.inner.segment.name())
            .field("identifier", &self.inner.identifier)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// A reading end of a channel.
pub struct Consumer {
    inner: Attachment,
}

impl Consumer {
    /// Attach as consumer `cfg.identifier` of `cfg.name`. `cfg.role` must be
    /// [`Role::Consumer`].
    ///
    /// Attaching again under an identifier that already holds a slot shares
    /// that slot (and its cursor); the slot is freed when the last such
    /// handle detaches. A new identifier starts at the current producer
    /// cursor and only sees frames put after the attach.
    pub fn attach(registry: &Arc<SegmentRegistry>, cfg: &ChannelConfig) -> Result<Self> {
        if cfg.role != Role::Consumer {
            return Err(StreamError::WrongRole {
                expected: Role::Consumer,
                actual: cfg.role,
            });
        }
        Ok(Self {
            inner: Attachment::open(registry, cfg)?,
        })
    }

    /// Cursor of the next frame to read, moved up to the oldest resident
    /// frame if the producer has lapped this consumer. `None` if there is
    /// nothing to read.
    fn next_cursor(&self, t: &mut TablesMut<'_>) -> Option<u64> {
        let n = self.inner.frame_capacity();
        let produced = t.slot(0).cursor;
        let s = t.slot_mut(self.inner.slot);
        if produced.saturating_sub(s.cursor) > n {
            trace!(from = s.cursor, to = produced - n, "consumer caught up");
            s.cursor = produced - n;
        }
        (s.cursor < produced).then_some(s.cursor)
    }

    /// Take the next frame and advance. `None` if nothing is ready.
    ///
    /// The slice borrows the arena directly; copy it out if it has to outlive
    /// the next `frame_capacity` puts.
    pub fn get(&self) -> Option<Frame<'_>> {
        let seg = &self.inner.segment;
        let mut t = seg.write();
        let cursor = self.next_cursor(&mut t)?;
        let d = t.desc((cursor % self.inner.frame_capacity()) as usize);
        let (info, offset, length) = (d.info, d.offset as usize, d.length as usize);
        let data = t.payload(offset, length);
        t.slot_mut(self.inner.slot).cursor = cursor + 1;
        Some(Frame {
            info,
            data,
            position: cursor,
        })
    }

    /// Peek at the next frame without advancing.
    ///
    /// The descriptor is marked as being accessed until the guard is posted
    /// or dropped. Dropping the guard without [`FrameGuard::post`] leaves the
    /// cursor where it was, so the next `front` returns the same frame.
    pub fn front(&mut self) -> Option<FrameGuard<'_>> {
        let inner = &self.inner;
        let seg = &inner.segment;
        let mut t = seg.write();
        let cursor = self.next_cursor(&mut t)?;
        let index = (cursor % inner.frame_capacity()) as usize;
        let d = t.desc_mut(index);
        d.readers += 1;
        let (info, offset, length, stamp, epoch) =
            (d.info, d.offset, d.length as usize, d.stamp, d.arena_epoch);
        let data = t.payload(offset as usize, length);
        Some(FrameGuard {
            owner: inner,
            index,
            cursor,
            stamp,
            epoch,
            offset,
            info,
            data,
            released: false,
        })
    }

    /// Drop the backlog: the next read returns the next frame put.
    pub fn sync(&self) {
        let mut t = self.inner.segment.write();
        let produced = t.slot(0).cursor;
        let s = t.slot_mut(self.inner.slot);
        let skipped = produced.saturating_sub(s.cursor);
        s.cursor = produced;
        if skipped > 0 {
            debug!(
                channel = %self.inner.segment.name(),
                identifier = %self.inner.identifier,
                skipped,
                "consumer synced"
            );
        }
    }

    /// Unread frames, at most `frame_capacity`.
    pub fn remaining(&self) -> usize {
        let t = self.inner.segment.read();
        let behind = t.slot(0).cursor.saturating_sub(t.slot(self.inner.slot).cursor);
        behind.min(self.inner.frame_capacity()) as usize
    }

    /// Attached consumers, this one included.
    pub fn readers(&self) -> u32 {
        self.inner.readers()
    }

    /// Unread frames of this slot the producer has overwritten so far.
    pub fn overwritten(&self) -> u64 {
        self.inner.segment.read().slot(self.inner.slot).overwrites
    }

    pub fn stats(&self) -> ChannelStats {
        self.inner.stats()
    }

    /// Run `cb` for every frame the producer puts, while this consumer is
    /// attached. Replaces an earlier callback of this slot.
    ///
    /// Only a producer in this process can run it. It runs on the producer's
    /// thread and delays the producer, so it must not block.
    pub fn register_callback<F>(&self, cb: F)
    where
        F: Fn(&FrameInfo, &[u8]) + Send + Sync + 'static,
    {
        let cb: Callback = Arc::new(cb);
        self.inner.segment.set_callback(self.inner.slot, cb);
        self.inner.segment.write().slot_mut(self.inner.slot).has_callback = 1;
        debug!(
            channel = %self.inner.segment.name(),
            slot = self.inner.slot,
            "callback registered"
        );
    }

    /// Remove this slot's callback; returns whether one was registered.
    pub fn unregister_callback(&self) -> bool {
        let removed = self.inner.segment.clear_callback(self.inner.slot);
        self.inner.segment.write().slot_mut(self.inner.slot).has_callback = 0;
        removed
    }

    /// Whether a callback is registered for this slot, by any process.
    pub fn has_callback(&self) -> bool {
        self.inner.segment.read().slot(self.inner.slot).has_callback != 0
    }

    fn pending(&self) -> bool {
        let t = self.inner.segment.read();
        t.slot(self.inner.slot).cursor < t.slot(0).cursor
    }

    /// Block until a frame is ready to read.
    ///
    /// Returns `Ok(false)` if `timeout_ms` elapsed first; `None` waits
    /// indefinitely.
    pub fn wait_frame(&self, timeout_ms: Option<u64>) -> Result<bool> {
        if self.pending() {
            return Ok(true);
        }
        self.inner
            .segment
            .wait_while(|| !self.pending(), timeout_ms)
    }

    /// [`wait_frame`](Self::wait_frame) followed by [`get`](Self::get).
    pub fn wait_get(&self, timeout_ms: Option<u64>) -> Result<Option<Frame<'_>>> {
        if !self.wait_frame(timeout_ms)? {
            return Ok(None);
        }
        Ok(self.get())
    }

    /// Slot index in the channel's slot table (1..=consumer_limit).
    pub fn slot(&self) -> usize {
        self.inner.slot
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn name(&self) -> &str {
        self.inner.segment.name()
    }

    /// Give up this handle's claim on the slot. Dropping the consumer does
    /// the same.
    pub fn detach(mut self) {
        self.inner.detach();
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("channel", &self.inner.segment.name())
            .field("identifier", &self.inner.identifier)
            .field("slot", &self.inner.slot)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FrameGuard
// ---------------------------------------------------------------------------

/// A frame peeked with [`Consumer::front`].
///
/// [`post`](Self::post) consumes the frame; dropping the guard only ends the
/// peek.
pub struct FrameGuard<'a> {
    owner: &'a Attachment,
    index: usize,
    cursor: u64,
    stamp: u64,
    epoch: u32,
    offset: u64,
    info: FrameInfo,
    data: &'a [u8],
    released: bool,
}

impl<'a> FrameGuard<'a> {
    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Position of this frame in the channel.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Whether the descriptor and payload bytes are still the ones `front`
    /// returned. `false` once the producer has lapped the frame or wrapped
    /// the arena over its bytes.
    pub fn is_intact(&self) -> bool {
        let t = self.owner.segment.read();
        let p = t.slot(0);
        t.desc(self.index).stamp == self.stamp
            && payload_in_place(self.epoch, self.offset, p.arena_wraps, p.write_offset)
    }

    /// Consume the frame: end the peek and advance past it.
    pub fn post(mut self) {
        self.release(true);
    }

    fn release(&mut self, advance: bool) {
        if self.released {
            return;
        }
        self.released = true;
        let mut t = self.owner.segment.write();
        let d = t.desc_mut(self.index);
        d.readers = d.readers.saturating_sub(1);
        if advance {
            let s = t.slot_mut(self.owner.slot);
            // Another handle of the same identifier may have moved on.
            if s.cursor == self.cursor {
                s.cursor += 1;
            }
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.release(false);
    }
}

impl fmt::Debug for FrameGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGuard")
            .field("info", &self.info)
            .field("len", &self.data.len())
            .field("position", &self.cursor)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Either end of a channel, as chosen by [`ChannelConfig::role`].
#[derive(Debug)]
pub enum Endpoint {
    Producer(Producer),
    Consumer(Consumer),
}

impl Endpoint {
    pub fn role(&self) -> Role {
        match self {
            Endpoint::Producer(_) => Role::Producer,
            Endpoint::Consumer(_) => Role::Consumer,
        }
    }

    pub fn into_producer(self) -> Option<Producer> {
        match self {
            Endpoint::Producer(p) => Some(p),
            Endpoint::Consumer(_) => None,
        }
    }

    pub fn into_consumer(self) -> Option<Consumer> {
        match self {
            Endpoint::Consumer(c) => Some(c),
            Endpoint::Producer(_) => None,
        }
    }

    pub fn detach(self) {
        match self {
            Endpoint::Producer(p) => p.detach(),
            Endpoint::Consumer(c) => c.detach(),
        }
    }
}

/// Attach to the channel `cfg.name` in the role `cfg.role` asks for.
pub fn open(registry: &Arc<SegmentRegistry>, cfg: &ChannelConfig) -> Result<Endpoint> {
    match cfg.role {
        Role::Producer => Producer::attach(registry, cfg).map(Endpoint::Producer),
        Role::Consumer => Consumer::attach(registry, cfg).map(Endpoint::Consumer),
    }
}
