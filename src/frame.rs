// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Frame metadata and the borrowed views handed out to consumers.

use std::fmt;

/// Application metadata carried with every frame.
///
/// The layout is fixed (`repr(C)`) because it is stored verbatim in the
/// descriptor ring of a segment that other processes may map.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameInfo {
    /// Payload type, e.g. a codec id.
    pub kind: u32,
    /// Correlation key, e.g. the encoder instance that produced the frame.
    pub key: u32,
    /// Producer-assigned sequence number. Gaps reveal lost frames.
    pub seq: u64,
    /// Presentation timestamp.
    pub timestamp: u64,
    /// Frame rate for video, sample rate for audio.
    pub rate: u32,
    pub width: u32,
    pub height: u32,
    pub reserved: [u8; 12],
}

impl FrameInfo {
    pub fn new(kind: u32, seq: u64) -> Self {
        Self {
            kind,
            seq,
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: u32) -> Self {
        self.key = key;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// A frame returned by [`Consumer::get`](crate::Consumer::get).
///
/// `data` points straight into the payload arena. The producer does not wait
/// for readers: once it has written another `frame_capacity` frames (or
/// wrapped the arena over these bytes) the slice may hold newer data.
#[derive(Clone, Copy)]
pub struct Frame<'a> {
    pub info: FrameInfo,
    pub data: &'a [u8],
    /// Position of this frame in the channel (frames produced before it).
    pub position: u64,
}

impl Frame<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy the payload out of the arena.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("info", &self.info)
            .field("len", &self.data.len())
            .field("position", &self.position)
            .finish()
    }
}
