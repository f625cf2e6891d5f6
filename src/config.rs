// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channel configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::layout::{Layout, IDENT_LEN};

/// Which end of the channel an attachment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Producer,
    #[default]
    Consumer,
}

/// Where the channel memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Heap memory shared by threads of this process.
    #[default]
    ProcessLocalHeap,
    /// A named POSIX shared memory segment, shared across processes.
    OsSharedMemory,
}

fn default_consumer_limit() -> u32 {
    ChannelConfig::DEFAULT_CONSUMER_LIMIT
}

fn default_frame_capacity() -> u32 {
    ChannelConfig::DEFAULT_FRAME_CAPACITY
}

fn default_payload_bytes() -> usize {
    ChannelConfig::DEFAULT_PAYLOAD_BYTES
}

/// Everything needed to attach to a channel.
///
/// All attachments of one channel must agree on `consumer_limit`,
/// `frame_capacity`, `payload_bytes` and `backend`; a mismatch is reported
/// as [`StreamError::LayoutMismatch`]. `payload_bytes` must be large enough
/// for the largest frame the producer will ever put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name shared by every attachment.
    pub name: String,
    /// Identity of this attachment within the channel.
    pub identifier: String,
    #[serde(default = "default_consumer_limit")]
    pub consumer_limit: u32,
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: u32,
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub backend: Backend,
}

impl ChannelConfig {
    pub const DEFAULT_CONSUMER_LIMIT: u32 = 4;
    pub const DEFAULT_FRAME_CAPACITY: u32 = 30;
    pub const DEFAULT_PAYLOAD_BYTES: usize = 4 << 20;

    /// A consumer configuration with default geometry.
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
            consumer_limit: Self::DEFAULT_CONSUMER_LIMIT,
            frame_capacity: Self::DEFAULT_FRAME_CAPACITY,
            payload_bytes: Self::DEFAULT_PAYLOAD_BYTES,
            role: Role::Consumer,
            backend: Backend::ProcessLocalHeap,
        }
    }

    pub fn producer(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(name, identifier).with_role(Role::Producer)
    }

    pub fn consumer(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(name, identifier).with_role(Role::Consumer)
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn with_consumer_limit(mut self, consumer_limit: u32) -> Self {
        self.consumer_limit = consumer_limit;
        self
    }

    pub fn with_frame_capacity(mut self, frame_capacity: u32) -> Self {
        self.frame_capacity = frame_capacity;
        self
    }

    pub fn with_payload_bytes(mut self, payload_bytes: usize) -> Self {
        self.payload_bytes = payload_bytes;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Check the configuration without touching any memory.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StreamError::invalid("channel name is empty"));
        }
        if self.name.contains('\0') {
            return Err(StreamError::invalid("channel name contains NUL"));
        }
        if self.identifier.is_empty() {
            return Err(StreamError::invalid("identifier is empty"));
        }
        if self.identifier.len() >= IDENT_LEN || self.identifier.contains('\0') {
            return Err(StreamError::invalid(format!(
                "identifier `{}` must be 1..{} bytes without NUL",
                self.identifier,
                IDENT_LEN - 1
            )));
        }
        if self.consumer_limit < 1 {
            return Err(StreamError::invalid("consumer_limit must be at least 1"));
        }
        if self.frame_capacity < 2 {
            return Err(StreamError::invalid("frame_capacity must be at least 2"));
        }
        if self.payload_bytes == 0 {
            return Err(StreamError::invalid("payload_bytes must be at least 1"));
        }
        self.layout().map(|_| ())
    }

    /// Geometry of the segment this configuration describes.
    pub fn layout(&self) -> Result<Layout> {
        Layout::new(self.consumer_limit, self.frame_capacity, self.payload_bytes)
            .ok_or_else(|| StreamError::invalid("channel geometry overflows usize"))
    }

    /// Exact size in bytes of the segment.
    pub fn segment_size(&self) -> Result<usize> {
        self.layout().map(|l| l.total_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ChannelConfig::new("video", "rtsp");
        cfg.validate().expect("valid");
        assert_eq!(cfg.role, Role::Consumer);
        assert_eq!(cfg.backend, Backend::ProcessLocalHeap);
    }

    #[test]
    fn rejects_bad_geometry() {
        let base = ChannelConfig::producer("video", "venc");
        assert!(base.clone().with_consumer_limit(0).validate().is_err());
        assert!(base.clone().with_frame_capacity(1).validate().is_err());
        assert!(base.clone().with_payload_bytes(0).validate().is_err());
        assert!(base.with_frame_capacity(2).validate().is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        assert!(ChannelConfig::new("", "id").validate().is_err());
        assert!(ChannelConfig::new("video", "").validate().is_err());
        assert!(ChannelConfig::new("video", "x".repeat(IDENT_LEN)).validate().is_err());
        assert!(ChannelConfig::new("video", "x".repeat(IDENT_LEN - 1))
            .validate()
            .is_ok());
    }

    #[test]
    fn segment_size_covers_the_arena() {
        let cfg = ChannelConfig::new("video", "id")
            .with_frame_capacity(3)
            .with_payload_bytes(4096);
        let size = cfg.segment_size().expect("size");
        assert!(size > 4096);
        assert_eq!(size, cfg.layout().expect("layout").arena_offset() + 4096);
    }
}
