// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type for channel creation, attachment and production.
//
// Reading from an empty channel is not an error: `get`/`front` return
// `None`. Frames lost to a lapping producer are counted, not reported.

use std::io;

use thiserror::Error;

use crate::config::Role;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The configuration was rejected before any memory was touched.
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// The backing segment could not be allocated or mapped.
    #[error("failed to create segment `{name}`: {source}")]
    Creation {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Every consumer slot of the channel is occupied.
    #[error("channel `{name}` has no free consumer slot (limit {limit})")]
    AttachFull { name: String, limit: u32 },

    /// The segment already exists with a different geometry or backend.
    #[error("segment `{name}` does not match the requested layout: {detail}")]
    LayoutMismatch { name: String, detail: String },

    /// The registry already tracks its maximum number of segments.
    #[error("segment registry is full ({limit} segments)")]
    RegistryFull { limit: usize },

    /// A frame larger than the whole payload arena.
    #[error("frame of {len} bytes exceeds the {capacity}-byte payload arena")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// The configuration asked for a different role than the handle type.
    #[error("configuration role is {actual:?}, expected {expected:?}")]
    WrongRole { expected: Role, actual: Role },

    /// The requested backend is not available on this platform.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Failure of a blocking wait primitive.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StreamError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
