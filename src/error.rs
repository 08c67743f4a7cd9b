// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Error categories for the allocator, ring channel, and router layers.
// The shared-memory/platform layer keeps plain `std::io::Result` since those
// failures are OS I/O, not bus-domain errors.

use thiserror::Error;

/// A bus-domain error. No variant here ever unwinds across a component
/// boundary — every allocator/channel/router call returns one of these
/// instead of panicking.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Allocator exhausted, or a ring channel has no room for the record.
    #[error("out of memory")]
    OutOfMemory,

    /// Bad magic, bad hash, or a misaligned record.
    #[error("corrupted record or structure")]
    Corruption,

    /// An address's serial does not match the header stored at its offset.
    #[error("stale handle")]
    StaleHandle,

    /// Consumer-supplied buffer is smaller than the next record; the ring
    /// position was not advanced, so the caller can grow the buffer and
    /// retry.
    #[error("buffer too small, required {required} bytes")]
    BufferTooSmall { required: usize },

    /// Destination busid is not present in the directory.
    #[error("route unknown for destination")]
    RouteUnknown,

    /// A transient TCP/KV EAGAIN or timeout; caller should retry once.
    #[error("transient I/O: {0}")]
    TransientIo(String),

    /// Cannot mmap, cannot bind the listen port, or corrupt magic on resume.
    #[error("fatal init failure: {0}")]
    FatalInit(String),
}

pub type BusResult<T> = Result<T, BusError>;
