//! Error types for the NAT engine.
//!
//! Transient socket conditions (would-block, interrupted) are never surfaced
//! through these types; the data paths swallow them and retry on the next
//! readiness notification. Everything here is either a hard I/O failure or a
//! setup bug caught at a well-defined boundary.

use std::io;

use thiserror::Error;

/// Configuration problems detected when the engine is built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DNS rewrite names must encode to the same length ({old} vs {new} bytes)")]
    NameLengthMismatch { old: usize, new: usize },

    #[error("virtual network base must end in .0: {0}")]
    BadSpecialNet(std::net::Ipv4Addr),

    #[error("stream buffer capacity must be non-zero")]
    ZeroStreamCapacity,
}

/// Errors surfaced by engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The prepared buffer room is smaller than data that was already
    /// promised to fit.
    #[error("buffer has {room} bytes of prepared room, need {need}")]
    BufferTooSmall { need: usize, room: usize },

    /// The handle refers to a flow that has been torn down.
    #[error("stale flow handle")]
    StaleHandle,

    /// The flow has no live host descriptor.
    #[error("flow has no host descriptor")]
    NoDescriptor,

    #[error(transparent)]
    Io(#[from] io::Error),
}
