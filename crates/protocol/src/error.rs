//! Protocol error types

use thiserror::Error;

/// Errors produced while encoding or decoding USB/IP frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer spoke a USB/IP version we do not implement
    #[error("unsupported USB/IP version {found:#06x} (expected {expected:#06x})")]
    UnsupportedVersion { found: u16, expected: u16 },

    /// Unknown operation code in the OP phase
    #[error("unknown operation code {code:#06x}")]
    UnknownOp { code: u16 },

    /// Unknown command code in the CMD phase
    #[error("unknown command {code:#010x}")]
    UnknownCommand { code: u32 },

    /// Frame violates the wire layout
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: &'static str },

    /// Declared payload exceeds the allocation ceiling
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Bus id is not ASCII or does not fit the 32-byte wire field
    #[error("invalid bus id {0:?}")]
    InvalidBusId(String),

    /// I/O error while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
