//! Protocol error types

use thiserror::Error;

/// Errors raised while building USB protocol values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Isochronous packet lengths do not cover the buffer exactly
    #[error("Packet lengths sum to {sum} bytes but the buffer holds {buffer} bytes")]
    PacketLengthMismatch { sum: usize, buffer: usize },

    /// Isochronous packet list is empty or longer than the kernel accepts
    #[error("Invalid packet count: {count} (must be 1..={max})")]
    InvalidPacketCount { count: usize, max: usize },

    /// Packets add up to more than one request can carry
    #[error("Packet lengths sum to {length} bytes, more than the {max} byte limit")]
    TransferTooLarge { length: usize, max: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
