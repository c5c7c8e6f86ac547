//! Engine error types
//!
//! `EngineError` is what a caller sees synchronously when a request is
//! rejected at the call boundary. Anything that goes wrong after a request was
//! accepted is reported through its callback as a `TransferStatus` instead.
//! `KernelError` is the backend-neutral form of a failed kernel call.

use protocol::{Direction, ProtocolError, TransferType};
use thiserror::Error;

/// Synchronous rejection of a request
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The handle was closed or the device went away
    #[error("device handle is closed or the device was disconnected")]
    Disconnected,

    /// No claimed interface owns this endpoint in its current alternate setting
    #[error("endpoint {address:#04x} is not part of any claimed interface")]
    UnknownEndpoint { address: u8 },

    /// The endpoint exists but cannot carry this kind of transfer
    #[error(
        "endpoint {address:#04x} is {actual_type:?}/{actual_direction:?}, request needs {expected}/{direction:?}"
    )]
    EndpointMismatch {
        address: u8,
        expected: &'static str,
        direction: Direction,
        actual_type: TransferType,
        actual_direction: Direction,
    },

    /// Requested length does not fit the buffer or the transfer kind
    #[error("invalid length {length} (buffer {buffer}, max {max})")]
    InvalidLength {
        length: usize,
        buffer: usize,
        max: usize,
    },

    /// Isochronous packet list rejected
    #[error(transparent)]
    Packets(#[from] ProtocolError),

    /// The I/O thread could not be started
    #[error("failed to spawn I/O thread: {0}")]
    Spawn(String),
}

/// Failure of a kernel call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Device is gone
    #[error("no such device")]
    NoDevice,

    /// Interface or device busy (claimed elsewhere, configuration in use)
    #[error("resource busy")]
    Busy,

    /// Kernel rejected a parameter
    #[error("invalid parameter")]
    InvalidParam,

    /// Request, interface or endpoint unknown to the kernel
    #[error("not found")]
    NotFound,

    /// Endpoint halted
    #[error("endpoint stalled")]
    Stall,

    /// Permission denied
    #[error("access denied")]
    Access,

    /// Interrupted system call
    #[error("interrupted")]
    Interrupted,

    /// Any other OS error code
    #[error("os error {0}")]
    Os(i32),
}

impl KernelError {
    /// Whether this error means the device is no longer usable
    pub fn is_disconnect(&self) -> bool {
        matches!(self, KernelError::NoDevice)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
