//! Kernel request/reap interface
//!
//! The engine talks to the kernel only through [`UsbKernel`]: submit a
//! request, discard it, reap completed ones in batches, and run blocking
//! device-control calls. The backend is picked once when a handle is opened
//! and lives on that handle's I/O thread for its whole life.
//!
//! A submitted [`KernelRequest`] (and its buffer) belongs to the backend until
//! it comes back inside a [`Completion`], a [`SubmitError`], or the list
//! returned by [`UsbKernel::close`].

pub mod mock;
#[cfg(target_os = "linux")]
pub mod usbfs;

use protocol::{Direction, SETUP_PACKET_SIZE, TransferType};
use std::time::Duration;

use crate::error::KernelError;

pub use common::WakeFn as KernelWaker;

/// Engine-assigned identifier of one in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One request as handed to the kernel
#[derive(Debug)]
pub struct KernelRequest {
    pub id: TransferId,
    pub transfer_type: TransferType,
    /// Endpoint address, direction bit included (0x00/0x80 for control)
    pub endpoint: u8,
    /// Payload; control requests carry the setup packet in the first 8 bytes
    pub buffer: Vec<u8>,
    /// Isochronous packet lengths, empty for other types
    pub iso_packet_lengths: Vec<u32>,
    /// Ask the kernel to fail IN transfers that end short
    pub short_not_ok: bool,
}

impl KernelRequest {
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.endpoint)
    }

    /// Bytes the data stage asked for, excluding any setup packet
    pub fn requested_length(&self) -> usize {
        match self.transfer_type {
            TransferType::Control => self.buffer.len().saturating_sub(SETUP_PACKET_SIZE),
            _ => self.buffer.len(),
        }
    }
}

/// Backend-neutral kernel completion code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Ok,
    /// Endpoint halted (EPIPE)
    Stall,
    /// Device gone (ENODEV, ESHUTDOWN)
    NoDevice,
    /// Discarded before completion (ENOENT, ECONNRESET)
    Unlinked,
    /// Kernel-side timeout (ETIMEDOUT)
    TimedOut,
    /// Short IN transfer with short_not_ok set (EREMOTEIO)
    ShortNotOk,
    /// Device sent more than asked (EOVERFLOW)
    Overflow,
    /// Anything else, as a positive errno
    Other(i32),
}

/// Per-packet completion of an isochronous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketCompletion {
    pub code: CompletionCode,
    pub actual_length: usize,
}

/// A reaped request
#[derive(Debug)]
pub struct Completion {
    pub request: KernelRequest,
    pub code: CompletionCode,
    /// Data stage bytes moved (setup packet excluded)
    pub actual_length: usize,
    /// One entry per packet for isochronous requests, empty otherwise
    pub iso_packets: Vec<IsoPacketCompletion>,
}

/// Kernel refused a request outright
#[derive(Debug)]
pub struct SubmitError {
    pub error: KernelError,
    pub request: KernelRequest,
}

/// Result of asking the kernel to cancel a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardOutcome {
    /// Cancellation is under way; the request will be reaped
    Discarding,
    /// Nothing to cancel; the request already finished
    AlreadyCompleted,
}

/// Blocking device-level operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOperation {
    SetConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SetInterface { interface: u8, alternate: u8 },
    Reset,
    ClearHalt(u8),
}

/// Asynchronous request/reap device interface
///
/// Every method is called from the owning I/O thread only, except that the
/// [`KernelWaker`] returned by `waker` may be invoked from any thread.
pub trait UsbKernel: Send + 'static {
    /// Queue a request with the kernel
    fn submit(&mut self, request: KernelRequest) -> Result<(), SubmitError>;

    /// Ask the kernel to cancel a submitted request
    fn discard(&mut self, id: TransferId) -> DiscardOutcome;

    /// Wait up to `timeout` (forever if `None`) and return completed requests
    ///
    /// Returns an empty batch when the wait timed out or was woken. An error
    /// means reaping itself failed; `KernelError::NoDevice` is fatal.
    fn reap(&mut self, timeout: Option<Duration>) -> Result<Vec<Completion>, KernelError>;

    /// Run a blocking device-level operation
    fn control(&mut self, operation: DeviceOperation) -> Result<(), KernelError>;

    /// Hook that makes a blocked `reap` return early
    fn waker(&self) -> KernelWaker;

    /// Release the device
    ///
    /// Requests the kernel still held are returned so their buffers can go
    /// back to the callers. Called once.
    fn close(&mut self) -> Vec<KernelRequest>;

    /// Stop using the device without closing the descriptor
    ///
    /// Same contract as `close`. Backends with nothing to hand back just
    /// close.
    fn release(&mut self) -> Vec<KernelRequest> {
        self.close()
    }
}
