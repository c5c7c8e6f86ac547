//! Linux usbfs backend
//!
//! Talks to `/dev/bus/usb/BBB/DDD` through the usbdevfs ioctls. Requests are
//! submitted as URBs with `SUBMITURB`, cancelled with `DISCARDURB` and
//! collected with `REAPURBNDELAY` once `poll` reports the descriptor
//! writable. An eventfd is polled alongside so the I/O thread can be woken
//! when a command is queued.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use protocol::{Direction, MAX_ISO_PACKETS, TransferType};
use std::collections::HashMap;
use std::ffi::c_void;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{
    Completion, CompletionCode, DeviceOperation, DiscardOutcome, IsoPacketCompletion,
    KernelRequest, KernelWaker, SubmitError, TransferId, UsbKernel,
};
use crate::error::KernelError;

const URB_TYPE_ISO: u8 = 0;
const URB_TYPE_INTERRUPT: u8 = 1;
const URB_TYPE_CONTROL: u8 = 2;
const URB_TYPE_BULK: u8 = 3;

const URB_SHORT_NOT_OK: u32 = 0x01;
const URB_ISO_ASAP: u32 = 0x02;

/// `struct usbdevfs_urb`
#[repr(C)]
struct UsbfsUrb {
    urb_type: u8,
    endpoint: u8,
    status: i32,
    flags: u32,
    buffer: *mut c_void,
    buffer_length: i32,
    actual_length: i32,
    start_frame: i32,
    number_of_packets: i32,
    error_count: i32,
    signr: u32,
    usercontext: *mut c_void,
}

/// `struct usbdevfs_iso_packet_desc`
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct UsbfsIsoPacketDesc {
    length: u32,
    actual_length: u32,
    status: u32,
}

/// An URB followed by its isochronous frame descriptors
#[repr(C)]
struct UsbfsIsoUrb {
    urb: UsbfsUrb,
    iso_frame_desc: [UsbfsIsoPacketDesc; MAX_ISO_PACKETS],
}

/// `struct usbdevfs_setinterface`
#[repr(C)]
struct UsbfsSetInterface {
    interface: u32,
    altsetting: u32,
}

mod ioctl {
    use super::{UsbfsSetInterface, UsbfsUrb};

    nix::ioctl_read!(set_interface, b'U', 4, UsbfsSetInterface);
    nix::ioctl_read!(set_configuration, b'U', 5, u32);
    nix::ioctl_read!(submit_urb, b'U', 10, UsbfsUrb);
    nix::ioctl_write_ptr_bad!(discard_urb, nix::request_code_none!(b'U', 11), UsbfsUrb);
    nix::ioctl_write_ptr!(reap_urb_ndelay, b'U', 13, *mut UsbfsUrb);
    nix::ioctl_read!(claim_interface, b'U', 15, u32);
    nix::ioctl_read!(release_interface, b'U', 16, u32);
    nix::ioctl_none!(reset, b'U', 20);
    nix::ioctl_read!(clear_halt, b'U', 21, u32);
}

enum UrbStorage {
    Plain(Box<UsbfsUrb>),
    Iso(Box<UsbfsIsoUrb>),
}

impl UrbStorage {
    fn urb_ptr(&mut self) -> *mut UsbfsUrb {
        match self {
            UrbStorage::Plain(urb) => &mut **urb as *mut UsbfsUrb,
            UrbStorage::Iso(iso) => &mut iso.urb as *mut UsbfsUrb,
        }
    }
}

/// A submitted URB and the request whose buffer it points into
///
/// Both the URB and the buffer are heap allocations that stay put while the
/// record sits in the pending map, so the kernel's pointers stay valid.
struct PendingUrb {
    storage: UrbStorage,
    request: KernelRequest,
}

/// Where a released descriptor ends up
///
/// Cloned out of the backend before it moves into a [`DeviceHandle`]; holds
/// the descriptor once the handle was released instead of closed.
///
/// [`DeviceHandle`]: crate::DeviceHandle
#[derive(Debug, Clone, Default)]
pub struct ReleasedFd {
    slot: Arc<Mutex<Option<OwnedFd>>>,
}

impl ReleasedFd {
    pub fn take(&self) -> Option<OwnedFd> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn put(&self, fd: OwnedFd) {
        *self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(fd);
    }
}

/// usbfs device backend
pub struct UsbfsKernel {
    fd: Option<OwnedFd>,
    wake: Arc<EventFd>,
    pending: HashMap<TransferId, PendingUrb>,
    released: ReleasedFd,
}

// The raw pointers inside pending URBs only reference heap memory owned by
// this struct; nothing else aliases them.
unsafe impl Send for UsbfsKernel {}

impl UsbfsKernel {
    /// Open a usbfs device node, e.g. `/dev/bus/usb/001/004`
    pub fn open(path: &Path) -> Result<Self, KernelError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                warn!("Failed to open {}: {}", path.display(), e);
                map_io_error(&e)
            })?;
        debug!("Opened usbfs device {}", path.display());
        Self::from_fd(OwnedFd::from(file))
    }

    /// Wrap a descriptor opened elsewhere
    pub fn from_fd(fd: OwnedFd) -> Result<Self, KernelError> {
        let wake = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(map_errno)?;
        Ok(Self {
            fd: Some(fd),
            wake: Arc::new(wake),
            pending: HashMap::new(),
            released: ReleasedFd::default(),
        })
    }

    /// Slot that receives the descriptor when the owning handle is released
    pub fn released_fd(&self) -> ReleasedFd {
        self.released.clone()
    }

    fn raw_fd(&self) -> Result<i32, KernelError> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or(KernelError::NoDevice)
    }

    /// Block in poll until the device has completions, the waker fires, or
    /// the timeout passes
    fn wait(&self, timeout: Option<Duration>) -> Result<(), KernelError> {
        let Some(fd) = self.fd.as_ref() else {
            return Err(KernelError::NoDevice);
        };

        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(t) => {
                let mut ms = t.as_millis().min(u16::MAX as u128) as u16;
                if ms == 0 && !t.is_zero() {
                    ms = 1;
                }
                PollTimeout::from(ms)
            }
        };

        let mut fds = [
            PollFd::new(fd.as_fd(), PollFlags::POLLOUT),
            PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, timeout) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(map_errno(e)),
        }

        let woken = fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        if woken {
            // Counter reset; EAGAIN just means another reader got it first
            let _ = self.wake.read();
        }
        Ok(())
    }

    /// Pull every completed URB the kernel has ready
    fn reap_ready(&mut self) -> Result<Vec<Completion>, KernelError> {
        let fd = self.raw_fd()?;
        let mut batch = Vec::new();

        loop {
            let mut reaped: *mut UsbfsUrb = ptr::null_mut();
            let result = unsafe {
                ioctl::reap_urb_ndelay(fd, &mut reaped as *mut *mut UsbfsUrb as *const _)
            };
            match result {
                Ok(_) => {
                    if let Some(completion) = self.take_completed(reaped) {
                        batch.push(completion);
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    let error = map_errno(e);
                    if batch.is_empty() {
                        return Err(error);
                    }
                    // Report what we have; the error shows up on the next call
                    debug!("Reap stopped early: {}", error);
                    break;
                }
            }
        }

        Ok(batch)
    }

    fn take_completed(&mut self, reaped: *mut UsbfsUrb) -> Option<Completion> {
        if reaped.is_null() {
            return None;
        }
        // usercontext carries the transfer id we stored at submission
        let id = TransferId(unsafe { (*reaped).usercontext } as usize as u64);
        let Some(mut pending) = self.pending.remove(&id) else {
            warn!("Reaped URB for unknown transfer {}", id);
            return None;
        };
        debug_assert_eq!(pending.storage.urb_ptr(), reaped);

        let (code, actual_length, iso_packets) = match &pending.storage {
            UrbStorage::Plain(urb) => (
                completion_code(urb.status),
                urb.actual_length.max(0) as usize,
                Vec::new(),
            ),
            UrbStorage::Iso(iso) => {
                let count = pending.request.iso_packet_lengths.len();
                let packets = iso.iso_frame_desc[..count]
                    .iter()
                    .map(|desc| IsoPacketCompletion {
                        code: completion_code(desc.status as i32),
                        actual_length: desc.actual_length as usize,
                    })
                    .collect();
                (
                    completion_code(iso.urb.status),
                    iso.urb.actual_length.max(0) as usize,
                    packets,
                )
            }
        };

        trace!(
            "Reaped {} on endpoint {:#04x}: {:?}, {} bytes",
            id, pending.request.endpoint, code, actual_length
        );

        Some(Completion {
            request: pending.request,
            code,
            actual_length,
            iso_packets,
        })
    }
}

impl UsbKernel for UsbfsKernel {
    fn submit(&mut self, mut request: KernelRequest) -> Result<(), SubmitError> {
        let fd = match self.raw_fd() {
            Ok(fd) => fd,
            Err(error) => return Err(SubmitError { error, request }),
        };
        let Ok(buffer_length) = i32::try_from(request.buffer.len()) else {
            return Err(SubmitError {
                error: KernelError::InvalidParam,
                request,
            });
        };

        let (urb_type, mut flags) = match request.transfer_type {
            TransferType::Control => (URB_TYPE_CONTROL, 0),
            TransferType::Isochronous => (URB_TYPE_ISO, URB_ISO_ASAP),
            TransferType::Bulk => (URB_TYPE_BULK, 0),
            TransferType::Interrupt => (URB_TYPE_INTERRUPT, 0),
        };
        if request.short_not_ok && request.direction() == Direction::In {
            flags |= URB_SHORT_NOT_OK;
        }

        let urb = UsbfsUrb {
            urb_type,
            endpoint: request.endpoint,
            status: 0,
            flags,
            buffer: request.buffer.as_mut_ptr().cast(),
            buffer_length,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: request.iso_packet_lengths.len() as i32,
            error_count: 0,
            signr: 0,
            usercontext: request.id.0 as usize as *mut c_void,
        };

        let storage = if request.transfer_type == TransferType::Isochronous {
            let mut iso = Box::new(UsbfsIsoUrb {
                urb,
                iso_frame_desc: [UsbfsIsoPacketDesc::default(); MAX_ISO_PACKETS],
            });
            for (desc, &length) in iso
                .iso_frame_desc
                .iter_mut()
                .zip(&request.iso_packet_lengths)
            {
                desc.length = length;
            }
            UrbStorage::Iso(iso)
        } else {
            UrbStorage::Plain(Box::new(urb))
        };

        let id = request.id;
        let mut pending = PendingUrb { storage, request };
        let urb_ptr = pending.storage.urb_ptr();

        match unsafe { ioctl::submit_urb(fd, urb_ptr) } {
            Ok(_) => {
                trace!("Submitted {} to endpoint {:#04x}", id, pending.request.endpoint);
                self.pending.insert(id, pending);
                Ok(())
            }
            Err(e) => {
                warn!("SUBMITURB failed for {}: {}", id, e);
                Err(SubmitError {
                    error: map_errno(e),
                    request: pending.request,
                })
            }
        }
    }

    fn discard(&mut self, id: TransferId) -> DiscardOutcome {
        let Ok(fd) = self.raw_fd() else {
            return DiscardOutcome::AlreadyCompleted;
        };
        let Some(pending) = self.pending.get_mut(&id) else {
            return DiscardOutcome::AlreadyCompleted;
        };

        match unsafe { ioctl::discard_urb(fd, pending.storage.urb_ptr()) } {
            Ok(_) => DiscardOutcome::Discarding,
            // The URB finished and waits in the completed list
            Err(Errno::EINVAL) => DiscardOutcome::AlreadyCompleted,
            Err(e) => {
                // Device errors still complete the URB through reap
                debug!("DISCARDURB for {} returned {}", id, e);
                DiscardOutcome::Discarding
            }
        }
    }

    fn reap(&mut self, timeout: Option<Duration>) -> Result<Vec<Completion>, KernelError> {
        let batch = self.reap_ready()?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        self.wait(timeout)?;
        self.reap_ready()
    }

    fn control(&mut self, operation: DeviceOperation) -> Result<(), KernelError> {
        let fd = self.raw_fd()?;
        debug!("usbfs device operation {:?}", operation);

        let result = unsafe {
            match operation {
                DeviceOperation::SetConfiguration(value) => {
                    let mut value = value as u32;
                    ioctl::set_configuration(fd, &mut value)
                }
                DeviceOperation::ClaimInterface(number) => {
                    let mut number = number as u32;
                    ioctl::claim_interface(fd, &mut number)
                }
                DeviceOperation::ReleaseInterface(number) => {
                    let mut number = number as u32;
                    ioctl::release_interface(fd, &mut number)
                }
                DeviceOperation::SetInterface {
                    interface,
                    alternate,
                } => {
                    let mut setting = UsbfsSetInterface {
                        interface: interface as u32,
                        altsetting: alternate as u32,
                    };
                    ioctl::set_interface(fd, &mut setting)
                }
                DeviceOperation::Reset => ioctl::reset(fd),
                DeviceOperation::ClearHalt(endpoint) => {
                    let mut endpoint = endpoint as u32;
                    ioctl::clear_halt(fd, &mut endpoint)
                }
            }
        };

        result.map(|_| ()).map_err(|e| {
            warn!("usbfs {:?} failed: {}", operation, e);
            map_errno(e)
        })
    }

    fn waker(&self) -> KernelWaker {
        let wake = self.wake.clone();
        Arc::new(move || {
            if let Err(e) = wake.write(1) {
                warn!("Failed to wake usbfs I/O thread: {}", e);
            }
        })
    }

    fn close(&mut self) -> Vec<KernelRequest> {
        // Closing the descriptor makes the kernel kill and free every URB it
        // still holds, so the buffers are ours again afterwards.
        if let Some(fd) = self.fd.take() {
            drop(fd);
            debug!("Closed usbfs descriptor");
        }
        self.pending.drain().map(|(_, p)| p.request).collect()
    }

    fn release(&mut self) -> Vec<KernelRequest> {
        if !self.pending.is_empty() {
            // URBs still point into our buffers; only closing gets them back
            warn!(
                "{} URBs still in flight, closing instead of releasing",
                self.pending.len()
            );
            return self.close();
        }
        if let Some(fd) = self.fd.take() {
            self.released.put(fd);
            debug!("Released usbfs descriptor");
        }
        Vec::new()
    }
}

impl Drop for UsbfsKernel {
    fn drop(&mut self) {
        if self.fd.is_some() {
            let abandoned = self.close();
            if !abandoned.is_empty() {
                warn!("Dropped usbfs backend with {} requests in flight", abandoned.len());
            }
        }
    }
}

/// Map an errno from an ioctl to a KernelError
pub fn map_errno(errno: Errno) -> KernelError {
    match errno {
        Errno::ENODEV | Errno::ESHUTDOWN => KernelError::NoDevice,
        Errno::EBUSY => KernelError::Busy,
        Errno::EINVAL => KernelError::InvalidParam,
        Errno::ENOENT => KernelError::NotFound,
        Errno::EPIPE => KernelError::Stall,
        Errno::EACCES | Errno::EPERM => KernelError::Access,
        Errno::EINTR => KernelError::Interrupted,
        other => KernelError::Os(other as i32),
    }
}

fn map_io_error(err: &std::io::Error) -> KernelError {
    match err.raw_os_error() {
        Some(code) => map_errno(Errno::from_raw(code)),
        None => KernelError::Os(0),
    }
}

/// Map a URB (or iso packet) status to a completion code
pub fn completion_code(status: i32) -> CompletionCode {
    if status == 0 {
        return CompletionCode::Ok;
    }
    match Errno::from_raw(status.saturating_abs()) {
        Errno::EPIPE => CompletionCode::Stall,
        Errno::ENODEV | Errno::ESHUTDOWN => CompletionCode::NoDevice,
        Errno::ENOENT | Errno::ECONNRESET => CompletionCode::Unlinked,
        Errno::ETIMEDOUT => CompletionCode::TimedOut,
        Errno::EREMOTEIO => CompletionCode::ShortNotOk,
        Errno::EOVERFLOW => CompletionCode::Overflow,
        other => CompletionCode::Other(other as i32),
    }
}
