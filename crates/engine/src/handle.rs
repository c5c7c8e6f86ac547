//! Public device handle
//!
//! [`DeviceHandle`] validates each request against the current endpoint
//! snapshot on the calling thread, then posts it to the handle's I/O thread.
//! Nothing here blocks except [`DeviceHandle::close`], which waits until every
//! outstanding transfer has been handed back.
//!
//! Requests rejected here return an [`EngineError`] and never get a callback.
//! Accepted requests get exactly one callback, on the thread (or tokio
//! runtime) they were issued from.

use common::{CommandSender, command_channel};
use protocol::{
    ControlType, Direction, InterfaceDescriptor, IsoPacketResult, MAX_CONTROL_LENGTH,
    MAX_TRANSFER_LENGTH, Recipient, SETUP_PACKET_SIZE, SetupPacket, TransferStatus, TransferType,
    endpoint_address, request_type, total_length, validate_packets,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::callback::CallbackTarget;
use crate::config::{EngineConfig, ShortPacketPolicy};
use crate::endpoints::{DescriptorProvider, Endpoint, EndpointTable};
use crate::error::{EngineError, Result};
use crate::kernel::{DeviceOperation, UsbKernel};
use crate::transfer::{CompletionCallback, Transfer};
use crate::worker::{Command, IoWorker, Submission};

/// Lifecycle of a handle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandleState {
    Open = 0,
    /// Close or device removal under way; new requests are rejected
    Closing = 1,
    /// Descriptor released; terminal
    Closed = 2,
}

impl HandleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HandleState::Open,
            1 => HandleState::Closing,
            _ => HandleState::Closed,
        }
    }
}

/// State visible to both the caller side and the I/O thread
pub(crate) struct Shared {
    state: AtomicU8,
    pub endpoints: EndpointTable,
}

impl Shared {
    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle; never moves backwards
    pub fn set_state(&self, state: HandleState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// Result of a control, bulk or interrupt transfer (async API)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutput {
    pub status: TransferStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
}

/// Result of an isochronous transfer (async API)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsochronousOutput {
    pub status: TransferStatus,
    pub buffer: Vec<u8>,
    pub packets: Vec<IsoPacketResult>,
}

/// Capability to tell a handle its device was unplugged
///
/// Handed to whatever watches hot-plug events. Signalling a handle that is
/// already closed does nothing.
#[derive(Clone)]
pub struct RemovalNotice {
    commands: CommandSender<Command>,
}

impl RemovalNotice {
    pub fn notify_removed(&self) {
        if self.commands.post(Command::Removed).is_err() {
            debug!("Removal notice for a handle that is already closed");
        }
    }
}

impl std::fmt::Debug for RemovalNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalNotice")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

/// A source of device-removal events a handle can subscribe to
pub trait RemovalNotifier {
    fn subscribe(&self, notice: RemovalNotice);
}

/// One open USB device
pub struct DeviceHandle {
    shared: Arc<Shared>,
    commands: CommandSender<Command>,
    short_packet: ShortPacketPolicy,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    io_thread_id: ThreadId,
}

impl DeviceHandle {
    /// Take ownership of an opened kernel backend and start its I/O thread
    pub fn open<K: UsbKernel>(
        kernel: K,
        descriptors: Arc<dyn DescriptorProvider>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(HandleState::Open as u8),
            endpoints: EndpointTable::new(descriptors),
        });
        let (commands, receiver) = command_channel(kernel.waker());
        let worker = IoWorker::new(
            kernel,
            receiver,
            shared.clone(),
            config.engine.close_drain_timeout(),
        );

        let io_thread = thread::Builder::new()
            .name(config.engine.io_thread_name.clone())
            .spawn(move || worker.run())
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        let io_thread_id = io_thread.thread().id();

        info!(
            "Opened device handle (configuration {:?})",
            shared.endpoints.configuration()
        );

        Ok(Self {
            shared,
            commands,
            short_packet: config.short_packet,
            io_thread: Mutex::new(Some(io_thread)),
            io_thread_id,
        })
    }

    pub fn state(&self) -> HandleState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != HandleState::Open
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::Disconnected);
        }
        Ok(())
    }

    fn post(&self, cmd: Command) -> Result<()> {
        self.commands
            .post(cmd)
            .map_err(|_| EngineError::Disconnected)
    }

    fn device_operation<F>(&self, operation: DeviceOperation, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.ensure_open()?;
        debug!("Queueing {:?}", operation);
        self.post(Command::Device {
            operation,
            callback: Box::new(callback),
            target: CallbackTarget::capture(),
        })
    }

    pub fn set_configuration<F>(&self, value: u8, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.device_operation(DeviceOperation::SetConfiguration(value), callback)
    }

    /// Claim an interface; fails (callback `false`) if already claimed
    pub fn claim_interface<F>(&self, number: u8, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.device_operation(DeviceOperation::ClaimInterface(number), callback)
    }

    pub fn release_interface<F>(&self, number: u8, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.device_operation(DeviceOperation::ReleaseInterface(number), callback)
    }

    pub fn set_interface_alt_setting<F>(&self, number: u8, setting: u8, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.device_operation(
            DeviceOperation::SetInterface {
                interface: number,
                alternate: setting,
            },
            callback,
        )
    }

    pub fn reset_device<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.device_operation(DeviceOperation::Reset, callback)
    }

    /// Clear a halt condition; `endpoint` is a full address
    pub fn clear_halt<F>(&self, endpoint: u8, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.device_operation(DeviceOperation::ClearHalt(endpoint), callback)
    }

    /// Submit a control transfer on endpoint 0
    ///
    /// `buffer` carries the OUT data stage, or receives the IN data stage; the
    /// first `length` bytes are used. The callback gets those `length` bytes
    /// back (filled up to the reported length for IN).
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer<F>(
        &self,
        direction: Direction,
        control_type: ControlType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        mut buffer: Vec<u8>,
        length: usize,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(TransferStatus, usize, Vec<u8>) + Send + 'static,
    {
        self.ensure_open()?;
        if length > buffer.len() || length > MAX_CONTROL_LENGTH {
            return Err(EngineError::InvalidLength {
                length,
                buffer: buffer.len(),
                max: buffer.len().min(MAX_CONTROL_LENGTH),
            });
        }

        let setup = SetupPacket {
            request_type: request_type(direction, control_type, recipient),
            request,
            value,
            index,
            length: length as u16,
        };
        buffer.truncate(length);
        let mut payload = Vec::with_capacity(SETUP_PACKET_SIZE + length);
        payload.extend_from_slice(&setup.to_bytes());
        payload.append(&mut buffer);

        let transfer = Transfer::new(
            TransferType::Control,
            endpoint_address(0, direction),
            CompletionCallback::Transfer(Box::new(callback)),
            CallbackTarget::capture(),
        )
        .with_requested_length(length)
        .with_timeout(timeout);

        self.submit(transfer, payload, Vec::new())
    }

    /// Submit a bulk or interrupt transfer
    ///
    /// The endpoint's type only decides whether a short IN transfer counts as
    /// `Completed` or `ShortPacket` (see [`ShortPacketPolicy`]).
    pub fn generic_transfer<F>(
        &self,
        direction: Direction,
        endpoint_number: u8,
        mut buffer: Vec<u8>,
        length: usize,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(TransferStatus, usize, Vec<u8>) + Send + 'static,
    {
        self.ensure_open()?;
        let address = endpoint_address(endpoint_number, direction);
        let endpoint = self.resolve(address)?;

        let short_ok = match endpoint.transfer_type {
            TransferType::Bulk => self.short_packet.bulk,
            TransferType::Interrupt => self.short_packet.interrupt,
            _ => return Err(mismatch(&endpoint, "bulk or interrupt", direction)),
        };
        if endpoint.direction != direction {
            return Err(mismatch(&endpoint, "bulk or interrupt", direction));
        }
        if length > buffer.len() || length > MAX_TRANSFER_LENGTH {
            return Err(EngineError::InvalidLength {
                length,
                buffer: buffer.len(),
                max: buffer.len().min(MAX_TRANSFER_LENGTH),
            });
        }
        buffer.truncate(length);

        let transfer = Transfer::new(
            endpoint.transfer_type,
            address,
            CompletionCallback::Transfer(Box::new(callback)),
            CallbackTarget::capture(),
        )
        .with_requested_length(length)
        .with_short_ok(short_ok)
        .with_timeout(timeout);

        self.submit(transfer, buffer, Vec::new())
    }

    /// Receive one isochronous request of `packet_lengths.len()` packets
    ///
    /// The buffer is allocated here, sized to the sum of the packet lengths.
    pub fn isochronous_transfer_in<F>(
        &self,
        endpoint_number: u8,
        packet_lengths: Vec<u32>,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(TransferStatus, Vec<u8>, Vec<IsoPacketResult>) + Send + 'static,
    {
        self.ensure_open()?;
        let address = endpoint_address(endpoint_number, Direction::In);
        self.resolve_isochronous(address, Direction::In)?;

        // Validated before the buffer is allocated
        let length = total_length(&packet_lengths);
        validate_packets(&packet_lengths, length)?;

        self.submit_isochronous(address, vec![0; length], packet_lengths, timeout, callback)
    }

    /// Send one isochronous request; `packet_lengths` must sum to `buffer.len()`
    pub fn isochronous_transfer_out<F>(
        &self,
        endpoint_number: u8,
        buffer: Vec<u8>,
        packet_lengths: Vec<u32>,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(TransferStatus, Vec<u8>, Vec<IsoPacketResult>) + Send + 'static,
    {
        self.ensure_open()?;
        let address = endpoint_address(endpoint_number, Direction::Out);
        self.resolve_isochronous(address, Direction::Out)?;
        validate_packets(&packet_lengths, buffer.len())?;

        self.submit_isochronous(address, buffer, packet_lengths, timeout, callback)
    }

    fn submit_isochronous<F>(
        &self,
        address: u8,
        buffer: Vec<u8>,
        packet_lengths: Vec<u32>,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(TransferStatus, Vec<u8>, Vec<IsoPacketResult>) + Send + 'static,
    {
        let transfer = Transfer::new(
            TransferType::Isochronous,
            address,
            CompletionCallback::Isochronous(Box::new(callback)),
            CallbackTarget::capture(),
        )
        .with_requested_length(buffer.len())
        .with_packet_count(packet_lengths.len())
        .with_timeout(timeout);

        self.submit(transfer, buffer, packet_lengths)
    }

    fn submit(&self, transfer: Transfer, buffer: Vec<u8>, iso_packet_lengths: Vec<u32>) -> Result<()> {
        self.post(Command::Submit(Submission {
            transfer,
            buffer,
            iso_packet_lengths,
        }))
    }

    fn resolve(&self, address: u8) -> Result<Endpoint> {
        self.shared
            .endpoints
            .lookup(address)
            .ok_or(EngineError::UnknownEndpoint { address })
    }

    fn resolve_isochronous(&self, address: u8, direction: Direction) -> Result<Endpoint> {
        let endpoint = self.resolve(address)?;
        if endpoint.transfer_type != TransferType::Isochronous || endpoint.direction != direction {
            return Err(mismatch(&endpoint, "isochronous", direction));
        }
        Ok(endpoint)
    }

    /// Descriptor of the claimed interface that owns `address`, if any
    pub fn find_interface_by_endpoint(&self, address: u8) -> Option<InterfaceDescriptor> {
        self.shared.endpoints.find_interface(address)
    }

    /// Endpoint currently published for `address`
    pub fn endpoint(&self, address: u8) -> Option<Endpoint> {
        self.shared.endpoints.lookup(address)
    }

    pub fn removal_notice(&self) -> RemovalNotice {
        RemovalNotice {
            commands: self.commands.clone(),
        }
    }

    pub fn subscribe_removal(&self, notifier: &dyn RemovalNotifier) {
        notifier.subscribe(self.removal_notice());
    }

    /// Cancel every outstanding transfer and close the device
    ///
    /// Outstanding transfers complete with `Cancelled` before this returns
    /// (callbacks bound to a run loop are queued there by then). Later calls
    /// are no-ops; every other operation fails with `Disconnected` afterwards.
    pub fn close(&self) {
        self.shut_down(false);
    }

    /// Like [`close`](Self::close), but the backend keeps its descriptor open
    /// and hands it back (see `UsbfsKernel::released_fd`)
    ///
    /// Falls back to closing when the device is already gone or requests
    /// could not be drained.
    pub fn release(&self) {
        self.shut_down(true);
    }

    fn shut_down(&self, release: bool) {
        let on_io_thread = thread::current().id() == self.io_thread_id;
        self.shared.set_state(HandleState::Closing);

        if on_io_thread {
            // Called from an inline callback; the I/O thread can't wait on itself
            let _ = self.commands.post(Command::Close {
                reply: None,
                release,
            });
            return;
        }

        let (tx, rx) = mpsc::channel();
        let posted = self.commands.post(Command::Close {
            reply: Some(tx),
            release,
        });
        if posted.is_ok() {
            let _ = rx.recv();
        }

        let io_thread = self
            .io_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(io_thread) = io_thread {
            if io_thread.join().is_err() {
                error!("Device I/O thread panicked");
            }
            info!("Device handle {}", if release { "released" } else { "closed" });
        }
    }

    async fn device_operation_async(&self, operation: DeviceOperation) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.device_operation(operation, move |success| {
            let _ = tx.send(success);
        })?;
        rx.await.map_err(|_| EngineError::Disconnected)
    }

    pub async fn set_configuration_async(&self, value: u8) -> Result<bool> {
        self.device_operation_async(DeviceOperation::SetConfiguration(value))
            .await
    }

    pub async fn claim_interface_async(&self, number: u8) -> Result<bool> {
        self.device_operation_async(DeviceOperation::ClaimInterface(number))
            .await
    }

    pub async fn release_interface_async(&self, number: u8) -> Result<bool> {
        self.device_operation_async(DeviceOperation::ReleaseInterface(number))
            .await
    }

    pub async fn set_interface_alt_setting_async(&self, number: u8, setting: u8) -> Result<bool> {
        self.device_operation_async(DeviceOperation::SetInterface {
            interface: number,
            alternate: setting,
        })
        .await
    }

    pub async fn reset_device_async(&self) -> Result<bool> {
        self.device_operation_async(DeviceOperation::Reset).await
    }

    pub async fn clear_halt_async(&self, endpoint: u8) -> Result<bool> {
        self.device_operation_async(DeviceOperation::ClearHalt(endpoint))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn control_transfer_async(
        &self,
        direction: Direction,
        control_type: ControlType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        buffer: Vec<u8>,
        length: usize,
        timeout: Duration,
    ) -> Result<TransferOutput> {
        let (tx, rx) = oneshot::channel();
        self.control_transfer(
            direction,
            control_type,
            recipient,
            request,
            value,
            index,
            buffer,
            length,
            timeout,
            move |status, actual_length, buffer| {
                let _ = tx.send(TransferOutput {
                    status,
                    actual_length,
                    buffer,
                });
            },
        )?;
        rx.await.map_err(|_| EngineError::Disconnected)
    }

    pub async fn generic_transfer_async(
        &self,
        direction: Direction,
        endpoint_number: u8,
        buffer: Vec<u8>,
        length: usize,
        timeout: Duration,
    ) -> Result<TransferOutput> {
        let (tx, rx) = oneshot::channel();
        self.generic_transfer(
            direction,
            endpoint_number,
            buffer,
            length,
            timeout,
            move |status, actual_length, buffer| {
                let _ = tx.send(TransferOutput {
                    status,
                    actual_length,
                    buffer,
                });
            },
        )?;
        rx.await.map_err(|_| EngineError::Disconnected)
    }

    pub async fn isochronous_transfer_in_async(
        &self,
        endpoint_number: u8,
        packet_lengths: Vec<u32>,
        timeout: Duration,
    ) -> Result<IsochronousOutput> {
        let (tx, rx) = oneshot::channel();
        self.isochronous_transfer_in(
            endpoint_number,
            packet_lengths,
            timeout,
            move |status, buffer, packets| {
                let _ = tx.send(IsochronousOutput {
                    status,
                    buffer,
                    packets,
                });
            },
        )?;
        rx.await.map_err(|_| EngineError::Disconnected)
    }

    pub async fn isochronous_transfer_out_async(
        &self,
        endpoint_number: u8,
        buffer: Vec<u8>,
        packet_lengths: Vec<u32>,
        timeout: Duration,
    ) -> Result<IsochronousOutput> {
        let (tx, rx) = oneshot::channel();
        self.isochronous_transfer_out(
            endpoint_number,
            buffer,
            packet_lengths,
            timeout,
            move |status, buffer, packets| {
                let _ = tx.send(IsochronousOutput {
                    status,
                    buffer,
                    packets,
                });
            },
        )?;
        rx.await.map_err(|_| EngineError::Disconnected)
    }
}

fn mismatch(endpoint: &Endpoint, expected: &'static str, direction: Direction) -> EngineError {
    EngineError::EndpointMismatch {
        address: endpoint.address,
        expected,
        direction,
        actual_type: endpoint.transfer_type,
        actual_direction: endpoint.direction,
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("state", &self.state())
            .field("endpoints", &self.shared.endpoints)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::StaticDescriptors;
    use crate::kernel::mock::{MockController, mock_kernel};
    use common::test_utils::{MOCK_BULK_IN, create_mock_configuration};

    fn open() -> (DeviceHandle, MockController) {
        let (kernel, controller) = mock_kernel();
        let descriptors = Arc::new(StaticDescriptors::new(vec![create_mock_configuration()]));
        let handle = DeviceHandle::open(kernel, descriptors, &EngineConfig::default()).unwrap();
        (handle, controller)
    }

    #[test]
    fn test_state_never_moves_backwards() {
        let (handle, _controller) = open();
        assert_eq!(handle.state(), HandleState::Open);

        handle.shared.set_state(HandleState::Closed);
        handle.shared.set_state(HandleState::Closing);
        assert_eq!(handle.state(), HandleState::Closed);
    }

    #[test]
    fn test_io_thread_uses_configured_name() {
        let (kernel, _controller) = mock_kernel();
        let mut config = EngineConfig::default();
        config.engine.io_thread_name = "dev-7-io".to_string();
        let handle = DeviceHandle::open(
            kernel,
            Arc::new(StaticDescriptors::new(vec![create_mock_configuration()])),
            &config,
        )
        .unwrap();

        let name = handle
            .io_thread
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|t| t.thread().name().map(str::to_string));
        assert_eq!(name.as_deref(), Some("dev-7-io"));
    }

    #[test]
    fn test_control_length_validation() {
        let (handle, controller) = open();
        let err = handle
            .control_transfer(
                Direction::In,
                ControlType::Standard,
                Recipient::Device,
                0x06,
                0x0100,
                0,
                vec![0; 4],
                18,
                Duration::ZERO,
                |_, _, _| panic!("rejected requests get no callback"),
            )
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidLength {
                length: 18,
                buffer: 4,
                max: 4
            }
        );
        assert!(controller.submitted().is_empty());
    }

    #[test]
    fn test_unclaimed_endpoint_rejected() {
        let (handle, _controller) = open();
        let err = handle
            .generic_transfer(
                Direction::In,
                MOCK_BULK_IN & 0x0f,
                vec![0; 64],
                64,
                Duration::ZERO,
                |_, _, _| {},
            )
            .unwrap_err();
        assert_eq!(err, EngineError::UnknownEndpoint { address: MOCK_BULK_IN });
    }

    #[test]
    fn test_closed_handle_rejects_everything() {
        let (handle, controller) = open();
        handle.close();
        handle.close();

        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(controller.close_calls(), 1);
        assert_eq!(
            handle.claim_interface(0, |_| {}).unwrap_err(),
            EngineError::Disconnected
        );
        assert_eq!(
            handle
                .isochronous_transfer_in(4, vec![188], Duration::ZERO, |_, _, _| {})
                .unwrap_err(),
            EngineError::Disconnected
        );
    }
}
