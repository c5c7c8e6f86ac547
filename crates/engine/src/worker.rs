//! Device I/O thread
//!
//! One thread per open handle. It is the only place that calls into the
//! kernel backend or touches the transfer registry and timeout scheduler.
//!
//! Each turn of the loop:
//! 1. Drains queued commands (non-blocking)
//! 2. Fires expired timeouts by discarding their requests
//! 3. Finishes shutdown once everything discarded has been reaped
//! 4. Reaps completions, blocking until the next timeout deadline
//!
//! Posting a command wakes the reap wait through the backend's waker.

use common::CommandReceiver;
use protocol::{Direction, IsoPacketResult, TransferStatus};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::callback::CallbackTarget;
use crate::handle::{HandleState, Shared};
use crate::kernel::{
    Completion, DeviceOperation, DiscardOutcome, KernelRequest, SubmitError, UsbKernel,
};
use crate::registry::TransferRegistry;
use crate::timeout::TimeoutScheduler;
use crate::transfer::{ResultCallback, Transfer};

/// Work posted from client threads to the I/O thread
pub(crate) enum Command {
    Device {
        operation: DeviceOperation,
        callback: ResultCallback,
        target: CallbackTarget,
    },
    Submit(Submission),
    /// Cancel everything and let go of the device; `reply` fires when done.
    /// With `release` the backend hands its descriptor back instead of
    /// closing it.
    Close {
        reply: Option<mpsc::Sender<()>>,
        release: bool,
    },
    /// External removal notice
    Removed,
}

/// A validated transfer ready for the kernel
pub(crate) struct Submission {
    pub transfer: Transfer,
    /// Kernel payload; control requests start with the setup packet
    pub buffer: Vec<u8>,
    pub iso_packet_lengths: Vec<u32>,
}

/// Winding down after close or device removal
struct Shutdown {
    /// Status reported for transfers that had no cancel reason yet
    reason: TransferStatus,
    /// Give up waiting for discarded requests after this
    deadline: Instant,
    waiters: Vec<mpsc::Sender<()>>,
    /// Hand the descriptor back rather than closing it
    release: bool,
}

pub(crate) struct IoWorker<K: UsbKernel> {
    kernel: K,
    commands: CommandReceiver<Command>,
    shared: Arc<Shared>,
    registry: TransferRegistry,
    timeouts: TimeoutScheduler,
    drain_timeout: Duration,
    shutdown: Option<Shutdown>,
    /// Reap failed with NoDevice; nothing more will come back
    device_gone: bool,
}

impl<K: UsbKernel> IoWorker<K> {
    pub fn new(
        kernel: K,
        commands: CommandReceiver<Command>,
        shared: Arc<Shared>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            kernel,
            commands,
            shared,
            registry: TransferRegistry::new(),
            timeouts: TimeoutScheduler::new(),
            drain_timeout,
            shutdown: None,
            device_gone: false,
        }
    }

    /// Run until the handle is closed or the device goes away
    pub fn run(mut self) {
        info!("Device I/O thread started");

        loop {
            while let Some(cmd) = self.commands.try_recv() {
                self.handle_command(cmd);
            }

            self.fire_timeouts();

            if self.shutdown_complete() {
                break;
            }

            let wait = self.reap_wait();
            match self.kernel.reap(wait) {
                Ok(batch) => {
                    for completion in batch {
                        self.handle_completion(completion);
                    }
                }
                Err(e) if e.is_disconnect() => {
                    if !self.device_gone {
                        warn!("Device disconnected while reaping");
                    }
                    self.device_gone = true;
                    self.begin_shutdown(TransferStatus::Disconnected);
                }
                Err(e) => {
                    // Transient; back off briefly instead of spinning
                    warn!("Error reaping completions: {}", e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        self.finish();
        info!("Device I/O thread stopped");
    }

    /// How long the reap may block
    fn reap_wait(&self) -> Option<Duration> {
        let shutdown_deadline = self.shutdown.as_ref().map(|s| s.deadline);
        let deadline = match (self.timeouts.next_deadline(), shutdown_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Handle a command, containing panics so the device keeps being served
    fn handle_command(&mut self, cmd: Command) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in I/O command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: Command) {
        match cmd {
            Command::Device {
                operation,
                callback,
                target,
            } => {
                let success = self.device_operation(operation);
                target.deliver_result(callback, success);
            }

            Command::Submit(submission) => self.submit(submission),

            Command::Close { reply, release } => {
                debug!("{} requested", if release { "Release" } else { "Close" });
                self.begin_shutdown(TransferStatus::Cancelled);
                if let Some(shutdown) = self.shutdown.as_mut() {
                    shutdown.release |= release;
                    shutdown.waiters.extend(reply);
                }
            }

            Command::Removed => {
                info!("Device removal signalled");
                self.begin_shutdown(TransferStatus::Disconnected);
            }
        }
    }

    /// Run a device control operation and update the endpoint table
    fn device_operation(&mut self, operation: DeviceOperation) -> bool {
        if self.shutdown.is_some() {
            debug!("Rejecting {:?}: handle is closing", operation);
            return false;
        }

        let endpoints = &self.shared.endpoints;
        let allowed = match operation {
            DeviceOperation::ClaimInterface(number) => !endpoints.is_claimed(number),
            DeviceOperation::ReleaseInterface(number)
            | DeviceOperation::SetInterface {
                interface: number, ..
            } => endpoints.is_claimed(number),
            _ => true,
        };
        if !allowed {
            debug!("Rejecting {:?}: interface claim state", operation);
            return false;
        }

        debug!("Device operation {:?}", operation);
        match self.kernel.control(operation) {
            Ok(()) => {
                match operation {
                    DeviceOperation::SetConfiguration(value) => endpoints.set_configuration(value),
                    DeviceOperation::ClaimInterface(number) => endpoints.claim(number),
                    DeviceOperation::ReleaseInterface(number) => endpoints.release(number),
                    DeviceOperation::SetInterface {
                        interface,
                        alternate,
                    } => endpoints.set_alternate(interface, alternate),
                    DeviceOperation::Reset | DeviceOperation::ClearHalt(_) => {}
                }
                true
            }
            Err(e) => {
                warn!("Device operation {:?} failed: {}", operation, e);
                if e.is_disconnect() {
                    self.begin_shutdown(TransferStatus::Disconnected);
                }
                false
            }
        }
    }

    /// Register and submit one transfer
    fn submit(&mut self, submission: Submission) {
        let Submission {
            transfer,
            buffer,
            iso_packet_lengths,
        } = submission;

        if self.shutdown.is_some() {
            debug!("Rejecting transfer to {:#04x}: handle is closing", transfer.endpoint);
            transfer.fail(TransferStatus::Disconnected, buffer);
            return;
        }

        let transfer_type = transfer.transfer_type;
        let endpoint = transfer.endpoint;
        let timeout = transfer.timeout;
        let short_not_ok = !transfer.short_ok && Direction::from_address(endpoint) == Direction::In;

        let id = self.registry.insert(transfer);
        let request = KernelRequest {
            id,
            transfer_type,
            endpoint,
            buffer,
            iso_packet_lengths,
            short_not_ok,
        };

        match self.kernel.submit(request) {
            Ok(()) => {
                trace!("Submitted {} ({:?}) to {:#04x}", id, transfer_type, endpoint);
                self.timeouts.arm(id, timeout);
            }
            Err(SubmitError { error, request }) => {
                warn!("Kernel rejected {} to {:#04x}: {}", id, endpoint, error);
                let transfer = self.registry.complete_and_remove(id);
                transfer.fail(TransferStatus::Error, request.buffer);
                if error.is_disconnect() {
                    self.begin_shutdown(TransferStatus::Disconnected);
                }
            }
        }
    }

    /// Discard every transfer whose timeout passed
    ///
    /// The status is assigned when the discarded request is reaped.
    fn fire_timeouts(&mut self) {
        for id in self.timeouts.take_expired(Instant::now()) {
            let Some(transfer) = self.registry.get_mut(id) else {
                continue;
            };
            if transfer.cancel_reason.is_some() {
                continue;
            }
            match self.kernel.discard(id) {
                DiscardOutcome::Discarding => {
                    debug!("Transfer {} timed out", id);
                    transfer.mark_cancelled(TransferStatus::TimedOut);
                }
                DiscardOutcome::AlreadyCompleted => {
                    trace!("Transfer {} finished before its timeout fired", id);
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            request,
            code,
            actual_length,
            iso_packets,
        } = completion;
        let id = request.id;

        self.timeouts.disarm(id);
        let transfer = self.registry.complete_and_remove(id);
        let status = transfer.status_for(code, actual_length);
        let packets: Vec<IsoPacketResult> = iso_packets
            .iter()
            .map(|p| IsoPacketResult::new(transfer.packet_status(p.code), p.actual_length))
            .collect();

        trace!("Completed {}: {:?} -> {}, {} bytes", id, code, status, actual_length);
        transfer.complete(status, actual_length, request.buffer, packets);

        if status == TransferStatus::Disconnected && self.shutdown.is_none() {
            warn!("Transfer {} reported device gone", id);
            self.begin_shutdown(TransferStatus::Disconnected);
        }
    }

    /// Stop accepting work and discard everything in flight
    fn begin_shutdown(&mut self, reason: TransferStatus) {
        if self.shutdown.is_some() {
            return;
        }
        info!("Shutting down device handle ({})", reason);
        self.shared.set_state(HandleState::Closing);

        for id in self.registry.ids() {
            if let Some(transfer) = self.registry.get_mut(id) {
                transfer.mark_cancelled(reason);
            }
            if !self.device_gone {
                self.kernel.discard(id);
            }
        }
        self.timeouts.clear();

        self.shutdown = Some(Shutdown {
            reason,
            deadline: Instant::now() + self.drain_timeout,
            waiters: Vec::new(),
            release: false,
        });
    }

    fn shutdown_complete(&self) -> bool {
        match &self.shutdown {
            Some(shutdown) => {
                if self.registry.is_empty() || self.device_gone {
                    return true;
                }
                if Instant::now() >= shutdown.deadline {
                    warn!(
                        "{} transfers not reaped within the drain timeout",
                        self.registry.len()
                    );
                    return true;
                }
                false
            }
            None => false,
        }
    }

    /// Release the device and settle every remaining obligation
    fn finish(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };

        let abandoned = if shutdown.release && !self.device_gone {
            self.kernel.release()
        } else {
            self.kernel.close()
        };
        for request in abandoned {
            if let Some(transfer) = self.registry.take(request.id) {
                let status = transfer.cancel_reason.unwrap_or(shutdown.reason);
                transfer.fail(status, request.buffer);
            }
        }
        for transfer in self.registry.cancel_all() {
            error!("Transfer {:?} lost its buffer in the kernel", transfer);
            let status = transfer.cancel_reason.unwrap_or(shutdown.reason);
            transfer.fail(status, Vec::new());
        }
        self.timeouts.clear();
        self.shared.endpoints.clear();
        self.shared.set_state(HandleState::Closed);

        // Anything posted while we were winding down still gets its callback
        let mut waiters = shutdown.waiters;
        for cmd in self.commands.close_and_drain() {
            match cmd {
                Command::Device {
                    callback, target, ..
                } => target.deliver_result(callback, false),
                Command::Submit(Submission {
                    transfer, buffer, ..
                }) => transfer.fail(TransferStatus::Disconnected, buffer),
                Command::Close { reply, .. } => waiters.extend(reply),
                Command::Removed => {}
            }
        }

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}
