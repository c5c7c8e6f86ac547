//! Scripted in-memory kernel backend
//!
//! [`MockKernel`] is moved onto a handle's I/O thread like any backend; the
//! paired [`MockController`] stays with the test (or simulation) and decides
//! when and how each submitted request completes, fails device operations on
//! demand, and can pull the device out from under the engine.

use protocol::{SETUP_PACKET_SIZE, SetupPacket, TransferType};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

use super::{
    Completion, CompletionCode, DeviceOperation, DiscardOutcome, IsoPacketCompletion,
    KernelRequest, KernelWaker, SubmitError, TransferId, UsbKernel,
};
use crate::error::KernelError;

/// Copy of a request as the kernel saw it at submission time
#[derive(Debug, Clone)]
pub struct SubmittedRequest {
    pub id: TransferId,
    pub transfer_type: TransferType,
    pub endpoint: u8,
    /// Buffer contents at submission (setup packet included for control)
    pub data: Vec<u8>,
    pub iso_packet_lengths: Vec<u32>,
    pub short_not_ok: bool,
}

impl SubmittedRequest {
    /// Setup packet of a control request
    pub fn setup(&self) -> Option<SetupPacket> {
        match self.transfer_type {
            TransferType::Control => SetupPacket::from_bytes(&self.data).ok(),
            _ => None,
        }
    }

    /// Data stage length, excluding the setup packet
    pub fn requested_length(&self) -> usize {
        match self.transfer_type {
            TransferType::Control => self.data.len().saturating_sub(SETUP_PACKET_SIZE),
            _ => self.data.len(),
        }
    }
}

/// What the scripted kernel does with a freshly submitted request
pub enum MockReply {
    /// Stay in flight until the controller completes or the engine discards it
    Pending,
    /// Complete right away
    Complete {
        code: CompletionCode,
        /// Bytes written into the data stage of an IN request
        data: Option<Vec<u8>>,
        actual_length: usize,
        iso_packets: Vec<IsoPacketCompletion>,
    },
    /// Refuse the submission
    Reject(KernelError),
}

impl MockReply {
    /// Successful completion moving `actual_length` bytes
    pub fn ok(actual_length: usize) -> Self {
        MockReply::Complete {
            code: CompletionCode::Ok,
            data: None,
            actual_length,
            iso_packets: Vec::new(),
        }
    }

    /// Successful IN completion delivering `data`
    pub fn data(data: Vec<u8>) -> Self {
        MockReply::Complete {
            code: CompletionCode::Ok,
            actual_length: data.len(),
            data: Some(data),
            iso_packets: Vec::new(),
        }
    }

    /// Completion with an error code and nothing transferred
    pub fn code(code: CompletionCode) -> Self {
        MockReply::Complete {
            code,
            data: None,
            actual_length: 0,
            iso_packets: Vec::new(),
        }
    }

    /// Isochronous completion with explicit per-packet results
    pub fn iso(iso_packets: Vec<IsoPacketCompletion>) -> Self {
        MockReply::Complete {
            code: CompletionCode::Ok,
            data: None,
            actual_length: iso_packets.iter().map(|p| p.actual_length).sum(),
            iso_packets,
        }
    }
}

type Responder = Box<dyn FnMut(&SubmittedRequest) -> MockReply + Send>;

#[derive(Default)]
struct MockState {
    pending: BTreeMap<TransferId, KernelRequest>,
    ready: VecDeque<Completion>,
    submitted: Vec<SubmittedRequest>,
    discarded: Vec<TransferId>,
    discard_attempts: Vec<TransferId>,
    operations: Vec<DeviceOperation>,
    operation_failures: VecDeque<KernelError>,
    responder: Option<Responder>,
    unplugged: bool,
    /// Finished requests stay invisible to reap
    held: bool,
    /// Accepted discards still finish with the full transfer
    late_discards: bool,
    woken: bool,
    close_calls: usize,
    release_calls: usize,
}

impl MockState {
    fn abandon_all(&mut self) -> Vec<KernelRequest> {
        let mut abandoned: Vec<KernelRequest> =
            std::mem::take(&mut self.pending).into_values().collect();
        abandoned.extend(self.ready.drain(..).map(|c| c.request));
        abandoned
    }

    fn finish(&mut self, id: TransferId, reply: MockReply) -> bool {
        let Some(request) = self.pending.remove(&id) else {
            return false;
        };
        match build_completion(request, reply) {
            Ok(completion) => self.ready.push_back(completion),
            Err(request) => {
                // Reject only makes sense at submission; treat as an I/O error
                self.ready.push_back(Completion {
                    iso_packets: uniform_iso(&request, CompletionCode::Other(5)),
                    request,
                    code: CompletionCode::Other(5),
                    actual_length: 0,
                });
            }
        }
        true
    }
}

struct Shared {
    state: Mutex<MockState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scripted kernel backend, owned by the I/O thread
pub struct MockKernel {
    shared: Arc<Shared>,
}

/// Test-side control of a [`MockKernel`]
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Shared>,
}

/// Create a backend and its controller
pub fn mock_kernel() -> (MockKernel, MockController) {
    let shared = Arc::new(Shared {
        state: Mutex::new(MockState::default()),
        cond: Condvar::new(),
    });
    (
        MockKernel {
            shared: shared.clone(),
        },
        MockController { shared },
    )
}

fn uniform_iso(request: &KernelRequest, code: CompletionCode) -> Vec<IsoPacketCompletion> {
    request
        .iso_packet_lengths
        .iter()
        .map(|_| IsoPacketCompletion {
            code,
            actual_length: 0,
        })
        .collect()
}

fn build_completion(
    mut request: KernelRequest,
    reply: MockReply,
) -> Result<Completion, KernelRequest> {
    match reply {
        MockReply::Pending | MockReply::Reject(_) => Err(request),
        MockReply::Complete {
            code,
            data,
            actual_length,
            mut iso_packets,
        } => {
            let offset = match request.transfer_type {
                TransferType::Control => SETUP_PACKET_SIZE,
                _ => 0,
            };
            if let Some(data) = data {
                let end = (offset + data.len()).min(request.buffer.len());
                let n = end.saturating_sub(offset);
                request.buffer[offset..end].copy_from_slice(&data[..n]);
            }
            let actual_length = actual_length.min(request.requested_length());

            if request.transfer_type == TransferType::Isochronous && iso_packets.is_empty() {
                iso_packets = request
                    .iso_packet_lengths
                    .iter()
                    .map(|&len| IsoPacketCompletion {
                        code,
                        actual_length: if code == CompletionCode::Ok {
                            len as usize
                        } else {
                            0
                        },
                    })
                    .collect();
            }

            Ok(Completion {
                request,
                code,
                actual_length,
                iso_packets,
            })
        }
    }
}

impl UsbKernel for MockKernel {
    fn submit(&mut self, request: KernelRequest) -> Result<(), SubmitError> {
        let mut state = self.shared.lock();

        if state.unplugged {
            return Err(SubmitError {
                error: KernelError::NoDevice,
                request,
            });
        }

        let submitted = SubmittedRequest {
            id: request.id,
            transfer_type: request.transfer_type,
            endpoint: request.endpoint,
            data: request.buffer.clone(),
            iso_packet_lengths: request.iso_packet_lengths.clone(),
            short_not_ok: request.short_not_ok,
        };
        let reply = match state.responder.as_mut() {
            Some(responder) => responder(&submitted),
            None => MockReply::Pending,
        };
        state.submitted.push(submitted);
        trace!("Mock kernel accepted request {}", request.id);

        match reply {
            MockReply::Reject(error) => {
                self.shared.cond.notify_all();
                return Err(SubmitError { error, request });
            }
            MockReply::Pending => {
                state.pending.insert(request.id, request);
            }
            reply => {
                let id = request.id;
                state.pending.insert(id, request);
                state.finish(id, reply);
            }
        }

        self.shared.cond.notify_all();
        Ok(())
    }

    fn discard(&mut self, id: TransferId) -> DiscardOutcome {
        let mut state = self.shared.lock();
        state.discard_attempts.push(id);
        self.shared.cond.notify_all();
        let Some(request) = state.pending.get(&id) else {
            return DiscardOutcome::AlreadyCompleted;
        };

        let reply = if state.late_discards {
            MockReply::ok(request.requested_length())
        } else {
            MockReply::code(CompletionCode::Unlinked)
        };
        state.discarded.push(id);
        state.finish(id, reply);
        self.shared.cond.notify_all();
        DiscardOutcome::Discarding
    }

    fn reap(&mut self, timeout: Option<Duration>) -> Result<Vec<Completion>, KernelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();

        loop {
            if !state.held && !state.ready.is_empty() {
                return Ok(state.ready.drain(..).collect());
            }
            if state.unplugged {
                return Err(KernelError::NoDevice);
            }
            if state.woken {
                state.woken = false;
                return Ok(Vec::new());
            }

            state = match deadline {
                None => self
                    .shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    self.shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    fn control(&mut self, operation: DeviceOperation) -> Result<(), KernelError> {
        let mut state = self.shared.lock();
        state.operations.push(operation);
        self.shared.cond.notify_all();

        if state.unplugged {
            return Err(KernelError::NoDevice);
        }
        match state.operation_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn waker(&self) -> KernelWaker {
        let shared = self.shared.clone();
        Arc::new(move || {
            shared.lock().woken = true;
            shared.cond.notify_all();
        })
    }

    fn close(&mut self) -> Vec<KernelRequest> {
        let mut state = self.shared.lock();
        state.close_calls += 1;
        let abandoned = state.abandon_all();
        self.shared.cond.notify_all();
        abandoned
    }

    fn release(&mut self) -> Vec<KernelRequest> {
        let mut state = self.shared.lock();
        state.release_calls += 1;
        let abandoned = state.abandon_all();
        self.shared.cond.notify_all();
        abandoned
    }
}

impl MockController {
    /// Decide the fate of every future submission
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&SubmittedRequest) -> MockReply + Send + 'static,
    {
        self.shared.lock().responder = Some(Box::new(responder));
    }

    /// Complete a pending request; false if it is not pending
    pub fn complete(&self, id: TransferId, reply: MockReply) -> bool {
        let mut state = self.shared.lock();
        let done = state.finish(id, reply);
        self.shared.cond.notify_all();
        done
    }

    /// Make the next device operation fail with `error`
    pub fn fail_next_operation(&self, error: KernelError) {
        self.shared.lock().operation_failures.push_back(error);
    }

    /// Simulate the device being unplugged
    ///
    /// Pending requests complete with `NoDevice`; once they are reaped, reap
    /// itself fails with `NoDevice`, as does any later submission.
    pub fn unplug(&self) {
        let mut state = self.shared.lock();
        state.unplugged = true;
        let ids: Vec<TransferId> = state.pending.keys().copied().collect();
        for id in ids {
            state.finish(id, MockReply::code(CompletionCode::NoDevice));
        }
        self.shared.cond.notify_all();
    }

    /// Keep finished requests from being reaped until released
    pub fn hold_completions(&self) {
        self.shared.lock().held = true;
    }

    pub fn release_completions(&self) {
        self.shared.lock().held = false;
        self.shared.cond.notify_all();
    }

    /// Accept discards but let the request finish as if the discard lost
    /// the race with the hardware
    pub fn set_late_discards(&self, late: bool) {
        self.shared.lock().late_discards = late;
    }

    /// Requests submitted so far, in submission order
    pub fn submitted(&self) -> Vec<SubmittedRequest> {
        self.shared.lock().submitted.clone()
    }

    /// Block until at least `count` requests were submitted
    pub fn wait_for_submissions(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.submitted.len() >= count)
    }

    /// Block until at least `count` device operations ran
    pub fn wait_for_operations(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.operations.len() >= count)
    }

    /// Ids of requests still held by the kernel
    pub fn pending(&self) -> Vec<TransferId> {
        self.shared.lock().pending.keys().copied().collect()
    }

    /// Ids the engine asked to discard, in order
    pub fn discarded(&self) -> Vec<TransferId> {
        self.shared.lock().discarded.clone()
    }

    /// Every id the engine tried to discard, accepted or not
    pub fn discard_attempts(&self) -> Vec<TransferId> {
        self.shared.lock().discard_attempts.clone()
    }

    /// Block until at least `count` discards were attempted
    pub fn wait_for_discard_attempts(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.discard_attempts.len() >= count)
    }

    /// Device operations issued so far, in order
    pub fn operations(&self) -> Vec<DeviceOperation> {
        self.shared.lock().operations.clone()
    }

    /// How many times the backend was closed
    pub fn close_calls(&self) -> usize {
        self.shared.lock().close_calls
    }

    /// How many times the backend was released instead of closed
    pub fn release_calls(&self) -> usize {
        self.shared.lock().release_calls
    }

    fn wait_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&MockState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if done(&state) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_in(id: u64, len: usize) -> KernelRequest {
        KernelRequest {
            id: TransferId(id),
            transfer_type: TransferType::Bulk,
            endpoint: 0x81,
            buffer: vec![0; len],
            iso_packet_lengths: Vec::new(),
            short_not_ok: false,
        }
    }

    #[test]
    fn test_pending_until_completed() {
        let (mut kernel, controller) = mock_kernel();
        kernel.submit(bulk_in(1, 8)).unwrap();

        assert!(kernel.reap(Some(Duration::from_millis(1))).unwrap().is_empty());
        assert_eq!(controller.pending(), vec![TransferId(1)]);

        assert!(controller.complete(TransferId(1), MockReply::data(vec![1, 2, 3])));
        let batch = kernel.reap(Some(Duration::ZERO)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].actual_length, 3);
        assert_eq!(&batch[0].request.buffer[..3], &[1, 2, 3]);
        assert!(!controller.complete(TransferId(1), MockReply::ok(0)));
    }

    #[test]
    fn test_discard_reaps_unlinked() {
        let (mut kernel, controller) = mock_kernel();
        kernel.submit(bulk_in(1, 8)).unwrap();

        assert_eq!(kernel.discard(TransferId(1)), DiscardOutcome::Discarding);
        assert_eq!(kernel.discard(TransferId(1)), DiscardOutcome::AlreadyCompleted);
        assert_eq!(controller.discarded(), vec![TransferId(1)]);

        let batch = kernel.reap(None).unwrap();
        assert_eq!(batch[0].code, CompletionCode::Unlinked);
    }

    #[test]
    fn test_responder_rejects() {
        let (mut kernel, controller) = mock_kernel();
        controller.set_responder(|_| MockReply::Reject(KernelError::InvalidParam));

        let err = kernel.submit(bulk_in(1, 8)).unwrap_err();
        assert_eq!(err.error, KernelError::InvalidParam);
        assert_eq!(err.request.buffer.len(), 8);
        assert!(controller.pending().is_empty());
    }

    #[test]
    fn test_waker_interrupts_reap() {
        let (mut kernel, _controller) = mock_kernel();
        let waker = kernel.waker();

        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            waker();
        });
        assert!(kernel.reap(None).unwrap().is_empty());
        t.join().unwrap();
    }

    #[test]
    fn test_unplug() {
        let (mut kernel, controller) = mock_kernel();
        kernel.submit(bulk_in(1, 8)).unwrap();
        controller.unplug();

        let batch = kernel.reap(None).unwrap();
        assert_eq!(batch[0].code, CompletionCode::NoDevice);
        assert_eq!(kernel.reap(None).unwrap_err(), KernelError::NoDevice);
        assert_eq!(
            kernel.control(DeviceOperation::Reset),
            Err(KernelError::NoDevice)
        );
    }

    #[test]
    fn test_close_returns_outstanding() {
        let (mut kernel, controller) = mock_kernel();
        kernel.submit(bulk_in(1, 8)).unwrap();
        kernel.submit(bulk_in(2, 8)).unwrap();
        controller.complete(TransferId(2), MockReply::ok(8));

        let abandoned = kernel.close();
        assert_eq!(abandoned.len(), 2);
        assert_eq!(controller.close_calls(), 1);
    }
}
