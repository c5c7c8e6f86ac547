//! In-flight transfer records
//!
//! A [`Transfer`] is what the I/O thread keeps for every request it handed to
//! the kernel: enough to classify the completion and the callback that gets
//! the buffer back. The buffer itself travels inside the kernel request.

use protocol::{IsoPacketResult, SETUP_PACKET_SIZE, TransferStatus, TransferType, uniform_results};
use std::time::Duration;

use crate::callback::CallbackTarget;
use crate::kernel::CompletionCode;

/// Completion callback of a device control operation
pub type ResultCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Completion callback of a control, bulk or interrupt transfer
pub type TransferCallback = Box<dyn FnOnce(TransferStatus, usize, Vec<u8>) + Send + 'static>;

/// Completion callback of an isochronous transfer
///
/// Receives the overall status, the buffer, and one result per packet.
pub type IsochronousTransferCallback =
    Box<dyn FnOnce(TransferStatus, Vec<u8>, Vec<IsoPacketResult>) + Send + 'static>;

pub enum CompletionCallback {
    Transfer(TransferCallback),
    Isochronous(IsochronousTransferCallback),
}

/// One request the kernel currently holds
pub struct Transfer {
    pub transfer_type: TransferType,
    pub endpoint: u8,
    /// Data stage length the caller asked for
    pub requested_length: usize,
    /// Isochronous packets, 0 for other types
    pub packet_count: usize,
    /// Whether ending short still counts as `Completed`
    pub short_ok: bool,
    pub timeout: Duration,
    /// Status to report if the kernel reaps this as unlinked
    pub cancel_reason: Option<TransferStatus>,
    callback: CompletionCallback,
    target: CallbackTarget,
}

impl Transfer {
    pub fn new(
        transfer_type: TransferType,
        endpoint: u8,
        callback: CompletionCallback,
        target: CallbackTarget,
    ) -> Self {
        Self {
            transfer_type,
            endpoint,
            requested_length: 0,
            packet_count: 0,
            short_ok: true,
            timeout: Duration::ZERO,
            cancel_reason: None,
            callback,
            target,
        }
    }

    pub fn with_requested_length(mut self, length: usize) -> Self {
        self.requested_length = length;
        self
    }

    pub fn with_packet_count(mut self, count: usize) -> Self {
        self.packet_count = count;
        self
    }

    pub fn with_short_ok(mut self, short_ok: bool) -> Self {
        self.short_ok = short_ok;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Record why the engine discarded this transfer
    ///
    /// The first reason sticks; a transfer that already timed out stays
    /// `TimedOut` even if the handle is closed before it is reaped.
    pub fn mark_cancelled(&mut self, reason: TransferStatus) -> bool {
        if self.cancel_reason.is_some() {
            return false;
        }
        self.cancel_reason = Some(reason);
        true
    }

    /// Classify the request-level completion
    pub fn status_for(&self, code: CompletionCode, actual_length: usize) -> TransferStatus {
        translate_completion(
            code,
            actual_length,
            self.requested_length,
            self.short_ok,
            self.cancel_reason,
        )
    }

    /// Classify one isochronous packet
    pub fn packet_status(&self, code: CompletionCode) -> TransferStatus {
        translate_completion(code, 0, 0, true, self.cancel_reason)
    }

    /// Hand the buffer and results to the callback's target
    pub fn complete(
        self,
        status: TransferStatus,
        actual_length: usize,
        buffer: Vec<u8>,
        packets: Vec<IsoPacketResult>,
    ) {
        let buffer = match self.transfer_type {
            TransferType::Control => strip_setup(buffer),
            _ => buffer,
        };

        match self.callback {
            CompletionCallback::Transfer(callback) => self
                .target
                .deliver(Box::new(move || callback(status, actual_length, buffer))),
            CompletionCallback::Isochronous(callback) => {
                let packets = if packets.len() == self.packet_count {
                    packets
                } else {
                    uniform_results(self.packet_count, status)
                };
                self.target
                    .deliver(Box::new(move || callback(status, buffer, packets)))
            }
        }
    }

    /// Complete without any data, every packet sharing `status`
    pub fn fail(self, status: TransferStatus, buffer: Vec<u8>) {
        let packets = uniform_results(self.packet_count, status);
        self.complete(status, 0, buffer, packets);
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("transfer_type", &self.transfer_type)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("requested_length", &self.requested_length)
            .field("packet_count", &self.packet_count)
            .field("cancel_reason", &self.cancel_reason)
            .finish()
    }
}

fn strip_setup(mut buffer: Vec<u8>) -> Vec<u8> {
    if buffer.len() >= SETUP_PACKET_SIZE {
        buffer.drain(..SETUP_PACKET_SIZE);
    }
    buffer
}

/// Map a kernel completion code to the status the caller sees
///
/// Unlinked requests report why the engine discarded them, or `Cancelled`
/// when the kernel unlinked them on its own.
pub fn translate_completion(
    code: CompletionCode,
    actual_length: usize,
    requested_length: usize,
    short_ok: bool,
    cancel_reason: Option<TransferStatus>,
) -> TransferStatus {
    match code {
        CompletionCode::Ok if actual_length < requested_length && !short_ok => {
            TransferStatus::ShortPacket
        }
        CompletionCode::Ok => TransferStatus::Completed,
        CompletionCode::ShortNotOk => TransferStatus::ShortPacket,
        CompletionCode::Stall => TransferStatus::Stalled,
        CompletionCode::NoDevice => TransferStatus::Disconnected,
        CompletionCode::Unlinked => cancel_reason.unwrap_or(TransferStatus::Cancelled),
        CompletionCode::TimedOut => TransferStatus::TimedOut,
        CompletionCode::Overflow | CompletionCode::Other(_) => TransferStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Option<(TransferStatus, usize, Vec<u8>)>>>;

    fn recording(transfer_type: TransferType) -> (Transfer, Seen) {
        let seen: Seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let transfer = Transfer::new(
            transfer_type,
            0x81,
            CompletionCallback::Transfer(Box::new(move |status, len, buffer| {
                *sink.lock().unwrap() = Some((status, len, buffer));
            })),
            CallbackTarget::Inline,
        );
        (transfer, seen)
    }

    #[test]
    fn test_translate_ok() {
        use TransferStatus::*;
        assert_eq!(translate_completion(CompletionCode::Ok, 64, 64, false, None), Completed);
        assert_eq!(translate_completion(CompletionCode::Ok, 10, 64, true, None), Completed);
        assert_eq!(translate_completion(CompletionCode::Ok, 10, 64, false, None), ShortPacket);
        assert_eq!(translate_completion(CompletionCode::Ok, 0, 0, false, None), Completed);
    }

    #[test]
    fn test_translate_errors() {
        use TransferStatus::*;
        assert_eq!(translate_completion(CompletionCode::Stall, 0, 8, true, None), Stalled);
        assert_eq!(translate_completion(CompletionCode::NoDevice, 0, 8, true, None), Disconnected);
        assert_eq!(translate_completion(CompletionCode::ShortNotOk, 4, 8, false, None), ShortPacket);
        assert_eq!(translate_completion(CompletionCode::TimedOut, 0, 8, true, None), TimedOut);
        assert_eq!(translate_completion(CompletionCode::Overflow, 8, 8, true, None), Error);
        assert_eq!(translate_completion(CompletionCode::Other(71), 0, 8, true, None), Error);
    }

    #[test]
    fn test_translate_unlinked_uses_reason() {
        use TransferStatus::*;
        assert_eq!(translate_completion(CompletionCode::Unlinked, 0, 8, true, None), Cancelled);
        assert_eq!(
            translate_completion(CompletionCode::Unlinked, 0, 8, true, Some(TimedOut)),
            TimedOut
        );
        // A request that beat its discard keeps its real outcome
        assert_eq!(
            translate_completion(CompletionCode::Ok, 8, 8, true, Some(TimedOut)),
            Completed
        );
    }

    #[test]
    fn test_first_cancel_reason_wins() {
        let (mut transfer, _) = recording(TransferType::Bulk);
        assert!(transfer.mark_cancelled(TransferStatus::TimedOut));
        assert!(!transfer.mark_cancelled(TransferStatus::Cancelled));
        assert_eq!(transfer.cancel_reason, Some(TransferStatus::TimedOut));
    }

    #[test]
    fn test_control_completion_strips_setup() {
        let (transfer, seen) = recording(TransferType::Control);
        let mut buffer = vec![0xAA; SETUP_PACKET_SIZE];
        buffer.extend_from_slice(&[1, 2, 3]);

        transfer.complete(TransferStatus::Completed, 3, buffer, Vec::new());

        let (status, len, data) = seen.lock().unwrap().take().unwrap();
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(len, 3);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn test_isochronous_fail_is_uniform() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let transfer = Transfer::new(
            TransferType::Isochronous,
            0x04,
            CompletionCallback::Isochronous(Box::new(move |status, buffer, packets| {
                assert_eq!(status, TransferStatus::Error);
                assert_eq!(buffer.len(), 564);
                *sink.lock().unwrap() = packets;
            })),
            CallbackTarget::Inline,
        )
        .with_packet_count(3);

        transfer.fail(TransferStatus::Error, vec![0; 564]);

        let packets = seen.lock().unwrap().clone();
        assert_eq!(packets, vec![IsoPacketResult::new(TransferStatus::Error, 0); 3]);
    }
}
