//! Isochronous packet layout and results

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{ProtocolError, Result};
use crate::types::{MAX_TRANSFER_LENGTH, TransferStatus};

/// Most packets one isochronous request may carry (usbfs rejects more)
pub const MAX_ISO_PACKETS: usize = 128;

/// Outcome of a single isochronous packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoPacketResult {
    pub status: TransferStatus,
    pub actual_length: usize,
}

impl IsoPacketResult {
    pub fn new(status: TransferStatus, actual_length: usize) -> Self {
        Self {
            status,
            actual_length,
        }
    }
}

/// Total payload covered by a packet length list
///
/// Saturates instead of wrapping on targets where `usize` is 32 bits.
pub fn total_length(packet_lengths: &[u32]) -> usize {
    packet_lengths
        .iter()
        .fold(0usize, |sum, &len| sum.saturating_add(len as usize))
}

/// Check a packet list against the kernel's limits and a buffer length
pub fn validate_packets(packet_lengths: &[u32], buffer_len: usize) -> Result<()> {
    if packet_lengths.is_empty() || packet_lengths.len() > MAX_ISO_PACKETS {
        return Err(ProtocolError::InvalidPacketCount {
            count: packet_lengths.len(),
            max: MAX_ISO_PACKETS,
        });
    }

    let sum = total_length(packet_lengths);
    if sum > MAX_TRANSFER_LENGTH {
        return Err(ProtocolError::TransferTooLarge {
            length: sum,
            max: MAX_TRANSFER_LENGTH,
        });
    }
    if sum != buffer_len {
        return Err(ProtocolError::PacketLengthMismatch {
            sum,
            buffer: buffer_len,
        });
    }

    Ok(())
}

/// Contiguous buffer ranges of each packet, in order
///
/// Packets are laid out back to back starting at offset 0.
pub fn packet_ranges(packet_lengths: &[u32]) -> Vec<Range<usize>> {
    let mut offset = 0;
    packet_lengths
        .iter()
        .map(|&len| {
            let start = offset;
            offset += len as usize;
            start..offset
        })
        .collect()
}

/// Same status and zero length for every packet
///
/// Used when a request fails before per-packet status exists.
pub fn uniform_results(packet_count: usize, status: TransferStatus) -> Vec<IsoPacketResult> {
    vec![IsoPacketResult::new(status, 0); packet_count]
}
