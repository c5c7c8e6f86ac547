//! USB transfer value types
//!
//! This module defines the small USB vocabulary shared by the engine and its
//! callers: directions, transfer types, control request fields, the setup
//! packet and the fixed set of transfer outcomes.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Size of a control transfer setup packet in bytes
pub const SETUP_PACKET_SIZE: usize = 8;

/// Largest data stage a single control transfer can carry (wLength is a u16)
pub const MAX_CONTROL_LENGTH: usize = u16::MAX as usize;

/// Largest buffer one kernel request can describe (usbfs buffer_length is an i32)
pub const MAX_TRANSFER_LENGTH: usize = i32::MAX as usize;

/// Direction bit of an endpoint address / bmRequestType
pub const DIRECTION_IN_MASK: u8 = 0x80;

/// Endpoint number bits of an endpoint address
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

/// Transfer direction, relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_address(address: u8) -> Self {
        if address & DIRECTION_IN_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Direction bit to OR into an endpoint number or bmRequestType
    pub fn bit(self) -> u8 {
        match self {
            Direction::In => DIRECTION_IN_MASK,
            Direction::Out => 0,
        }
    }
}

/// Build an endpoint address from an endpoint number and a direction
pub fn endpoint_address(number: u8, direction: Direction) -> u8 {
    (number & ENDPOINT_NUMBER_MASK) | direction.bit()
}

/// USB endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Decode the transfer type from an endpoint descriptor's bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Control request type (bmRequestType bits 5..6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Control request recipient (bmRequestType bits 0..4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Compose a bmRequestType byte
pub fn request_type(direction: Direction, control_type: ControlType, recipient: Recipient) -> u8 {
    let type_bits = match control_type {
        ControlType::Standard => 0,
        ControlType::Class => 1,
        ControlType::Vendor => 2,
        ControlType::Reserved => 3,
    };
    let recipient_bits = match recipient {
        Recipient::Device => 0,
        Recipient::Interface => 1,
        Recipient::Endpoint => 2,
        Recipient::Other => 3,
    };
    direction.bit() | (type_bits << 5) | recipient_bits
}

/// Control transfer setup packet
///
/// Serialized little-endian in front of the data stage of every control
/// request submitted to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETUP_PACKET_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: SETUP_PACKET_SIZE,
                available: bytes.len(),
            });
        }

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    /// Direction of the data stage
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }
}

/// Outcome of a transfer, as delivered to the caller
///
/// Every failure that happens after a transfer was accepted is reported
/// through this set; nothing is thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer finished with all requested bytes (or short packets tolerated)
    Completed,
    /// Fewer bytes than requested and short packets not tolerated
    ShortPacket,
    /// Endpoint halted; clear_halt before retrying
    Stalled,
    /// Cancelled by its timeout
    TimedOut,
    /// Cancelled by close or by the kernel
    Cancelled,
    /// Device is gone
    Disconnected,
    /// Any other failure
    Error,
}

impl TransferStatus {
    /// Whether the data in the returned buffer is meaningful
    pub fn is_success(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::ShortPacket)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStatus::Completed => "completed",
            TransferStatus::ShortPacket => "short packet",
            TransferStatus::Stalled => "stalled",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Disconnected => "disconnected",
            TransferStatus::Error => "error",
        };
        f.write_str(name)
    }
}
