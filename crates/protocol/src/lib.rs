//! USB protocol types for usbfs-engine
//!
//! This crate defines the USB-level vocabulary shared by the transfer engine
//! and its callers: transfer directions and types, control setup packets,
//! transfer outcomes, parsed descriptor structs and isochronous packet layout.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlType, Direction, Recipient, SetupPacket, request_type};
//!
//! // GET_DESCRIPTOR(DEVICE)
//! let setup = SetupPacket {
//!     request_type: request_type(Direction::In, ControlType::Standard, Recipient::Device),
//!     request: 0x06,
//!     value: 0x0100,
//!     index: 0,
//!     length: 18,
//! };
//! assert_eq!(setup.to_bytes()[0], 0x80);
//! ```

pub mod descriptors;
pub mod error;
pub mod iso;
pub mod types;

pub use descriptors::{ConfigurationDescriptor, EndpointDescriptor, InterfaceDescriptor};
pub use error::{ProtocolError, Result};
pub use iso::{
    IsoPacketResult, MAX_ISO_PACKETS, packet_ranges, total_length, uniform_results,
    validate_packets,
};
pub use types::{
    ControlType, DIRECTION_IN_MASK, Direction, ENDPOINT_NUMBER_MASK, MAX_CONTROL_LENGTH,
    MAX_TRANSFER_LENGTH, Recipient, SETUP_PACKET_SIZE, SetupPacket, TransferStatus, TransferType,
    endpoint_address, request_type,
};
