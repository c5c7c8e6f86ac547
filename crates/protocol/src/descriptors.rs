//! Parsed USB descriptor structures
//!
//! The engine does not parse raw descriptor bytes. It consumes these already
//! decoded structs from whoever enumerated the device.

use serde::{Deserialize, Serialize};

use crate::types::{Direction, TransferType};

/// One endpoint of an interface alternate setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress (direction bit included)
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn new(address: u8, transfer_type: TransferType, max_packet_size: u16) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }
}

/// One alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(interface_number: u8, alternate_setting: u8) -> Self {
        Self {
            interface_number,
            alternate_setting,
            class: 0xff,
            subclass: 0,
            protocol: 0,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.push(endpoint);
        self
    }
}

/// A configuration: every alternate setting of every interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// bConfigurationValue
    pub value: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigurationDescriptor {
    pub fn new(value: u8) -> Self {
        Self {
            value,
            interfaces: Vec::new(),
        }
    }

    pub fn with_interface(mut self, interface: InterfaceDescriptor) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Find a specific interface alternate setting
    pub fn interface(&self, number: u8, alternate: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.interface_number == number && i.alternate_setting == alternate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_lookup() {
        let config = ConfigurationDescriptor::new(1)
            .with_interface(
                InterfaceDescriptor::new(0, 0)
                    .with_endpoint(EndpointDescriptor::new(0x81, TransferType::Bulk, 512)),
            )
            .with_interface(
                InterfaceDescriptor::new(0, 1)
                    .with_endpoint(EndpointDescriptor::new(0x82, TransferType::Isochronous, 188)),
            );

        let alt1 = config.interface(0, 1).unwrap();
        assert_eq!(alt1.endpoints[0].address, 0x82);
        assert_eq!(alt1.endpoints[0].direction(), Direction::In);
        assert!(config.interface(1, 0).is_none());
    }
}
