//! Test utilities for usbfs-engine
//!
//! Provides mock descriptors and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_configuration;
//!
//! # fn main() {
//! let config = create_mock_configuration();
//! assert_eq!(config.value, 1);
//! assert!(config.interface(0, 0).is_some());
//! # }
//! ```

use protocol::{ConfigurationDescriptor, EndpointDescriptor, InterfaceDescriptor, TransferType};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk IN endpoint of the mock vendor interface
pub const MOCK_BULK_IN: u8 = 0x81;
/// Bulk OUT endpoint of the mock vendor interface
pub const MOCK_BULK_OUT: u8 = 0x02;
/// Interrupt IN endpoint of the mock vendor interface
pub const MOCK_INTERRUPT_IN: u8 = 0x83;
/// Isochronous OUT endpoint, only present in interface 1 alternate 1
pub const MOCK_ISO_OUT: u8 = 0x04;
/// Isochronous IN endpoint, only present in interface 1 alternate 1
pub const MOCK_ISO_IN: u8 = 0x84;

/// Create a mock vendor interface with bulk and interrupt endpoints
///
/// # Arguments
/// * `number` - bInterfaceNumber
pub fn create_mock_vendor_interface(number: u8) -> InterfaceDescriptor {
    InterfaceDescriptor::new(number, 0)
        .with_endpoint(EndpointDescriptor::new(MOCK_BULK_IN, TransferType::Bulk, 512))
        .with_endpoint(EndpointDescriptor::new(MOCK_BULK_OUT, TransferType::Bulk, 512))
        .with_endpoint(EndpointDescriptor {
            address: MOCK_INTERRUPT_IN,
            transfer_type: TransferType::Interrupt,
            max_packet_size: 64,
            interval: 1,
        })
}

/// Create a mock streaming interface
///
/// Alternate 0 has no endpoints (zero bandwidth), alternate 1 carries a pair
/// of isochronous endpoints, like a typical audio/video streaming interface.
pub fn create_mock_streaming_interface(number: u8) -> [InterfaceDescriptor; 2] {
    let idle = InterfaceDescriptor::new(number, 0);
    let streaming = InterfaceDescriptor::new(number, 1)
        .with_endpoint(EndpointDescriptor {
            address: MOCK_ISO_OUT,
            transfer_type: TransferType::Isochronous,
            max_packet_size: 188,
            interval: 1,
        })
        .with_endpoint(EndpointDescriptor {
            address: MOCK_ISO_IN,
            transfer_type: TransferType::Isochronous,
            max_packet_size: 188,
            interval: 1,
        });
    [idle, streaming]
}

/// Create the mock configuration used by engine tests
///
/// Configuration 1: interface 0 is the vendor interface, interface 1 is the
/// streaming interface with two alternate settings.
pub fn create_mock_configuration() -> ConfigurationDescriptor {
    let [idle, streaming] = create_mock_streaming_interface(1);
    ConfigurationDescriptor::new(1)
        .with_interface(create_mock_vendor_interface(0))
        .with_interface(idle)
        .with_interface(streaming)
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Standard 18-byte device descriptor, as returned by GET_DESCRIPTOR(DEVICE)
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0xff, // bDeviceClass (vendor)
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}
