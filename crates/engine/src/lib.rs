//! Asynchronous USB transfer engine over Linux usbfs
//!
//! A [`DeviceHandle`] owns one open device and one dedicated I/O thread. It
//! turns control, bulk, interrupt and isochronous requests into kernel
//! requests, tracks them while in flight, enforces per-transfer timeouts and
//! delivers exactly one completion callback per accepted request, on the
//! thread that issued it.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use common::test_utils::create_mock_configuration;
//! use engine::kernel::mock::{MockReply, mock_kernel};
//! use engine::{DeviceHandle, EngineConfig, StaticDescriptors};
//!
//! let (kernel, controller) = mock_kernel();
//! controller.set_responder(|_| MockReply::ok(0));
//!
//! let descriptors = Arc::new(StaticDescriptors::new(vec![create_mock_configuration()]));
//! let handle = DeviceHandle::open(kernel, descriptors, &EngineConfig::default()).unwrap();
//!
//! let (tx, rx) = std::sync::mpsc::channel();
//! handle
//!     .claim_interface(0, move |ok| tx.send(ok).unwrap())
//!     .unwrap();
//! assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
//! handle.close();
//! ```

pub mod callback;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod handle;
pub mod kernel;
pub mod registry;
pub mod timeout;
pub mod transfer;
mod worker;

pub use callback::CallbackTarget;
pub use config::{EngineConfig, ShortPacketPolicy};
pub use endpoints::{DescriptorProvider, Endpoint, EndpointTable, StaticDescriptors};
pub use error::{EngineError, KernelError, Result};
pub use handle::{
    DeviceHandle, HandleState, IsochronousOutput, RemovalNotice, RemovalNotifier, TransferOutput,
};
pub use kernel::{DeviceOperation, UsbKernel};
#[cfg(target_os = "linux")]
pub use kernel::usbfs::{ReleasedFd, UsbfsKernel};
pub use transfer::{IsochronousTransferCallback, ResultCallback, TransferCallback};
