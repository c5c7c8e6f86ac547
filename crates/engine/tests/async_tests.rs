//! Async API Tests
//!
//! Exercises the `*_async` wrappers and callback delivery onto a tokio
//! runtime.
//!
//! # Test Scenarios
//! - Device operations and transfers awaited from async code
//! - Callbacks issued inside a runtime run as runtime tasks
//! - Futures resolve when the handle closes underneath them
//!
//! Run with: `cargo test -p engine --test async_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MOCK_BULK_IN, MOCK_BULK_OUT, MOCK_ISO_IN, create_mock_configuration,
    create_mock_device_descriptor, with_timeout,
};
use engine::kernel::mock::{MockController, MockReply, mock_kernel};
use engine::{DeviceHandle, EngineConfig, EngineError, StaticDescriptors};
use protocol::{ControlType, Direction, IsoPacketResult, Recipient, TransferStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn open_handle() -> (DeviceHandle, MockController) {
    let (kernel, controller) = mock_kernel();
    let descriptors = Arc::new(StaticDescriptors::new(vec![create_mock_configuration()]));
    let handle = DeviceHandle::open(kernel, descriptors, &EngineConfig::default())
        .expect("handle should open");
    (handle, controller)
}

#[tokio::test]
async fn test_async_device_operations() {
    let (handle, controller) = open_handle();

    assert!(handle.claim_interface_async(0).await.unwrap());
    assert!(!handle.claim_interface_async(0).await.unwrap());
    assert!(handle.clear_halt_async(MOCK_BULK_IN).await.unwrap());
    assert!(handle.reset_device_async().await.unwrap());
    assert!(handle.release_interface_async(0).await.unwrap());

    assert_eq!(controller.operations().len(), 4);
}

#[tokio::test]
async fn test_async_control_transfer() {
    let (handle, controller) = open_handle();
    let descriptor = create_mock_device_descriptor();
    let reply = descriptor.clone();
    controller.set_responder(move |_| MockReply::data(reply.clone()));

    let output = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        handle.control_transfer_async(
            Direction::In,
            ControlType::Standard,
            Recipient::Device,
            0x06,
            0x0100,
            0,
            vec![0; 18],
            18,
            Duration::from_secs(1),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(output.status, TransferStatus::Completed);
    assert_eq!(output.actual_length, 18);
    assert_eq!(output.buffer, descriptor);
}

#[tokio::test]
async fn test_async_bulk_round_trip() {
    let (handle, controller) = open_handle();
    assert!(handle.claim_interface_async(0).await.unwrap());
    controller.set_responder(|req| MockReply::ok(req.requested_length()));

    let output = handle
        .generic_transfer_async(
            Direction::Out,
            MOCK_BULK_OUT,
            vec![0x55; 256],
            256,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(output.status, TransferStatus::Completed);
    assert_eq!(output.actual_length, 256);

    let err = handle
        .generic_transfer_async(Direction::Out, 9, vec![0; 4], 4, Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::UnknownEndpoint { address: 0x09 });
}

#[tokio::test]
async fn test_async_isochronous_in() {
    let (handle, controller) = open_handle();
    assert!(handle.claim_interface_async(1).await.unwrap());
    assert!(handle.set_interface_alt_setting_async(1, 1).await.unwrap());
    controller.set_responder(|_| MockReply::ok(0));

    let output = handle
        .isochronous_transfer_in_async(MOCK_ISO_IN & 0x0f, vec![188, 188], Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(output.status, TransferStatus::Completed);
    assert_eq!(output.buffer.len(), 376);
    assert_eq!(
        output.packets,
        vec![IsoPacketResult::new(TransferStatus::Completed, 188); 2]
    );
}

#[tokio::test]
async fn test_async_timeout_status() {
    let (handle, _controller) = open_handle();
    assert!(handle.claim_interface_async(0).await.unwrap());

    let output = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        handle.generic_transfer_async(
            Direction::In,
            MOCK_BULK_IN & 0x0f,
            vec![0; 64],
            64,
            Duration::from_millis(30),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(output.status, TransferStatus::TimedOut);
    assert_eq!(output.actual_length, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_resolves_pending_futures() {
    let (handle, controller) = open_handle();
    let handle = Arc::new(handle);
    assert!(handle.claim_interface_async(0).await.unwrap());

    let pending = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .generic_transfer_async(Direction::In, 1, vec![0; 64], 64, Duration::ZERO)
                .await
        })
    };
    tokio::task::spawn_blocking({
        let controller = controller.clone();
        move || controller.wait_for_submissions(1, DEFAULT_TEST_TIMEOUT)
    })
    .await
    .unwrap();

    tokio::task::block_in_place(|| handle.close());

    let output = with_timeout(DEFAULT_TEST_TIMEOUT, pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(output.status, TransferStatus::Cancelled);

    let err = handle.claim_interface_async(0).await.unwrap_err();
    assert_eq!(err, EngineError::Disconnected);
}

#[tokio::test]
async fn test_callback_runs_as_runtime_task() {
    let (handle, controller) = open_handle();
    assert!(handle.claim_interface_async(0).await.unwrap());
    controller.set_responder(|_| MockReply::ok(8));

    let (tx, rx) = oneshot::channel();
    handle
        .generic_transfer(
            Direction::Out,
            MOCK_BULK_OUT,
            vec![0; 8],
            8,
            Duration::ZERO,
            move |status, len, _| {
                // Only possible from inside a runtime
                let in_runtime = tokio::runtime::Handle::try_current().is_ok();
                let _ = tx.send((status, len, in_runtime));
            },
        )
        .unwrap();

    let (status, len, in_runtime) = with_timeout(DEFAULT_TEST_TIMEOUT, rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, TransferStatus::Completed);
    assert_eq!(len, 8);
    assert!(in_runtime);
}
