//! usbfs-engine CLI
//!
//! Opens one usbfs device node and runs a single operation through the
//! transfer engine. Handy for checking permissions and that a device answers.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use engine::{DeviceHandle, EngineConfig};
use protocol::{ControlType, Direction, Recipient};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// bRequest of GET_DESCRIPTOR
const GET_DESCRIPTOR: u8 = 0x06;
/// Descriptor type DEVICE
const DESCRIPTOR_TYPE_DEVICE: u16 = 0x01;
const DEVICE_DESCRIPTOR_LENGTH: usize = 18;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "usbfs-engine")]
#[command(author, version, about = "Asynchronous USB transfers over Linux usbfs")]
#[command(long_about = "
Drives one USB device through the usbfs request/reap interface.

EXAMPLES:
    # Read the device descriptor
    usbfs-engine --device /dev/bus/usb/001/004 descriptor

    # Claim and release interface 0
    usbfs-engine --device /dev/bus/usb/001/004 claim 0

    # Port reset
    usbfs-engine --device /dev/bus/usb/001/004 reset

    # Write the default configuration file
    usbfs-engine save-config

CONFIGURATION:
    The engine looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbfs-engine/engine.toml
    3. /etc/usbfs-engine/engine.toml
    4. Built-in defaults
")]
struct Args {
    /// usbfs device node, e.g. /dev/bus/usb/001/004
    #[arg(short, long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Path to configuration file (~ is expanded)
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the device descriptor with a control transfer
    Descriptor,
    /// Reset the device
    Reset,
    /// Claim an interface, then release it
    Claim {
        /// bInterfaceNumber
        interface: u8,
    },
    /// Save the default configuration to the default location and exit
    SaveConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::SaveConfig = args.command {
        let config = EngineConfig::default();
        let path = EngineConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config.as_deref() {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).into_owned());
            EngineConfig::load(Some(path)).context("Failed to load configuration")?
        }
        None => EngineConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.engine.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbfs-engine v{}", env!("CARGO_PKG_VERSION"));

    let Some(device) = args.device.as_deref() else {
        bail!("--device is required for {:?}", args.command);
    };
    let handle = open_handle(device, &config)?;

    let result = run_command(&handle, &args.command).await;

    tokio::task::block_in_place(|| handle.close());
    result
}

async fn run_command(handle: &DeviceHandle, command: &Command) -> Result<()> {
    match command {
        Command::Descriptor => {
            let output = handle
                .control_transfer_async(
                    Direction::In,
                    ControlType::Standard,
                    Recipient::Device,
                    GET_DESCRIPTOR,
                    DESCRIPTOR_TYPE_DEVICE << 8,
                    0,
                    vec![0; DEVICE_DESCRIPTOR_LENGTH],
                    DEVICE_DESCRIPTOR_LENGTH,
                    CONTROL_TIMEOUT,
                )
                .await?;
            if !output.status.is_success() {
                bail!("GET_DESCRIPTOR failed: {}", output.status);
            }
            let length = output.actual_length.min(output.buffer.len());
            println!("{}", hex(&output.buffer[..length]));
        }

        Command::Reset => {
            if !handle.reset_device_async().await? {
                bail!("Device reset failed");
            }
            println!("Device reset");
        }

        Command::Claim { interface } => {
            if !handle.claim_interface_async(*interface).await? {
                bail!("Failed to claim interface {}", interface);
            }
            println!("Claimed interface {}", interface);
            if !handle.release_interface_async(*interface).await? {
                bail!("Failed to release interface {}", interface);
            }
            println!("Released interface {}", interface);
        }

        Command::SaveConfig => {}
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_handle(path: &Path, config: &EngineConfig) -> Result<DeviceHandle> {
    use engine::{StaticDescriptors, UsbfsKernel};
    use std::sync::Arc;

    let kernel = UsbfsKernel::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    // Descriptor parsing happens elsewhere; claims still work without it
    let descriptors = Arc::new(StaticDescriptors::new(Vec::new()));
    DeviceHandle::open(kernel, descriptors, config).context("Failed to open device handle")
}

#[cfg(not(target_os = "linux"))]
fn open_handle(path: &Path, _config: &EngineConfig) -> Result<DeviceHandle> {
    bail!("{}: usbfs is only available on Linux", path.display())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
