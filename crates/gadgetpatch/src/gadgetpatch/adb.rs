use crate::gadgetpatch::arch::Architecture;
use crate::gadgetpatch::utils::string_buf::StringBuf;
use adb_client::{ADBDeviceExt, ADBServer, DeviceState};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn format_device_state(state: &DeviceState) -> &'static str {
    match state {
        DeviceState::Offline => "Offline",
        DeviceState::Device => "Device",
        DeviceState::NoDevice => "No Device",
        DeviceState::Authorizing => "Authorizing",
        DeviceState::Unauthorized => "Unauthorized",
        DeviceState::Connecting => "Connecting",
        DeviceState::NoPerm => "No Permission",
        DeviceState::Detached => "Detached",
        DeviceState::Bootloader => "In Bootloader",
        DeviceState::Host => "Host",
        DeviceState::Recovery => "In Recovery Mode",
        DeviceState::Sideload => "In Sideloading Mode",
        DeviceState::Rescue => "In Rescue Mode",
    }
}

/// Something that can tell which CPU architecture the target device runs.
///
/// Implementations are blocking; callers go through [`query_architecture`]
/// which bounds them with a timeout.
pub trait DeviceBridge: Send + Sync {
    /// `Ok(None)` when no device is attached or the reported ABI is unknown.
    fn device_architecture(&self) -> Result<Option<Architecture>>;
}

/// Asks the local ADB server for the first connected device's primary ABI.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdbBridge;

impl DeviceBridge for AdbBridge {
    fn device_architecture(&self) -> Result<Option<Architecture>> {
        let mut server = ADBServer::default();
        let devices = server.devices().context("Failed to list ADB devices")?;

        if !devices.iter().any(|d| matches!(d.state, DeviceState::Device)) {
            debug!("No ADB device in 'device' state");
            return Ok(None);
        }

        let mut device = server
            .get_device()
            .context("Failed to connect to ADB device")?;
        let mut output = StringBuf::new();

        device
            .shell_command(&["getprop", "ro.product.cpu.abi"], &mut output)
            .context("Failed to read ro.product.cpu.abi")?;

        let Some(abi) = output.first_line() else {
            return Ok(None);
        };

        let architecture = Architecture::from_abi(abi);
        if architecture.is_none() {
            warn!("Device reports unsupported ABI '{abi}'");
        }

        Ok(architecture)
    }
}

/// A bridge that never finds a device. Used with `--no-device`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevice;

impl DeviceBridge for NoDevice {
    fn device_architecture(&self) -> Result<Option<Architecture>> {
        Ok(None)
    }
}

/// Queries `bridge` off the async runtime. Errors and timeouts are logged
/// and reported as "no device" so architecture detection can fall through
/// to the next source.
pub async fn query_architecture(
    bridge: Arc<dyn DeviceBridge>,
    timeout: Duration,
) -> Option<Architecture> {
    let task = tokio::task::spawn_blocking(move || bridge.device_architecture());

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(arch))) => {
            if let Some(arch) = arch {
                info!("Connected device reports {arch}");
            }
            arch
        }
        Ok(Ok(Err(e))) => {
            warn!("Device query failed: {e:#}");
            None
        }
        Ok(Err(join)) => {
            warn!("Device query panicked: {join}");
            None
        }
        Err(_) => {
            warn!("Device query timed out after {}s", timeout.as_secs());
            None
        }
    }
}

pub fn list_devices(server: &mut ADBServer) -> Result<()> {
    let devices = server.devices().context("Failed to list ADB devices")?;

    if devices.is_empty() {
        info!("No connected devices found.");
        return Ok(());
    }

    for device in devices {
        let identifier = device.identifier.split('.').next().unwrap_or_default();
        let arch = if matches!(device.state, DeviceState::Device) {
            let mut output = StringBuf::new();
            server
                .get_device_by_name(&device.identifier)
                .and_then(|mut d| d.shell_command(&["getprop", "ro.product.cpu.abi"], &mut output))
                .ok()
                .and_then(|_| output.first_line().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string())
        } else {
            "-".to_string()
        };

        info!(
            "Identifier => {}\nState      => {}\nABI        => {}\n",
            identifier,
            format_device_state(&device.state),
            arch
        );
    }

    Ok(())
}
