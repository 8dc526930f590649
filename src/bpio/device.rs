//! Bus Pirate discovery.
//!
//! Detects Bus Pirate 5/6 boards by USB VID/PID.

use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};

use super::config::is_bus_pirate;

/// Information about a detected Bus Pirate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusPirateDevice {
    /// Serial port path (e.g., "/dev/ttyACM1" or "COM7").
    pub port: String,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Device serial number (if available).
    pub serial_number: Option<String>,
    /// Product name (if available).
    pub product_name: Option<String>,
}

impl BusPirateDevice {
    /// Get a display label for this device.
    pub fn display_label(&self) -> String {
        match &self.product_name {
            Some(name) => format!("{} ({})", name, self.port),
            None => format!("Bus Pirate ({})", self.port),
        }
    }
}

/// Find all connected Bus Pirates.
///
/// The board exposes two CDC interfaces (terminal and binary); both are
/// listed. On macOS `tty.*` duplicates of `cu.*` ports are skipped.
pub fn find_bus_pirates() -> Vec<BusPirateDevice> {
    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("Serial port enumeration failed: {}", e);
            return Vec::new();
        }
    };

    let devices: Vec<BusPirateDevice> = ports
        .into_iter()
        .filter(|port| !cfg!(target_os = "macos") || !port.port_name.contains("/dev/tty."))
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) if is_bus_pirate(usb.vid, usb.pid) => {
                Some(BusPirateDevice {
                    port: port.port_name,
                    vid: usb.vid,
                    pid: usb.pid,
                    serial_number: usb.serial_number,
                    product_name: usb.product,
                })
            }
            _ => None,
        })
        .collect();

    log::debug!("Found {} Bus Pirate port(s)", devices.len());
    devices
}

/// Get the device on a specific port, if it is a Bus Pirate.
pub fn get_device_by_port(port_name: &str) -> Option<BusPirateDevice> {
    find_bus_pirates().into_iter().find(|d| d.port == port_name)
}
