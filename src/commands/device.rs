//! Async Bus Pirate detection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::bpio::{find_bus_pirates, BpioError, BpioResult, BusPirateDevice};

/// Detected board as presented to a UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedDevice {
    /// Serial port path.
    pub port: String,
    /// Display label for the device.
    pub label: String,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Device serial number (if available).
    pub serial_number: Option<String>,
}

impl From<BusPirateDevice> for DetectedDevice {
    fn from(device: BusPirateDevice) -> Self {
        Self {
            label: device.display_label(),
            port: device.port,
            vid: device.vid,
            pid: device.pid,
            serial_number: device.serial_number,
        }
    }
}

/// Detect connected Bus Pirates.
///
/// Devices with duplicate labels are numbered ("Bus Pirate 5 #1", "Bus Pirate 5 #2").
pub async fn detect_devices() -> BpioResult<Vec<DetectedDevice>> {
    tokio::task::spawn_blocking(|| {
        number_duplicate_labels(find_bus_pirates().into_iter().map(DetectedDevice::from).collect())
    })
    .await
    .map_err(|e| BpioError::Task {
        operation: "detect devices".into(),
        reason: e.to_string(),
    })
}

fn number_duplicate_labels(mut devices: Vec<DetectedDevice>) -> Vec<DetectedDevice> {
    let mut label_counts: HashMap<String, usize> = HashMap::new();
    for device in &devices {
        *label_counts.entry(device.label.clone()).or_insert(0) += 1;
    }

    let mut label_indices: HashMap<String, usize> = HashMap::new();
    for device in &mut devices {
        if label_counts.get(&device.label).is_some_and(|&count| count > 1) {
            let index = label_indices.entry(device.label.clone()).or_insert(0);
            *index += 1;
            device.label = format!("{} #{}", device.label, index);
        }
    }

    devices
}
