//! Async entry points for hosts running a tokio runtime.

mod client;
mod device;

pub use client::{AsyncClient, TransferProgressEvent};
pub use device::{detect_devices, DetectedDevice};
