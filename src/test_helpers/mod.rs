//! Shared fixtures for unit tests.

mod fixtures;
mod simulator;
mod temp;

pub use fixtures::{init_logging, patterned_image, simulated_client};
pub use simulator::{DeviceProbe, Fault, SimulatedDevice, SimulatedFlash};
pub use temp::TestContext;
