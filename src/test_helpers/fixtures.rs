use crate::bpio::packet::PostcardCodec;
use crate::bpio::{BpioClient, ClientConfig};

use super::simulator::{DeviceProbe, SimulatedDevice, SimulatedFlash};

/// Route `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic non-uniform image that also contains zero bytes.
pub fn patterned_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Client settings with short deadlines so failure paths finish quickly.
fn fast_config() -> ClientConfig {
    ClientConfig {
        exchange_timeout_ms: 50,
        erase_timeout_ms: 200,
        erase_poll_ms: 1,
        program_timeout_ms: 200,
        program_poll_ms: 1,
        ..ClientConfig::default()
    }
}

/// Client wired to a simulated board.
pub fn simulated_client(flash: SimulatedFlash) -> (BpioClient<SimulatedDevice>, DeviceProbe) {
    init_logging();
    let device = SimulatedDevice::new(flash);
    let probe = device.probe();
    let client = BpioClient::new(device, Box::new(PostcardCodec), fast_config())
        .expect("fast config is valid");
    (client, probe)
}
