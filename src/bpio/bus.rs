//! Bus strategies and typed per-mode handles.
//!
//! Each bus kind knows how to validate its own settings and how to frame a
//! write/read transaction as a [`DataRequest`]. [`BusHandle`] pairs a
//! strategy with a session, so every call is gated on the matching mode.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use super::config::DEFAULT_SPI_SPEED_HZ;
use super::error::{BpioError, BpioResult};
use super::packet::{ConfigurationRequest, DataRequest, ModeConfiguration, PsuSetting};
use super::session::{ModeKind, ModeSession};
use super::transport::Transport;

/// Lowest programmable supply voltage.
const PSU_MIN_MV: u32 = 800;

/// Highest programmable supply voltage.
const PSU_MAX_MV: u32 = 5000;

/// Highest current limit the supply accepts. Zero disables the limit.
const PSU_MAX_MA: u16 = 500;

const I2C_MAX_SPEED_HZ: u32 = 1_000_000;
const SPI_MAX_SPEED_HZ: u32 = 62_500_000;
const SPI_MIN_DATA_BITS: u8 = 4;
const SPI_MAX_DATA_BITS: u8 = 8;

// ============================================================================
// Power
// ============================================================================

/// Target power applied when a mode is entered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PowerConfig {
    /// Supply voltage; `None` leaves the supply off.
    pub psu_millivolts: Option<u32>,
    /// Current limit in mA, 0 for none.
    pub psu_milliamps: u16,
    /// Enable the on-board pull-up resistors.
    pub pullups: bool,
}

impl PowerConfig {
    /// Supply at `millivolts` with pull-ups on.
    pub fn powered(millivolts: u32) -> Self {
        Self {
            psu_millivolts: Some(millivolts),
            psu_milliamps: 0,
            pullups: true,
        }
    }

    pub fn validate(&self) -> BpioResult<()> {
        if let Some(mv) = self.psu_millivolts {
            if !(PSU_MIN_MV..=PSU_MAX_MV).contains(&mv) {
                return Err(BpioError::InvalidParameter {
                    reason: format!(
                        "PSU voltage {}mV outside {}..={}mV",
                        mv, PSU_MIN_MV, PSU_MAX_MV
                    ),
                });
            }
        }
        if self.psu_milliamps > PSU_MAX_MA {
            return Err(BpioError::InvalidParameter {
                reason: format!(
                    "PSU current limit {}mA above {}mA",
                    self.psu_milliamps, PSU_MAX_MA
                ),
            });
        }
        Ok(())
    }

    fn apply(&self, request: &mut ConfigurationRequest) {
        request.psu = Some(match self.psu_millivolts {
            Some(millivolts) => PsuSetting::Enable {
                millivolts,
                milliamps: self.psu_milliamps,
            },
            None => PsuSetting::Disable,
        });
        request.pullup_enable = Some(self.pullups);
    }
}

// ============================================================================
// Strategy trait
// ============================================================================

/// Per-bus behavior: settings validation and transaction framing.
pub trait BusMode {
    /// Mode this strategy drives.
    const KIND: ModeKind;

    /// Operation name used in errors and logs.
    const TRANSFER_OPERATION: &'static str;

    type Config: Clone + Default;

    /// Reject settings the device would refuse or misapply.
    fn validate(config: &Self::Config) -> BpioResult<()>;

    /// Configuration sent together with mode entry.
    fn configuration(config: &Self::Config) -> ConfigurationRequest;

    /// Frame one write-then-read transaction.
    fn transfer_request(write: &[u8], read_bytes: usize) -> BpioResult<DataRequest>;
}

fn read_length(read_bytes: usize) -> BpioResult<u16> {
    u16::try_from(read_bytes).map_err(|_| BpioError::InvalidParameter {
        reason: format!("read of {} bytes exceeds {} byte limit", read_bytes, u16::MAX),
    })
}

// ============================================================================
// I2C
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct I2cConfig {
    pub speed_hz: u32,
    pub clock_stretch: bool,
    pub power: PowerConfig,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            speed_hz: 400_000,
            clock_stretch: false,
            power: PowerConfig::default(),
        }
    }
}

/// I2C master: every transaction is wrapped in START and STOP conditions.
#[derive(Debug, Clone, Copy)]
pub struct I2c;

impl BusMode for I2c {
    const KIND: ModeKind = ModeKind::I2c;
    const TRANSFER_OPERATION: &'static str = "i2c transfer";

    type Config = I2cConfig;

    fn validate(config: &I2cConfig) -> BpioResult<()> {
        if config.speed_hz == 0 || config.speed_hz > I2C_MAX_SPEED_HZ {
            return Err(BpioError::InvalidParameter {
                reason: format!(
                    "I2C speed {}Hz outside 1..={}Hz",
                    config.speed_hz, I2C_MAX_SPEED_HZ
                ),
            });
        }
        config.power.validate()
    }

    fn configuration(config: &I2cConfig) -> ConfigurationRequest {
        let mut request = ConfigurationRequest {
            mode_configuration: Some(ModeConfiguration {
                speed: config.speed_hz,
                clock_stretch: config.clock_stretch,
                ..Default::default()
            }),
            ..Default::default()
        };
        config.power.apply(&mut request);
        request
    }

    fn transfer_request(write: &[u8], read_bytes: usize) -> BpioResult<DataRequest> {
        // First byte is the 8-bit device address
        if write.is_empty() {
            return Err(BpioError::InvalidParameter {
                reason: "I2C transfer needs at least the device address byte".into(),
            });
        }
        Ok(DataRequest {
            start_main: true,
            data_write: write.to_vec(),
            bytes_read: read_length(read_bytes)?,
            stop_main: true,
            ..Default::default()
        })
    }
}

// ============================================================================
// SPI
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpiConfig {
    pub speed_hz: u32,
    pub data_bits: u8,
    pub clock_polarity: bool,
    pub clock_phase: bool,
    /// Chip select idles high (active low).
    pub chip_select_idle_high: bool,
    pub msb_first: bool,
    pub power: PowerConfig,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            speed_hz: DEFAULT_SPI_SPEED_HZ,
            data_bits: 8,
            clock_polarity: false,
            clock_phase: false,
            chip_select_idle_high: true,
            msb_first: true,
            power: PowerConfig::default(),
        }
    }
}

/// SPI master: chip select is asserted for the whole transaction.
#[derive(Debug, Clone, Copy)]
pub struct Spi;

impl BusMode for Spi {
    const KIND: ModeKind = ModeKind::Spi;
    const TRANSFER_OPERATION: &'static str = "spi transfer";

    type Config = SpiConfig;

    fn validate(config: &SpiConfig) -> BpioResult<()> {
        if config.speed_hz == 0 || config.speed_hz > SPI_MAX_SPEED_HZ {
            return Err(BpioError::InvalidParameter {
                reason: format!(
                    "SPI speed {}Hz outside 1..={}Hz",
                    config.speed_hz, SPI_MAX_SPEED_HZ
                ),
            });
        }
        if !(SPI_MIN_DATA_BITS..=SPI_MAX_DATA_BITS).contains(&config.data_bits) {
            return Err(BpioError::InvalidParameter {
                reason: format!(
                    "SPI data bits {} outside {}..={}",
                    config.data_bits, SPI_MIN_DATA_BITS, SPI_MAX_DATA_BITS
                ),
            });
        }
        config.power.validate()
    }

    fn configuration(config: &SpiConfig) -> ConfigurationRequest {
        let mut request = ConfigurationRequest {
            mode_configuration: Some(ModeConfiguration {
                speed: config.speed_hz,
                data_bits: config.data_bits,
                clock_polarity: config.clock_polarity,
                clock_phase: config.clock_phase,
                chip_select_idle: config.chip_select_idle_high,
                ..Default::default()
            }),
            mode_bitorder_msb: Some(config.msb_first),
            ..Default::default()
        };
        config.power.apply(&mut request);
        request
    }

    fn transfer_request(write: &[u8], read_bytes: usize) -> BpioResult<DataRequest> {
        Ok(DataRequest {
            start_main: true,
            data_write: write.to_vec(),
            bytes_read: read_length(read_bytes)?,
            stop_main: true,
            ..Default::default()
        })
    }
}

// ============================================================================
// 1-Wire
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OneWireConfig {
    pub power: PowerConfig,
}

impl Default for OneWireConfig {
    fn default() -> Self {
        // Parasite-powered parts need the pull-up
        Self {
            power: PowerConfig {
                pullups: true,
                ..Default::default()
            },
        }
    }
}

/// 1-Wire master. Every transfer opens with a bus reset, so it can start
/// with a ROM command; [`BusHandle::read`] continues without one.
#[derive(Debug, Clone, Copy)]
pub struct OneWire;

impl BusMode for OneWire {
    const KIND: ModeKind = ModeKind::OneWire;
    const TRANSFER_OPERATION: &'static str = "1-wire transfer";

    type Config = OneWireConfig;

    fn validate(config: &OneWireConfig) -> BpioResult<()> {
        config.power.validate()
    }

    fn configuration(config: &OneWireConfig) -> ConfigurationRequest {
        let mut request = ConfigurationRequest::default();
        config.power.apply(&mut request);
        request
    }

    fn transfer_request(write: &[u8], read_bytes: usize) -> BpioResult<DataRequest> {
        Ok(DataRequest {
            start_main: true,
            data_write: write.to_vec(),
            bytes_read: read_length(read_bytes)?,
            ..Default::default()
        })
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Mode-gated access to one bus kind on a session.
pub struct BusHandle<'a, T: Transport, M: BusMode> {
    session: &'a ModeSession<T>,
    _mode: PhantomData<M>,
}

impl<'a, T: Transport, M: BusMode> BusHandle<'a, T, M> {
    pub fn new(session: &'a ModeSession<T>) -> Self {
        Self {
            session,
            _mode: PhantomData,
        }
    }

    /// Validate `config` and enter this bus mode with it.
    pub fn configure(&self, config: &M::Config) -> BpioResult<()> {
        M::validate(config)?;
        self.session.enter_mode(M::KIND, M::configuration(config))
    }

    /// Whether this bus mode is the active one.
    pub fn is_active(&self) -> bool {
        self.session.state().active() == Some(M::KIND)
    }

    /// Write `write`, then read `read_bytes` back, as one transaction.
    pub fn transfer(&self, write: &[u8], read_bytes: usize) -> BpioResult<Vec<u8>> {
        self.run(M::transfer_request(write, read_bytes)?, read_bytes)
    }

    fn run(&self, request: DataRequest, read_bytes: usize) -> BpioResult<Vec<u8>> {
        let response = self
            .session
            .data(M::KIND, M::TRANSFER_OPERATION, request)?;

        if response.data_read.len() != read_bytes {
            return Err(BpioError::Protocol {
                operation: M::TRANSFER_OPERATION.to_string(),
                reason: format!(
                    "requested {} bytes, device returned {}",
                    read_bytes,
                    response.data_read.len()
                ),
            });
        }
        Ok(response.data_read)
    }

    pub fn write(&self, data: &[u8]) -> BpioResult<()> {
        self.transfer(data, 0).map(|_| ())
    }

    /// Leave this bus mode.
    pub fn release(&self) -> BpioResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.session.exit_mode()
    }
}

impl<'a, T: Transport> BusHandle<'a, T, Spi> {
    pub fn read(&self, read_bytes: usize) -> BpioResult<Vec<u8>> {
        self.transfer(&[], read_bytes)
    }
}

impl<'a, T: Transport> BusHandle<'a, T, OneWire> {
    /// Read `read_bytes` without a reset, continuing the last transfer.
    pub fn read(&self, read_bytes: usize) -> BpioResult<Vec<u8>> {
        let request = DataRequest {
            bytes_read: read_length(read_bytes)?,
            ..Default::default()
        };
        self.run(request, read_bytes)
    }

    /// Issue a bus reset pulse.
    pub fn reset(&self) -> BpioResult<()> {
        let request = DataRequest {
            start_main: true,
            ..Default::default()
        };
        self.session
            .data(ModeKind::OneWire, "1-wire reset", request)
            .map(|_| ())
    }
}

impl<'a, T: Transport> BusHandle<'a, T, I2c> {
    /// Read from a device register: address, register, then `read_bytes`.
    pub fn read_register(&self, address: u8, register: u8, read_bytes: usize) -> BpioResult<Vec<u8>> {
        self.transfer(&[address, register], read_bytes)
    }
}
