//! Configuration constants and runtime settings for the BPIO2 client.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{BpioError, BpioResult};

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// pid.codes USB Vendor ID used by the Bus Pirate 5/6.
pub const BUS_PIRATE_VID: u16 = 0x1209;

/// Bus Pirate USB Product ID.
pub const BUS_PIRATE_PID: u16 = 0x7331;

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate for the BPIO2 binary interface.
///
/// The port is USB CDC, so the value is nominal, but some host drivers
/// refuse to open without one.
pub const BPIO_BAUD_RATE: u32 = 115_200;

/// Serial read timeout applied when a port is opened.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default deadline for a single request/response exchange.
pub const EXCHANGE_TIMEOUT_MS: u64 = 1000;

// ============================================================================
// Framing
// ============================================================================

/// COBS frame delimiter. Never appears inside an encoded frame.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Maximum accepted encoded frame length before the decoder gives up.
///
/// Sized for a 64 KiB read response plus envelope and stuffing overhead,
/// so corrupted streams without a delimiter cannot grow the buffer forever.
pub const MAX_FRAME_SIZE: usize = 70 * 1024;

// ============================================================================
// Protocol
// ============================================================================

/// BPIO2 protocol major version carried in every request envelope.
pub const PROTOCOL_VERSION_MAJOR: u8 = 2;

/// BPIO2 protocol minor version carried in every request envelope.
pub const PROTOCOL_VERSION_MINOR: u16 = 0;

/// Mode name the device reports when no bus mode is active.
pub const IDLE_MODE_NAME: &str = "HiZ";

// ============================================================================
// Retry Configuration
// ============================================================================

/// Extra attempts for a chunk after a timeout or link failure.
pub const MAX_CHUNK_RETRIES: u32 = 3;

// ============================================================================
// Bulk Transfer
// ============================================================================

/// Smallest chunk the bulk controller accepts.
pub const MIN_CHUNK_SIZE: usize = 1;

/// Largest chunk the bulk controller accepts.
pub const MAX_CHUNK_SIZE: usize = 4096;

/// Default chunk size for flash reads.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 512;

/// Default chunk size for flash writes (one SPI NOR page).
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = SPI_FLASH_PAGE_SIZE;

// ============================================================================
// SPI NOR Flash
// ============================================================================

/// Page program granularity of standard SPI NOR flash.
pub const SPI_FLASH_PAGE_SIZE: usize = 256;

/// Default flash capacity; transfers from address 0 must fit in it (16 MiB).
pub const DEFAULT_FLASH_SIZE: usize = 16 * 1024 * 1024;

/// Highest addressable byte count with 3-byte addressing.
pub const MAX_FLASH_ADDRESS_SPACE: usize = 1 << 24;

/// Default SPI clock for flash operations (12 MHz).
pub const DEFAULT_SPI_SPEED_HZ: u32 = 12_000_000;

/// Status register bit 0: write in progress.
pub const STATUS_WIP: u8 = 0x01;

/// Standard SPI NOR flash opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlashOpcode {
    /// Page program, followed by a 24-bit address and up to one page of data.
    PageProgram = 0x02,
    /// Read data, followed by a 24-bit address.
    Read = 0x03,
    /// Read status register 1.
    ReadStatus = 0x05,
    /// Set the write enable latch.
    WriteEnable = 0x06,
    /// JEDEC manufacturer and device ID.
    JedecId = 0x9F,
    /// Erase the entire chip.
    ChipErase = 0xC7,
}

/// Build a `[opcode, a23..a16, a15..a8, a7..a0]` command header.
pub fn addressed_command(opcode: FlashOpcode, address: u32) -> [u8; 4] {
    [
        opcode as u8,
        ((address >> 16) & 0xFF) as u8,
        ((address >> 8) & 0xFF) as u8,
        (address & 0xFF) as u8,
    ]
}

// ============================================================================
// Flash Timing
// ============================================================================

/// Upper bound for a full chip erase (large parts take minutes).
pub const CHIP_ERASE_TIMEOUT_MS: u64 = 400_000;

/// Status poll interval while a chip erase runs.
pub const CHIP_ERASE_POLL_MS: u64 = 500;

/// Upper bound for a single page program.
pub const PAGE_PROGRAM_TIMEOUT_MS: u64 = 1000;

/// Status poll interval while a page program runs.
pub const PAGE_PROGRAM_POLL_MS: u64 = 1;

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Tunable client settings.
///
/// Every field falls back to its default when absent from a settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Deadline for one request/response exchange.
    pub exchange_timeout_ms: u64,
    /// Extra attempts per bulk chunk after a timeout or link failure.
    pub retry_limit: u32,
    /// Chunk size for flash reads.
    pub read_chunk_size: usize,
    /// Chunk size for flash writes.
    pub write_chunk_size: usize,
    /// Capacity of the attached flash chip.
    pub flash_size: usize,
    /// Deadline for a chip erase to finish.
    pub erase_timeout_ms: u64,
    /// Status poll interval during chip erase.
    pub erase_poll_ms: u64,
    /// Deadline for one page program to finish.
    pub program_timeout_ms: u64,
    /// Status poll interval during page program.
    pub program_poll_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            baud_rate: BPIO_BAUD_RATE,
            exchange_timeout_ms: EXCHANGE_TIMEOUT_MS,
            retry_limit: MAX_CHUNK_RETRIES,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
            flash_size: DEFAULT_FLASH_SIZE,
            erase_timeout_ms: CHIP_ERASE_TIMEOUT_MS,
            erase_poll_ms: CHIP_ERASE_POLL_MS,
            program_timeout_ms: PAGE_PROGRAM_TIMEOUT_MS,
            program_poll_ms: PAGE_PROGRAM_POLL_MS,
        }
    }
}

impl ClientConfig {
    /// Reject settings the client cannot operate with.
    pub fn validate(&self) -> BpioResult<()> {
        if self.baud_rate == 0 {
            return Err(BpioError::InvalidParameter {
                reason: "baud rate must be non-zero".into(),
            });
        }
        if self.exchange_timeout_ms == 0 {
            return Err(BpioError::InvalidParameter {
                reason: "exchange timeout must be non-zero".into(),
            });
        }
        if self.erase_timeout_ms == 0 || self.program_timeout_ms == 0 {
            return Err(BpioError::InvalidParameter {
                reason: "flash busy timeouts must be non-zero".into(),
            });
        }
        if self.flash_size == 0 || self.flash_size > MAX_FLASH_ADDRESS_SPACE {
            return Err(BpioError::InvalidParameter {
                reason: format!(
                    "flash size {} outside 1..={} bytes",
                    self.flash_size, MAX_FLASH_ADDRESS_SPACE
                ),
            });
        }
        validate_chunk_size(self.read_chunk_size)?;
        validate_chunk_size(self.write_chunk_size)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

/// Check a chunk size against the bulk transfer limits.
pub fn validate_chunk_size(chunk_size: usize) -> BpioResult<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(BpioError::InvalidParameter {
            reason: format!(
                "chunk size {} outside {}..={} bytes",
                chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            ),
        });
    }
    Ok(())
}

/// Check if a VID/PID combination is a Bus Pirate.
pub fn is_bus_pirate(vid: u16, pid: u16) -> bool {
    vid == BUS_PIRATE_VID && pid == BUS_PIRATE_PID
}
