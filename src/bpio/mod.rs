//! BPIO2 host client for Bus Pirate 5/6 boards.
//!
//! # Layers
//!
//! 1. **Framing** - COBS-encoded frames terminated by a zero byte ([`cobs`])
//! 2. **Transport** - byte pipe to the board, usually a USB CDC port ([`transport`])
//! 3. **Request engine** - one outstanding request/response exchange at a time ([`protocol`])
//! 4. **Mode session** - idle/entering/in/exiting state machine gating bus traffic ([`session`])
//! 5. **Bus handles and flash** - typed I2C/SPI/1-Wire access and chunked SPI flash transfers
//!
//! # Example
//!
//! ```ignore
//! use bpio_client::bpio::{BpioClient, ClientConfig, SpiConfig};
//!
//! let client = BpioClient::open_first(&ClientConfig::default())?;
//! client.spi().configure(&SpiConfig::default())?;
//! let image = client.read_flash_with_progress(1 << 20, Some(4096), |event| {
//!     println!("{}", event.message());
//! })?;
//! client.close()?;
//! ```

pub mod bus;
pub mod client;
pub mod cobs;
pub mod config;
pub mod device;
pub mod error;
pub mod flash;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod transport;

pub use bus::{BusHandle, I2c, I2cConfig, OneWire, OneWireConfig, PowerConfig, Spi, SpiConfig};
pub use client::BpioClient;
pub use config::ClientConfig;
pub use device::{find_bus_pirates, BusPirateDevice};
pub use error::{BpioError, BpioResult, ErrorKind};
pub use flash::{ReadSummary, TransferEvent, WriteSummary};
pub use session::{ModeKind, ModeState};
pub use transport::{SerialTransport, Transport};
