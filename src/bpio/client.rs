//! High-level BPIO2 client.
//!
//! Owns one session over one transport. Bus access goes through typed
//! handles; flash dumps and programming go through the bulk controller and
//! require SPI mode.

use std::io::Write;

use super::bus::{BusHandle, I2c, OneWire, Spi};
use super::config::ClientConfig;
use super::device::find_bus_pirates;
use super::error::{BpioError, BpioResult};
use super::flash::{BulkTransfer, ReadSummary, SpiFlash, TransferEvent, WriteOptions, WriteSummary};
use super::packet::{
    ConfigurationRequest, MessageCodec, PostcardCodec, RequestContents, ResponseContents,
    StatusResponse,
};
use super::protocol::RequestEngine;
use super::session::{ModeKind, ModeSession, ModeState};
use super::transport::{SerialTransport, Transport};

/// Client for one Bus Pirate connection.
pub struct BpioClient<T: Transport = SerialTransport> {
    session: ModeSession<T>,
    bulk: BulkTransfer,
    config: ClientConfig,
}

impl BpioClient<SerialTransport> {
    /// Open the BPIO2 port at `port_name` with the postcard codec.
    pub fn open(port_name: &str, config: &ClientConfig) -> BpioResult<Self> {
        Self::open_with_codec(port_name, Box::new(PostcardCodec), config)
    }

    /// Open the BPIO2 port at `port_name`, encoding messages with `codec`.
    pub fn open_with_codec(
        port_name: &str,
        codec: Box<dyn MessageCodec>,
        config: &ClientConfig,
    ) -> BpioResult<Self> {
        config.validate()?;
        let transport = SerialTransport::open_with_baud(port_name, config.baud_rate)?;
        Self::new(transport, codec, config.clone())
    }

    /// Open the first Bus Pirate port that answers a status request, using
    /// the postcard codec.
    pub fn open_first(config: &ClientConfig) -> BpioResult<Self> {
        Self::open_first_with_codec(config, || Box::new(PostcardCodec))
    }

    /// Open the first Bus Pirate port that answers a status request.
    ///
    /// Each board exposes a terminal port next to the BPIO2 port, so ports
    /// that fail to answer are skipped. `codec` is called once per port tried.
    pub fn open_first_with_codec(
        config: &ClientConfig,
        codec: impl Fn() -> Box<dyn MessageCodec>,
    ) -> BpioResult<Self> {
        let devices = find_bus_pirates();
        let mut last_error = None;

        for device in &devices {
            match Self::open_with_codec(&device.port, codec(), config) {
                Ok(client) => match client.status() {
                    Ok(status) => {
                        log::info!(
                            "Connected to {} (firmware {})",
                            device.display_label(),
                            status.firmware_version()
                        );
                        return Ok(client);
                    }
                    Err(e) => {
                        log::debug!("{} did not answer BPIO2: {}", device.port, e);
                        client.close().ok();
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    log::debug!("Could not open {}: {}", device.port, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BpioError::NoDeviceFound {
            port: "any".into(),
        }))
    }
}

impl<T: Transport> BpioClient<T> {
    /// Build a client over an already-open transport.
    pub fn new(transport: T, codec: Box<dyn MessageCodec>, config: ClientConfig) -> BpioResult<Self> {
        config.validate()?;
        let engine = RequestEngine::new(transport, codec);
        Ok(Self {
            session: ModeSession::new(engine, config.exchange_timeout()),
            bulk: BulkTransfer::new(config.retry_limit),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &ModeSession<T> {
        &self.session
    }

    pub fn state(&self) -> ModeState {
        self.session.state()
    }

    pub fn status(&self) -> BpioResult<StatusResponse> {
        self.session.status()
    }

    /// Apply non-mode settings (PSU, pull-ups, bit order, LEDs, print string).
    pub fn configure(&self, request: ConfigurationRequest) -> BpioResult<()> {
        self.session.configure(request)
    }

    pub fn enter_mode(&self, kind: ModeKind, request: ConfigurationRequest) -> BpioResult<()> {
        self.session.enter_mode(kind, request)
    }

    pub fn exit_mode(&self) -> BpioResult<()> {
        self.session.exit_mode()
    }

    pub fn send_command(&self, request: RequestContents) -> BpioResult<ResponseContents> {
        self.session.send_command(request)
    }

    pub fn i2c(&self) -> BusHandle<'_, T, I2c> {
        BusHandle::new(&self.session)
    }

    pub fn spi(&self) -> BusHandle<'_, T, Spi> {
        BusHandle::new(&self.session)
    }

    pub fn one_wire(&self) -> BusHandle<'_, T, OneWire> {
        BusHandle::new(&self.session)
    }

    /// SPI NOR flash on the SPI bus.
    pub fn flash(&self) -> SpiFlash<'_, T> {
        SpiFlash::new(&self.session, &self.config)
    }

    /// Read `size` bytes of flash into memory.
    ///
    /// `chunk_size` falls back to the configured read chunk size.
    pub fn read_flash(&self, size: usize, chunk_size: Option<usize>) -> BpioResult<Vec<u8>> {
        self.read_flash_with_progress(size, chunk_size, |_| {})
    }

    /// Read `size` bytes of flash into memory, reporting progress.
    ///
    /// Nothing is returned on failure; use [`read_flash_to`](Self::read_flash_to)
    /// to keep completed chunks.
    pub fn read_flash_with_progress(
        &self,
        size: usize,
        chunk_size: Option<usize>,
        on_progress: impl FnMut(TransferEvent),
    ) -> BpioResult<Vec<u8>> {
        let mut image = Vec::with_capacity(size.min(self.config.flash_size));
        self.read_flash_to(size, chunk_size, &mut image, on_progress)?;
        Ok(image)
    }

    /// Stream `size` bytes of flash into `sink`.
    ///
    /// On failure `sink` has received every chunk before the failing one.
    pub fn read_flash_to<W: Write + ?Sized>(
        &self,
        size: usize,
        chunk_size: Option<usize>,
        sink: &mut W,
        on_progress: impl FnMut(TransferEvent),
    ) -> BpioResult<ReadSummary> {
        self.check_capacity("read_flash", size)?;
        self.session.require_mode(ModeKind::Spi, "read_flash")?;
        let chunk_size = chunk_size.unwrap_or(self.config.read_chunk_size);
        self.bulk
            .read(&self.flash(), size, chunk_size, sink, on_progress)
    }

    /// Program `data` from address 0.
    ///
    /// `chunk_size` falls back to the configured write chunk size.
    pub fn write_flash(
        &self,
        data: &[u8],
        chunk_size: Option<usize>,
        erase: bool,
        verify: bool,
    ) -> BpioResult<WriteSummary> {
        self.write_flash_with_progress(data, chunk_size, erase, verify, |_| {})
    }

    /// Program `data` from address 0, reporting progress.
    pub fn write_flash_with_progress(
        &self,
        data: &[u8],
        chunk_size: Option<usize>,
        erase: bool,
        verify: bool,
        on_progress: impl FnMut(TransferEvent),
    ) -> BpioResult<WriteSummary> {
        self.check_capacity("write_flash", data.len())?;
        self.session.require_mode(ModeKind::Spi, "write_flash")?;
        let options = WriteOptions {
            chunk_size: chunk_size.unwrap_or(self.config.write_chunk_size),
            erase,
            verify,
        };
        self.bulk.write(&self.flash(), data, options, on_progress)
    }

    /// Transfers from address 0 must fit the configured flash size.
    fn check_capacity(&self, operation: &str, size: usize) -> BpioResult<()> {
        if size > self.config.flash_size {
            return Err(BpioError::InvalidParameter {
                reason: format!(
                    "{} of {} bytes exceeds the {} byte flash",
                    operation, size, self.config.flash_size
                ),
            });
        }
        Ok(())
    }

    /// Leave any active mode (best-effort) and release the transport.
    pub fn close(&self) -> BpioResult<()> {
        self.session.close()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}
