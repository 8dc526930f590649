//! SPI NOR flash access and the bulk transfer controller.
//!
//! Transfers run chunk by chunk through [`FlashAccess`]:
//! 1. Read - one addressed read per chunk, appended to the sink in order
//! 2. Write - optional chip erase, then program each chunk, optionally
//!    reading it back to verify
//!
//! Timeouts and link failures retry the same chunk whole; anything else ends
//! the job.

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::config::{
    addressed_command, validate_chunk_size, ClientConfig, FlashOpcode, MAX_FLASH_ADDRESS_SPACE,
    SPI_FLASH_PAGE_SIZE, STATUS_WIP,
};
use super::error::{BpioError, BpioResult};
use super::packet::DataRequest;
use super::session::{ModeKind, ModeSession};
use super::transport::Transport;

// ============================================================================
// Flash access
// ============================================================================

/// Chunk-level flash primitives the bulk controller drives.
#[cfg_attr(test, automock)]
pub trait FlashAccess {
    /// Read `len` bytes starting at `address`.
    fn read_chunk(&self, address: u32, len: usize) -> BpioResult<Vec<u8>>;

    /// Program `data` starting at `address`, returning once it is committed.
    fn write_chunk(&self, address: u32, data: &[u8]) -> BpioResult<()>;

    /// Erase the whole chip, returning once the erase has finished.
    fn erase_chip(&self) -> BpioResult<()>;
}

/// Busy-wait limits for one kind of flash operation.
#[derive(Debug, Clone, Copy)]
struct BusyWait {
    operation: &'static str,
    timeout: Duration,
    poll: Duration,
}

/// Standard SPI NOR flash over a session in SPI mode.
pub struct SpiFlash<'a, T: Transport> {
    session: &'a ModeSession<T>,
    erase_wait: BusyWait,
    program_wait: BusyWait,
}

impl<'a, T: Transport> SpiFlash<'a, T> {
    pub fn new(session: &'a ModeSession<T>, config: &ClientConfig) -> Self {
        Self {
            session,
            erase_wait: BusyWait {
                operation: "chip erase",
                timeout: Duration::from_millis(config.erase_timeout_ms),
                poll: Duration::from_millis(config.erase_poll_ms),
            },
            program_wait: BusyWait {
                operation: "page program",
                timeout: Duration::from_millis(config.program_timeout_ms),
                poll: Duration::from_millis(config.program_poll_ms),
            },
        }
    }

    fn command(&self, operation: &str, write: Vec<u8>, read_bytes: u16) -> BpioResult<Vec<u8>> {
        let request = DataRequest {
            start_main: true,
            data_write: write,
            bytes_read: read_bytes,
            stop_main: true,
            ..Default::default()
        };
        Ok(self
            .session
            .data(ModeKind::Spi, operation, request)?
            .data_read)
    }

    /// Manufacturer, memory type and capacity bytes.
    pub fn jedec_id(&self) -> BpioResult<[u8; 3]> {
        let id = self.command("read JEDEC ID", vec![FlashOpcode::JedecId as u8], 3)?;
        <[u8; 3]>::try_from(id.as_slice()).map_err(|_| BpioError::Protocol {
            operation: "read JEDEC ID".into(),
            reason: format!("expected 3 ID bytes, got {}", id.len()),
        })
    }

    pub fn read_status(&self) -> BpioResult<u8> {
        let status = self.command("read status", vec![FlashOpcode::ReadStatus as u8], 1)?;
        status.first().copied().ok_or_else(|| BpioError::Protocol {
            operation: "read status".into(),
            reason: "empty status response".into(),
        })
    }

    fn write_enable(&self) -> BpioResult<()> {
        self.command("write enable", vec![FlashOpcode::WriteEnable as u8], 0)
            .map(|_| ())
    }

    /// Poll the status register until the write-in-progress bit clears.
    fn wait_ready(&self, wait: BusyWait) -> BpioResult<()> {
        let start = Instant::now();

        loop {
            if self.read_status()? & STATUS_WIP == 0 {
                return Ok(());
            }
            if start.elapsed() >= wait.timeout {
                return Err(BpioError::Timeout {
                    operation: format!("{} to finish", wait.operation),
                    timeout_ms: wait.timeout.as_millis() as u64,
                });
            }
            thread::sleep(wait.poll);
        }
    }
}

impl<'a, T: Transport> FlashAccess for SpiFlash<'a, T> {
    fn read_chunk(&self, address: u32, len: usize) -> BpioResult<Vec<u8>> {
        let read_bytes = u16::try_from(len).map_err(|_| BpioError::InvalidParameter {
            reason: format!("flash read of {} bytes exceeds {}", len, u16::MAX),
        })?;
        let header = addressed_command(FlashOpcode::Read, address);
        self.command("flash read", header.to_vec(), read_bytes)
    }

    fn write_chunk(&self, address: u32, data: &[u8]) -> BpioResult<()> {
        let mut address = address;
        let mut remaining = data;

        // Page program wraps within a page, so never cross a page boundary
        while !remaining.is_empty() {
            let page_left = SPI_FLASH_PAGE_SIZE - (address as usize % SPI_FLASH_PAGE_SIZE);
            let (piece, rest) = remaining.split_at(page_left.min(remaining.len()));

            self.write_enable()?;
            let mut write = addressed_command(FlashOpcode::PageProgram, address).to_vec();
            write.extend_from_slice(piece);
            self.command("page program", write, 0)?;
            self.wait_ready(self.program_wait)?;

            address += piece.len() as u32;
            remaining = rest;
        }
        Ok(())
    }

    fn erase_chip(&self) -> BpioResult<()> {
        self.write_enable()?;
        self.command("chip erase", vec![FlashOpcode::ChipErase as u8], 0)?;
        self.wait_ready(self.erase_wait)
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Progress of a bulk transfer.
///
/// Chunk events arrive in offset order; exactly one `Complete` or `Failed`
/// ends every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum TransferEvent {
    /// Chip erase underway.
    Erasing,
    /// Bytes `0..offset` are done.
    Chunk { offset: usize, total: usize },
    /// All bytes transferred.
    Complete { total: usize },
    /// Job ended with bytes `0..offset` done.
    Failed { offset: usize, total: usize },
}

impl TransferEvent {
    /// Get a percentage estimate for this event.
    pub fn percent(&self) -> f32 {
        match self {
            TransferEvent::Erasing => 0.0,
            TransferEvent::Chunk { offset, total } | TransferEvent::Failed { offset, total } => {
                if *total == 0 {
                    0.0
                } else {
                    (*offset as f32 / *total as f32) * 100.0
                }
            }
            TransferEvent::Complete { .. } => 100.0,
        }
    }

    /// Get a human-readable message for this event.
    pub fn message(&self) -> String {
        match self {
            TransferEvent::Erasing => "Erasing flash...".into(),
            TransferEvent::Chunk { offset, total } => {
                format!("{}/{} bytes ({:.0}%)", offset, total, self.percent())
            }
            TransferEvent::Complete { total } => format!("Transfer complete ({} bytes)", total),
            TransferEvent::Failed { offset, total } => {
                format!("Transfer failed at byte {} of {}", offset, total)
            }
        }
    }

    /// Whether this event ends the job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Complete { .. } | TransferEvent::Failed { .. }
        )
    }
}

// ============================================================================
// Jobs and summaries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferDirection {
    Read,
    Write,
}

/// State of one bulk transfer. `offset` only moves forward, one whole
/// chunk at a time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TransferJob {
    direction: TransferDirection,
    total: usize,
    chunk_size: usize,
    offset: usize,
    retries: u32,
    verify: bool,
}

impl TransferJob {
    fn new(
        direction: TransferDirection,
        total: usize,
        chunk_size: usize,
        verify: bool,
    ) -> BpioResult<Self> {
        validate_chunk_size(chunk_size)?;
        if total > MAX_FLASH_ADDRESS_SPACE {
            return Err(BpioError::InvalidParameter {
                reason: format!(
                    "transfer of {} bytes exceeds the {} byte address space",
                    total, MAX_FLASH_ADDRESS_SPACE
                ),
            });
        }
        Ok(Self {
            direction,
            total,
            chunk_size,
            offset: 0,
            retries: 0,
            verify,
        })
    }

    /// Length of the chunk starting at the current offset.
    fn next_chunk_len(&self) -> usize {
        self.chunk_size.min(self.total - self.offset)
    }

    fn chunks(&self) -> usize {
        self.total.div_ceil(self.chunk_size)
    }

    fn operation(&self) -> &'static str {
        match self.direction {
            TransferDirection::Read => "flash read",
            TransferDirection::Write => "flash write",
        }
    }
}

/// Outcome of a completed flash read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadSummary {
    pub bytes: usize,
    pub chunks: usize,
    pub retries: u32,
    /// SHA-256 of the bytes read, lowercase hex.
    pub sha256: String,
}

/// Outcome of a completed flash write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteSummary {
    pub bytes: usize,
    pub chunks: usize,
    pub retries: u32,
    pub erased: bool,
    pub verified: bool,
    /// SHA-256 of the image written, lowercase hex.
    pub sha256: String,
}

/// Options for a flash write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub chunk_size: usize,
    pub erase: bool,
    pub verify: bool,
}

// ============================================================================
// Controller
// ============================================================================

/// Drives chunked flash transfers with bounded retry.
#[derive(Debug, Clone, Copy)]
pub struct BulkTransfer {
    retry_limit: u32,
}

impl BulkTransfer {
    /// Controller allowing `retry_limit` extra attempts per chunk.
    pub fn new(retry_limit: u32) -> Self {
        Self { retry_limit }
    }

    /// Run `attempt` until it succeeds, fails for good, or retries run out.
    fn with_retry<R>(
        &self,
        job: &mut TransferJob,
        operation: &str,
        mut attempt: impl FnMut() -> BpioResult<R>,
    ) -> BpioResult<R> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match attempt() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempts <= self.retry_limit => {
                    job.retries += 1;
                    log::warn!(
                        "{} at 0x{:06X} failed (attempt {}/{}): {}; retrying",
                        operation,
                        job.offset,
                        attempts,
                        self.retry_limit + 1,
                        e
                    );
                }
                Err(e) => {
                    return Err(BpioError::Transfer {
                        operation: operation.to_string(),
                        offset: job.offset as u32,
                        attempts,
                        source: Box::new(e),
                    })
                }
            }
        }
    }

    /// Run a job body and emit exactly one terminal event for it.
    fn finish<R>(
        job: &TransferJob,
        result: BpioResult<R>,
        on_progress: &mut impl FnMut(TransferEvent),
    ) -> BpioResult<R> {
        match &result {
            Ok(_) => {
                log::info!("{} complete: {} bytes", job.operation(), job.total);
                on_progress(TransferEvent::Complete { total: job.total });
            }
            Err(e) => {
                log::error!("{} failed at 0x{:06X}: {}", job.operation(), job.offset, e);
                on_progress(TransferEvent::Failed {
                    offset: job.offset,
                    total: job.total,
                });
            }
        }
        result
    }

    /// Read `total` bytes from address 0 into `sink`, chunk by chunk.
    ///
    /// On failure `sink` holds every chunk completed before the failing one;
    /// those bytes are only meaningful to callers that asked for streaming.
    pub fn read<F, W>(
        &self,
        flash: &F,
        total: usize,
        chunk_size: usize,
        sink: &mut W,
        mut on_progress: impl FnMut(TransferEvent),
    ) -> BpioResult<ReadSummary>
    where
        F: FlashAccess + ?Sized,
        W: Write + ?Sized,
    {
        let mut job = TransferJob::new(TransferDirection::Read, total, chunk_size, false)?;
        log::info!(
            "Reading {} bytes in {} chunk(s) of {}",
            total,
            job.chunks(),
            chunk_size
        );

        let result = self.run_read(flash, &mut job, sink, &mut on_progress);
        Self::finish(&job, result, &mut on_progress)
    }

    fn run_read<F, W>(
        &self,
        flash: &F,
        job: &mut TransferJob,
        sink: &mut W,
        on_progress: &mut impl FnMut(TransferEvent),
    ) -> BpioResult<ReadSummary>
    where
        F: FlashAccess + ?Sized,
        W: Write + ?Sized,
    {
        let mut hasher = Sha256::new();

        while job.offset < job.total {
            let len = job.next_chunk_len();
            let address = job.offset as u32;

            let data = self.with_retry(job, "flash read", || {
                let data = flash.read_chunk(address, len)?;
                check_length(address, len, &data)?;
                Ok(data)
            })?;

            sink.write_all(&data)
                .map_err(|e| BpioError::link("write flash image", e))?;
            hasher.update(&data);

            job.offset += len;
            log::debug!("Read chunk 0x{:06X}+{}", address, len);
            on_progress(TransferEvent::Chunk {
                offset: job.offset,
                total: job.total,
            });
        }

        sink.flush()
            .map_err(|e| BpioError::link("flush flash image", e))?;

        Ok(ReadSummary {
            bytes: job.total,
            chunks: job.chunks(),
            retries: job.retries,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    /// Write `data` from address 0, optionally erasing first and verifying
    /// each chunk after it is programmed.
    ///
    /// A verify mismatch fails the job at once; the chunk is not rewritten.
    pub fn write<F>(
        &self,
        flash: &F,
        data: &[u8],
        options: WriteOptions,
        mut on_progress: impl FnMut(TransferEvent),
    ) -> BpioResult<WriteSummary>
    where
        F: FlashAccess + ?Sized,
    {
        let mut job = TransferJob::new(
            TransferDirection::Write,
            data.len(),
            options.chunk_size,
            options.verify,
        )?;
        log::info!(
            "Writing {} bytes in {} chunk(s) of {} (erase: {}, verify: {})",
            data.len(),
            job.chunks(),
            options.chunk_size,
            options.erase,
            options.verify
        );

        let result = self.run_write(flash, &mut job, data, options.erase, &mut on_progress);
        Self::finish(&job, result, &mut on_progress)
    }

    fn run_write<F>(
        &self,
        flash: &F,
        job: &mut TransferJob,
        data: &[u8],
        erase: bool,
        on_progress: &mut impl FnMut(TransferEvent),
    ) -> BpioResult<WriteSummary>
    where
        F: FlashAccess + ?Sized,
    {
        if erase {
            on_progress(TransferEvent::Erasing);
            log::info!("Erasing chip");
            self.with_retry(job, "chip erase", || flash.erase_chip())?;
        }

        let mut hasher = Sha256::new();

        while job.offset < job.total {
            let len = job.next_chunk_len();
            let chunk = &data[job.offset..job.offset + len];
            let address = job.offset as u32;
            let verify = job.verify;

            self.with_retry(job, "flash write", || {
                flash.write_chunk(address, chunk)?;
                if verify {
                    let read_back = flash.read_chunk(address, len)?;
                    check_length(address, len, &read_back)?;
                    compare_chunk(address, chunk, &read_back)?;
                }
                Ok(())
            })?;

            hasher.update(chunk);
            job.offset += len;
            log::debug!("Wrote chunk 0x{:06X}+{}", address, len);
            on_progress(TransferEvent::Chunk {
                offset: job.offset,
                total: job.total,
            });
        }

        Ok(WriteSummary {
            bytes: job.total,
            chunks: job.chunks(),
            retries: job.retries,
            erased: erase,
            verified: job.verify,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }
}

/// A chunk must come back exactly as long as requested.
fn check_length(address: u32, expected: usize, data: &[u8]) -> BpioResult<()> {
    let actual = data.len();
    if actual < expected {
        return Err(BpioError::ShortRead {
            offset: address,
            expected,
            actual,
        });
    }
    if actual > expected {
        return Err(BpioError::LongRead {
            offset: address,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Compare a programmed chunk with its read-back, naming the first bad byte.
fn compare_chunk(address: u32, written: &[u8], read_back: &[u8]) -> BpioResult<()> {
    match written.iter().zip(read_back).position(|(w, r)| w != r) {
        Some(i) => {
            log::error!(
                "Verification mismatch at 0x{:06X}: wrote 0x{:02X}, read 0x{:02X}",
                address as usize + i,
                written[i],
                read_back[i]
            );
            Err(BpioError::Verification {
                offset: address + i as u32,
                chunk_offset: address,
                chunk_len: written.len(),
                expected: written[i],
                actual: read_back[i],
            })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpio::packet::PostcardCodec;
    use crate::bpio::protocol::RequestEngine;
    use crate::bpio::ErrorKind;
    use crate::test_helpers::{
        init_logging, patterned_image, DeviceProbe, Fault, SimulatedDevice, SimulatedFlash,
    };

    fn spi_session(flash: SimulatedFlash) -> (ModeSession<SimulatedDevice>, DeviceProbe) {
        let device = SimulatedDevice::new(flash);
        let probe = device.probe();
        let session = ModeSession::new(
            RequestEngine::new(device, Box::new(PostcardCodec)),
            Duration::from_millis(30),
        );
        session
            .enter_mode(ModeKind::Spi, Default::default())
            .unwrap();
        (session, probe)
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            erase_poll_ms: 1,
            erase_timeout_ms: 200,
            program_poll_ms: 1,
            program_timeout_ms: 200,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_transfer_event_percent_and_message() {
        assert_eq!(TransferEvent::Erasing.percent(), 0.0);
        assert_eq!(TransferEvent::Complete { total: 10 }.percent(), 100.0);

        let event = TransferEvent::Chunk {
            offset: 750,
            total: 1000,
        };
        assert_eq!(event.percent(), 75.0);
        assert!(event.message().contains("75%"));
        assert!(!event.is_terminal());
        assert!(TransferEvent::Failed {
            offset: 0,
            total: 0
        }
        .is_terminal());
    }

    #[test]
    fn test_bulk_read_chunk_sizes() {
        init_logging();
        let image = patterned_image(10_000);
        let mut flash = SimulatedFlash::new(16 * 1024);
        flash.load(0, &image);
        let (session, probe) = spi_session(flash);

        let spi_flash = SpiFlash::new(&session, &fast_config());
        let mut out = Vec::new();
        let summary = BulkTransfer::new(3)
            .read(&spi_flash, 10_000, 4096, &mut out, |_| {})
            .unwrap();

        assert_eq!(probe.flash_read_sizes(), vec![4096, 4096, 1808]);
        assert_eq!(out, image);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.retries, 0);
        assert_eq!(summary.sha256, format!("{:x}", Sha256::digest(&image)));
    }

    #[test]
    fn test_read_progress_is_ordered_and_terminates_once() {
        let (session, _probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());

        let mut events = Vec::new();
        BulkTransfer::new(3)
            .read(&spi_flash, 1000, 300, &mut Vec::new(), |e| events.push(e))
            .unwrap();

        assert_eq!(
            events,
            vec![
                TransferEvent::Chunk {
                    offset: 300,
                    total: 1000
                },
                TransferEvent::Chunk {
                    offset: 600,
                    total: 1000
                },
                TransferEvent::Chunk {
                    offset: 900,
                    total: 1000
                },
                TransferEvent::Chunk {
                    offset: 1000,
                    total: 1000
                },
                TransferEvent::Complete { total: 1000 },
            ]
        );
    }

    #[test]
    fn test_read_retries_dropped_response() {
        let (session, probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());
        probe.inject(Fault::DropResponse);

        let summary = BulkTransfer::new(3)
            .read(&spi_flash, 512, 512, &mut Vec::new(), |_| {})
            .unwrap();

        assert_eq!(summary.retries, 1);
        assert_eq!(probe.flash_read_sizes(), vec![512, 512]);
    }

    #[test]
    fn test_late_response_not_taken_for_retry_answer() {
        let image = patterned_image(16);
        let mut flash = SimulatedFlash::new(16);
        flash.load(0, &image);
        let (session, probe) = spi_session(flash);
        let spi_flash = SpiFlash::new(&session, &fast_config());
        probe.inject(Fault::LateResponse);

        let mut out = Vec::new();
        let summary = BulkTransfer::new(3)
            .read(&spi_flash, 16, 4, &mut out, |_| {})
            .unwrap();

        assert_eq!(out, image);
        assert_eq!(summary.retries, 1);
        assert_eq!(probe.flash_read_sizes(), vec![4, 4, 4, 4, 4]);
    }

    #[test]
    fn test_long_read_is_protocol_error() {
        let (session, probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());
        probe.inject(Fault::LongRead(3));

        let err = BulkTransfer::new(3)
            .read(&spi_flash, 512, 512, &mut Vec::new(), |_| {})
            .unwrap_err();

        assert!(matches!(
            err.root_cause(),
            BpioError::LongRead {
                expected: 512,
                actual: 515,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(probe.flash_read_sizes().len(), 1);
    }

    #[test]
    fn test_read_timeout_retry_bound() {
        let (session, probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());
        probe.set_unresponsive(true);
        let before = probe.write_count();

        let mut events = Vec::new();
        let err = BulkTransfer::new(3)
            .read(&spi_flash, 1024, 512, &mut Vec::new(), |e| events.push(e))
            .unwrap_err();

        assert_eq!(probe.write_count() - before, 4);
        assert!(matches!(err, BpioError::Transfer { attempts: 4, offset: 0, .. }));
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(
            events,
            vec![TransferEvent::Failed {
                offset: 0,
                total: 1024
            }]
        );
    }

    #[test]
    fn test_short_read_is_not_retried() {
        let (session, probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());
        probe.inject(Fault::ShortRead(10));

        let mut out = Vec::new();
        let err = BulkTransfer::new(3)
            .read(&spi_flash, 1024, 512, &mut out, |_| {})
            .unwrap_err();

        assert!(matches!(
            err.root_cause(),
            BpioError::ShortRead {
                expected: 512,
                actual: 502,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(probe.flash_read_sizes().len(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn test_streaming_read_keeps_completed_chunks() {
        let (session, probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());

        let mut out = Vec::new();
        let mut failed_at = None;
        let result = BulkTransfer::new(0).read(&spi_flash, 2048, 512, &mut out, |event| {
            if let TransferEvent::Chunk { offset: 1024, .. } = event {
                probe.inject(Fault::DropResponse);
            }
            if let TransferEvent::Failed { offset, .. } = event {
                failed_at = Some(offset);
            }
        });

        assert!(result.is_err());
        assert_eq!(out.len(), 1024);
        assert_eq!(failed_at, Some(1024));
    }

    #[test]
    fn test_write_erase_and_verify() {
        init_logging();
        let image = patterned_image(1000);
        let (session, probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());

        let mut events = Vec::new();
        let summary = BulkTransfer::new(3)
            .write(
                &spi_flash,
                &image,
                WriteOptions {
                    chunk_size: 256,
                    erase: true,
                    verify: true,
                },
                |e| events.push(e),
            )
            .unwrap();

        assert_eq!(probe.flash_contents(0, 1000), image);
        assert_eq!(probe.chip_erase_count(), 1);
        assert!(summary.erased && summary.verified);
        assert_eq!(summary.chunks, 4);
        assert_eq!(events.first(), Some(&TransferEvent::Erasing));
        assert_eq!(events.last(), Some(&TransferEvent::Complete { total: 1000 }));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn test_write_splits_programs_at_page_boundaries() {
        let (session, probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());

        // 300 bytes at 200 cross into the next page after 56 bytes
        spi_flash.write_chunk(200, &[0x5A; 300]).unwrap();

        assert_eq!(probe.page_program_sizes(), vec![56, 244]);
        assert_eq!(probe.flash_contents(200, 300), vec![0x5A; 300]);
    }

    #[test]
    fn test_verify_mismatch_reports_offset() {
        let image = patterned_image(1024);
        let mut flash = SimulatedFlash::new(4096);
        flash.corrupt_reads_at(700);
        let (session, _probe) = spi_session(flash);
        let spi_flash = SpiFlash::new(&session, &fast_config());

        let mut events = Vec::new();
        let err = BulkTransfer::new(3)
            .write(
                &spi_flash,
                &image,
                WriteOptions {
                    chunk_size: 256,
                    erase: false,
                    verify: true,
                },
                |e| events.push(e),
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Verification);
        match err.root_cause() {
            BpioError::Verification {
                offset,
                chunk_offset,
                chunk_len,
                expected,
                actual,
            } => {
                assert_eq!(*offset, 700);
                assert_eq!(*chunk_offset, 512);
                assert_eq!(*chunk_len, 256);
                assert_eq!(*expected, image[700]);
                assert_eq!(*actual, image[700] ^ 0xFF);
            }
            other => panic!("expected verification error, got {:?}", other),
        }
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Failed {
                offset: 512,
                total: 1024
            })
        );
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransferEvent::Complete { .. })));
    }

    #[test]
    fn test_write_without_verify_ignores_read_back() {
        let mut flash = SimulatedFlash::new(4096);
        flash.corrupt_reads_at(10);
        let (session, probe) = spi_session(flash);
        let spi_flash = SpiFlash::new(&session, &fast_config());

        let summary = BulkTransfer::new(3)
            .write(
                &spi_flash,
                &[0x11; 64],
                WriteOptions {
                    chunk_size: 64,
                    erase: false,
                    verify: false,
                },
                |_| {},
            )
            .unwrap();

        assert!(!summary.verified);
        assert!(probe.flash_read_sizes().is_empty());
    }

    #[test]
    fn test_write_timeout_retry_bound_with_mock_flash() {
        let mut flash = MockFlashAccess::new();
        flash.expect_write_chunk().times(4).returning(|_, _| {
            Err(BpioError::Timeout {
                operation: "page program to finish".into(),
                timeout_ms: 1,
            })
        });
        flash.expect_read_chunk().times(0);
        flash.expect_erase_chip().times(0);

        let err = BulkTransfer::new(3)
            .write(
                &flash,
                &[0u8; 100],
                WriteOptions {
                    chunk_size: 100,
                    erase: false,
                    verify: true,
                },
                |_| {},
            )
            .unwrap_err();

        assert!(matches!(err, BpioError::Transfer { attempts: 4, .. }));
    }

    #[test]
    fn test_retried_chunk_is_retried_whole() {
        let mut flash = MockFlashAccess::new();
        let mut calls = 0;
        flash
            .expect_write_chunk()
            .times(3)
            .returning(move |address, data| {
                calls += 1;
                if calls == 2 {
                    return Err(BpioError::link(
                        "write",
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "stall"),
                    ));
                }
                assert_eq!(address % 128, 0);
                assert_eq!(data.len(), 128);
                Ok(())
            });
        flash
            .expect_read_chunk()
            .returning(|_, len| Ok(vec![0xAB; len]));

        let summary = BulkTransfer::new(3)
            .write(
                &flash,
                &[0xAB; 256],
                WriteOptions {
                    chunk_size: 128,
                    erase: false,
                    verify: true,
                },
                |_| {},
            )
            .unwrap();

        assert_eq!(summary.retries, 1);
        assert_eq!(summary.chunks, 2);
    }

    #[test]
    fn test_erase_busy_timeout() {
        let mut flash = SimulatedFlash::new(4096);
        flash.set_erase_busy_polls(u32::MAX);
        let (session, _probe) = spi_session(flash);
        let config = ClientConfig {
            erase_timeout_ms: 20,
            erase_poll_ms: 1,
            ..ClientConfig::default()
        };
        let spi_flash = SpiFlash::new(&session, &config);

        let err = spi_flash.erase_chip().unwrap_err();
        assert!(matches!(err, BpioError::Timeout { timeout_ms: 20, .. }));
    }

    #[test]
    fn test_invalid_jobs_rejected_before_io() {
        let flash = MockFlashAccess::new();
        let bulk = BulkTransfer::new(3);

        assert!(bulk
            .read(&flash, 100, 0, &mut Vec::new(), |_| {})
            .is_err());
        assert!(bulk
            .read(&flash, MAX_FLASH_ADDRESS_SPACE + 1, 512, &mut Vec::new(), |_| {})
            .is_err());
    }

    #[test]
    fn test_empty_read_completes_immediately() {
        let flash = MockFlashAccess::new();
        let mut events = Vec::new();
        let summary = BulkTransfer::new(3)
            .read(&flash, 0, 512, &mut Vec::new(), |e| events.push(e))
            .unwrap();

        assert_eq!(summary.chunks, 0);
        assert_eq!(events, vec![TransferEvent::Complete { total: 0 }]);
    }

    #[test]
    fn test_jedec_id() {
        let (session, _probe) = spi_session(SimulatedFlash::new(4096));
        let spi_flash = SpiFlash::new(&session, &fast_config());
        assert_eq!(spi_flash.jedec_id().unwrap(), SimulatedFlash::JEDEC_ID);
    }
}
