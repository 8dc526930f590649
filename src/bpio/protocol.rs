//! Request/response engine for BPIO2.
//!
//! The protocol is strictly half-duplex: one framed request goes out, one
//! framed response comes back. The engine owns the transport and the frame
//! decoder behind a single lock, so a second caller cannot start writing
//! until the first exchange has its response or has failed.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::cobs::{self, FrameDecoder};
use super::error::{BpioError, BpioResult, ErrorKind};
use super::packet::{MessageCodec, MessageKind, RequestContents, RequestPacket, ResponseContents};
use super::transport::Transport;

/// Size of the scratch buffer for each transport read.
const READ_BUFFER_SIZE: usize = 512;

/// Transport and decoder state guarded by the exchange lock.
struct Link<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    closed: bool,
}

impl<T: Transport> Link<T> {
    /// Drop partial frames and pending input after a failed exchange.
    fn resynchronize(&mut self) {
        self.decoder.reset();
        if let Err(e) = self.transport.clear_input() {
            log::warn!("Failed to clear input while resynchronizing: {}", e);
        }
    }

    fn round_trip(
        &mut self,
        operation: &str,
        frame: &[u8],
        timeout: Duration,
    ) -> BpioResult<Vec<u8>> {
        self.transport.write(frame)?;
        self.transport.flush()?;
        self.wait_for_frame(operation, timeout)
    }

    /// Read until the decoder yields one frame or the deadline passes.
    fn wait_for_frame(&mut self, operation: &str, timeout: Duration) -> BpioResult<Vec<u8>> {
        let start = Instant::now();
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        while start.elapsed() < timeout {
            let remaining = timeout.saturating_sub(start.elapsed());
            let bytes_read = self.transport.read(&mut buffer, remaining)?;

            if bytes_read == 0 {
                continue;
            }

            for (i, &byte) in buffer[..bytes_read].iter().enumerate() {
                if let Some(result) = self.decoder.feed(byte) {
                    let trailing = bytes_read - i - 1;
                    if trailing > 0 {
                        log::debug!(
                            "Discarding {} byte(s) after {} response frame",
                            trailing,
                            operation
                        );
                    }
                    return result;
                }
            }
        }

        Err(BpioError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

/// Half-duplex exchange engine over a [`Transport`].
pub struct RequestEngine<T: Transport> {
    link: Mutex<Link<T>>,
    codec: Box<dyn MessageCodec>,
}

impl<T: Transport> RequestEngine<T> {
    /// Create an engine that owns `transport` and encodes with `codec`.
    pub fn new(transport: T, codec: Box<dyn MessageCodec>) -> Self {
        Self {
            link: Mutex::new(Link {
                transport,
                decoder: FrameDecoder::new(),
                closed: false,
            }),
            codec,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Link<T>> {
        // A panic mid-exchange leaves nothing half-updated that resync can't fix
        self.link.lock().unwrap_or_else(|poisoned| {
            let mut link = poisoned.into_inner();
            link.decoder.reset();
            link
        })
    }

    /// Send one payload and wait for exactly one response payload.
    ///
    /// Holds the exchange lock for the whole round trip. On any failure the
    /// decoder and pending input are discarded so the next exchange starts
    /// on a frame boundary.
    pub fn exchange_raw(
        &self,
        operation: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> BpioResult<Vec<u8>> {
        self.transact(operation, payload, timeout, Ok)
    }

    /// Send a typed request and return its correlated response.
    ///
    /// The response must be of the kind paired with the request. A device
    /// error response or a non-empty error field becomes a `Device` error.
    pub fn exchange(
        &self,
        request: RequestContents,
        timeout: Duration,
    ) -> BpioResult<ResponseContents> {
        let operation = request.name();
        let expected = request.expected_response();

        let payload = self.codec.serialize(&RequestPacket::new(request))?;
        self.transact(operation, &payload, timeout, |response_bytes| {
            self.correlate(operation, expected, &response_bytes)
        })
    }

    /// One locked round trip followed by `parse` on the response payload.
    ///
    /// Input that arrived before the request is discarded first: it can only
    /// be a response to an earlier request that already gave up. Transport
    /// failures and unusable responses leave the link resynchronized.
    fn transact<R>(
        &self,
        operation: &str,
        payload: &[u8],
        timeout: Duration,
        parse: impl FnOnce(Vec<u8>) -> BpioResult<R>,
    ) -> BpioResult<R> {
        let mut link = self.lock();

        if link.closed {
            return Err(BpioError::Closed {
                operation: operation.to_string(),
            });
        }

        if link.decoder.in_frame() {
            log::debug!("Dropping partial frame before {}", operation);
        }
        link.decoder.reset();
        link.transport.clear_input()?;

        let frame = cobs::encode(payload);
        log::trace!(
            "{}: sending {} byte payload as {} byte frame",
            operation,
            payload.len(),
            frame.len()
        );

        let result = link
            .round_trip(operation, &frame, timeout)
            .and_then(parse);

        if let Err(e) = &result {
            match e {
                BpioError::Timeout { timeout_ms, .. } => {
                    log::warn!("{} timed out after {}ms, resynchronizing", operation, timeout_ms)
                }
                other => log::warn!("{} failed: {}", operation, other),
            }
            if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Link | ErrorKind::Protocol) {
                link.resynchronize();
            }
        }
        result
    }

    fn correlate(
        &self,
        operation: &str,
        expected: MessageKind,
        response_bytes: &[u8],
    ) -> BpioResult<ResponseContents> {
        let contents = self
            .codec
            .deserialize(response_bytes)
            .map_err(|e| BpioError::Protocol {
                operation: operation.to_string(),
                reason: e.to_string(),
            })?
            .contents;

        if contents.kind() == MessageKind::Error {
            let message = contents.error().unwrap_or("unspecified error").to_string();
            return Err(BpioError::Device {
                operation: operation.to_string(),
                message,
            });
        }

        if contents.kind() != expected {
            return Err(BpioError::UnexpectedResponse {
                operation: operation.to_string(),
                expected,
                actual: contents.kind(),
            });
        }

        if let Some(message) = contents.error() {
            return Err(BpioError::Device {
                operation: operation.to_string(),
                message: message.to_string(),
            });
        }

        Ok(contents)
    }

    /// Whether the transport has been released.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Release the transport. Only the first call reaches the transport.
    pub fn close(&self) -> BpioResult<()> {
        let mut link = self.lock();
        if link.closed {
            return Ok(());
        }
        link.closed = true;
        link.decoder.reset();
        link.transport.close()
    }
}
