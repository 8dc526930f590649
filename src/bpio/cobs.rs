//! COBS (Consistent Overhead Byte Stuffing) framing.
//!
//! Every frame on the wire is the COBS encoding of one message payload
//! followed by a single `0x00` delimiter. The encoding never emits `0x00`,
//! so the delimiter is an unambiguous frame boundary on a byte stream.
//! See: Cheshire & Baker, "Consistent Overhead Byte Stuffing", 1999.

use super::config::{FRAME_DELIMITER, MAX_FRAME_SIZE};
use super::error::{BpioError, BpioResult};

/// Longest block a single code byte can describe.
const MAX_BLOCK_CODE: u8 = 0xFF;

/// Worst-case encoded length for `len` payload bytes, delimiter included.
pub fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 2
}

/// Encode a payload into a complete frame, delimiter included.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(max_encoded_len(data.len()));

    // Placeholder for the first code byte
    let mut code_index = 0;
    encoded.push(0);
    let mut code: u8 = 1;

    for &byte in data {
        if byte == FRAME_DELIMITER {
            encoded[code_index] = code;
            code_index = encoded.len();
            encoded.push(0);
            code = 1;
            continue;
        }

        encoded.push(byte);
        code += 1;

        if code == MAX_BLOCK_CODE {
            encoded[code_index] = code;
            code_index = encoded.len();
            encoded.push(0);
            code = 1;
        }
    }

    encoded[code_index] = code;
    encoded.push(FRAME_DELIMITER);

    encoded
}

/// Decode the body of one frame (delimiter already stripped).
pub fn decode(frame: &[u8]) -> BpioResult<Vec<u8>> {
    if frame.is_empty() {
        return Err(BpioError::InvalidFrame {
            reason: "empty frame".into(),
        });
    }

    let mut decoded = Vec::with_capacity(frame.len());
    let mut index = 0;

    while index < frame.len() {
        let code = frame[index];
        if code == FRAME_DELIMITER {
            return Err(BpioError::InvalidFrame {
                reason: format!("zero code byte at index {}", index),
            });
        }

        let block_end = index + code as usize;
        if block_end > frame.len() {
            return Err(BpioError::InvalidFrame {
                reason: format!(
                    "code 0x{:02X} at index {} overruns {}-byte frame",
                    code,
                    index,
                    frame.len()
                ),
            });
        }

        let block = &frame[index + 1..block_end];
        if block.contains(&FRAME_DELIMITER) {
            return Err(BpioError::InvalidFrame {
                reason: "delimiter inside frame body".into(),
            });
        }
        decoded.extend_from_slice(block);
        index = block_end;

        // A short block stands for a zero, except after the last block
        if code != MAX_BLOCK_CODE && index < frame.len() {
            decoded.push(FRAME_DELIMITER);
        }
    }

    Ok(decoded)
}

/// Streaming COBS decoder for incremental parsing.
///
/// Bytes are buffered until a delimiter arrives, then the buffered frame is
/// decoded and the buffer starts over. Repeated delimiters are idle fill and
/// produce nothing.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder that rejects frames longer than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            max_frame_size,
            discarding: false,
        }
    }

    /// Feed a byte to the decoder.
    ///
    /// # Returns
    /// - `Some(Ok(payload))` when a delimiter completes a valid frame
    /// - `Some(Err(e))` when the completed frame is malformed or too large
    /// - `None` if more data is needed
    pub fn feed(&mut self, byte: u8) -> Option<BpioResult<Vec<u8>>> {
        if byte == FRAME_DELIMITER {
            if self.discarding {
                // Oversized frame ends here; resynchronized.
                self.discarding = false;
                return None;
            }
            if self.buffer.is_empty() {
                return None;
            }
            let frame = std::mem::take(&mut self.buffer);
            return Some(decode(&frame));
        }

        if self.discarding {
            return None;
        }

        if self.buffer.len() >= self.max_frame_size {
            let size = self.buffer.len();
            self.buffer.clear();
            self.discarding = true;
            return Some(Err(BpioError::FrameTooLarge {
                size,
                max_size: self.max_frame_size,
            }));
        }

        self.buffer.push(byte);
        None
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Check if the decoder holds part of a frame.
    pub fn in_frame(&self) -> bool {
        !self.buffer.is_empty() || self.discarding
    }

    /// Get the current buffer length.
    #[cfg(test)]
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
