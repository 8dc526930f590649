use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::bpio::cobs::{self, FrameDecoder};
use crate::bpio::config::{FlashOpcode, IDLE_MODE_NAME, STATUS_WIP};
use crate::bpio::packet::{
    ConfigurationRequest, ConfigurationResponse, DataRequest, DataResponse, ErrorResponse,
    PostcardCodec, RequestContents, ResponseContents, ResponsePacket, StatusResponse,
};
use crate::bpio::{BpioError, BpioResult, Transport};

/// One-shot misbehavior applied to the next request the device receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Process the request but never answer it.
    DropResponse,
    /// Reject the request with an error response, without processing it.
    ErrorResponse(String),
    /// Answer a data request with this many bytes missing.
    ShortRead(usize),
    /// Answer a data request with this many extra bytes.
    LongRead(usize),
    /// Process the request but deliver the answer only after the client's
    /// next input clear, as if it crossed the client's timeout on the wire.
    LateResponse,
}

/// In-memory SPI NOR flash with standard command behavior.
#[derive(Debug, Clone)]
pub struct SimulatedFlash {
    memory: Vec<u8>,
    write_enabled: bool,
    busy_polls: u32,
    erase_busy_polls: u32,
    program_busy_polls: u32,
    corrupt_at: Option<usize>,
}

impl SimulatedFlash {
    pub const JEDEC_ID: [u8; 3] = [0xEF, 0x40, 0x18];

    /// Erased flash of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            memory: vec![0xFF; size],
            write_enabled: false,
            busy_polls: 0,
            erase_busy_polls: 3,
            program_busy_polls: 1,
            corrupt_at: None,
        }
    }

    /// Place raw bytes, bypassing program semantics.
    pub fn load(&mut self, address: usize, data: &[u8]) {
        self.memory[address..address + data.len()].copy_from_slice(data);
    }

    /// Every read covering `address` returns that byte inverted.
    pub fn corrupt_reads_at(&mut self, address: usize) {
        self.corrupt_at = Some(address);
    }

    /// Status polls that report busy after a chip erase.
    pub fn set_erase_busy_polls(&mut self, polls: u32) {
        self.erase_busy_polls = polls;
    }

    fn read(&self, address: usize, len: usize) -> Vec<u8> {
        (address..address + len)
            .map(|a| {
                let byte = self.memory.get(a).copied().unwrap_or(0xFF);
                if self.corrupt_at == Some(a) {
                    byte ^ 0xFF
                } else {
                    byte
                }
            })
            .collect()
    }

    fn status(&mut self) -> u8 {
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            STATUS_WIP
        } else {
            0
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    mode: String,
    flash: Option<SimulatedFlash>,
    outbound: VecDeque<u8>,
    late: Vec<u8>,
    ready_at: Option<Instant>,
    faults: VecDeque<Fault>,
    unresponsive: bool,
    closed: bool,

    write_count: usize,
    close_count: usize,
    requests: usize,
    overlapping: usize,
    flash_reads: Vec<usize>,
    page_programs: Vec<usize>,
    chip_erases: usize,
    last_data: Option<DataRequest>,
}

/// BPIO2 device simulator behind the [`Transport`] trait.
///
/// Decodes request frames as they are written and queues response frames
/// for reading. SPI mode data requests are interpreted as flash commands.
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
    decoder: FrameDecoder,
    response_delay: Duration,
}

/// Observer and fault injector sharing state with a [`SimulatedDevice`].
#[derive(Clone)]
pub struct DeviceProbe {
    state: Arc<Mutex<DeviceState>>,
}

fn lock(state: &Mutex<DeviceState>) -> MutexGuard<'_, DeviceState> {
    state.lock().expect("simulator state poisoned")
}

impl SimulatedDevice {
    pub fn new(flash: SimulatedFlash) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                mode: IDLE_MODE_NAME.to_string(),
                flash: Some(flash),
                ..Default::default()
            })),
            decoder: FrameDecoder::new(),
            response_delay: Duration::ZERO,
        }
    }

    /// Hold each response back for `delay` after its request arrives.
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn probe(&self) -> DeviceProbe {
        DeviceProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl Transport for SimulatedDevice {
    fn write(&mut self, data: &[u8]) -> BpioResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(BpioError::Closed {
                operation: "write".into(),
            });
        }
        state.write_count += 1;

        for &byte in data {
            let Some(frame) = self.decoder.feed(byte) else {
                continue;
            };
            let frame = frame.expect("client sent a malformed frame");

            state.requests += 1;
            if state.ready_at.is_some_and(|at| Instant::now() < at) {
                state.overlapping += 1;
            }
            if state.unresponsive {
                continue;
            }

            let request = PostcardCodec
                .decode_request(&frame)
                .expect("client sent an undecodable request");

            let late = state.faults.front() == Some(&Fault::LateResponse);
            if let Some(contents) = state.respond(request.contents) {
                let payload = PostcardCodec
                    .encode_response(&ResponsePacket { contents })
                    .expect("response encodes");
                let frame = cobs::encode(&payload);
                if late {
                    state.late.extend(frame);
                } else {
                    state.outbound.extend(frame);
                    state.ready_at = Some(Instant::now() + self.response_delay);
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> BpioResult<usize> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(BpioError::Closed {
                    operation: "read".into(),
                });
            }
            let ready = state.ready_at.map_or(true, |at| Instant::now() >= at);
            if ready && !state.outbound.is_empty() {
                let n = buffer.len().min(state.outbound.len());
                for (slot, byte) in buffer.iter_mut().zip(state.outbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }

        thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(0)
    }

    fn flush(&mut self) -> BpioResult<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> BpioResult<()> {
        let mut state = lock(&self.state);
        state.outbound.clear();
        // A held-back answer lands just after the clear
        let late = std::mem::take(&mut state.late);
        state.outbound.extend(late);
        Ok(())
    }

    fn close(&mut self) -> BpioResult<()> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.close_count += 1;
        Ok(())
    }
}

impl DeviceState {
    fn respond(&mut self, request: RequestContents) -> Option<ResponseContents> {
        let fault = self.faults.pop_front();

        if let Some(Fault::ErrorResponse(error)) = &fault {
            return Some(ResponseContents::Error(ErrorResponse {
                error: error.clone(),
            }));
        }

        let response = match request {
            RequestContents::Status(_) => ResponseContents::Status(self.status()),
            RequestContents::Configuration(config) => {
                ResponseContents::Configuration(self.configure(config))
            }
            RequestContents::Data(data) => ResponseContents::Data(self.data(data)),
        };

        match (fault, response) {
            (Some(Fault::DropResponse), _) => None,
            (Some(Fault::ShortRead(missing)), ResponseContents::Data(mut data)) => {
                let len = data.data_read.len().saturating_sub(missing);
                data.data_read.truncate(len);
                Some(ResponseContents::Data(data))
            }
            (Some(Fault::LongRead(extra)), ResponseContents::Data(mut data)) => {
                data.data_read.extend(std::iter::repeat(0xEE).take(extra));
                Some(ResponseContents::Data(data))
            }
            (_, response) => Some(response),
        }
    }

    fn status(&self) -> StatusResponse {
        StatusResponse {
            version_hardware_major: 5,
            version_hardware_minor: 10,
            version_firmware_major: 0,
            version_firmware_minor: 1,
            version_firmware_git_hash: "0123abc".into(),
            modes_available: ["HiZ", "1WIRE", "I2C", "SPI"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            mode_current: self.mode.clone(),
            mode_bitorder_msb: true,
            mode_max_packet_size: 640,
            mode_max_write: 512,
            mode_max_read: 512,
            adc_mv: vec![0; 8],
            ..Default::default()
        }
    }

    fn configure(&mut self, config: ConfigurationRequest) -> ConfigurationResponse {
        if let Some(mode) = config.mode {
            if !["HiZ", "1WIRE", "I2C", "SPI"].contains(&mode.as_str()) {
                return ConfigurationResponse {
                    error: Some(format!("Invalid mode name: {}", mode)),
                };
            }
            self.mode = mode;
        }
        ConfigurationResponse { error: None }
    }

    fn data(&mut self, request: DataRequest) -> DataResponse {
        self.last_data = Some(request.clone());
        let read_len = request.bytes_read as usize;

        if self.mode != "SPI" {
            return DataResponse {
                error: None,
                data_read: vec![0; read_len],
            };
        }

        let Some(flash) = self.flash.as_mut() else {
            return DataResponse::default();
        };

        let write = request.data_write.as_slice();

        let data_read = match write.first().copied() {
            Some(op) if op == FlashOpcode::JedecId as u8 => {
                let mut id = SimulatedFlash::JEDEC_ID.to_vec();
                id.resize(read_len, 0);
                id
            }
            Some(op) if op == FlashOpcode::ReadStatus as u8 => {
                (0..read_len).map(|_| flash.status()).collect()
            }
            Some(op) if op == FlashOpcode::WriteEnable as u8 => {
                flash.write_enabled = true;
                Vec::new()
            }
            Some(op) if op == FlashOpcode::Read as u8 && write.len() >= 4 => {
                self.flash_reads.push(read_len);
                flash.read(flash_address(write), read_len)
            }
            Some(op) if op == FlashOpcode::PageProgram as u8 && write.len() >= 4 => {
                if flash.write_enabled {
                    let start = flash_address(write);
                    let data = &write[4..];
                    for (i, byte) in data.iter().enumerate() {
                        if let Some(cell) = flash.memory.get_mut(start + i) {
                            *cell &= *byte;
                        }
                    }
                    self.page_programs.push(data.len());
                    flash.busy_polls = flash.program_busy_polls;
                    flash.write_enabled = false;
                }
                Vec::new()
            }
            Some(op) if op == FlashOpcode::ChipErase as u8 => {
                if flash.write_enabled {
                    flash.memory.iter_mut().for_each(|b| *b = 0xFF);
                    self.chip_erases += 1;
                    flash.busy_polls = flash.erase_busy_polls;
                    flash.write_enabled = false;
                }
                Vec::new()
            }
            _ => vec![0; read_len],
        };

        DataResponse {
            error: None,
            data_read,
        }
    }
}

/// 24-bit address following a flash opcode.
fn flash_address(command: &[u8]) -> usize {
    ((command[1] as usize) << 16) | ((command[2] as usize) << 8) | command[3] as usize
}

impl DeviceProbe {
    /// Queue a fault for the next request.
    pub fn inject(&self, fault: Fault) {
        lock(&self.state).faults.push_back(fault);
    }

    /// Swallow all further requests without answering.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        lock(&self.state).unresponsive = unresponsive;
    }

    pub fn device_mode(&self) -> String {
        lock(&self.state).mode.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).write_count
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).close_count
    }

    pub fn request_count(&self) -> usize {
        lock(&self.state).requests
    }

    /// Requests that arrived before the previous response was ready.
    pub fn overlapping_requests(&self) -> usize {
        lock(&self.state).overlapping
    }

    /// Byte counts of every flash read command, in order.
    pub fn flash_read_sizes(&self) -> Vec<usize> {
        lock(&self.state).flash_reads.clone()
    }

    /// Byte counts of every page program command, in order.
    pub fn page_program_sizes(&self) -> Vec<usize> {
        lock(&self.state).page_programs.clone()
    }

    pub fn chip_erase_count(&self) -> usize {
        lock(&self.state).chip_erases
    }

    pub fn last_data_request(&self) -> Option<DataRequest> {
        lock(&self.state).last_data.clone()
    }

    /// Raw flash contents, ignoring read corruption.
    pub fn flash_contents(&self, address: usize, len: usize) -> Vec<u8> {
        lock(&self.state)
            .flash
            .as_ref()
            .map(|f| f.memory[address..address + len].to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_only_clears_bits() {
        let mut state = DeviceState {
            mode: "SPI".into(),
            flash: Some(SimulatedFlash::new(16)),
            ..Default::default()
        };
        let program = |data: Vec<u8>| DataRequest {
            data_write: [vec![0x02, 0, 0, 0], data].concat(),
            ..Default::default()
        };
        let enable = DataRequest {
            data_write: vec![0x06],
            ..Default::default()
        };

        state.data(enable.clone());
        state.data(program(vec![0x0F]));
        state.data(enable);
        state.data(program(vec![0xF1]));

        assert_eq!(state.flash.unwrap().memory[0], 0x01);
    }

    #[test]
    fn test_program_without_write_enable_is_ignored() {
        let mut state = DeviceState {
            mode: "SPI".into(),
            flash: Some(SimulatedFlash::new(16)),
            ..Default::default()
        };
        state.data(DataRequest {
            data_write: vec![0x02, 0, 0, 0, 0x00],
            ..Default::default()
        });
        assert_eq!(state.flash.unwrap().memory[0], 0xFF);
    }
}
