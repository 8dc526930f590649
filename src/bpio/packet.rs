//! BPIO2 message types and the codec seam.
//!
//! Requests and responses travel inside versioned envelopes. The schema
//! encoding itself sits behind [`MessageCodec`]; the engine only needs
//! `serialize(request) -> bytes` and `deserialize(bytes) -> response`, and
//! pairs responses to requests by [`MessageKind`].

use serde::{Deserialize, Serialize};

use super::config::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use super::error::{BpioError, BpioResult};

// ============================================================================
// Correlation
// ============================================================================

/// Message type identifier used to pair a response with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Error,
    Status,
    Configuration,
    Data,
}

// ============================================================================
// Requests
// ============================================================================

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPacket {
    pub version_major: u8,
    pub version_minor: u16,
    pub contents: RequestContents,
}

impl RequestPacket {
    /// Wrap request contents in an envelope for the current protocol version.
    pub fn new(contents: RequestContents) -> Self {
        Self {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            contents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestContents {
    Status(StatusRequest),
    Configuration(ConfigurationRequest),
    Data(DataRequest),
}

impl RequestContents {
    /// The response type the device answers this request with.
    pub fn expected_response(&self) -> MessageKind {
        match self {
            RequestContents::Status(_) => MessageKind::Status,
            RequestContents::Configuration(_) => MessageKind::Configuration,
            RequestContents::Data(_) => MessageKind::Data,
        }
    }

    /// Short name for logs and error context.
    pub fn name(&self) -> &'static str {
        match self {
            RequestContents::Status(_) => "status request",
            RequestContents::Configuration(_) => "configuration request",
            RequestContents::Data(_) => "data request",
        }
    }
}

/// Sections of device status to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusQuery {
    All,
    Version,
    Mode,
    Pullup,
    Psu,
    Adc,
    Io,
    Disk,
    Led,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRequest {
    pub query: Vec<StatusQuery>,
}

impl StatusRequest {
    pub fn all() -> Self {
        Self {
            query: vec![StatusQuery::All],
        }
    }
}

/// Bus parameters sent with a mode change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeConfiguration {
    /// Bus clock in Hz.
    pub speed: u32,
    pub data_bits: u8,
    pub clock_polarity: bool,
    pub clock_phase: bool,
    /// Chip-select level while idle (true = high).
    pub chip_select_idle: bool,
    pub clock_stretch: bool,
}

/// Power supply request: enable at a voltage/current limit, or disable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PsuSetting {
    Enable { millivolts: u32, milliamps: u16 },
    Disable,
}

/// Device configuration. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationRequest {
    /// Mode to switch to, by device mode name.
    pub mode: Option<String>,
    pub mode_configuration: Option<ModeConfiguration>,
    pub mode_bitorder_msb: Option<bool>,
    pub psu: Option<PsuSetting>,
    pub pullup_enable: Option<bool>,
    /// One 0xRRGGBB value per LED.
    pub led_color: Vec<u32>,
    /// Text echoed to the device terminal when BPIO debugging is on.
    pub print_string: Option<String>,
}

/// One bus transaction: optional start, write, read, optional stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub start_main: bool,
    pub start_alt: bool,
    pub data_write: Vec<u8>,
    pub bytes_read: u16,
    pub stop_main: bool,
    pub stop_alt: bool,
}

// ============================================================================
// Responses
// ============================================================================

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePacket {
    pub contents: ResponseContents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseContents {
    Error(ErrorResponse),
    Status(StatusResponse),
    Configuration(ConfigurationResponse),
    Data(DataResponse),
}

impl ResponseContents {
    pub fn kind(&self) -> MessageKind {
        match self {
            ResponseContents::Error(_) => MessageKind::Error,
            ResponseContents::Status(_) => MessageKind::Status,
            ResponseContents::Configuration(_) => MessageKind::Configuration,
            ResponseContents::Data(_) => MessageKind::Data,
        }
    }

    /// Error text the device attached to this response, if any.
    pub fn error(&self) -> Option<&str> {
        let error = match self {
            ResponseContents::Error(r) => Some(r.error.as_str()),
            ResponseContents::Status(r) => r.error.as_deref(),
            ResponseContents::Configuration(r) => r.error.as_deref(),
            ResponseContents::Data(r) => r.error.as_deref(),
        };
        error.filter(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub error: Option<String>,
    pub version_hardware_major: u32,
    pub version_hardware_minor: u32,
    pub version_firmware_major: u32,
    pub version_firmware_minor: u32,
    pub version_firmware_git_hash: String,
    pub version_firmware_date: String,
    pub modes_available: Vec<String>,
    pub mode_current: String,
    pub mode_pin_labels: Vec<String>,
    pub mode_bitorder_msb: bool,
    pub mode_max_packet_size: u32,
    pub mode_max_write: u32,
    pub mode_max_read: u32,
    pub psu_enabled: bool,
    pub psu_set_mv: u32,
    pub psu_set_ma: u32,
    pub psu_measured_mv: u32,
    pub psu_measured_ma: u32,
    pub psu_current_error: bool,
    pub pullup_enabled: bool,
    /// Millivolts per IO pin.
    pub adc_mv: Vec<u32>,
    /// Bit n set = IOn is an output.
    pub io_direction: u8,
    /// Bit n set = IOn is high.
    pub io_value: u8,
    pub disk_size_mb: Option<f32>,
    pub disk_used_mb: Option<f32>,
    pub led_count: Option<u32>,
}

impl StatusResponse {
    /// Firmware version as `major.minor`.
    pub fn firmware_version(&self) -> String {
        format!(
            "{}.{}",
            self.version_firmware_major, self.version_firmware_minor
        )
    }

    /// Whether IO pin `pin` is configured as an output.
    pub fn io_is_output(&self, pin: u8) -> bool {
        pin < 8 && (self.io_direction >> pin) & 1 == 1
    }

    /// Whether IO pin `pin` reads high.
    pub fn io_is_high(&self, pin: u8) -> bool {
        pin < 8 && (self.io_value >> pin) & 1 == 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationResponse {
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    pub error: Option<String>,
    pub data_read: Vec<u8>,
}

// ============================================================================
// Codec
// ============================================================================

/// Schema encoding for request and response envelopes.
pub trait MessageCodec: Send + Sync {
    /// Encode a request envelope into payload bytes.
    fn serialize(&self, request: &RequestPacket) -> BpioResult<Vec<u8>>;

    /// Decode payload bytes into a response envelope.
    fn deserialize(&self, payload: &[u8]) -> BpioResult<ResponsePacket>;
}

/// Serde/postcard encoding of the message types above.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl MessageCodec for PostcardCodec {
    fn serialize(&self, request: &RequestPacket) -> BpioResult<Vec<u8>> {
        postcard::to_allocvec(request).map_err(|e| BpioError::Encode(e.to_string()))
    }

    fn deserialize(&self, payload: &[u8]) -> BpioResult<ResponsePacket> {
        postcard::from_bytes(payload).map_err(|e| BpioError::Decode(e.to_string()))
    }
}

impl PostcardCodec {
    /// Decode a request envelope. Device-side counterpart of `serialize`.
    pub fn decode_request(&self, payload: &[u8]) -> BpioResult<RequestPacket> {
        postcard::from_bytes(payload).map_err(|e| BpioError::Decode(e.to_string()))
    }

    /// Encode a response envelope. Device-side counterpart of `deserialize`.
    pub fn encode_response(&self, response: &ResponsePacket) -> BpioResult<Vec<u8>> {
        postcard::to_allocvec(response).map_err(|e| BpioError::Encode(e.to_string()))
    }
}
