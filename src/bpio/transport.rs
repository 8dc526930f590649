//! Serial transport layer for BPIO2 communication.
//!
//! Provides a trait-based abstraction over serial communication,
//! enabling both real hardware and simulated devices in tests.

use std::io::Read;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use serialport::SerialPort;

use super::config::{BPIO_BAUD_RATE, SERIAL_READ_TIMEOUT};
use super::error::{BpioError, BpioResult};

/// Trait for byte-stream transport operations.
///
/// Implementations know nothing about framing or messages. A read that sees
/// no data before its timeout reports zero bytes; real failures are errors.
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    /// Write all of `data` to the transport.
    fn write(&mut self, data: &[u8]) -> BpioResult<()>;

    /// Read available data, waiting at most `timeout`.
    ///
    /// # Returns
    /// Number of bytes read, 0 on timeout
    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> BpioResult<usize>;

    /// Read a single byte, failing with `Timeout` if none arrives in time.
    fn read_byte(&mut self, timeout: Duration) -> BpioResult<u8> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte, timeout)? {
            0 => Err(BpioError::Timeout {
                operation: "read_byte".into(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            _ => Ok(byte[0]),
        }
    }

    /// Flush any buffered output.
    fn flush(&mut self) -> BpioResult<()>;

    /// Discard any pending input data from the receive buffer.
    fn clear_input(&mut self) -> BpioResult<()>;

    /// Release the underlying handle. Later calls fail with `Closed`.
    fn close(&mut self) -> BpioResult<()>;
}

/// Serial port transport implementation.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    port_name: String,
}

impl SerialTransport {
    /// Open a serial port at the standard BPIO2 baud rate.
    pub fn open(port_name: &str) -> BpioResult<Self> {
        Self::open_with_baud(port_name, BPIO_BAUD_RATE)
    }

    /// Open a serial port with a specific baud rate.
    pub fn open_with_baud(port_name: &str, baud_rate: u32) -> BpioResult<Self> {
        let normalized_name = normalize_port_name(port_name);

        let port = serialport::new(&normalized_name, baud_rate)
            .timeout(SERIAL_READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| classify_open_error(port_name, e))?;

        // Stale bytes from a previous session would desync the first frame
        port.clear(serialport::ClearBuffer::Input).ok();

        log::info!("Opened serial port {} at {} baud", normalized_name, baud_rate);

        Ok(Self {
            port: Some(port),
            port_name: normalized_name,
        })
    }

    /// Name of the port this transport was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn port(&mut self, operation: &str) -> BpioResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(|| BpioError::Closed {
            operation: operation.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> BpioResult<()> {
        use std::io::Write;

        self.port("write")?
            .write_all(data)
            .map_err(|e| BpioError::link("write", e))
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> BpioResult<usize> {
        let port = self.port("read")?;
        port.set_timeout(timeout)?;

        match port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(BpioError::link("read", e)),
        }
    }

    fn flush(&mut self) -> BpioResult<()> {
        use std::io::Write;

        self.port("flush")?
            .flush()
            .map_err(|e| BpioError::link("flush", e))
    }

    fn clear_input(&mut self) -> BpioResult<()> {
        self.port("clear_input")?
            .clear(serialport::ClearBuffer::Input)
            .map_err(BpioError::from)
    }

    fn close(&mut self) -> BpioResult<()> {
        if self.port.take().is_some() {
            log::info!("Closed serial port {}", self.port_name);
        }
        Ok(())
    }
}

/// Map a port-open failure to the most specific error.
fn classify_open_error(port_name: &str, e: serialport::Error) -> BpioError {
    let err_str = e.to_string().to_lowercase();

    match e.kind() {
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => BpioError::NoDeviceFound {
            port: port_name.to_string(),
        },
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            BpioError::PortPermissionDenied {
                port: port_name.to_string(),
            }
        }
        _ if err_str.contains("busy") || err_str.contains("in use") => BpioError::PortBusy {
            port: port_name.to_string(),
        },
        _ => BpioError::link("open", e.into()),
    }
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}
