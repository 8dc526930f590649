//! Bus mode tracking and gating.
//!
//! The device runs one bus mode at a time. [`ModeSession`] mirrors that mode
//! locally so bus operations issued outside their mode fail before anything
//! is written to the link.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::IDLE_MODE_NAME;
use super::error::{BpioError, BpioResult};
use super::packet::{
    ConfigurationRequest, DataRequest, DataResponse, MessageKind, RequestContents,
    ResponseContents, StatusRequest, StatusResponse,
};
use super::protocol::RequestEngine;
use super::transport::Transport;

/// Bus master modes the client drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModeKind {
    I2c,
    Spi,
    OneWire,
}

impl ModeKind {
    /// Mode name as the device spells it.
    pub fn device_name(&self) -> &'static str {
        match self {
            ModeKind::I2c => "I2C",
            ModeKind::Spi => "SPI",
            ModeKind::OneWire => "1WIRE",
        }
    }

    /// Parse a device mode name. Matching ignores ASCII case.
    pub fn from_device_name(name: &str) -> Option<Self> {
        [ModeKind::I2c, ModeKind::Spi, ModeKind::OneWire]
            .into_iter()
            .find(|kind| kind.device_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_name())
    }
}

/// Local view of the device's bus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    Idle,
    EnteringMode(ModeKind),
    InMode(ModeKind),
    ExitingMode(ModeKind),
}

impl ModeState {
    /// The active mode, if the session is settled in one.
    pub fn active(&self) -> Option<ModeKind> {
        match self {
            ModeState::InMode(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Whether a mode change is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ModeState::EnteringMode(_) | ModeState::ExitingMode(_))
    }
}

impl fmt::Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeState::Idle => f.write_str("idle"),
            ModeState::EnteringMode(kind) => write!(f, "entering {} mode", kind),
            ModeState::InMode(kind) => write!(f, "in {} mode", kind),
            ModeState::ExitingMode(kind) => write!(f, "exiting {} mode", kind),
        }
    }
}

/// Mode state machine layered on the request engine.
///
/// Lock order is always mode state first, then the engine's link lock. Mode
/// changes drop the state lock while their exchange runs and publish the
/// transitional state instead, so gated operations fail fast meanwhile.
pub struct ModeSession<T: Transport> {
    engine: RequestEngine<T>,
    state: Mutex<ModeState>,
    timeout: Duration,
}

impl<T: Transport> ModeSession<T> {
    /// Start an idle session over `engine`, using `timeout` per exchange.
    pub fn new(engine: RequestEngine<T>, timeout: Duration) -> Self {
        Self {
            engine,
            state: Mutex::new(ModeState::Idle),
            timeout,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ModeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ModeState) {
        *self.lock_state() = state;
    }

    fn ensure_open(&self, operation: &str) -> BpioResult<()> {
        if self.engine.is_closed() {
            return Err(BpioError::Closed {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Current mode state.
    pub fn state(&self) -> ModeState {
        *self.lock_state()
    }

    /// Deadline applied to each exchange.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Switch the device into `kind`, applying `request` in the same exchange.
    ///
    /// Allowed from idle or from another settled mode. On failure the session
    /// falls back to idle.
    pub fn enter_mode(&self, kind: ModeKind, mut request: ConfigurationRequest) -> BpioResult<()> {
        let operation = format!("enter {} mode", kind);

        {
            let mut state = self.lock_state();
            self.ensure_open(&operation)?;
            if state.is_transitioning() {
                return Err(BpioError::ModeBusy {
                    operation,
                    state: *state,
                });
            }
            *state = ModeState::EnteringMode(kind);
        }

        log::info!("Entering {} mode", kind);
        request.mode = Some(kind.device_name().to_string());

        match self
            .engine
            .exchange(RequestContents::Configuration(request), self.timeout)
        {
            Ok(_) => {
                self.set_state(ModeState::InMode(kind));
                log::info!("{} mode active", kind);
                Ok(())
            }
            Err(e) => {
                self.set_state(ModeState::Idle);
                log::warn!("Failed to enter {} mode: {}", kind, e);
                Err(e)
            }
        }
    }

    /// Return the device to its idle mode.
    ///
    /// A no-op when already idle. The session ends up idle whether or not
    /// the device acknowledged.
    pub fn exit_mode(&self) -> BpioResult<()> {
        let kind = {
            let mut state = self.lock_state();
            self.ensure_open("exit mode")?;
            match *state {
                ModeState::Idle => return Ok(()),
                ModeState::InMode(kind) => {
                    *state = ModeState::ExitingMode(kind);
                    kind
                }
                transitioning => {
                    return Err(BpioError::ModeBusy {
                        operation: "exit mode".into(),
                        state: transitioning,
                    })
                }
            }
        };

        log::info!("Exiting {} mode", kind);
        let result = self.send_exit();
        self.set_state(ModeState::Idle);

        match result {
            Ok(()) => {
                log::info!("Returned to {}", IDLE_MODE_NAME);
                Ok(())
            }
            Err(e) => {
                log::warn!("Exit from {} mode not acknowledged: {}", kind, e);
                Err(e)
            }
        }
    }

    fn send_exit(&self) -> BpioResult<()> {
        let request = ConfigurationRequest {
            mode: Some(IDLE_MODE_NAME.to_string()),
            ..Default::default()
        };
        self.engine
            .exchange(RequestContents::Configuration(request), self.timeout)
            .map(|_| ())
    }

    /// Query device status. Valid in any mode.
    pub fn status(&self) -> BpioResult<StatusResponse> {
        self.ensure_open("status request")?;
        match self
            .engine
            .exchange(RequestContents::Status(StatusRequest::all()), self.timeout)?
        {
            ResponseContents::Status(status) => Ok(status),
            other => Err(BpioError::UnexpectedResponse {
                operation: "status request".into(),
                expected: MessageKind::Status,
                actual: other.kind(),
            }),
        }
    }

    /// Apply settings that do not change the mode (PSU, pull-ups, LEDs...).
    pub fn configure(&self, request: ConfigurationRequest) -> BpioResult<()> {
        if let Some(mode) = &request.mode {
            return Err(BpioError::InvalidParameter {
                reason: format!(
                    "mode change to '{}' must go through enter_mode/exit_mode",
                    mode
                ),
            });
        }
        self.ensure_open("configuration request")?;
        self.engine
            .exchange(RequestContents::Configuration(request), self.timeout)
            .map(|_| ())
    }

    /// Send an arbitrary request.
    ///
    /// Mode changes are refused here so the local state cannot drift from
    /// the device. Data requests need some mode to be active.
    pub fn send_command(&self, request: RequestContents) -> BpioResult<ResponseContents> {
        let operation = request.name();

        match &request {
            RequestContents::Configuration(ConfigurationRequest {
                mode: Some(mode), ..
            }) => Err(BpioError::InvalidParameter {
                reason: format!(
                    "mode change to '{}' must go through enter_mode/exit_mode",
                    mode
                ),
            }),
            RequestContents::Data(_) => {
                let state = self.lock_state();
                self.ensure_open(operation)?;
                if state.active().is_none() {
                    return Err(BpioError::NoActiveMode {
                        operation: operation.to_string(),
                    });
                }
                self.engine.exchange(request, self.timeout)
            }
            _ => {
                self.ensure_open(operation)?;
                self.engine.exchange(request, self.timeout)
            }
        }
    }

    /// Run one bus transaction that is only valid in `kind` mode.
    ///
    /// The mode check and the exchange happen under the state lock, so the
    /// mode cannot change in between. A mismatch costs no I/O.
    pub fn data(
        &self,
        kind: ModeKind,
        operation: &str,
        request: DataRequest,
    ) -> BpioResult<DataResponse> {
        let state = self.lock_state();
        self.ensure_open(operation)?;

        if *state != ModeState::InMode(kind) {
            return Err(BpioError::WrongMode {
                operation: operation.to_string(),
                expected: kind,
                actual: *state,
            });
        }

        match self
            .engine
            .exchange(RequestContents::Data(request), self.timeout)?
        {
            ResponseContents::Data(response) => Ok(response),
            other => Err(BpioError::UnexpectedResponse {
                operation: operation.to_string(),
                expected: MessageKind::Data,
                actual: other.kind(),
            }),
        }
    }

    /// Check that `kind` is active without touching the link.
    pub fn require_mode(&self, kind: ModeKind, operation: &str) -> BpioResult<()> {
        let state = self.lock_state();
        self.ensure_open(operation)?;
        if *state != ModeState::InMode(kind) {
            return Err(BpioError::WrongMode {
                operation: operation.to_string(),
                expected: kind,
                actual: *state,
            });
        }
        Ok(())
    }

    /// End the session.
    ///
    /// Attempts to leave the active mode, then releases the transport. Safe
    /// to call repeatedly and after failures; the exit attempt is best-effort.
    pub fn close(&self) -> BpioResult<()> {
        let mut state = self.lock_state();
        if self.engine.is_closed() {
            return Ok(());
        }

        if let ModeState::InMode(kind) = *state {
            *state = ModeState::ExitingMode(kind);
            if let Err(e) = self.send_exit() {
                log::warn!("Best-effort exit from {} mode failed: {}", kind, e);
            }
        }
        *state = ModeState::Idle;

        let result = self.engine.close();
        log::info!("Session closed");
        result
    }
}
