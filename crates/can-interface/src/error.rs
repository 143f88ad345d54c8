//! CAN Interface Error Types

use obd_protocol::ObdError;
use thiserror::Error;

/// Errors raised by frame injection and the bus monitor
///
/// Every message starts with `Error` so it can be shown as-is.
#[derive(Debug, Error)]
pub enum CanError {
    /// Adapter is not connected
    #[error("Error: adapter not connected")]
    NotConnected,

    /// Input is not hexadecimal after sanitizing
    #[error("Error: invalid hex in {field}: '{value}'")]
    InvalidHex { field: &'static str, value: String },

    /// I/O fault on the serial link (cable pulled, device gone)
    #[error("Error: transport fault: {0}")]
    Transport(String),

    /// Adapter answered but refused the request
    #[error("Error: adapter rejected request: {0}")]
    Rejected(String),

    /// Another monitor already owns the link
    #[error("Error: bus monitor already active on this link")]
    MonitorBusy,

    /// Worker thread could not be started
    #[error("Error: failed to start sniffer: {0}")]
    Spawn(String),
}

impl From<ObdError> for CanError {
    fn from(err: ObdError) -> Self {
        match err {
            ObdError::VehicleNotConnected => CanError::NotConnected,
            ObdError::SerialError(reason) => CanError::Transport(reason),
            other => CanError::Rejected(other.to_string()),
        }
    }
}

impl CanError {
    /// Whether the fault came from the transport itself
    pub fn is_transport(&self) -> bool {
        matches!(self, CanError::Transport(_))
    }
}
