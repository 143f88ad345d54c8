//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    /// Serial port connection error
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Timeout waiting for response
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Invalid response from adapter
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Adapter answered "NO DATA" (request understood, nothing on the bus)
    #[error("No data returned for request {0}")]
    NoData(String),

    /// Protocol not supported
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// PID not supported by vehicle
    #[error("PID {0:02X} not supported by vehicle")]
    PidNotSupported(u8),

    /// Adapter not responding
    #[error("OBD adapter not responding")]
    AdapterNotResponding,

    /// No serial adapter could be found on any candidate port
    #[error("No OBD adapter found on candidate ports")]
    AdapterNotFound,

    /// CAN bus error
    #[error("CAN bus error: {0}")]
    CanBusError(String),

    /// Vehicle not connected
    #[error("Vehicle ignition is off or not connected")]
    VehicleNotConnected,

    /// The shared link is currently held by the bus monitor
    #[error("Link is in bus monitor mode")]
    MonitorActive,

    /// Formula evaluation failed
    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

/// Errors raised while parsing or evaluating a sensor formula
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    /// Character outside the formula grammar
    #[error("Unexpected character '{found}' at position {position}")]
    UnexpectedChar { found: char, position: usize },

    /// Identifier that is neither a byte variable nor a known function
    #[error("Unknown identifier '{0}'")]
    UnknownIdentifier(String),

    /// Token sequence does not form a valid expression
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// Formula refers to a byte past the end of the payload
    #[error("Byte {variable} referenced but payload has {available} byte(s)")]
    ByteOutOfRange { variable: char, available: usize },

    /// Division by zero during evaluation
    #[error("Division by zero")]
    DivisionByZero,

    /// Result was NaN or infinite
    #[error("Formula produced a non-finite value")]
    NonFinite,

    /// Formula text or nesting exceeds the accepted size
    #[error("Formula too complex: {0}")]
    TooComplex(&'static str),
}

/// Errors raised while loading sensor definitions
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Pack document is not valid JSON or not an object of records
    #[error("Pack '{pack}' is malformed: {reason}")]
    MalformedPack { pack: String, reason: String },

    /// A record inside a pack has the wrong shape
    #[error("Sensor '{key}' has an invalid definition: {reason}")]
    InvalidRecord { key: String, reason: String },

    /// A record's formula failed to parse
    #[error("Sensor '{key}' has an invalid formula: {source}")]
    InvalidFormula {
        key: String,
        #[source]
        source: FormulaError,
    },
}
