//! OBD-II Protocol Implementation
//!
//! This crate talks to ELM327-compatible OBD-II adapters over a shared serial
//! link. It owns the session lifecycle, the built-in PID catalog, the layered
//! sensor registry with its pro-pack extensions, the restricted formula
//! language used to decode manufacturer PIDs, and trouble-code handling.

mod client;
mod dtc;
pub mod elm;
mod error;
pub mod formula;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
mod pid;
mod protocol;
mod registry;
mod simulation;
pub mod transport;

pub use client::{ClientConfig, ConnectionState, ObdClient};
pub use dtc::{decode_code, describe, DiagnosticCode, DtcReport, DtcStatus};
pub use error::{FormulaError, ObdError, RegistryError};
pub use formula::Formula;
pub use pid::{Pid, StandardSensor, STANDARD_SENSORS};
pub use protocol::ObdProtocol;
pub use registry::{
    PidRegistry, ProPack, ProSensorRecord, SensorDefinition, SensorSettings, SensorSource,
    DIRECT_PACK_LABEL,
};
pub use simulation::{SimulatedEcu, SIMULATED_BAROMETRIC, SIMULATED_FUEL_LEVEL};
pub use transport::{Link, MonitorGuard, Transport};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
}
