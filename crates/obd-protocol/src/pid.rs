//! OBD-II PID Definitions and Response Parsing
//!
//! Defines the built-in Mode 01 catalog: the sensor key each PID is known
//! by, its display metadata and its decoding formula.

use crate::mode;
use serde::{Deserialize, Serialize};

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Timing advance (0x0E)
    TimingAdvance = 0x0E,
    /// Intake air temperature (0x0F)
    IntakeTemp = 0x0F,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Run time since engine start (0x1F)
    RunTime = 0x1F,
    /// Fuel tank level input (0x2F)
    FuelLevel = 0x2F,
    /// Absolute barometric pressure (0x33)
    BarometricPressure = 0x33,
    /// Control module voltage (0x42)
    ControlModuleVoltage = 0x42,
}

impl Pid {
    /// Every PID in the built-in catalog
    pub const ALL: [Pid; 16] = [
        Pid::Rpm,
        Pid::Speed,
        Pid::CoolantTemp,
        Pid::ControlModuleVoltage,
        Pid::EngineLoad,
        Pid::ThrottlePosition,
        Pid::IntakeTemp,
        Pid::Maf,
        Pid::FuelLevel,
        Pid::BarometricPressure,
        Pid::TimingAdvance,
        Pid::RunTime,
        Pid::ShortFuelTrim,
        Pid::LongFuelTrim,
        Pid::IntakeManifoldPressure,
        Pid::O2Voltage,
    ];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Look up a catalog PID by its number
    pub fn from_hex(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_hex() == value)
    }

    /// Sensor key this PID is published under
    pub fn key(&self) -> &'static str {
        match self {
            Pid::Rpm => "RPM",
            Pid::Speed => "SPEED",
            Pid::CoolantTemp => "COOLANT_TEMP",
            Pid::ControlModuleVoltage => "CONTROL_MODULE_VOLTAGE",
            Pid::EngineLoad => "ENGINE_LOAD",
            Pid::ThrottlePosition => "THROTTLE_POS",
            Pid::IntakeTemp => "INTAKE_TEMP",
            Pid::Maf => "MAF",
            Pid::FuelLevel => "FUEL_LEVEL",
            Pid::BarometricPressure => "BAROMETRIC_PRESSURE",
            Pid::TimingAdvance => "TIMING_ADVANCE",
            Pid::RunTime => "RUN_TIME",
            Pid::ShortFuelTrim => "SHORT_FUEL_TRIM_1",
            Pid::LongFuelTrim => "LONG_FUEL_TRIM_1",
            Pid::IntakeManifoldPressure => "INTAKE_PRESSURE",
            Pid::O2Voltage => "O2_B1S1",
        }
    }

    /// Look up a catalog PID by sensor key
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.key() == key)
    }

    /// Get the number of response bytes for this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::Rpm | Pid::Maf | Pid::O2Voltage | Pid::RunTime | Pid::ControlModuleVoltage => 2,
            _ => 1,
        }
    }

    /// Request text for current data (`010C`)
    pub fn request(&self) -> String {
        format!("{:02X}{:02X}", mode::CURRENT_DATA, self.as_hex())
    }

    /// Request text for freeze frame 0 (`020C00`)
    pub fn freeze_frame_request(&self) -> String {
        format!("{:02X}{:02X}00", mode::FREEZE_FRAME, self.as_hex())
    }

    /// Decode the payload (data bytes after the PID echo)
    ///
    /// Returns `None` when the payload is shorter than the PID requires.
    pub fn decode(&self, bytes: &[u8]) -> Option<f64> {
        if bytes.len() < self.response_bytes() {
            return None;
        }
        let a = f64::from(bytes[0]);
        let word = || f64::from(bytes[0]) * 256.0 + f64::from(bytes[1]);
        let value = match self {
            // ((A*256)+B)/4
            Pid::Rpm => word() / 4.0,
            // A (km/h)
            Pid::Speed => a,
            // A - 40 (°C)
            Pid::CoolantTemp | Pid::IntakeTemp => a - 40.0,
            // A * 100 / 255 (%)
            Pid::EngineLoad | Pid::ThrottlePosition | Pid::FuelLevel => a * 100.0 / 255.0,
            // ((A*256)+B) / 100 (g/s)
            Pid::Maf => word() / 100.0,
            // (A - 128) * 100 / 128 (%)
            Pid::ShortFuelTrim | Pid::LongFuelTrim => (a - 128.0) * 100.0 / 128.0,
            // A / 200 (V)
            Pid::O2Voltage => a / 200.0,
            // A (kPa)
            Pid::IntakeManifoldPressure | Pid::BarometricPressure => a,
            // A/2 - 64 (° before TDC)
            Pid::TimingAdvance => a / 2.0 - 64.0,
            // (A*256)+B (s)
            Pid::RunTime => word(),
            // ((A*256)+B) / 1000 (V)
            Pid::ControlModuleVoltage => word() / 1000.0,
        };
        Some(value)
    }
}

/// Display metadata of a built-in sensor
#[derive(Debug, Clone, Copy)]
pub struct StandardSensor {
    pub pid: Pid,
    pub name: &'static str,
    pub unit: &'static str,
    pub show: bool,
    pub log: bool,
    pub limit: f64,
    pub description: &'static str,
}

/// The built-in sensor table
pub const STANDARD_SENSORS: [StandardSensor; 16] = [
    StandardSensor {
        pid: Pid::Rpm,
        name: "Engine RPM",
        unit: "",
        show: true,
        log: true,
        limit: 6000.0,
        description: "Revolutions Per Minute: How fast the engine crankshaft is spinning.",
    },
    StandardSensor {
        pid: Pid::Speed,
        name: "Vehicle Speed",
        unit: "km/h",
        show: true,
        log: true,
        limit: 160.0,
        description: "Current vehicle speed as reported by the ECU.",
    },
    StandardSensor {
        pid: Pid::CoolantTemp,
        name: "Coolant Temp",
        unit: "°C",
        show: true,
        log: true,
        limit: 120.0,
        description: "Engine Coolant Temperature: above 110°C the engine is overheating.",
    },
    StandardSensor {
        pid: Pid::ControlModuleVoltage,
        name: "Voltage",
        unit: "V",
        show: true,
        log: false,
        limit: 16.0,
        description: "ECU Voltage: about 12.6V with the engine off, about 14.0V while running.",
    },
    StandardSensor {
        pid: Pid::EngineLoad,
        name: "Engine Load",
        unit: "%",
        show: true,
        log: false,
        limit: 100.0,
        description: "Calculated Load Value: engine effort relative to its maximum capacity.",
    },
    StandardSensor {
        pid: Pid::ThrottlePosition,
        name: "Throttle Pos",
        unit: "%",
        show: false,
        log: true,
        limit: 100.0,
        description: "Throttle Position: how far the throttle plate is open.",
    },
    StandardSensor {
        pid: Pid::IntakeTemp,
        name: "Intake Air Temp",
        unit: "°C",
        show: false,
        log: false,
        limit: 80.0,
        description: "Intake Air Temperature: temperature of the air entering the engine.",
    },
    StandardSensor {
        pid: Pid::Maf,
        name: "MAF Air Flow",
        unit: "g/s",
        show: false,
        log: false,
        limit: 200.0,
        description: "Mass Air Flow: weight of air entering the engine, used for fueling.",
    },
    StandardSensor {
        pid: Pid::FuelLevel,
        name: "Fuel Level",
        unit: "%",
        show: false,
        log: false,
        limit: 100.0,
        description: "Fuel Tank Level percentage.",
    },
    StandardSensor {
        pid: Pid::BarometricPressure,
        name: "Barometric",
        unit: "kPa",
        show: false,
        log: false,
        limit: 200.0,
        description: "Atmospheric Pressure: varies with weather and altitude.",
    },
    StandardSensor {
        pid: Pid::TimingAdvance,
        name: "Timing Adv",
        unit: "°",
        show: false,
        log: false,
        limit: 60.0,
        description: "Ignition Timing Advance: spark angle relative to top dead center.",
    },
    StandardSensor {
        pid: Pid::RunTime,
        name: "Run Time",
        unit: "sec",
        show: false,
        log: false,
        limit: 3600.0,
        description: "Time elapsed since the engine was started.",
    },
    StandardSensor {
        pid: Pid::ShortFuelTrim,
        name: "Short Fuel Trim",
        unit: "%",
        show: false,
        log: false,
        limit: 25.0,
        description: "Short-term fuel trim, bank 1.",
    },
    StandardSensor {
        pid: Pid::LongFuelTrim,
        name: "Long Fuel Trim",
        unit: "%",
        show: false,
        log: false,
        limit: 25.0,
        description: "Long-term fuel trim, bank 1.",
    },
    StandardSensor {
        pid: Pid::IntakeManifoldPressure,
        name: "Intake Pressure",
        unit: "kPa",
        show: false,
        log: false,
        limit: 255.0,
        description: "Intake manifold absolute pressure.",
    },
    StandardSensor {
        pid: Pid::O2Voltage,
        name: "O2 Sensor B1S1",
        unit: "V",
        show: false,
        log: false,
        limit: 1.275,
        description: "Oxygen sensor voltage, bank 1 sensor 1.",
    },
];
