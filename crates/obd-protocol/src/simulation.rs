//! Simulated vehicle for running without an adapter
//!
//! Values are pseudo-random but bounded and derived from a hash of a call
//! counter, so a sequence of queries is reproducible.

use crate::dtc::DtcStatus;
use crate::pid::Pid;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Instant;

/// Fixed fuel level reported in simulation (%)
pub const SIMULATED_FUEL_LEVEL: f64 = 75.0;

/// Nominal barometric pressure in simulation (kPa)
pub const SIMULATED_BAROMETRIC: f64 = 101.3;

/// Simulated ECU state
#[derive(Debug, Clone)]
pub struct SimulatedEcu {
    started: Instant,
    counter: u64,
    codes: Vec<(DtcStatus, [u8; 2])>,
    freeze_frame: BTreeMap<Pid, f64>,
}

impl Default for SimulatedEcu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEcu {
    /// Fresh ECU with one confirmed misfire (P0301), one pending lean code
    /// (P0171) and the freeze frame captured when the misfire was logged
    pub fn new() -> Self {
        let freeze_frame = BTreeMap::from([
            (Pid::Rpm, 1000.0),
            (Pid::Speed, 0.0),
            (Pid::CoolantTemp, 100.0),
            (Pid::EngineLoad, 35.0),
            (Pid::ControlModuleVoltage, 13.8),
        ]);
        Self {
            started: Instant::now(),
            counter: 0,
            codes: vec![
                (DtcStatus::Confirmed, [0x03, 0x01]),
                (DtcStatus::Pending, [0x01, 0x71]),
            ],
            freeze_frame,
        }
    }

    fn next_hash(&mut self, salt: impl Hash) -> u64 {
        self.counter = self.counter.wrapping_add(1);
        let mut hasher = DefaultHasher::new();
        self.counter.hash(&mut hasher);
        salt.hash(&mut hasher);
        hasher.finish()
    }

    /// Current value of a catalog PID
    pub fn read(&mut self, pid: Pid) -> f64 {
        let hash = self.next_hash(pid.as_hex());
        match pid {
            Pid::Rpm => (800 + hash % 2700) as f64,
            Pid::Speed => (hash % 120) as f64,
            Pid::CoolantTemp => (70 + hash % 35) as f64,
            Pid::ControlModuleVoltage => 13.5 + (hash % 100) as f64 / 100.0,
            Pid::EngineLoad => (20 + hash % 60) as f64,
            Pid::ThrottlePosition => (10 + hash % 40) as f64,
            Pid::IntakeTemp => (20 + hash % 15) as f64,
            Pid::Maf => (5 + hash % 45) as f64,
            Pid::FuelLevel => SIMULATED_FUEL_LEVEL,
            Pid::BarometricPressure => {
                SIMULATED_BAROMETRIC + ((hash % 21) as f64 - 10.0) / 10.0
            }
            Pid::TimingAdvance => (5 + hash % 25) as f64,
            Pid::RunTime => self.started.elapsed().as_secs() as f64,
            Pid::ShortFuelTrim | Pid::LongFuelTrim => (hash % 21) as f64 - 10.0,
            Pid::O2Voltage => 0.1 + (hash % 80) as f64 / 100.0,
            Pid::IntakeManifoldPressure => (30 + hash % 70) as f64,
        }
    }

    /// Raw payload for a non-catalog request
    pub fn raw_payload(&mut self, request: &str, len: usize) -> Vec<u8> {
        let hash = self.next_hash(request);
        hash.to_be_bytes().iter().cycle().take(len).copied().collect()
    }

    /// Stored trouble codes with their status
    pub fn codes(&self) -> &[(DtcStatus, [u8; 2])] {
        &self.codes
    }

    /// Freeze-frame value of a catalog PID
    pub fn freeze_frame(&self, pid: Pid) -> Option<f64> {
        self.freeze_frame.get(&pid).copied()
    }

    /// Erase codes and the freeze frame
    pub fn clear(&mut self) {
        self.codes.clear();
        self.freeze_frame.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_and_bounded_values() {
        let mut ecu = SimulatedEcu::new();
        for _ in 0..50 {
            assert_eq!(ecu.read(Pid::FuelLevel), 75.0);
            let baro = ecu.read(Pid::BarometricPressure);
            assert!((baro - 101.3).abs() <= 2.0);
            let rpm = ecu.read(Pid::Rpm);
            assert!((800.0..3500.0).contains(&rpm));
            assert_eq!(rpm.fract(), 0.0);
        }
    }

    #[test]
    fn test_run_time_never_decreases() {
        let mut ecu = SimulatedEcu::new();
        let first = ecu.read(Pid::RunTime);
        let second = ecu.read(Pid::RunTime);
        assert!(second >= first);
    }

    #[test]
    fn test_clear_erases_codes_and_freeze_frame() {
        let mut ecu = SimulatedEcu::new();
        assert_eq!(ecu.codes().len(), 2);
        assert_eq!(ecu.freeze_frame(Pid::Rpm), Some(1000.0));
        ecu.clear();
        assert!(ecu.codes().is_empty());
        assert_eq!(ecu.freeze_frame(Pid::Rpm), None);
    }

    #[test]
    fn test_raw_payload_length() {
        let mut ecu = SimulatedEcu::new();
        assert_eq!(ecu.raw_payload("221234", 2).len(), 2);
        assert_eq!(ecu.raw_payload("221234", 12).len(), 12);
    }
}
