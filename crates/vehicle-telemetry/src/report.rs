//! Diagnostic backup report
//!
//! Snapshot taken before clearing codes: the codes themselves plus the
//! freeze frame the vehicle erases along with them.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use obd_protocol::DtcReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub captured_at: DateTime<Utc>,
    /// Adapter port, or `None` in simulation
    pub port: Option<String>,
    pub protocol: String,
    pub codes: DtcReport,
    pub freeze_frame: BTreeMap<String, f64>,
}

impl DiagnosticReport {
    pub fn new(
        port: Option<String>,
        protocol: String,
        codes: DtcReport,
        freeze_frame: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            captured_at: Utc::now(),
            port,
            protocol,
            codes,
            freeze_frame,
        }
    }

    /// Total codes across all modules and statuses
    pub fn code_count(&self) -> usize {
        self.codes.values().map(Vec::len).sum()
    }

    pub fn is_fault_free(&self) -> bool {
        self.code_count() == 0
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::DiagnosticCode;

    #[test]
    fn test_counts_and_json() {
        let mut codes = DtcReport::new();
        codes.insert(
            "ENGINE - CONFIRMED".to_string(),
            vec![DiagnosticCode::from_bytes([0x03, 0x01]), DiagnosticCode::from_bytes([0x01, 0x71])],
        );
        codes.insert(
            "TRANSMISSION - PENDING".to_string(),
            vec![DiagnosticCode::from_bytes([0x07, 0x00])],
        );
        let frame = BTreeMap::from([("RPM".to_string(), 1000.0)]);
        let report = DiagnosticReport::new(None, "CAN 11/500".to_string(), codes, frame);

        assert_eq!(report.code_count(), 3);
        assert!(!report.is_fault_free());

        let json = report.to_json().unwrap();
        assert!(json.contains("P0301"));
        assert!(json.contains("ENGINE - CONFIRMED"));
        assert!(json.contains("captured_at"));
        assert_eq!(DiagnosticReport::from_json(&json).unwrap(), report);
    }

    #[test]
    fn test_empty_report() {
        let report = DiagnosticReport::new(None, "AUTO".to_string(), DtcReport::new(), BTreeMap::new());
        assert!(report.is_fault_free());
    }
}
