//! Diagnostic trouble codes and freeze-frame data
//!
//! Codes are read with adapter headers enabled so each code can be grouped
//! under the module that reported it. Groups are labelled
//! `<MODULE> - <STATUS>`, e.g. `ENGINE - CONFIRMED`.

use crate::client::ObdClient;
use crate::elm;
use crate::error::ObdError;
use crate::mode;
use crate::pid::Pid;
use crate::protocol::ObdProtocol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Grouped trouble codes, keyed by category label
pub type DtcReport = BTreeMap<String, Vec<DiagnosticCode>>;

/// Which store a code was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtcStatus {
    /// Mode 03
    Confirmed,
    /// Mode 07
    Pending,
    /// Mode 0A, survives a clear
    Permanent,
}

impl DtcStatus {
    pub const ALL: [DtcStatus; 3] = [DtcStatus::Confirmed, DtcStatus::Pending, DtcStatus::Permanent];

    pub fn service(&self) -> u8 {
        match self {
            DtcStatus::Confirmed => mode::READ_DTC,
            DtcStatus::Pending => mode::PENDING_DTC,
            DtcStatus::Permanent => mode::PERMANENT_DTC,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DtcStatus::Confirmed => "CONFIRMED",
            DtcStatus::Pending => "PENDING",
            DtcStatus::Permanent => "PERMANENT",
        }
    }
}

/// A decoded trouble code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticCode {
    /// Five-character code, e.g. `P0301`
    pub code: String,
    pub description: String,
}

impl DiagnosticCode {
    /// Decode the two-byte wire form
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        let code = decode_code(bytes);
        let description = describe(&code).to_string();
        Self { code, description }
    }
}

/// Letter from the top two bits, then four hex digits
pub fn decode_code(bytes: [u8; 2]) -> String {
    let letter = ['P', 'C', 'B', 'U'][usize::from(bytes[0] >> 6)];
    format!(
        "{}{:X}{:X}{:02X}",
        letter,
        (bytes[0] >> 4) & 0x03,
        bytes[0] & 0x0F,
        bytes[1]
    )
}

/// Description of common generic codes
pub fn describe(code: &str) -> &'static str {
    match code {
        "P0101" => "Mass Air Flow Circuit Range/Performance",
        "P0113" => "Intake Air Temperature Circuit High Input",
        "P0118" => "Engine Coolant Temperature Circuit High Input",
        "P0128" => "Coolant Thermostat Below Regulating Temperature",
        "P0131" => "O2 Sensor Circuit Low Voltage (Bank 1 Sensor 1)",
        "P0171" => "System Too Lean (Bank 1)",
        "P0172" => "System Too Rich (Bank 1)",
        "P0174" => "System Too Lean (Bank 2)",
        "P0175" => "System Too Rich (Bank 2)",
        "P0300" => "Random/Multiple Cylinder Misfire Detected",
        "P0301" => "Cylinder 1 Misfire Detected",
        "P0302" => "Cylinder 2 Misfire Detected",
        "P0303" => "Cylinder 3 Misfire Detected",
        "P0304" => "Cylinder 4 Misfire Detected",
        "P0420" => "Catalyst System Efficiency Below Threshold (Bank 1)",
        "P0442" => "Evaporative Emission System Leak Detected (Small Leak)",
        "P0455" => "Evaporative Emission System Leak Detected (Large Leak)",
        "P0500" => "Vehicle Speed Sensor Malfunction",
        "P0505" => "Idle Air Control System Malfunction",
        "P0700" => "Transmission Control System Malfunction",
        "U0100" => "Lost Communication With ECM/PCM",
        _ => "Unknown fault code",
    }
}

/// Name the module behind a response header
fn module_label(source: Option<&str>) -> String {
    match source {
        None => "ECU".to_string(),
        Some("7E8") | Some("18DAF110") | Some("10") => "ENGINE".to_string(),
        Some("7E9") | Some("18DAF118") | Some("18") => "TRANSMISSION".to_string(),
        Some(other) => format!("ECU {}", other),
    }
}

/// ISO-TP message being reassembled: declared length and bytes so far
type PartialMessage = (usize, Vec<u8>);

fn push_can_frame(messages: &mut Vec<PartialMessage>, frame: &[u8]) {
    let Some((&pci, rest)) = frame.split_first() else {
        return;
    };
    match pci >> 4 {
        // Single frame
        0 => {
            let len = usize::from(pci & 0x0F);
            messages.push((len, rest.to_vec()));
        }
        // First frame
        1 => {
            if let Some((&low, data)) = rest.split_first() {
                let len = (usize::from(pci & 0x0F) << 8) | usize::from(low);
                messages.push((len, data.to_vec()));
            }
        }
        // Consecutive frame
        2 => {
            if let Some((_, bytes)) = messages.last_mut() {
                bytes.extend_from_slice(rest);
            }
        }
        _ => debug!("Ignoring flow-control frame {:02X}", pci),
    }
}

/// Split a reply captured with headers on into per-module messages
///
/// CAN lines carry an 11-bit (`7E8`) or 29-bit (`18 DA F1 10`) header and a
/// PCI byte; legacy lines carry three header bytes and a trailing checksum.
pub(crate) fn parse_framed(
    reply: &str,
    protocol: ObdProtocol,
) -> Result<Vec<(String, Vec<u8>)>, ObdError> {
    let mut modules: Vec<(String, Vec<PartialMessage>)> = Vec::new();

    for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (source, data) = if protocol.is_can() {
            match tokens.first() {
                Some(first) if first.len() == 3 => (first.to_string(), &tokens[1..]),
                Some(_) if tokens.len() > 4 => (tokens[..4].concat(), &tokens[4..]),
                _ => continue,
            }
        } else if tokens.len() > 4 {
            (tokens[2].to_string(), &tokens[3..tokens.len() - 1])
        } else {
            continue;
        };

        let bytes = elm::decode_hex(&data.concat())?;
        let module = module_label(Some(&source.to_ascii_uppercase()));
        let idx = match modules.iter().position(|(m, _)| *m == module) {
            Some(idx) => idx,
            None => {
                modules.push((module, Vec::new()));
                modules.len() - 1
            }
        };

        let messages = &mut modules[idx].1;
        if protocol.is_can() {
            push_can_frame(messages, &bytes);
        } else {
            messages.push((bytes.len(), bytes));
        }
    }

    Ok(modules
        .into_iter()
        .flat_map(|(module, messages)| {
            messages.into_iter().map(move |(len, mut bytes)| {
                bytes.truncate(len);
                (module.clone(), bytes)
            })
        })
        .collect())
}

/// Decode the code pairs following the service byte
///
/// On CAN the first byte is the number of codes.
fn decode_codes(data: &[u8], protocol: ObdProtocol) -> Vec<DiagnosticCode> {
    let pairs = if protocol.is_can() {
        data.get(1..).unwrap_or_default()
    } else {
        data
    };
    pairs
        .chunks_exact(2)
        .filter(|pair| pair[0] != 0 || pair[1] != 0)
        .map(|pair| DiagnosticCode::from_bytes([pair[0], pair[1]]))
        .collect()
}

impl ObdClient {
    /// Read confirmed, pending and permanent trouble codes
    ///
    /// Returns an empty report when the vehicle is fault-free or the client
    /// is not connected.
    pub async fn get_dtc(&mut self) -> DtcReport {
        let mut report = DtcReport::new();
        if !self.is_connected() || self.link.is_monitoring() {
            return report;
        }

        if let Some(ecu) = &self.simulation {
            for (status, bytes) in ecu.codes() {
                report
                    .entry(format!("ENGINE - {}", status.label()))
                    .or_default()
                    .push(DiagnosticCode::from_bytes(*bytes));
            }
            return report;
        }

        if let Err(e) = self.ensure_header(None).await {
            warn!("Cannot address ECUs for code read: {}", e);
            return report;
        }

        let headers = self.set_headers(true).await;
        for status in DtcStatus::ALL {
            match self.read_codes(status, headers).await {
                Ok(found) => {
                    for (module, code) in found {
                        report
                            .entry(format!("{} - {}", module, status.label()))
                            .or_default()
                            .push(code);
                    }
                }
                Err(e) => debug!("{} codes unavailable: {}", status.label(), e),
            }
        }
        if headers && !self.set_headers(false).await {
            warn!("Failed to turn adapter headers back off");
        }

        info!(
            "Read {} trouble code(s) in {} group(s)",
            report.values().map(Vec::len).sum::<usize>(),
            report.len()
        );
        report
    }

    async fn set_headers(&self, on: bool) -> bool {
        let command = if on { "ATH1" } else { "ATH0" };
        match self.command(command, self.timeout()).await {
            Ok(reply) => reply.contains("OK"),
            Err(e) => {
                debug!("{} failed: {}", command, e);
                false
            }
        }
    }

    async fn read_codes(
        &self,
        status: DtcStatus,
        headers: bool,
    ) -> Result<Vec<(String, DiagnosticCode)>, ObdError> {
        let service = status.service();
        let request = format!("{:02X}", service);
        let reply = self.command(&request, self.timeout()).await?;
        match elm::check_reply(&reply, &request) {
            Err(ObdError::NoData(_)) => return Ok(Vec::new()),
            other => other?,
        }

        if !headers {
            let payloads = elm::extract_payloads(&reply, &[service])?;
            if payloads.is_empty() {
                return Err(ObdError::InvalidResponse(format!("{}: {}", request, reply)));
            }
            return Ok(payloads
                .iter()
                .flat_map(|payload| decode_codes(payload, self.protocol))
                .map(|code| (module_label(None), code))
                .collect());
        }

        let positive = service + 0x40;
        Ok(parse_framed(&reply, self.protocol)?
            .into_iter()
            .filter_map(|(module, message)| match message.split_first() {
                Some((&first, data)) if first == positive => Some((module, data.to_vec())),
                _ => None,
            })
            .flat_map(|(module, data)| {
                decode_codes(&data, self.protocol)
                    .into_iter()
                    .map(move |code| (module.clone(), code))
            })
            .collect())
    }

    /// Clear trouble codes (mode 04)
    ///
    /// Irreversible: the vehicle also erases its freeze-frame data. Runs
    /// unconditionally; any confirmation belongs to the caller.
    pub async fn clear_dtc(&mut self) -> bool {
        if !self.is_connected() || self.link.is_monitoring() {
            return false;
        }
        warn!("Clearing trouble codes and freeze-frame data");

        if let Some(ecu) = self.simulation.as_mut() {
            ecu.clear();
            return true;
        }

        if let Err(e) = self.ensure_header(None).await {
            warn!("Clear failed: {}", e);
            return false;
        }
        let request = format!("{:02X}", mode::CLEAR_DTC);
        match self.command(&request, self.timeout()).await {
            Ok(reply) => {
                let cleared = elm::extract_payload(&reply, &[mode::CLEAR_DTC]).is_ok();
                if !cleared {
                    warn!("Clear rejected: {}", reply);
                }
                cleared
            }
            Err(e) => {
                warn!("Clear failed: {}", e);
                false
            }
        }
    }

    /// Values captured with the last stored fault (mode 02, frame 0)
    ///
    /// Keys that are not supported catalog sensors, or that the vehicle has
    /// no frame data for, are absent.
    pub async fn get_freeze_frame_snapshot<K: AsRef<str>>(
        &mut self,
        keys: impl IntoIterator<Item = K>,
    ) -> BTreeMap<String, f64> {
        let mut snapshot = BTreeMap::new();
        if !self.is_connected() || self.link.is_monitoring() {
            return snapshot;
        }

        for key in keys {
            let key = key.as_ref();
            let Some(pid) = Pid::from_key(key).filter(|p| self.supported.contains(p)) else {
                continue;
            };
            match self.read_freeze_frame(pid).await {
                Ok(Some(value)) => {
                    snapshot.insert(key.to_string(), value);
                }
                Ok(None) => {}
                Err(e) => debug!("No freeze frame for {}: {}", key, e),
            }
        }
        snapshot
    }

    async fn read_freeze_frame(&mut self, pid: Pid) -> Result<Option<f64>, ObdError> {
        if let Some(ecu) = &self.simulation {
            return Ok(ecu.freeze_frame(pid));
        }
        self.ensure_header(None).await?;
        let payload = self
            .request_payload(&pid.freeze_frame_request(), self.timeout())
            .await?;
        Ok(pid.decode(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::mock::MockAdapter;

    async fn connected(adapter: &MockAdapter) -> ObdClient {
        let mut client = ObdClient::new(ClientConfig {
            timeout_ms: 200,
            connect_timeout_ms: 200,
            ..Default::default()
        });
        assert!(client.connect_transport(Box::new(adapter.clone()), "mock").await);
        client
    }

    #[test]
    fn test_decode_code_letters() {
        assert_eq!(decode_code([0x03, 0x01]), "P0301");
        assert_eq!(decode_code([0x41, 0x23]), "C0123");
        assert_eq!(decode_code([0x81, 0x23]), "B0123");
        assert_eq!(decode_code([0xC1, 0x00]), "U0100");
        assert_eq!(decode_code([0x14, 0x20]), "P1420");
    }

    #[test]
    fn test_description_fallback() {
        assert_eq!(DiagnosticCode::from_bytes([0x01, 0x71]).description, "System Too Lean (Bank 1)");
        assert_eq!(DiagnosticCode::from_bytes([0x3F, 0xFF]).description, "Unknown fault code");
    }

    #[test]
    fn test_parse_multi_frame_and_padding() {
        let reply = "7E8 10 0A 43 04 01 43 01 96\n7E8 21 02 34 02 35 AA AA AA";
        let messages = parse_framed(reply, ObdProtocol::Iso15765_4Can11bit500).unwrap();
        assert_eq!(messages.len(), 1);
        let (module, message) = &messages[0];
        assert_eq!(module, "ENGINE");
        assert_eq!(message.len(), 10);

        let codes: Vec<String> = decode_codes(&message[1..], ObdProtocol::Iso15765_4Can11bit500)
            .into_iter()
            .map(|c| c.code)
            .collect();
        assert_eq!(codes, vec!["P0143", "P0196", "P0234", "P0235"]);
    }

    #[test]
    fn test_parse_several_modules() {
        let reply = "7E8 04 43 01 03 01\n7EA 04 43 01 C1 00\n7E9 04 43 01 07 00";
        let messages = parse_framed(reply, ObdProtocol::Iso15765_4Can11bit500).unwrap();
        let modules: Vec<&str> = messages.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(modules, vec!["ENGINE", "ECU 7EA", "TRANSMISSION"]);
    }

    #[test]
    fn test_parse_29_bit_and_legacy() {
        let can29 = parse_framed("18 DA F1 10 04 43 01 03 01", ObdProtocol::Iso15765_4Can29bit500).unwrap();
        assert_eq!(can29, vec![("ENGINE".to_string(), vec![0x43, 0x01, 0x03, 0x01])]);

        let legacy = parse_framed("48 6B 10 43 01 03 01 71 00 00 AB", ObdProtocol::Iso9141_2).unwrap();
        assert_eq!(legacy.len(), 1);
        let codes = decode_codes(&legacy[0].1[1..], ObdProtocol::Iso9141_2);
        let codes: Vec<&str> = codes.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["P0103", "P0171"]);
    }

    #[tokio::test]
    async fn test_get_dtc_from_adapter() {
        let adapter = MockAdapter::vehicle();
        let mut client = connected(&adapter).await;
        let report = client.get_dtc().await;

        assert_eq!(report.len(), 2);
        let confirmed = &report["ENGINE - CONFIRMED"];
        assert_eq!(confirmed[0].code, "P0301");
        assert_eq!(confirmed[0].description, "Cylinder 1 Misfire Detected");
        assert_eq!(report["ENGINE - PENDING"][0].code, "P0171");

        let sent = adapter.sent();
        let on = sent.iter().position(|c| c == "ATH1").unwrap();
        let read = sent.iter().position(|c| c == "03").unwrap();
        let off = sent.iter().rposition(|c| c == "ATH0").unwrap();
        assert!(on < read && read < off);
    }

    #[tokio::test]
    async fn test_fault_free_vehicle_returns_empty_report() {
        let adapter = MockAdapter::vehicle()
            .respond("03", "43 00")
            .respond("07", "NO DATA");
        let mut client = connected(&adapter).await;
        assert!(client.get_dtc().await.is_empty());
    }

    #[tokio::test]
    async fn test_headerless_fallback_keeps_every_ecu() {
        let adapter = MockAdapter::vehicle()
            .respond("ATH1", "?")
            .respond("03", "43 01 03 01\r43 01 07 00");
        let mut client = connected(&adapter).await;

        let report = client.get_dtc().await;
        let codes: Vec<&str> = report["ECU - CONFIRMED"].iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["P0301", "P0700"]);
        assert_eq!(report["ECU - PENDING"][0].code, "P0171");
        assert_eq!(adapter.sent().iter().filter(|c| *c == "ATH0").count(), 1);
    }

    #[tokio::test]
    async fn test_clear_erases_codes_and_freeze_frame() {
        let adapter = MockAdapter::vehicle();
        let mut client = connected(&adapter).await;

        let before = client.get_freeze_frame_snapshot(["RPM", "COOLANT_TEMP", "SPEED", "BOGUS"]).await;
        assert_eq!(before.get("RPM"), Some(&1000.0));
        assert_eq!(before.get("COOLANT_TEMP"), Some(&100.0));
        assert_eq!(before.get("SPEED"), Some(&0.0));
        assert!(!before.contains_key("BOGUS"));

        assert!(client.clear_dtc().await);
        assert_eq!(adapter.clear_count(), 1);
        assert!(client.get_dtc().await.is_empty());
        assert!(client.get_freeze_frame_snapshot(["RPM"]).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_rejected() {
        let adapter = MockAdapter::vehicle().respond("04", "7F 04 22");
        let mut client = connected(&adapter).await;
        assert!(!client.clear_dtc().await);
    }

    #[tokio::test]
    async fn test_simulated_codes() {
        let mut client = ObdClient::mock();
        let report = client.get_dtc().await;
        assert_eq!(report["ENGINE - CONFIRMED"][0].code, "P0301");
        assert_eq!(report["ENGINE - PENDING"][0].code, "P0171");

        let snapshot = client.get_freeze_frame_snapshot(["RPM", "FUEL_LEVEL"]).await;
        assert_eq!(snapshot.get("RPM"), Some(&1000.0));
        assert!(!snapshot.contains_key("FUEL_LEVEL"));

        let before = report.values().map(Vec::len).sum::<usize>();
        assert!(client.clear_dtc().await);
        let after = client.get_dtc().await.values().map(Vec::len).sum::<usize>();
        assert!(after < before);
        assert!(client.get_freeze_frame_snapshot(["RPM"]).await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_client() {
        let mut client = ObdClient::new(ClientConfig::default());
        assert!(client.get_dtc().await.is_empty());
        assert!(!client.clear_dtc().await);
        assert!(client.get_freeze_frame_snapshot(["RPM"]).await.is_empty());
    }
}
