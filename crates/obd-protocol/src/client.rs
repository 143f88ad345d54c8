//! OBD-II Client for ELM327 Adapters
//!
//! Owns the connection lifecycle (real adapter or simulation), discovers
//! which catalog PIDs the vehicle supports and answers sensor queries.
//! Every public query degrades to `None` instead of surfacing an error.

use crate::elm;
use crate::error::ObdError;
use crate::formula::Formula;
use crate::mode;
use crate::pid::Pid;
use crate::protocol::ObdProtocol;
use crate::registry::{PidRegistry, ProPack, ProSensorRecord, DIRECT_PACK_LABEL};
use crate::simulation::SimulatedEcu;
use crate::transport::{self, Link, Transport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default timeout for OBD commands
const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Highest supported-PID bitmap requested during discovery
const LAST_SUPPORT_BASE: u8 = 0x40;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout of a regular request/response exchange (ms)
    pub timeout_ms: u64,
    /// Timeout of reset and first bus contact, which may trigger a protocol search (ms)
    pub connect_timeout_ms: u64,
    /// Baud rates tried on each candidate port, in order
    pub baud_rates: Vec<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: 5000,
            baud_rates: vec![38400, 9600, 115200],
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(text)
    }
}

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient {
    pub(crate) config: ClientConfig,
    pub(crate) link: Link,
    pub(crate) state: ConnectionState,
    /// Simulated vehicle when running without hardware
    pub(crate) simulation: Option<SimulatedEcu>,
    pub(crate) protocol: ObdProtocol,
    /// Catalog PIDs the vehicle reported as supported
    pub(crate) supported: BTreeSet<Pid>,
    pub(crate) registry: PidRegistry,
}

impl ObdClient {
    /// Create a disconnected client with its own link
    pub fn new(config: ClientConfig) -> Self {
        Self::with_link(config, Link::new())
    }

    /// Create a disconnected client on a shared link
    pub fn with_link(config: ClientConfig, link: Link) -> Self {
        Self {
            config,
            link,
            state: ConnectionState::Disconnected,
            simulation: None,
            protocol: ObdProtocol::Auto,
            supported: BTreeSet::new(),
            registry: PidRegistry::standard(),
        }
    }

    /// Create a connected, simulated client for testing (no hardware required)
    pub fn mock() -> Self {
        info!("Creating simulated OBD client");
        let mut client = Self::new(ClientConfig::default());
        client.enter_simulation();
        client
    }

    /// Connect to the adapter
    ///
    /// With `port` set only that port is tried; otherwise every enumerated
    /// serial port is tried at each configured baud rate. In simulation
    /// mode no hardware is touched.
    pub async fn connect(&mut self, port: Option<&str>, simulation: bool) -> bool {
        self.disconnect().await;
        self.state = ConnectionState::Connecting;

        if simulation {
            self.enter_simulation();
            return true;
        }

        let candidates = match port {
            Some(port) => vec![port.to_string()],
            None => transport::candidate_ports(),
        };
        info!("Probing {} candidate port(s) for an OBD adapter", candidates.len());

        for name in candidates {
            for baud in self.config.baud_rates.clone() {
                let transport = match transport::open_serial(&name, baud) {
                    Ok(transport) => transport,
                    Err(e) => {
                        debug!("Skipping {}: {}", name, e);
                        break;
                    }
                };
                if self.try_transport(transport, &name).await {
                    return true;
                }
            }
        }

        warn!("Connection failed: {}", ObdError::AdapterNotFound);
        self.state = ConnectionState::Failed;
        false
    }

    /// Connect over an already opened transport
    pub async fn connect_transport(&mut self, transport: Box<dyn Transport>, name: &str) -> bool {
        self.disconnect().await;
        self.state = ConnectionState::Connecting;
        if self.try_transport(transport, name).await {
            true
        } else {
            self.state = ConnectionState::Failed;
            false
        }
    }

    fn enter_simulation(&mut self) {
        self.link.attach_simulated();
        self.simulation = Some(SimulatedEcu::new());
        self.supported = Pid::ALL.into_iter().collect();
        self.protocol = ObdProtocol::Iso15765_4Can11bit500;
        self.state = ConnectionState::Connected;
        info!("Connected to simulated vehicle");
    }

    async fn try_transport(&mut self, transport: Box<dyn Transport>, name: &str) -> bool {
        self.link.attach(transport, name);
        match self.initialize().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                info!(
                    "Connected on {} ({}), {} supported PID(s)",
                    name,
                    self.protocol,
                    self.supported.len()
                );
                true
            }
            Err(e) => {
                warn!("Adapter on {} failed handshake: {}", name, e);
                self.link.detach();
                self.supported.clear();
                false
            }
        }
    }

    /// Initialize the ELM327 adapter and discover supported PIDs
    async fn initialize(&mut self) -> Result<(), ObdError> {
        let slow = Duration::from_millis(self.config.connect_timeout_ms);

        let banner = self.command("ATZ", slow).await?;
        debug!("Adapter banner: {}", banner);

        for setup in ["ATE0", "ATL0", "ATS1", "ATH0", ObdProtocol::Auto.to_elm_command()] {
            let reply = self.command(setup, self.timeout()).await?;
            if !reply.contains("OK") {
                return Err(ObdError::InvalidResponse(format!("{}: {}", setup, reply)));
            }
        }
        self.link.set_header(None);

        self.supported = self.discover_supported(slow).await?;

        self.protocol = match self.command("ATDPN", self.timeout()).await {
            Ok(reply) => ObdProtocol::from_elm_number(&reply).unwrap_or_default(),
            Err(e) => {
                debug!("Protocol query failed: {}", e);
                ObdProtocol::Auto
            }
        };
        Ok(())
    }

    /// Walk the supported-PID bitmaps and intersect them with the catalog
    async fn discover_supported(&self, first_timeout: Duration) -> Result<BTreeSet<Pid>, ObdError> {
        let mut supported = BTreeSet::new();
        let mut base = 0x00u8;

        loop {
            let request = format!("{:02X}{:02X}", mode::CURRENT_DATA, base);
            let timeout = if base == 0 { first_timeout } else { self.timeout() };
            let bitmap = match self.request_payload(&request, timeout).await {
                Ok(bitmap) => bitmap,
                // The first bitmap doubles as the connection test
                Err(e) if base == 0 => return Err(e),
                Err(e) => {
                    debug!("Support bitmap {} unavailable: {}", request, e);
                    break;
                }
            };

            let pids = elm::decode_supported(base, &bitmap);
            supported.extend(pids.iter().filter_map(|p| Pid::from_hex(*p)));

            if base >= LAST_SUPPORT_BASE || !pids.contains(&(base + 0x20)) {
                break;
            }
            base += 0x20;
        }

        Ok(supported)
    }

    /// Disconnect from the OBD adapter; idempotent
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Connected {
            info!("Disconnecting OBD client");
        }
        self.link.detach();
        self.simulation = None;
        self.supported.clear();
        self.state = ConnectionState::Disconnected;
    }

    /// Check if client is connected
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the client talks to the simulated vehicle
    pub fn is_simulation(&self) -> bool {
        self.simulation.is_some()
    }

    /// Get current protocol
    pub fn protocol(&self) -> ObdProtocol {
        self.protocol
    }

    /// Catalog PIDs supported by the connected vehicle
    pub fn supported_commands(&self) -> &BTreeSet<Pid> {
        &self.supported
    }

    /// Shared link to the adapter
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Active sensor definitions
    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    /// Replace the whole definition table
    pub fn set_registry(&mut self, registry: PidRegistry) {
        self.registry = registry;
    }

    /// Replace the active pro-pack table
    ///
    /// Invalid records are skipped with a warning. Returns how many were
    /// accepted.
    pub fn set_pro_definitions(
        &mut self,
        definitions: impl IntoIterator<Item = (String, ProSensorRecord)>,
    ) -> usize {
        let (pack, rejected) = ProPack::from_records_lossy(DIRECT_PACK_LABEL, definitions);
        for e in rejected {
            warn!("Ignoring pro definition: {}", e);
        }
        let accepted = pack.len();
        self.registry.replace_packs(vec![pack]);
        accepted
    }

    /// Set command timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout_ms = timeout.as_millis() as u64;
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Query a sensor by key; `None` when unsupported, unknown or undecodable
    pub async fn query_sensor(&mut self, key: &str) -> Option<f64> {
        if !self.is_connected() || self.link.is_monitoring() {
            return None;
        }

        let definition = self.registry.lookup(key).cloned();
        let result = match definition.as_ref().and_then(|d| d.raw_access()) {
            Some((raw_pid, header, formula)) => self.query_formula(raw_pid, header, formula).await,
            None => match Pid::from_key(key) {
                Some(pid) => self.query_pid(pid).await,
                None => {
                    debug!("No way to query unknown sensor {}", key);
                    return None;
                }
            },
        };

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Query {} yielded no value: {}", key, e);
                None
            }
        }
    }

    /// Query a catalog PID and decode it with its standard rule
    pub async fn query_pid(&mut self, pid: Pid) -> Result<f64, ObdError> {
        if !self.supported.contains(&pid) {
            return Err(ObdError::PidNotSupported(pid.as_hex()));
        }
        if let Some(ecu) = self.simulation.as_mut() {
            return Ok(ecu.read(pid));
        }

        self.ensure_header(None).await?;
        let payload = self.request_payload(&pid.request(), self.timeout()).await?;
        pid.decode(&payload)
            .ok_or_else(|| ObdError::InvalidResponse(format!("short payload for {}", pid.request())))
    }

    /// Send a raw request (optionally to a specific header) and return the payload
    pub async fn query_raw(&mut self, request: &str, header: Option<&str>) -> Result<Vec<u8>, ObdError> {
        self.ensure_header(header).await?;
        self.request_payload(request, self.timeout()).await
    }

    async fn query_formula(
        &mut self,
        raw_pid: &str,
        header: Option<&str>,
        formula: &Formula,
    ) -> Result<f64, ObdError> {
        let payload = match self.simulation.as_mut() {
            Some(ecu) => ecu.raw_payload(raw_pid, formula.bytes_required()),
            None => self.query_raw(raw_pid, header).await?,
        };
        Ok(formula.evaluate(&payload)?)
    }

    /// Program the adapter header if it differs from the one in use
    pub(crate) async fn ensure_header(&mut self, header: Option<&str>) -> Result<(), ObdError> {
        if self.link.header().as_deref() == header {
            return Ok(());
        }
        let target = header.unwrap_or(self.protocol.default_header());
        let command = format!("ATSH{}", target);
        let reply = self.command(&command, self.timeout()).await?;
        if !reply.contains("OK") {
            return Err(ObdError::InvalidResponse(format!("{}: {}", command, reply)));
        }
        self.link.set_header(header.map(str::to_string));
        Ok(())
    }

    /// Send a hex request and extract the positive-response payload
    ///
    /// A late answer to an abandoned request can still arrive after this
    /// request was written; it is skipped and the read continues until the
    /// deadline.
    pub(crate) async fn request_payload(&self, request: &str, timeout: Duration) -> Result<Vec<u8>, ObdError> {
        let request_bytes = elm::decode_hex(request)?;
        let deadline = Instant::now() + timeout;
        let mut reply = self.command(request, timeout).await?;

        loop {
            elm::check_reply(&reply, request)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !elm::answers_other_request(&reply, &request_bytes) {
                return elm::extract_payload(&reply, &request_bytes);
            }
            debug!("Skipping late reply while waiting for {}: {}", request, reply);
            reply = self.read_reply(remaining).await?;
        }
    }

    /// Read the next reply without sending anything
    async fn read_reply(&self, timeout: Duration) -> Result<String, ObdError> {
        if self.link.is_monitoring() {
            return Err(ObdError::MonitorActive);
        }
        let link = self.link.clone();
        tokio::task::spawn_blocking(move || {
            link.with_port(|port| elm::read_until_prompt(port, timeout))
        })
        .await
        .map_err(|e| ObdError::SerialError(format!("I/O task failed: {}", e)))?
        .map(|raw| elm::clean_reply(&raw, ""))
    }

    /// Run one command/reply exchange on a blocking thread
    pub(crate) async fn command(&self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        if self.link.is_monitoring() {
            return Err(ObdError::MonitorActive);
        }
        let link = self.link.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            link.with_port(|port| elm::send_command(port, &command, timeout))
        })
        .await
        .map_err(|e| ObdError::SerialError(format!("I/O task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;
    use std::io::{Read, Write};

    async fn connected(adapter: &MockAdapter) -> ObdClient {
        let mut client = ObdClient::new(ClientConfig {
            timeout_ms: 200,
            connect_timeout_ms: 200,
            ..Default::default()
        });
        assert!(client.connect_transport(Box::new(adapter.clone()), "mock").await);
        client
    }

    /// Adapter whose first answer to one command shows up after a delay,
    /// ahead of everything it says later (a serial line is FIFO)
    struct LateReply {
        inner: MockAdapter,
        command: &'static str,
        delay: Duration,
        chunk: usize,
        line: Vec<u8>,
        held: Option<(Instant, Vec<u8>)>,
        rx: std::collections::VecDeque<u8>,
        fired: bool,
    }

    impl LateReply {
        fn new(inner: MockAdapter, command: &'static str, delay: Duration, chunk: usize) -> Self {
            Self {
                inner,
                command,
                delay,
                chunk,
                line: Vec::new(),
                held: None,
                rx: Default::default(),
                fired: false,
            }
        }

        fn take_inner(&mut self) -> Vec<u8> {
            let mut out = Vec::new();
            let mut buf = [0u8; 256];
            while self.inner.pending_input().unwrap_or(0) > 0 {
                match self.inner.read(&mut buf) {
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
            out
        }

        fn pump(&mut self) {
            if matches!(&self.held, Some((due, _)) if Instant::now() < *due) {
                return;
            }
            if let Some((_, late)) = self.held.take() {
                self.rx.extend(late);
            }
            let fresh = self.take_inner();
            self.rx.extend(fresh);
        }
    }

    impl Write for LateReply {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.inner.write_all(buf)?;
            self.line.extend_from_slice(buf);
            if self.line.contains(&b'\r') {
                let command = String::from_utf8_lossy(&self.line).trim().to_string();
                self.line.clear();
                if !self.fired && command == self.command {
                    self.fired = true;
                    let late = self.take_inner();
                    self.held = Some((Instant::now() + self.delay, late));
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Read for LateReply {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.pump();
            if self.rx.is_empty() {
                std::thread::sleep(Duration::from_millis(2));
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle"));
            }
            let n = buf.len().min(self.chunk).min(self.rx.len());
            for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Transport for LateReply {
        fn pending_input(&mut self) -> std::io::Result<usize> {
            self.pump();
            Ok(self.rx.len())
        }
    }

    async fn with_late_rpm(chunk: usize) -> (MockAdapter, ObdClient) {
        let adapter = MockAdapter::vehicle();
        let mut client = ObdClient::new(ClientConfig {
            timeout_ms: 100,
            connect_timeout_ms: 200,
            ..Default::default()
        });
        let late = LateReply::new(adapter.clone(), "010C", Duration::from_millis(150), chunk);
        assert!(client.connect_transport(Box::new(late), "late").await);
        (adapter, client)
    }

    #[tokio::test]
    async fn test_late_reply_arriving_mid_exchange() {
        // One chunk carrying both replies, and chunks that end at the first prompt
        for chunk in [256, 14] {
            let (_, mut client) = with_late_rpm(chunk).await;
            assert_eq!(client.query_sensor("RPM").await, None);

            let mut results = Vec::new();
            for key in ["SPEED", "RPM", "SPEED", "RPM", "SPEED"] {
                results.push(client.query_sensor(key).await);
            }
            assert_eq!(
                results,
                vec![Some(60.0), Some(1726.0), Some(60.0), Some(1726.0), Some(60.0)],
                "chunk size {}",
                chunk
            );
        }
    }

    #[tokio::test]
    async fn test_late_reply_discarded_before_next_command() {
        let (adapter, mut client) = with_late_rpm(256).await;
        assert_eq!(client.query_sensor("RPM").await, None);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(client.query_sensor("SPEED").await, Some(60.0));

        let report = client.get_dtc().await;
        assert_eq!(report["ENGINE - CONFIRMED"][0].code, "P0301");
        assert_eq!(adapter.sent().last().map(String::as_str), Some("ATH0"));
        assert_eq!(client.query_sensor("RPM").await, Some(1726.0));
    }

    #[tokio::test]
    async fn test_mock_client_creation() {
        let client = ObdClient::mock();
        assert!(client.is_connected());
        assert!(client.is_simulation());
        assert_eq!(client.state().to_string(), "Connected");
    }

    #[tokio::test]
    async fn test_simulation_values() {
        let mut client = ObdClient::new(ClientConfig::default());
        assert!(client.connect(None, true).await);
        assert_eq!(client.query_sensor("FUEL_LEVEL").await, Some(75.0));
        let baro = client.query_sensor("BAROMETRIC_PRESSURE").await.unwrap();
        assert!((baro - 101.3).abs() <= 2.0);
        let rpm = client.query_sensor("RPM").await.unwrap();
        assert!(rpm >= 0.0);
        let first = client.query_sensor("RUN_TIME").await.unwrap();
        let second = client.query_sensor("RUN_TIME").await.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn test_successful_connection() {
        let adapter = MockAdapter::vehicle();
        let client = connected(&adapter).await;

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.protocol(), ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(client.supported_commands().len(), 16);

        let sent = adapter.sent();
        assert_eq!(&sent[..2], &["ATZ", "ATE0"]);
        assert!(sent.contains(&"0100".to_string()));
        assert!(sent.contains(&"0140".to_string()));
    }

    #[tokio::test]
    async fn test_supported_set_is_intersection() {
        // Only RPM (0x0C) and SPEED (0x0D) plus an unknown PID 0x01
        let adapter = MockAdapter::new().respond("0100", "41 00 80 18 00 00");
        let client = connected(&adapter).await;
        let supported: Vec<Pid> = client.supported_commands().iter().copied().collect();
        assert_eq!(supported, vec![Pid::Rpm, Pid::Speed]);
        assert!(!adapter.sent().contains(&"0120".to_string()));
    }

    #[tokio::test]
    async fn test_failed_connection() {
        let adapter = MockAdapter::new().respond("0100", "UNABLE TO CONNECT");
        let mut client = ObdClient::new(ClientConfig {
            timeout_ms: 100,
            connect_timeout_ms: 100,
            ..Default::default()
        });
        assert!(!client.connect_transport(Box::new(adapter), "mock").await);
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(!client.is_connected());
        assert!(!client.link().is_attached());
    }

    #[tokio::test]
    async fn test_silent_adapter_fails_connection() {
        let mut client = ObdClient::new(ClientConfig {
            timeout_ms: 50,
            connect_timeout_ms: 50,
            ..Default::default()
        });
        assert!(!client.connect_transport(Box::new(MockAdapter::new().silent()), "mock").await);
        assert_eq!(client.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_standard_query() {
        let adapter = MockAdapter::vehicle();
        let mut client = connected(&adapter).await;
        assert_eq!(client.query_sensor("RPM").await, Some(1726.0));
        assert_eq!(client.query_sensor("SPEED").await, Some(60.0));
        let volts = client.query_sensor("CONTROL_MODULE_VOLTAGE").await.unwrap();
        assert!((volts - 14.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unsupported_standard_key_is_not_queried() {
        let adapter = MockAdapter::new().respond("0100", "41 00 00 08 00 00");
        let mut client = connected(&adapter).await;
        let before = adapter.sent().len();
        assert_eq!(client.query_sensor("RPM").await, None);
        assert_eq!(adapter.sent().len(), before);
    }

    #[tokio::test]
    async fn test_no_data_yields_none() {
        let adapter = MockAdapter::new()
            .respond("0100", "41 00 00 18 00 00")
            .respond("010D", "NO DATA")
            .respond("010C", "41 0C 1A");
        let mut client = connected(&adapter).await;
        assert_eq!(client.query_sensor("SPEED").await, None);
        assert_eq!(client.query_sensor("RPM").await, None);
        assert_eq!(client.query_sensor("NOT_A_SENSOR").await, None);
    }

    #[tokio::test]
    async fn test_pro_pack_custom_pid_math() {
        let adapter = MockAdapter::vehicle().respond("221234", "62 12 34 0A 14");
        let mut client = connected(&adapter).await;

        let accepted = client.set_pro_definitions([(
            "TEST_OIL_TEMP".to_string(),
            ProSensorRecord::new("Test Oil", "C", true, true, 150.0).with_raw(
                "221234",
                Some("7E0"),
                "((A*256)+B)/100",
            ),
        )]);
        assert_eq!(accepted, 1);

        let value = client.query_sensor("TEST_OIL_TEMP").await.unwrap();
        assert!((value - 25.8).abs() < 1e-9);

        let sent = adapter.sent();
        let header_at = sent.iter().position(|c| c == "ATSH7E0").unwrap();
        assert_eq!(sent[header_at + 1], "221234");

        // Back to a standard PID restores the functional header once
        client.query_sensor("RPM").await.unwrap();
        client.query_sensor("SPEED").await.unwrap();
        let restores = adapter.sent().iter().filter(|c| *c == "ATSH7DF").count();
        assert_eq!(restores, 1);
    }

    #[tokio::test]
    async fn test_pro_pack_formula_fault_yields_none() {
        let adapter = MockAdapter::vehicle().respond("221234", "62 12 34 0A");
        let mut client = connected(&adapter).await;
        client.set_pro_definitions([(
            "TEST_OIL_TEMP".to_string(),
            ProSensorRecord::new("Test Oil", "C", true, true, 150.0).with_raw(
                "221234",
                None,
                "(A*256)+B",
            ),
        )]);
        assert_eq!(client.query_sensor("TEST_OIL_TEMP").await, None);
    }

    #[tokio::test]
    async fn test_invalid_pro_definitions_are_skipped() {
        let mut client = ObdClient::mock();
        let accepted = client.set_pro_definitions([
            (
                "GOOD".to_string(),
                ProSensorRecord::new("Good", "", true, true, 1.0).with_raw("2201", None, "A"),
            ),
            (
                "BAD".to_string(),
                ProSensorRecord::new("Bad", "", true, true, 1.0).with_raw("2202", None, "A +* B"),
            ),
        ]);
        assert_eq!(accepted, 1);
        assert!(client.registry().lookup("GOOD").is_some());
        assert!(client.registry().lookup("BAD").is_none());
        assert!(client.query_sensor("GOOD").await.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let adapter = MockAdapter::vehicle();
        let mut client = connected(&adapter).await;
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.link().is_attached());
        assert_eq!(client.query_sensor("RPM").await, None);
    }

    #[tokio::test]
    async fn test_queries_blocked_while_monitoring() {
        let adapter = MockAdapter::vehicle();
        let mut client = connected(&adapter).await;
        let guard = client.link().enter_monitor().unwrap();
        assert_eq!(client.query_sensor("RPM").await, None);
        drop(guard);
        assert_eq!(client.query_sensor("RPM").await, Some(1726.0));
    }
}
