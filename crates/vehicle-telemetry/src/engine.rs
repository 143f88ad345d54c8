//! Telemetry engine
//!
//! Owns the OBD client, the poll scheduler and the CAN interface, all
//! bound to one adapter link. Polling and sniffing never run together:
//! while the bus monitor holds the link every poll comes back empty.

use crate::error::EngineError;
use crate::packs;
use crate::report::DiagnosticReport;
use crate::settings::EngineConfig;
use can_interface::{CanError, CanInterface, SnifferState};
use obd_protocol::{
    DtcReport, Link, ObdClient, PidRegistry, ProSensorRecord, SensorSettings,
};
use obd_scheduler::InterlacedScheduler;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// One tick's readings
pub type Readings = BTreeMap<String, f64>;

pub struct TelemetryEngine {
    config: EngineConfig,
    client: ObdClient,
    scheduler: InterlacedScheduler,
    can: CanInterface,
}

impl TelemetryEngine {
    pub fn new(config: EngineConfig) -> Self {
        let link = Link::new();
        let client = ObdClient::with_link(config.client.clone(), link.clone());
        let scheduler = InterlacedScheduler::new(config.scheduler.clone());
        let can = CanInterface::new(link, config.sniffer.clone());
        Self {
            config,
            client,
            scheduler,
            can,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &ObdClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ObdClient {
        &mut self.client
    }

    pub fn can(&self) -> &CanInterface {
        &self.can
    }

    pub fn scheduler(&self) -> &InterlacedScheduler {
        &self.scheduler
    }

    /// Load pro-packs from the configured directory
    ///
    /// Returns the number of pack sensors now registered. Preferences
    /// already applied are kept.
    pub fn load_packs(&mut self) -> Result<usize, EngineError> {
        let Some(dir) = self.config.pack_dir.clone() else {
            debug!("No pack directory configured");
            return Ok(0);
        };
        let packs = packs::load_packs(&dir)?;
        let count = packs.iter().map(|p| p.len()).sum();

        let mut registry = self.client.registry().clone();
        registry.replace_packs(packs);
        self.client.set_registry(registry);
        Ok(count)
    }

    /// Replace the pack layer with a single in-memory table
    pub fn set_pro_definitions(
        &mut self,
        definitions: impl IntoIterator<Item = (String, ProSensorRecord)>,
    ) -> usize {
        self.client.set_pro_definitions(definitions)
    }

    /// Apply per-key show/log/limit preferences
    pub fn set_preferences(&mut self, preferences: HashMap<String, SensorSettings>) {
        let registry = self.client.registry().clone().with_preferences(preferences);
        self.client.set_registry(registry);
    }

    pub fn registry(&self) -> &PidRegistry {
        self.client.registry()
    }

    /// Connect using the configured port (or probing) and mode
    pub async fn connect(&mut self) -> bool {
        self.can.stop_sniffing();
        self.scheduler.reset();
        let port = self.config.port.clone();
        self.client.connect(port.as_deref(), self.config.simulation).await
    }

    /// Stop any monitor and release the adapter
    pub async fn disconnect(&mut self) {
        self.can.stop_sniffing();
        self.client.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// One scheduler tick over the active sensors
    ///
    /// Empty while sniffing or disconnected.
    pub async fn poll<G: AsRef<str>>(&mut self, graphed: &[G]) -> Readings {
        if self.can.is_sniffing() {
            debug!("Poll skipped: bus monitor active");
            return Readings::new();
        }
        if !self.client.is_connected() {
            return Readings::new();
        }
        let active: Vec<String> = self
            .client
            .registry()
            .active_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        self.scheduler.poll_tick(&mut self.client, &active, graphed).await
    }

    /// Poll every tick interval until `shutdown` flips or the receiver goes away
    pub async fn run_polling(
        &mut self,
        graphed: Vec<String>,
        readings: mpsc::Sender<Readings>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = self.config.scheduler.tick_interval();
        info!("Polling started ({} graphed)", graphed.len());

        loop {
            if *shutdown.borrow() {
                break;
            }
            let tick = self.poll(&graphed).await;
            if !tick.is_empty() && readings.send(tick).await.is_err() {
                debug!("Readings receiver dropped");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Polling stopped after {} tick(s)", self.scheduler.ticks());
    }

    pub async fn query_sensor(&mut self, key: &str) -> Option<f64> {
        self.client.query_sensor(key).await
    }

    pub async fn get_dtc(&mut self) -> DtcReport {
        self.client.get_dtc().await
    }

    /// Clear codes; see [`Self::diagnostic_report`] for a backup first
    pub async fn clear_dtc(&mut self) -> bool {
        self.client.clear_dtc().await
    }

    pub async fn get_freeze_frame_snapshot<K: AsRef<str>>(
        &mut self,
        keys: impl IntoIterator<Item = K>,
    ) -> Readings {
        self.client.get_freeze_frame_snapshot(keys).await
    }

    /// Codes plus the freeze frame of every registered sensor
    pub async fn diagnostic_report(&mut self) -> DiagnosticReport {
        let codes = self.client.get_dtc().await;
        let keys: Vec<String> = self
            .client
            .registry()
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        let freeze_frame = self.client.get_freeze_frame_snapshot(&keys).await;
        let port = if self.client.is_simulation() {
            None
        } else {
            self.client.link().port_name()
        };
        DiagnosticReport::new(
            port,
            self.client.protocol().to_string(),
            codes,
            freeze_frame,
        )
    }

    /// Start the bus monitor, streaming raw lines to `callback`
    pub fn start_sniffing<F>(&self, callback: F) -> Result<(), EngineError>
    where
        F: FnMut(String) + Send + 'static,
    {
        if !self.client.is_connected() {
            return Err(CanError::NotConnected.into());
        }
        self.can.start_sniffing(callback)?;
        Ok(())
    }

    /// Start the bus monitor and receive its lines on a channel
    pub fn sniff_channel(&self) -> Result<mpsc::UnboundedReceiver<String>, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.start_sniffing(move |line| {
            if tx.send(line).is_err() {
                debug!("Sniffed line dropped: receiver closed");
            }
        })?;
        Ok(rx)
    }

    pub fn stop_sniffing(&self) {
        self.can.stop_sniffing();
    }

    pub fn is_sniffing(&self) -> bool {
        self.can.is_sniffing()
    }

    pub fn sniffer_state(&self) -> SnifferState {
        self.can.state()
    }

    /// Send one raw frame; stops the bus monitor first
    pub fn inject_frame(&self, header: &str, data: &str) -> Result<String, EngineError> {
        Ok(self.can.inject_frame(header, data)?)
    }
}

impl Drop for TelemetryEngine {
    fn drop(&mut self) {
        self.can.stop_sniffing();
    }
}
