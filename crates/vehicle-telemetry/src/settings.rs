//! Engine settings
//!
//! Values come from built-in defaults, then an optional TOML/JSON/YAML file,
//! then `OBD_TELEMETRY__*` environment variables (`__` separates sections,
//! e.g. `OBD_TELEMETRY__CLIENT__TIMEOUT_MS=500`).

use crate::error::EngineError;
use can_interface::SnifferConfig;
use config::{Config, Environment, File};
use obd_protocol::ClientConfig;
use obd_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::Level;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "OBD_TELEMETRY";

/// Telemetry engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Serial device; `None` scans the candidate ports
    pub port: Option<String>,

    /// Use the built-in simulated ECU instead of hardware
    pub simulation: bool,

    /// Maximum log level (`trace` .. `error`)
    pub log_level: String,

    /// Directory searched recursively for `*.json` pro-packs
    pub pack_dir: Option<PathBuf>,

    /// Adapter exchange settings
    pub client: ClientConfig,

    /// Poll rotation settings
    pub scheduler: SchedulerConfig,

    /// Bus monitor settings
    pub sniffer: SnifferConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: None,
            simulation: false,
            log_level: "info".to_string(),
            pack_dir: None,
            client: ClientConfig::default(),
            scheduler: SchedulerConfig::default(),
            sniffer: SnifferConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for running against the simulated ECU
    pub fn simulated() -> Self {
        Self {
            simulation: true,
            ..Default::default()
        }
    }

    /// Layer an optional file and the environment over the defaults
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parsed log level; unknown names fall back to `INFO`
    pub fn level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }
}
