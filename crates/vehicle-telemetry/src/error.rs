//! Engine error types

use can_interface::CanError;
use obd_protocol::RegistryError;
use thiserror::Error;

/// Errors surfaced by the telemetry engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Can(#[from] CanError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
