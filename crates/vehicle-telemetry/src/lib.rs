//! Vehicle Telemetry
//!
//! Engine facade over the OBD client, the interlaced poll scheduler and
//! the CAN sniffer/injector. Handles configuration, logging setup and
//! pro-pack discovery, and keeps polling and bus monitoring apart.

mod engine;
mod error;
mod packs;
mod report;
mod settings;

use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

pub use engine::{Readings, TelemetryEngine};
pub use error::EngineError;
pub use packs::{discover_packs, load_packs};
pub use report::DiagnosticReport;
pub use settings::{EngineConfig, ENV_PREFIX};

/// Initialize logging at the given level
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("Tracing subscriber already installed");
    }
}
