//! Pro-pack discovery
//!
//! Packs are JSON files under a pack directory, usually grouped by make
//! (`bmw/n54.json`). Each is labelled by its path relative to that
//! directory and they load in label order, so a later file shadows an
//! earlier one on key collisions.

use crate::error::EngineError;
use obd_protocol::ProPack;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Every `*.json` file below `dir`, sorted by relative path
pub fn discover_packs(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|source| EngineError::Io {
            path: current.display().to_string(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
                found.push(path);
            }
        }
    }

    found.sort();
    debug!("Found {} pack file(s) in {}", found.len(), dir.display());
    Ok(found)
}

fn pack_label(dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(dir).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parse every pack below `dir`
///
/// An unreadable or malformed file is skipped with a warning; only a
/// missing or unreadable directory is an error.
pub fn load_packs(dir: &Path) -> Result<Vec<ProPack>, EngineError> {
    let mut packs = Vec::new();

    for path in discover_packs(dir)? {
        let label = pack_label(dir, &path);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Skipping pack {}: {}", label, e);
                continue;
            }
        };
        match ProPack::from_json(&label, &text) {
            Ok(pack) => packs.push(pack),
            Err(e) => warn!("Skipping pack {}: {}", label, e),
        }
    }

    info!("Loaded {} pack(s) from {}", packs.len(), dir.display());
    Ok(packs)
}
