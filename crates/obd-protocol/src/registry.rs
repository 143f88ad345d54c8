//! Sensor definition registry
//!
//! Two layers: the built-in catalog (base) and pro-pack definitions
//! (overrides). Lookup tries the override layer first, and every key
//! remembers where its definition came from.

use crate::error::RegistryError;
use crate::formula::Formula;
use crate::pid::{Pid, STANDARD_SENSORS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Label used for definitions handed over through `set_pro_definitions`
pub const DIRECT_PACK_LABEL: &str = "pro";

/// Where a definition came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorSource {
    /// Built-in catalog
    Standard,
    /// External pro-pack, identified by its label (usually a relative path)
    Pack(String),
}

impl fmt::Display for SensorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorSource::Standard => f.write_str("Standard"),
            SensorSource::Pack(label) => f.write_str(label),
        }
    }
}

/// Everything known about one sensor key
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDefinition {
    pub key: String,
    pub name: String,
    pub unit: String,
    pub show: bool,
    pub log: bool,
    pub limit: f64,
    pub description: String,
    /// Raw request bytes as hex (`221234`), for sensors outside the catalog
    pub raw_pid: Option<String>,
    /// Bus header to address the request to (`7E0`)
    pub header: Option<String>,
    /// Decoding formula for the raw response
    pub formula: Option<Formula>,
}

impl SensorDefinition {
    fn from_standard(sensor: &crate::pid::StandardSensor) -> Self {
        Self {
            key: sensor.pid.key().to_string(),
            name: sensor.name.to_string(),
            unit: sensor.unit.to_string(),
            show: sensor.show,
            log: sensor.log,
            limit: sensor.limit,
            description: sensor.description.to_string(),
            raw_pid: None,
            header: None,
            formula: None,
        }
    }

    /// Raw request and formula, when this sensor needs raw protocol access
    pub fn raw_access(&self) -> Option<(&str, Option<&str>, &Formula)> {
        match (&self.raw_pid, &self.formula) {
            (Some(pid), Some(formula)) => Some((pid.as_str(), self.header.as_deref(), formula)),
            _ => None,
        }
    }

    /// Catalog PID behind this key, if any
    pub fn standard_pid(&self) -> Option<Pid> {
        Pid::from_key(&self.key)
    }
}

/// One pro-pack record: `[name, unit, show, log, limit, raw_pid?, header?, formula?]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProSensorRecord {
    pub name: String,
    pub unit: String,
    pub show: bool,
    pub log: bool,
    pub limit: f64,
    pub raw_pid: Option<String>,
    pub header: Option<String>,
    pub formula: Option<String>,
}

impl ProSensorRecord {
    /// Definition-only record (indices 0–4)
    pub fn new(name: &str, unit: &str, show: bool, log: bool, limit: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            show,
            log,
            limit,
            raw_pid: None,
            header: None,
            formula: None,
        }
    }

    /// Attach raw protocol access (indices 5–7)
    pub fn with_raw(mut self, raw_pid: &str, header: Option<&str>, formula: &str) -> Self {
        self.raw_pid = Some(raw_pid.to_string());
        self.header = header.map(str::to_string);
        self.formula = Some(formula.to_string());
        self
    }

    /// Build a record from the positional JSON array form
    pub fn from_values(key: &str, values: &[Value]) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidRecord {
            key: key.to_string(),
            reason,
        };

        if values.len() < 5 {
            return Err(invalid(format!(
                "expected at least 5 fields, found {}",
                values.len()
            )));
        }

        let text = |idx: usize| -> Result<String, RegistryError> {
            values[idx]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("field {} must be a string", idx)))
        };
        let flag = |idx: usize| -> Result<bool, RegistryError> {
            values[idx]
                .as_bool()
                .ok_or_else(|| invalid(format!("field {} must be a boolean", idx)))
        };
        let optional = |idx: usize| -> Result<Option<String>, RegistryError> {
            match values.get(idx) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
                Some(_) => Err(invalid(format!("field {} must be a string or null", idx))),
            }
        };

        let limit = match &values[4] {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| invalid("field 4 must be numeric".to_string()))?;

        Ok(Self {
            name: text(0)?,
            unit: text(1)?,
            show: flag(2)?,
            log: flag(3)?,
            limit,
            raw_pid: optional(5)?,
            header: optional(6)?,
            formula: optional(7)?,
        })
    }

    /// Validate and turn into a definition
    pub fn into_definition(self, key: &str) -> Result<SensorDefinition, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidRecord {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let raw_pid = self.raw_pid.map(|p| compact_hex(&p));
        if let Some(pid) = &raw_pid {
            if pid.len() < 2 || pid.len() % 2 != 0 || !pid.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid("raw PID must be an even number of hex digits"));
            }
        }

        let header = self.header.map(|h| compact_hex(&h));
        if let Some(header) = &header {
            if !matches!(header.len(), 3 | 6 | 8) || !header.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid("header must be 3, 6 or 8 hex digits"));
            }
        }

        let formula = self
            .formula
            .as_deref()
            .map(Formula::parse)
            .transpose()
            .map_err(|source| RegistryError::InvalidFormula {
                key: key.to_string(),
                source,
            })?;

        if raw_pid.is_some() && formula.is_none() {
            return Err(invalid("raw PID given without a formula"));
        }

        Ok(SensorDefinition {
            key: key.to_string(),
            description: self.name.clone(),
            name: self.name,
            unit: self.unit,
            show: self.show,
            log: self.log,
            limit: self.limit,
            raw_pid,
            header,
            formula,
        })
    }
}

fn compact_hex(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// A named set of external sensor definitions
#[derive(Debug, Clone, Default)]
pub struct ProPack {
    label: String,
    sensors: BTreeMap<String, SensorDefinition>,
}

impl ProPack {
    /// Build a pack from already-parsed records; fails on the first bad record
    pub fn from_records(
        label: &str,
        records: impl IntoIterator<Item = (String, ProSensorRecord)>,
    ) -> Result<Self, RegistryError> {
        let mut sensors = BTreeMap::new();
        for (key, record) in records {
            let definition = record.into_definition(&key)?;
            sensors.insert(key, definition);
        }
        Ok(Self {
            label: label.to_string(),
            sensors,
        })
    }

    /// Build a pack from the valid records, returning the rejected ones' errors
    pub fn from_records_lossy(
        label: &str,
        records: impl IntoIterator<Item = (String, ProSensorRecord)>,
    ) -> (Self, Vec<RegistryError>) {
        let mut sensors = BTreeMap::new();
        let mut rejected = Vec::new();
        for (key, record) in records {
            match record.into_definition(&key) {
                Ok(definition) => {
                    sensors.insert(key, definition);
                }
                Err(e) => rejected.push(e),
            }
        }
        let pack = Self {
            label: label.to_string(),
            sensors,
        };
        (pack, rejected)
    }

    /// Parse a pack document: `{ "KEY": [name, unit, show, log, limit, ...] }`
    pub fn from_json(label: &str, text: &str) -> Result<Self, RegistryError> {
        let document: BTreeMap<String, Vec<Value>> =
            serde_json::from_str(text).map_err(|e| RegistryError::MalformedPack {
                pack: label.to_string(),
                reason: e.to_string(),
            })?;

        let records = document
            .into_iter()
            .map(|(key, values)| {
                ProSensorRecord::from_values(&key, &values).map(|record| (key, record))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pack = Self::from_records(label, records)?;
        debug!("Parsed pack {} with {} sensor(s)", label, pack.len());
        Ok(pack)
    }

    /// Pack label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of sensors in the pack
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    /// Whether the pack defines nothing
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

/// Effective per-key settings after user preferences
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    pub show: bool,
    pub log: bool,
    pub limit: f64,
}

/// Layered sensor definition table
#[derive(Debug, Clone, Default)]
pub struct PidRegistry {
    base: BTreeMap<String, SensorDefinition>,
    overrides: BTreeMap<String, (SensorDefinition, String)>,
    preferences: HashMap<String, SensorSettings>,
}

impl PidRegistry {
    /// Definitions of the built-in catalog
    pub fn standard_definitions() -> Vec<SensorDefinition> {
        STANDARD_SENSORS
            .iter()
            .map(SensorDefinition::from_standard)
            .collect()
    }

    /// Registry holding only the built-in catalog
    pub fn standard() -> Self {
        Self::load(Self::standard_definitions(), Vec::new())
    }

    /// Build the layered table; later packs shadow earlier ones
    pub fn load(standard: Vec<SensorDefinition>, packs: Vec<ProPack>) -> Self {
        let base = standard
            .into_iter()
            .map(|def| (def.key.clone(), def))
            .collect();
        let mut registry = Self {
            base,
            overrides: BTreeMap::new(),
            preferences: HashMap::new(),
        };
        registry.replace_packs(packs);
        registry
    }

    /// Swap the override layer for a new set of packs
    pub fn replace_packs(&mut self, packs: Vec<ProPack>) {
        self.overrides.clear();
        for pack in packs {
            info!("Loaded pack {} ({} sensors)", pack.label, pack.len());
            for (key, definition) in pack.sensors {
                if self.base.contains_key(&key) {
                    debug!("Pack {} overrides standard sensor {}", pack.label, key);
                }
                if let Some((_, previous)) = self.overrides.get(&key) {
                    warn!("Pack {} overrides {} from pack {}", pack.label, key, previous);
                }
                self.overrides.insert(key, (definition, pack.label.clone()));
            }
        }
    }

    /// Apply collaborator-supplied preferences (show/log/limit per key)
    pub fn with_preferences(mut self, preferences: HashMap<String, SensorSettings>) -> Self {
        self.preferences = preferences;
        self
    }

    /// Resolve a key: override layer first, then the catalog
    pub fn lookup(&self, key: &str) -> Option<&SensorDefinition> {
        self.overrides
            .get(key)
            .map(|(def, _)| def)
            .or_else(|| self.base.get(key))
    }

    /// Provenance of a key
    pub fn source(&self, key: &str) -> Option<SensorSource> {
        if let Some((_, label)) = self.overrides.get(key) {
            Some(SensorSource::Pack(label.clone()))
        } else if self.base.contains_key(key) {
            Some(SensorSource::Standard)
        } else {
            None
        }
    }

    /// Effective settings: preferences win over definition defaults
    pub fn settings(&self, key: &str) -> Option<SensorSettings> {
        let def = self.lookup(key)?;
        Some(self.preferences.get(key).copied().unwrap_or(SensorSettings {
            show: def.show,
            log: def.log,
            limit: def.limit,
        }))
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        self.base
            .keys()
            .chain(self.overrides.keys())
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Keys currently shown or logged
    pub fn active_keys(&self) -> Vec<&str> {
        self.keys()
            .into_iter()
            .filter(|key| {
                self.settings(key)
                    .map(|s| s.show || s.log)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.overrides.is_empty()
    }
}
