//! Persisted energy ratchet.
//!
//! Holds the last accepted cumulative energy (kWh) per source id and rewrites the
//! whole map to disk once per cycle. A missing or unreadable file at startup
//! means an empty state.

use crate::error::{EmeterError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Outcome of offering a new counter value to the ratchet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ratchet {
    Accepted,
    /// The value went backwards (or is not finite); the stored value is kept
    Rejected { previous: f64 },
}

#[derive(Debug, Clone)]
pub struct EnergyStateStore {
    file_path: PathBuf,
    values: BTreeMap<String, f64>,
}

impl EnergyStateStore {
    /// Empty store that will be saved to `file_path`
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            values: BTreeMap::new(),
        }
    }

    /// Load from disk; any failure is logged and yields an empty store
    pub fn load(file_path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(file_path);
        match read_state(&store.file_path) {
            Ok(Some(values)) => {
                info!(
                    "Loaded energy state for {} source(s) from {}",
                    values.len(),
                    store.file_path.display()
                );
                store.values = values;
            }
            Ok(None) => info!(
                "No energy state at {}, starting empty",
                store.file_path.display()
            ),
            Err(e) => error!("Failed to load energy state: {e}"),
        }
        store
    }

    pub fn get(&self, source_id: &str) -> Option<f64> {
        self.values.get(source_id).copied()
    }

    /// Stored value, or 0 kWh for a source never seen before
    pub fn previous(&self, source_id: &str) -> f64 {
        self.get(source_id).unwrap_or(0.0)
    }

    /// Offer `energy_kwh` for `source_id`; only a finite value that does not go
    /// below the stored one replaces it.
    pub fn ratchet(&mut self, source_id: &str, energy_kwh: f64) -> Ratchet {
        let previous = self.previous(source_id);
        if energy_kwh.is_finite() && energy_kwh >= previous {
            self.values.insert(source_id.to_string(), energy_kwh);
            Ratchet::Accepted
        } else {
            Ratchet::Rejected { previous }
        }
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Overwrite the state file: write a sibling temp file, then rename over it.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EmeterError::persistence(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }
        let contents = serde_json::to_string(&self.values)
            .map_err(|e| EmeterError::persistence(e.to_string()))?;

        let mut tmp = self.file_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, contents)
            .map_err(|e| EmeterError::persistence(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.file_path).map_err(|e| {
            EmeterError::persistence(format!("replace {}: {}", self.file_path.display(), e))
        })?;
        debug!("Saved energy state to {}", self.file_path.display());
        Ok(())
    }
}

fn read_state(path: &Path) -> Result<Option<BTreeMap<String, f64>>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| EmeterError::persistence(format!("read {}: {}", path.display(), e)))?;
    let values = serde_json::from_str(&contents)
        .map_err(|e| EmeterError::persistence(format!("parse {}: {}", path.display(), e)))?;
    Ok(Some(values))
}
