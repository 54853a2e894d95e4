//! Startup configuration.
//!
//! Loaded once from a YAML file; `${VAR}` placeholders are substituted from the
//! environment before parsing. Nothing here is reloaded while the loop runs.

use crate::error::{EmeterError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "EMETER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/emeter.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub inverters: Vec<InverterConfig>,
    #[serde(default)]
    pub remote_sources: Vec<RemoteSourceConfig>,
    #[serde(default)]
    pub meters: MeterFeedConfig,
    #[serde(default)]
    pub virtual_meter: VirtualMeterConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Where the per-source energy ratchet is persisted
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub on_energy_regression: OnEnergyRegression,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A locally polled inverter reached over Modbus TCP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterConfig {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    pub max_watts: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl InverterConfig {
    /// Identifier used for the energy ratchet and in log lines
    pub fn source_id(&self) -> String {
        self.host.clone()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A remote HTTP telemetry endpoint (Hoymiles/OpenDTU style live data)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSourceConfig {
    pub url: String,
    pub max_watts: f64,
    /// Consecutive failures still answered from the cache
    #[serde(default = "default_max_timeouts")]
    pub max_timeouts: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RemoteSourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterFeedConfig {
    #[serde(default, deserialize_with = "deserialize_serials")]
    pub supply: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_serials")]
    pub consume: Vec<String>,
    /// Consumption field name -> supply field name
    #[serde(default = "default_consume_to_supply")]
    pub consume_to_supply: BTreeMap<String, String>,
    #[serde(default = "default_max_packets")]
    pub max_packets: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl MeterFeedConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn is_allowed(&self, serial: &str) -> bool {
        self.supply.iter().chain(self.consume.iter()).any(|s| s == serial)
    }

    /// Supply meters first, then consume meters, in configured order
    pub fn allowed_serials(&self) -> impl Iterator<Item = &String> {
        self.supply.iter().chain(self.consume.iter())
    }

    pub fn is_enabled(&self) -> bool {
        !self.supply.is_empty() || !self.consume.is_empty()
    }
}

impl Default for MeterFeedConfig {
    fn default() -> Self {
        Self {
            supply: Vec::new(),
            consume: Vec::new(),
            consume_to_supply: default_consume_to_supply(),
            max_packets: default_max_packets(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMeterConfig {
    #[serde(default = "default_virtual_serial")]
    pub serial: u32,
    #[serde(default = "default_susy_id")]
    pub susy_id: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_multicast_port")]
    pub port: u16,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// Local interface used to join the group
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
}

impl Default for VirtualMeterConfig {
    fn default() -> Self {
        Self {
            serial: default_virtual_serial(),
            susy_id: default_susy_id(),
            multicast_group: default_multicast_group(),
            port: default_multicast_port(),
            ttl: default_ttl(),
            interface: default_interface(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Sleep after a cycle that produced power
    #[serde(default = "default_active_interval")]
    pub active_interval_secs: u64,
    /// Sleep after a cycle with zero power (night)
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
    /// Backoff after a cycle failed as a whole
    #[serde(default = "default_recovery")]
    pub recovery_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            active_interval_secs: default_active_interval(),
            idle_interval_secs: default_idle_interval(),
            recovery_secs: default_recovery(),
        }
    }
}

/// What a remote source reports when its energy counter went backwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnEnergyRegression {
    /// Reuse the last value accepted into the persisted state
    #[default]
    HoldPrevious,
    /// Reuse the in-memory cache, which is empty (0 kWh) after a restart
    UseCachedFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file in addition to stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/tmp/sma_last_energy.json")
}
fn default_modbus_port() -> u16 {
    502
}
fn default_unit_id() -> u8 {
    3
}
fn default_timeout_ms() -> u64 {
    2000
}
fn default_max_timeouts() -> u32 {
    3
}
fn default_consume_to_supply() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("pconsume".to_string(), "psupply".to_string()),
        ("pconsumecounter".to_string(), "psupplycounter".to_string()),
    ])
}
fn default_max_packets() -> usize {
    10
}
fn default_read_timeout_ms() -> u64 {
    500
}
fn default_virtual_serial() -> u32 {
    1_900_888_888
}
fn default_susy_id() -> u16 {
    349
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 12, 255, 254)
}
fn default_multicast_port() -> u16 {
    9522
}
fn default_ttl() -> u32 {
    32
}
fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_active_interval() -> u64 {
    5
}
fn default_idle_interval() -> u64 {
    60
}
fn default_recovery() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".into()
}

/// Meter serials show up as bare numbers in most configs; compare them as strings.
fn deserialize_serials<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Serial {
        Number(u64),
        Text(String),
    }

    let raw = Vec::<Serial>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|s| match s {
            Serial::Number(n) => n.to_string(),
            Serial::Text(t) => t.trim().to_string(),
        })
        .collect())
}

impl Config {
    /// Load the file named by `EMETER_CONFIG`, falling back to the default path
    pub fn load_from_env() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EmeterError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let expanded = expand_env_placeholders(raw)?;
        let cfg: Self = serde_yaml::from_str(&expanded)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inverters.is_empty() && self.remote_sources.is_empty() && !self.meters.is_enabled()
        {
            return Err(EmeterError::config(
                "at least one inverter, remote source or meter must be configured",
            ));
        }
        for inv in &self.inverters {
            if inv.max_watts <= 0.0 {
                return Err(EmeterError::config(format!(
                    "inverter {}: max_watts must be positive",
                    inv.host
                )));
            }
        }
        for remote in &self.remote_sources {
            if remote.max_watts <= 0.0 {
                return Err(EmeterError::config(format!(
                    "remote source {}: max_watts must be positive",
                    remote.url
                )));
            }
        }
        if self.meters.max_packets == 0 {
            return Err(EmeterError::config("meters.max_packets must be at least 1"));
        }
        if let Some(dup) = self
            .meters
            .consume
            .iter()
            .find(|s| self.meters.supply.contains(s))
        {
            return Err(EmeterError::config(format!(
                "meter {dup} is listed as both supply and consume"
            )));
        }
        let serial = self.virtual_meter.serial.to_string();
        if serial.len() != 10 || !serial.starts_with("1900") {
            return Err(EmeterError::config(format!(
                "virtual_meter.serial {serial} must have 10 digits and start with 1900"
            )));
        }
        // The emitted frames would be read back as meter input
        if self.meters.is_allowed(&serial) {
            return Err(EmeterError::config(format!(
                "virtual_meter.serial {serial} is also listed as a meter"
            )));
        }
        if !self.virtual_meter.multicast_group.is_multicast() {
            return Err(EmeterError::config(format!(
                "virtual_meter.multicast_group {} is not a multicast address",
                self.virtual_meter.multicast_group
            )));
        }
        Ok(())
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.active_interval_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.idle_interval_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.recovery_secs)
    }
}

/// Expand `${VAR}` placeholders from the environment; `$$` is a literal `$`.
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
            }
            Some('{') => {
                it.next();
                let mut var = String::new();
                let mut closed = false;
                for ch in it.by_ref() {
                    if ch == '}' {
                        closed = true;
                        break;
                    }
                    var.push(ch);
                }
                if !closed {
                    return Err(EmeterError::config(
                        "unterminated env placeholder: missing '}'",
                    ));
                }
                let val = std::env::var(&var).map_err(|_| {
                    EmeterError::config(format!("missing environment variable: {var}"))
                })?;
                out.push_str(&val);
            }
            _ => out.push('$'),
        }
    }
    Ok(out)
}
