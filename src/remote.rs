//! Remote HTTP telemetry sources (Hoymiles DTU live data).
//!
//! Each endpoint keeps an in-memory cache of its last good values. A failed
//! poll is answered from that cache until `max_timeouts` consecutive failures
//! have piled up; after that the source contributes nothing until it recovers.

use crate::config::{OnEnergyRegression, RemoteSourceConfig};
use crate::error::{EmeterError, Result};
use crate::reading::{power_in_range, SourceKind, SourceReading};
use serde_derive::{Deserialize, Serialize};
use tracing::{error, warn};

/// `{"total": {"Power": {"v", "u"}, "YieldTotal": {"v", "u"}}}`
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    pub total: LiveTotals,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTotals {
    #[serde(rename = "Power")]
    pub power: Quantity,
    #[serde(rename = "YieldTotal")]
    pub yield_total: Quantity,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub v: f64,
    pub u: String,
}

/// Convert a power reading to watts
pub fn normalize_power(value: f64, unit: &str) -> Result<f64> {
    match unit {
        "W" => Ok(value),
        "kW" => Ok(value * 1000.0),
        "mW" => Ok(value / 1000.0),
        other => Err(EmeterError::unit("power", other)),
    }
}

/// Convert an energy reading to kWh
pub fn normalize_energy(value: f64, unit: &str) -> Result<f64> {
    match unit {
        "kWh" => Ok(value),
        "Wh" => Ok(value / 1000.0),
        "MWh" => Ok(value * 1000.0),
        other => Err(EmeterError::unit("energy", other)),
    }
}

/// Last known good values for one endpoint; lives as long as the process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoymilesCacheEntry {
    pub source_id: String,
    pub last_power_watts: f64,
    pub last_energy_kwh: f64,
    pub consecutive_timeouts: u32,
}

impl HoymilesCacheEntry {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }
}

/// Power in W and energy in kWh after unit normalisation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub power_watts: f64,
    pub energy_kwh: f64,
}

impl TryFrom<LiveData> for Telemetry {
    type Error = EmeterError;

    fn try_from(data: LiveData) -> Result<Self> {
        Ok(Self {
            power_watts: normalize_power(data.total.power.v, &data.total.power.u)?,
            energy_kwh: normalize_energy(data.total.yield_total.v, &data.total.yield_total.u)?,
        })
    }
}

pub struct RemoteSourceAdapter {
    config: RemoteSourceConfig,
    on_regression: OnEnergyRegression,
    client: reqwest::Client,
    cache: HoymilesCacheEntry,
}

impl RemoteSourceAdapter {
    pub fn new(config: RemoteSourceConfig, on_regression: OnEnergyRegression) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EmeterError::config(format!("HTTP client for {}: {}", config.url, e)))?;
        let cache = HoymilesCacheEntry::new(config.url.clone());
        Ok(Self {
            config,
            on_regression,
            client,
            cache,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.config.url
    }

    pub fn cache(&self) -> &HoymilesCacheEntry {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut HoymilesCacheEntry {
        &mut self.cache
    }

    /// Poll once and apply the cache policy. `previous_energy` is the value
    /// currently held in the persisted ratchet for this source.
    pub async fn poll(&mut self, previous_energy: f64) -> SourceReading {
        let outcome = self.fetch().await;
        self.apply(outcome, previous_energy)
    }

    async fn fetch(&self) -> Result<Telemetry> {
        let data: LiveData = self
            .client
            .get(&self.config.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Telemetry::try_from(data)
    }

    /// Cache policy, split from the HTTP call so it can be driven directly
    pub fn apply(&mut self, outcome: Result<Telemetry>, previous_energy: f64) -> SourceReading {
        match outcome {
            Ok(telemetry) => self.accept(telemetry, previous_energy),
            Err(e) if e.counts_as_poll_failure() => self.fallback(&e),
            Err(e) => {
                error!("[Hoymiles] {}: {}", self.config.url, e);
                SourceReading::invalid(self.config.url.clone(), SourceKind::Remote)
            }
        }
    }

    fn accept(&mut self, telemetry: Telemetry, previous_energy: f64) -> SourceReading {
        let Telemetry {
            power_watts,
            energy_kwh,
        } = telemetry;

        let power = if power_in_range(power_watts, self.config.max_watts) {
            self.cache.last_power_watts = power_watts;
            self.cache.consecutive_timeouts = 0;
            power_watts
        } else {
            warn!(
                "[Hoymiles] {}: Ignoring power value {} W (limit {})",
                self.config.url, power_watts, self.config.max_watts
            );
            0.0
        };

        let energy = if energy_kwh.is_finite() && energy_kwh >= previous_energy {
            self.cache.last_energy_kwh = energy_kwh;
            energy_kwh
        } else {
            let substitute = match self.on_regression {
                OnEnergyRegression::HoldPrevious => previous_energy,
                OnEnergyRegression::UseCachedFallback => self.cache.last_energy_kwh,
            };
            warn!(
                "[Hoymiles] Energy value for {} decreased from {} to {}, using {}",
                self.config.url, previous_energy, energy_kwh, substitute
            );
            substitute
        };

        SourceReading::new(self.config.url.clone(), SourceKind::Remote, power, energy)
    }

    fn fallback(&mut self, err: &EmeterError) -> SourceReading {
        self.cache.consecutive_timeouts += 1;
        let timeouts = self.cache.consecutive_timeouts;
        error!(
            "[Hoymiles] Timeout/Error at {}: {} (#{})",
            self.config.url, err, timeouts
        );

        if timeouts <= self.config.max_timeouts {
            SourceReading::cached(
                self.config.url.clone(),
                SourceKind::Remote,
                self.cache.last_power_watts,
                self.cache.last_energy_kwh,
            )
        } else {
            warn!(
                "[Hoymiles] {} failed {} times in a row (limit {}), skipping",
                self.config.url, timeouts, self.config.max_timeouts
            );
            SourceReading::invalid(self.config.url.clone(), SourceKind::Remote)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL_PATH: &str = "/api/livedata/status";

    fn live_body(power: f64, power_unit: &str, energy: f64, energy_unit: &str) -> String {
        format!(
            r#"{{"inverters": [], "total": {{"Power": {{"v": {power}, "u": "{power_unit}", "d": 1}}, "YieldDay": {{"v": 1200, "u": "Wh", "d": 0}}, "YieldTotal": {{"v": {energy}, "u": "{energy_unit}", "d": 3}}}}}}"#
        )
    }

    fn adapter(url: String, max_timeouts: u32) -> RemoteSourceAdapter {
        RemoteSourceAdapter::new(
            RemoteSourceConfig {
                url,
                max_watts: 2500.0,
                max_timeouts,
                timeout_ms: 500,
            },
            OnEnergyRegression::HoldPrevious,
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_power() {
        assert_eq!(normalize_power(5.0, "kW").unwrap(), 5000.0);
        assert_eq!(normalize_power(5000.0, "mW").unwrap(), 5.0);
        assert_eq!(normalize_power(42.0, "W").unwrap(), 42.0);
        assert!(matches!(
            normalize_power(1.0, "GW"),
            Err(EmeterError::Unit { .. })
        ));
    }

    #[test]
    fn test_normalize_energy() {
        assert_eq!(normalize_energy(1500.0, "Wh").unwrap(), 1.5);
        assert_eq!(normalize_energy(2.0, "MWh").unwrap(), 2000.0);
        assert_eq!(normalize_energy(7.5, "kWh").unwrap(), 7.5);
        assert!(normalize_energy(1.0, "J").is_err());
    }

    #[tokio::test]
    async fn test_successful_poll_updates_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", URL_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(live_body(0.8, "kW", 2000.0, "Wh"))
            .create_async()
            .await;

        let mut a = adapter(format!("{}{}", server.url(), URL_PATH), 3);
        a.cache_mut().consecutive_timeouts = 2;
        let reading = a.poll(1.5).await;

        assert!(reading.valid);
        assert!(!reading.cached);
        assert_eq!(reading.power_watts, 800.0);
        assert_eq!(reading.energy_kwh, 2.0);
        assert_eq!(a.cache().last_power_watts, 800.0);
        assert_eq!(a.cache().last_energy_kwh, 2.0);
        assert_eq!(a.cache().consecutive_timeouts, 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_power_over_ceiling_contributes_zero() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", URL_PATH)
            .with_status(200)
            .with_body(live_body(3000.0, "W", 5.0, "kWh"))
            .create_async()
            .await;

        let mut a = adapter(format!("{}{}", server.url(), URL_PATH), 3);
        a.cache_mut().consecutive_timeouts = 1;
        let reading = a.poll(4.0).await;

        assert_eq!(reading.power_watts, 0.0);
        assert_eq!(reading.energy_kwh, 5.0);
        assert_eq!(a.cache().last_power_watts, 0.0);
        // Only an accepted power value clears the failure counter
        assert_eq!(a.cache().consecutive_timeouts, 1);
    }

    #[tokio::test]
    async fn test_energy_regression_holds_previous() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", URL_PATH)
            .with_status(200)
            .with_body(live_body(500.0, "W", 3.0, "kWh"))
            .create_async()
            .await;

        let mut a = adapter(format!("{}{}", server.url(), URL_PATH), 3);
        let reading = a.poll(4.0).await;

        assert_eq!(reading.power_watts, 500.0);
        assert_eq!(reading.energy_kwh, 4.0);
        assert_eq!(a.cache().last_energy_kwh, 0.0);
    }

    #[test]
    fn test_energy_regression_cached_fallback_policy() {
        let mut a = adapter("http://dtu.local/api/livedata/status".into(), 3);
        a.on_regression = OnEnergyRegression::UseCachedFallback;
        a.cache_mut().last_energy_kwh = 3.5;

        let reading = a.apply(
            Ok(Telemetry {
                power_watts: 100.0,
                energy_kwh: 1.0,
            }),
            4.0,
        );
        assert_eq!(reading.energy_kwh, 3.5);
    }

    #[tokio::test]
    async fn test_server_error_uses_cache() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", URL_PATH)
            .with_status(500)
            .create_async()
            .await;

        let mut a = adapter(format!("{}{}", server.url(), URL_PATH), 3);
        a.cache_mut().last_power_watts = 800.0;
        a.cache_mut().last_energy_kwh = 2.0;
        a.cache_mut().consecutive_timeouts = 1;

        let reading = a.poll(2.0).await;
        assert!(reading.valid);
        assert!(reading.cached);
        assert_eq!(reading.power_watts, 800.0);
        assert_eq!(reading.energy_kwh, 2.0);
        assert_eq!(a.cache().consecutive_timeouts, 2);
    }

    #[tokio::test]
    async fn test_missing_field_counts_as_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", URL_PATH)
            .with_status(200)
            .with_body(r#"{"total": {"Power": {"v": 100, "u": "W"}}}"#)
            .create_async()
            .await;

        let mut a = adapter(format!("{}{}", server.url(), URL_PATH), 3);
        let reading = a.poll(0.0).await;
        assert!(reading.cached);
        assert_eq!(a.cache().consecutive_timeouts, 1);
    }

    #[tokio::test]
    async fn test_non_numeric_value_counts_as_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", URL_PATH)
            .with_status(200)
            .with_body(
                r#"{"total": {"Power": {"v": "n/a", "u": "W"}, "YieldTotal": {"v": 1, "u": "kWh"}}}"#,
            )
            .create_async()
            .await;

        let mut a = adapter(format!("{}{}", server.url(), URL_PATH), 3);
        a.poll(0.0).await;
        assert_eq!(a.cache().consecutive_timeouts, 1);
    }

    #[tokio::test]
    async fn test_unknown_unit_counts_as_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", URL_PATH)
            .with_status(200)
            .with_body(live_body(1.0, "hp", 1.0, "kWh"))
            .create_async()
            .await;

        let mut a = adapter(format!("{}{}", server.url(), URL_PATH), 3);
        a.poll(0.0).await;
        assert_eq!(a.cache().consecutive_timeouts, 1);
    }

    #[test]
    fn test_timeout_budget_boundary() {
        let mut a = adapter("http://dtu.local/api/livedata/status".into(), 3);
        a.cache_mut().last_power_watts = 800.0;
        a.cache_mut().last_energy_kwh = 2.0;
        a.cache_mut().consecutive_timeouts = 2;

        // Third failure in a row: exactly at the budget, still cached
        let reading = a.apply(Err(EmeterError::timeout("2s")), 2.0);
        assert_eq!(a.cache().consecutive_timeouts, 3);
        assert!(reading.valid && reading.cached);
        assert_eq!(reading.power_watts, 800.0);

        // Fourth: over budget, contributes nothing
        let reading = a.apply(Err(EmeterError::timeout("2s")), 2.0);
        assert_eq!(a.cache().consecutive_timeouts, 4);
        assert!(!reading.valid);
        assert_eq!(reading.power_watts, 0.0);
        assert_eq!(reading.energy_kwh, 0.0);
    }

    #[test]
    fn test_other_errors_skip_without_charging_budget() {
        let mut a = adapter("http://dtu.local/api/livedata/status".into(), 3);
        a.cache_mut().last_power_watts = 800.0;

        let reading = a.apply(Err(EmeterError::config("bad client")), 0.0);
        assert!(!reading.valid);
        assert_eq!(a.cache().consecutive_timeouts, 0);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_counts_as_failure() {
        // Nothing listens on the discard port
        let mut a = adapter("http://127.0.0.1:9/api/livedata/status".into(), 0);
        let reading = a.poll(0.0).await;
        assert!(!reading.valid);
        assert_eq!(a.cache().consecutive_timeouts, 1);
    }
}
