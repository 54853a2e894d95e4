//! Combines one cycle's readings into a single total.

use crate::energy_state::{EnergyStateStore, Ratchet};
use crate::reading::{round_to, SourceKind, SourceReading};
use crate::speedwire::MeterFrame;
use std::collections::BTreeMap;
use tracing::warn;

pub const SUPPLY_POWER_FIELD: &str = "psupply";
pub const SUPPLY_ENERGY_FIELD: &str = "psupplycounter";

/// Totals for one cycle. Values are kept unrounded; use the `display_*`
/// helpers for logging.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregateResult {
    pub total_power_watts: f64,
    pub total_energy_kwh: f64,
    pub per_source_log: Vec<String>,
}

impl AggregateResult {
    pub fn display_power(&self) -> f64 {
        round_to(self.total_power_watts, 2)
    }

    pub fn display_energy(&self) -> f64 {
        round_to(self.total_energy_kwh, 3)
    }

    /// `<fragment> | <fragment> | SUM: P=<W>W E=<kWh>kWh`
    pub fn summary(&self) -> String {
        let sum = format!(
            "SUM: P={:.2}W E={:.3}kWh",
            self.display_power(),
            self.display_energy()
        );
        self.per_source_log
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(sum.as_str()))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Supply view of a meter frame as a reading keyed by the meter serial
pub fn meter_reading(frame: &MeterFrame) -> SourceReading {
    SourceReading::new(
        frame.serial.clone(),
        SourceKind::Meter,
        frame.field(SUPPLY_POWER_FIELD).unwrap_or(0.0),
        frame.field(SUPPLY_ENERGY_FIELD).unwrap_or(0.0),
    )
}

/// Sum power and the energy values the ratchet accepts. A value that went
/// backwards contributes no energy. Cached readings are last known values and
/// are summed as given without touching the state; invalid readings contribute
/// nothing.
pub fn aggregate(
    readings: &[SourceReading],
    meter_frames: &BTreeMap<String, MeterFrame>,
    state: &mut EnergyStateStore,
) -> AggregateResult {
    let meters: Vec<SourceReading> = meter_frames.values().map(meter_reading).collect();
    let mut result = AggregateResult::default();

    for reading in readings.iter().chain(meters.iter()) {
        if !reading.valid {
            result
                .per_source_log
                .push(format!("{}:{} skipped", reading.kind, reading.label()));
            continue;
        }

        let energy = if reading.cached {
            reading.energy_kwh
        } else {
            match state.ratchet(&reading.source_id, reading.energy_kwh) {
                Ratchet::Accepted => reading.energy_kwh,
                Ratchet::Rejected { previous } => {
                    warn!(
                        "[{}] Energy value for {} decreased from {} to {}, ignoring",
                        reading.kind,
                        reading.label(),
                        previous,
                        reading.energy_kwh
                    );
                    0.0
                }
            }
        };

        result.total_power_watts += reading.power_watts;
        result.total_energy_kwh += energy;
        result.per_source_log.push(format!(
            "{}:{}{} P={:.2}W E={:.3}kWh",
            reading.kind,
            reading.label(),
            if reading.cached { " (cached)" } else { "" },
            round_to(reading.power_watts, 2),
            round_to(energy, 3)
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(entries: &[(&str, f64)]) -> EnergyStateStore {
        let mut store = EnergyStateStore::new("/unused");
        for (id, value) in entries {
            store.ratchet(id, *value);
        }
        store
    }

    #[test]
    fn test_inverter_plus_cached_remote() {
        let mut state = store_with(&[("inverter1", 9.0)]);
        let readings = vec![
            SourceReading::new("inverter1", SourceKind::Inverter, 5000.0, 10.0),
            SourceReading::cached("http://dtu.local/api/livedata", SourceKind::Remote, 800.0, 2.0),
        ];

        let result = aggregate(&readings, &BTreeMap::new(), &mut state);

        assert_eq!(result.total_power_watts, 5800.0);
        assert_eq!(result.total_energy_kwh, 12.0);
        assert_eq!(state.get("inverter1"), Some(10.0));
        assert_eq!(
            result.per_source_log[1],
            "Hoymiles:dtu.local (cached) P=800.00W E=2.000kWh"
        );
        assert!(result.summary().ends_with("SUM: P=5800.00W E=12.000kWh"));
    }

    #[test]
    fn test_regression_contributes_no_energy() {
        let mut state = store_with(&[("inverter1", 10.0)]);
        let readings = vec![SourceReading::new(
            "inverter1",
            SourceKind::Inverter,
            1000.0,
            4.2,
        )];

        let result = aggregate(&readings, &BTreeMap::new(), &mut state);

        assert_eq!(result.total_energy_kwh, 0.0);
        assert_eq!(result.total_power_watts, 1000.0);
        assert_eq!(state.get("inverter1"), Some(10.0));
    }

    #[test]
    fn test_meter_regression_contributes_no_energy() {
        let mut state = store_with(&[("1900000001", 50.0)]);
        let frames = BTreeMap::from([(
            "1900000001".to_string(),
            MeterFrame::new("1900000001")
                .with_field("psupply", 700.0)
                .with_field("psupplycounter", 49.0),
        )]);

        let result = aggregate(&[], &frames, &mut state);

        assert_eq!(result.total_power_watts, 700.0);
        assert_eq!(result.total_energy_kwh, 0.0);
        assert_eq!(state.get("1900000001"), Some(50.0));
    }

    #[test]
    fn test_cached_reading_bypasses_ratchet() {
        let url = "http://dtu.local/api/livedata/status";
        let mut state = store_with(&[(url, 2000.0)]);
        // Cache still empty after a restart
        let readings = vec![SourceReading::cached(url, SourceKind::Remote, 0.0, 0.0)];

        let result = aggregate(&readings, &BTreeMap::new(), &mut state);

        assert_eq!(result.total_energy_kwh, 0.0);
        assert_eq!(state.get(url), Some(2000.0));
    }

    #[test]
    fn test_invalid_reading_contributes_nothing() {
        let mut state = store_with(&[("inverter1", 10.0)]);
        let readings = vec![
            SourceReading::invalid("inverter1", SourceKind::Inverter),
            SourceReading::new("inverter2", SourceKind::Inverter, 250.0, 3.0),
        ];

        let result = aggregate(&readings, &BTreeMap::new(), &mut state);

        assert_eq!(result.total_power_watts, 250.0);
        assert_eq!(result.total_energy_kwh, 3.0);
        assert_eq!(state.get("inverter1"), Some(10.0));
        assert_eq!(result.per_source_log[0], "SMA:inverter1 skipped");
    }

    #[test]
    fn test_meter_supply_fields_are_summed() {
        let mut state = EnergyStateStore::new("/unused");
        let frames = BTreeMap::from([
            (
                "1900000001".to_string(),
                MeterFrame::new("1900000001")
                    .with_field("psupply", 1200.0)
                    .with_field("psupplycounter", 5.0)
                    .with_field("pconsume", 0.0),
            ),
            (
                "1900123456".to_string(),
                MeterFrame::new("1900123456")
                    .with_field("pconsume", 300.0)
                    .with_field("pconsumecounter", 1.2)
                    .with_field("psupply", 300.0)
                    .with_field("psupplycounter", 1.2),
            ),
        ]);

        let result = aggregate(&[], &frames, &mut state);

        assert_eq!(result.total_power_watts, 1500.0);
        assert!((result.total_energy_kwh - 6.2).abs() < 1e-9);
        assert_eq!(state.get("1900123456"), Some(1.2));
        assert!(result.per_source_log[0].starts_with("SMAMeter:1900000001"));
    }

    #[test]
    fn test_repeated_aggregation_is_stable() {
        let mut state = EnergyStateStore::new("/unused");
        let readings = vec![
            SourceReading::new("inverter1", SourceKind::Inverter, 1234.56, 10.0),
            SourceReading::new("inverter2", SourceKind::Inverter, 0.0, 7.5),
        ];

        let first = aggregate(&readings, &BTreeMap::new(), &mut state);
        let snapshot = state.values().clone();
        let second = aggregate(&readings, &BTreeMap::new(), &mut state);

        assert_eq!(first, second);
        assert_eq!(state.values(), &snapshot);
    }

    #[test]
    fn test_rounding_is_display_only() {
        let mut state = EnergyStateStore::new("/unused");
        let readings = vec![SourceReading::new(
            "inverter1",
            SourceKind::Inverter,
            100.004,
            1.0004,
        )];

        let result = aggregate(&readings, &BTreeMap::new(), &mut state);

        assert_eq!(result.display_power(), 100.0);
        assert_eq!(result.display_energy(), 1.0);
        assert_eq!(state.get("inverter1"), Some(1.0004));

        // A value between the rounded and raw stored value is still a regression
        let readings = vec![SourceReading::new(
            "inverter1",
            SourceKind::Inverter,
            100.0,
            1.0002,
        )];
        aggregate(&readings, &BTreeMap::new(), &mut state);
        assert_eq!(state.get("inverter1"), Some(1.0004));
    }
}
