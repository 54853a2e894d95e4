use std::fmt;

/// Which class of source produced a reading; only affects log labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Inverter,
    Remote,
    Meter,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Inverter => write!(f, "SMA"),
            SourceKind::Remote => write!(f, "Hoymiles"),
            SourceKind::Meter => write!(f, "SMAMeter"),
        }
    }
}

/// One source's contribution for the current cycle.
///
/// Adapters have already applied the power ceiling, so `power_watts` is what gets
/// summed. `energy_kwh` still has to pass the ratchet in the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReading {
    pub source_id: String,
    pub kind: SourceKind,
    pub power_watts: f64,
    pub energy_kwh: f64,
    /// `false` means the source failed this cycle and contributes nothing
    pub valid: bool,
    /// Values were substituted from the last good poll
    pub cached: bool,
}

impl SourceReading {
    pub fn new(
        source_id: impl Into<String>,
        kind: SourceKind,
        power_watts: f64,
        energy_kwh: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            power_watts,
            energy_kwh,
            valid: true,
            cached: false,
        }
    }

    pub fn cached(
        source_id: impl Into<String>,
        kind: SourceKind,
        power_watts: f64,
        energy_kwh: f64,
    ) -> Self {
        Self {
            cached: true,
            ..Self::new(source_id, kind, power_watts, energy_kwh)
        }
    }

    /// Short name for log lines: the host part for URL sources
    pub fn label(&self) -> &str {
        let id = self.source_id.as_str();
        match id.split_once("://") {
            Some((_, rest)) => rest.split('/').next().unwrap_or(rest),
            None => id,
        }
    }

    pub fn invalid(source_id: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            valid: false,
            ..Self::new(source_id, kind, 0.0, 0.0)
        }
    }
}

/// Power counts iff `0 < power <= max_watts`; NaN never counts.
pub fn power_in_range(power_watts: f64, max_watts: f64) -> bool {
    power_watts > 0.0 && power_watts <= max_watts
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
