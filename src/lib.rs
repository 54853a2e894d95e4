//! Inverter energy-meter aggregator.
//!
//! Polls SMA inverters over Modbus TCP, remote Hoymiles/OpenDTU endpoints over HTTP
//! and physical SMA energy meters on the Speedwire multicast group, then
//! re-broadcasts the combined feed-in as a single virtual energy meter.

pub mod aggregator;
pub mod config;
pub mod emitter;
pub mod energy_state;
pub mod error;
pub mod inverter;
pub mod logging;
pub mod meter_feed;
pub mod reading;
pub mod remote;
pub mod scheduler;
pub mod speedwire;

// Re-export commonly used types for easier access
pub use aggregator::{aggregate, AggregateResult};
pub use config::{Config, OnEnergyRegression};
pub use emitter::VirtualMeterEmitter;
pub use energy_state::EnergyStateStore;
pub use error::{EmeterError, Result};
pub use inverter::{DeviceSession, InverterSourceAdapter, ModbusInverterSession};
pub use meter_feed::MeterFeedListener;
pub use reading::{SourceKind, SourceReading};
pub use remote::RemoteSourceAdapter;
pub use scheduler::Scheduler;
pub use speedwire::{MeterCodec, MeterFrame, SpeedwireCodec};
