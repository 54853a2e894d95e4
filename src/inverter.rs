//! Locally polled inverters.
//!
//! [`DeviceSession`] is the narrow contract the adapter needs from a device;
//! [`ModbusInverterSession`] implements it for SMA inverters over Modbus TCP.

use crate::config::InverterConfig;
use crate::error::{EmeterError, Result};
use crate::reading::{power_in_range, SourceKind, SourceReading};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tracing::{error, info, warn};

/// AC active power, S32, W
pub const REG_POWER_AC_TOTAL: u16 = 30775;
/// Total yield, U32, Wh
pub const REG_ENERGY_TOTAL: u16 = 30529;

const S32_NAN: u32 = 0x8000_0000;
const U32_NAN: u32 = 0xFFFF_FFFF;

/// Raw values from one device update; `None` when the device reports no value
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceSample {
    pub power_ac_total: Option<f64>,
    /// kWh
    pub energy_total: Option<f64>,
}

#[async_trait]
pub trait DeviceSession: Send {
    /// Establish the session ahead of the first update
    async fn init(&mut self) -> Result<()>;

    /// Read fresh values; fails with [`EmeterError::Device`]
    async fn update(&mut self) -> Result<DeviceSample>;
}

/// SMA inverter reached over Modbus TCP
pub struct ModbusInverterSession {
    host: String,
    port: u16,
    unit_id: u8,
    io_timeout: Duration,
    connection: Option<client::Context>,
}

impl ModbusInverterSession {
    pub fn new(config: &InverterConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            unit_id: config.unit_id,
            io_timeout: config.timeout(),
            connection: None,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        let addr = resolve(self.host.clone(), self.port).await?;
        match timeout(self.io_timeout, tcp::connect_slave(addr, Slave(self.unit_id))).await {
            Ok(Ok(ctx)) => {
                info!("Connected to inverter {} (unit {})", addr, self.unit_id);
                self.connection = Some(ctx);
                Ok(())
            }
            Ok(Err(e)) => Err(EmeterError::device(format!("connect {addr}: {e}"))),
            Err(_) => Err(EmeterError::device(format!("connect {addr}: timed out"))),
        }
    }

    async fn read_u32(&mut self, register: u16) -> Result<u32> {
        let io_timeout = self.io_timeout;
        let ctx = self
            .connection
            .as_mut()
            .ok_or_else(|| EmeterError::device("not connected"))?;
        let words = match timeout(io_timeout, ctx.read_input_registers(register, 2)).await {
            Ok(Ok(Ok(words))) => words,
            Ok(Ok(Err(exception))) => {
                return Err(EmeterError::device(format!(
                    "register {register}: exception {exception:?}"
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(EmeterError::device(format!(
                    "register {register}: timed out"
                )))
            }
        };
        if words.len() < 2 {
            return Err(EmeterError::device(format!(
                "register {register}: short response"
            )));
        }
        Ok(merge_u16_u32(words[0], words[1]))
    }

    async fn read_sample(&mut self) -> Result<DeviceSample> {
        let power = decode_s32(self.read_u32(REG_POWER_AC_TOTAL).await?);
        let energy_wh = decode_u32(self.read_u32(REG_ENERGY_TOTAL).await?);
        Ok(DeviceSample {
            power_ac_total: power,
            energy_total: energy_wh.map(|wh| wh / 1000.0),
        })
    }
}

#[async_trait]
impl DeviceSession for ModbusInverterSession {
    async fn init(&mut self) -> Result<()> {
        if self.connection.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    async fn update(&mut self) -> Result<DeviceSample> {
        self.init().await?;
        match self.read_sample().await {
            Ok(sample) => Ok(sample),
            Err(e) => {
                // Reconnect on the next update
                self.connection = None;
                Err(e)
            }
        }
    }
}

/// First address for `host`; owns its inputs so the future stays `Send`
async fn resolve(host: String, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| EmeterError::device(format!("resolve {host}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| EmeterError::device(format!("no address for {host}")))
}

/// SMA registers are big-endian word order: high word first
fn merge_u16_u32(high: u16, low: u16) -> u32 {
    (high as u32) << 16 | low as u32
}

fn decode_s32(raw: u32) -> Option<f64> {
    (raw != S32_NAN).then(|| raw as i32 as f64)
}

fn decode_u32(raw: u32) -> Option<f64> {
    (raw != U32_NAN).then_some(raw as f64)
}

/// One inverter plus its power ceiling
pub struct InverterSourceAdapter {
    source_id: String,
    max_watts: f64,
    session: Box<dyn DeviceSession>,
}

impl InverterSourceAdapter {
    pub fn new(
        source_id: impl Into<String>,
        max_watts: f64,
        session: Box<dyn DeviceSession>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            max_watts,
            session,
        }
    }

    pub fn from_config(config: &InverterConfig) -> Self {
        Self::new(
            config.source_id(),
            config.max_watts,
            Box::new(ModbusInverterSession::new(config)),
        )
    }

    /// Connect up front; failure is logged and retried by the first poll
    pub async fn init(&mut self) {
        if let Err(e) = self.session.init().await {
            error!("Init-error at {}: {}", self.source_id, e);
        }
    }

    /// A device failure yields an invalid reading; it never fails the cycle.
    pub async fn poll(&mut self) -> SourceReading {
        let sample = match self.session.update().await {
            Ok(sample) => sample,
            Err(e) => {
                error!("[SMA Update] Error at {}: {}", self.source_id, e);
                return SourceReading::invalid(self.source_id.clone(), SourceKind::Inverter);
            }
        };

        let power = sample.power_ac_total.unwrap_or(0.0);
        let energy = sample.energy_total.unwrap_or(0.0);
        let counted = if power_in_range(power, self.max_watts) {
            power
        } else {
            warn!(
                "[SMA] {}: Ignoring power value {} W (limit {})",
                self.source_id, power, self.max_watts
            );
            0.0
        };
        SourceReading::new(self.source_id.clone(), SourceKind::Inverter, counted, energy)
    }
}
