//! Broadcasts the aggregate as a virtual energy meter.

use crate::aggregator::AggregateResult;
use crate::config::VirtualMeterConfig;
use crate::error::{EmeterError, Result};
use crate::speedwire::{channel, EmeterPacket, MeterCodec};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::debug;

/// 0.1 W per unit
const POWER_SCALE: f64 = 10.0;
/// Ws per kWh
const ENERGY_SCALE: f64 = 3_600_000.0;

pub struct VirtualMeterEmitter {
    socket: UdpSocket,
    target: SocketAddr,
    serial: u32,
    susy_id: u16,
    codec: Arc<dyn MeterCodec>,
}

impl VirtualMeterEmitter {
    /// Sender for the configured multicast group
    pub fn bind(config: &VirtualMeterConfig, codec: Arc<dyn MeterCodec>) -> Result<Self> {
        let target = SocketAddr::from((config.multicast_group, config.port));
        Self::with_target(config, target, codec)
    }

    /// Sender for an explicit destination, keeping the configured identity and TTL
    pub fn with_target(
        config: &VirtualMeterConfig,
        target: SocketAddr,
        codec: Arc<dyn MeterCodec>,
    ) -> Result<Self> {
        let socket = sender_socket(config)
            .map_err(|e| EmeterError::send(format!("virtual meter socket: {e}")))?;
        Ok(Self {
            socket,
            target,
            serial: config.serial,
            susy_id: config.susy_id,
            codec,
        })
    }

    /// Encode and send one frame for `result`
    pub async fn emit(&self, result: &AggregateResult) -> Result<()> {
        let packet = build_packet(result, self.serial, self.susy_id, ticker_ms());
        let datagram = self.codec.encode(&packet)?;
        let sent = self
            .socket
            .send_to(&datagram, self.target)
            .await
            .map_err(|e| EmeterError::send(format!("{}: {}", self.target, e)))?;
        if sent != datagram.len() {
            return Err(EmeterError::send(format!(
                "{}: short send ({} of {} bytes)",
                self.target,
                sent,
                datagram.len()
            )));
        }
        debug!("Sent virtual meter frame ({} bytes) to {}", sent, self.target);
        Ok(())
    }
}

fn sender_socket(config: &VirtualMeterConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    if !config.interface.is_unspecified() {
        socket.set_multicast_if_v4(&config.interface)?;
    }
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Wall-clock milliseconds, wrapping at 32 bits like a meter ticker
fn ticker_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

fn scaled_power(watts: f64) -> u32 {
    (watts * POWER_SCALE).round().clamp(0.0, u32::MAX as f64) as u32
}

fn scaled_energy(kwh: f64) -> u64 {
    (kwh * ENERGY_SCALE).round().clamp(0.0, u64::MAX as f64) as u64
}

/// Virtual meter frame: only the feed-in total is reported, every other
/// channel is present and zero. Totals are sent at display precision.
pub fn build_packet(
    result: &AggregateResult,
    serial: u32,
    susy_id: u16,
    ticker_ms: u32,
) -> EmeterPacket {
    use channel::*;

    let mut packet = EmeterPacket::new(susy_id, serial, ticker_ms);

    packet.add_measurement(POSITIVE_ACTIVE, 0);
    packet.add_counter(POSITIVE_ACTIVE, 0);
    packet.add_measurement(NEGATIVE_ACTIVE, scaled_power(result.display_power()));
    packet.add_counter(NEGATIVE_ACTIVE, scaled_energy(result.display_energy()));

    for base in [
        POSITIVE_REACTIVE,
        NEGATIVE_REACTIVE,
        POSITIVE_APPARENT,
        NEGATIVE_APPARENT,
    ] {
        packet.add_measurement(base, 0);
        packet.add_counter(base, 0);
    }
    packet.add_measurement(POWER_FACTOR, 0);

    for n in 1..=3 {
        for base in [
            POSITIVE_ACTIVE,
            NEGATIVE_ACTIVE,
            POSITIVE_REACTIVE,
            NEGATIVE_REACTIVE,
            POSITIVE_APPARENT,
            NEGATIVE_APPARENT,
        ] {
            packet.add_measurement(phase(n, base), 0);
            packet.add_counter(phase(n, base), 0);
        }
        packet.add_measurement(phase(n, VOLTAGE), 0);
        packet.add_measurement(phase(n, CURRENT), 0);
        packet.add_measurement(phase(n, POWER_FACTOR), 0);
    }

    packet
}
