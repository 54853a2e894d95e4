//! Passive energy-meter feed.
//!
//! Each cycle drains a bounded number of datagrams from the multicast group,
//! keeps frames from allow-listed meters only (last frame per serial wins) and
//! rewrites consume meters into a supply view so all meters sum the same way.

use crate::config::{MeterFeedConfig, VirtualMeterConfig};
use crate::error::{EmeterError, Result};
use crate::speedwire::{MeterCodec, MeterFrame};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info};

const MAX_DATAGRAM: usize = 2048;

pub struct MeterFeedListener {
    socket: UdpSocket,
    config: MeterFeedConfig,
    codec: Arc<dyn MeterCodec>,
}

impl MeterFeedListener {
    pub fn new(socket: UdpSocket, config: MeterFeedConfig, codec: Arc<dyn MeterCodec>) -> Self {
        Self {
            socket,
            config,
            codec,
        }
    }

    /// Join the meter multicast group. The port is shared with other listeners
    /// on the host, so the socket is bound with `SO_REUSEADDR`.
    pub fn bind_multicast(
        group: &VirtualMeterConfig,
        config: MeterFeedConfig,
        codec: Arc<dyn MeterCodec>,
    ) -> Result<Self> {
        let socket = join_group(group)
            .map_err(|e| EmeterError::transport(format!("meter feed socket: {e}")))?;
        info!(
            "Listening for energy meters on {}:{}",
            group.multicast_group, group.port
        );
        Ok(Self::new(socket, config, codec))
    }

    /// Read at most `max_packets` datagrams, each bounded by the read timeout.
    /// Stops early on a timeout, a socket error or an undecodable datagram.
    pub async fn drain(&self) -> BTreeMap<String, MeterFrame> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut meter_data = BTreeMap::new();

        for _ in 0..self.config.max_packets {
            let (len, from) =
                match timeout(self.config.read_timeout(), self.socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(e)) => {
                        error!("[EnergyMeter] Error while reading socket: {e}");
                        break;
                    }
                    Ok(Ok(received)) => received,
                };

            let frame = match self.codec.decode(&buf[..len]) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    error!("[EnergyMeter] Dropping datagram from {from}: {e}");
                    break;
                }
            };
            if frame.serial.is_empty() || !self.config.is_allowed(&frame.serial) {
                continue;
            }
            debug!("Received EM data from {}: {:?}", frame.serial, frame.fields);
            meter_data.insert(frame.serial.clone(), frame);
        }

        apply_consume_mapping(&mut meter_data, &self.config);
        meter_data
    }
}

fn join_group(group: &VirtualMeterConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port)).into())?;
    socket.join_multicast_v4(&group.multicast_group, &group.interface)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Rewrite every configured consume meter into supply fields, in place
pub fn apply_consume_mapping(
    meter_data: &mut BTreeMap<String, MeterFrame>,
    config: &MeterFeedConfig,
) {
    for serial in &config.consume {
        if let Some(frame) = meter_data.get_mut(serial) {
            merge_consume_as_supply(frame, &config.consume_to_supply);
        }
    }
}

/// Add each mapped consumption field onto its supply counterpart.
/// An absent supply field starts at 0, so the value is carried over unchanged.
pub fn merge_consume_as_supply(frame: &mut MeterFrame, mapping: &BTreeMap<String, String>) {
    for (src, dst) in mapping {
        if let Some(value) = frame.field(src) {
            *frame.fields.entry(dst.clone()).or_insert(0.0) += value;
        }
    }
}
