//! Energy-meter multicast datagrams.
//!
//! Only the frame envelope and the OBIS measurement/counter entries are handled:
//! enough to read power and energy from physical meters and to write the virtual
//! meter. Discovery and inverter traffic on the same group decode to "no frame".
//!
//! Envelope: `"SMA\0"`, then tag blocks `[len u16][tag u16][len bytes]` up to an
//! empty end block. Tag `0x0010` carries the meter payload:
//! `[protocol 0x6069][susy id u16][serial u32][ticker u32][entries..]`.
//! Each entry has a 4-byte OBIS header `[0, channel, kind, tariff]` followed by a
//! u32 (kind 4, actual value) or a u64 (kind 8, counter).

use crate::error::{EmeterError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;

const SIGNATURE: &[u8; 4] = b"SMA\0";
const TAG_GROUP: u16 = 0x02A0;
const TAG_DATA: u16 = 0x0010;
const GROUP_DEFAULT: u32 = 1;
pub const PROTOCOL_EMETER: u16 = 0x6069;

const KIND_ACTUAL: u8 = 4;
const KIND_COUNTER: u8 = 8;
/// Firmware version entry; 4-byte payload, not a measurement
const CHANNEL_VERSION: u8 = 0x90;

/// OBIS channel numbers for the totals; phase `n` (1..=3) adds `20 * n`
pub mod channel {
    pub const POSITIVE_ACTIVE: u8 = 1;
    pub const NEGATIVE_ACTIVE: u8 = 2;
    pub const POSITIVE_REACTIVE: u8 = 3;
    pub const NEGATIVE_REACTIVE: u8 = 4;
    pub const POSITIVE_APPARENT: u8 = 9;
    pub const NEGATIVE_APPARENT: u8 = 10;
    pub const CURRENT: u8 = 11;
    pub const VOLTAGE: u8 = 12;
    pub const POWER_FACTOR: u8 = 13;
    pub const FREQUENCY: u8 = 14;

    pub const fn phase(phase: u8, base: u8) -> u8 {
        base + 20 * phase
    }
}

/// A decoded meter datagram: serial plus named values in W, kWh, V, A
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeterFrame {
    pub serial: String,
    pub fields: BTreeMap<String, f64>,
}

impl MeterFrame {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: f64) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObisValue {
    Actual(u32),
    Counter(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObisEntry {
    pub channel: u8,
    pub value: ObisValue,
}

/// Outbound meter datagram in wire units (0.1 W, Ws, mV, mA, 1/1000)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmeterPacket {
    pub susy_id: u16,
    pub serial: u32,
    pub ticker_ms: u32,
    pub entries: Vec<ObisEntry>,
}

impl EmeterPacket {
    pub fn new(susy_id: u16, serial: u32, ticker_ms: u32) -> Self {
        Self {
            susy_id,
            serial,
            ticker_ms,
            entries: Vec::new(),
        }
    }

    pub fn add_measurement(&mut self, channel: u8, value: u32) {
        self.entries.push(ObisEntry {
            channel,
            value: ObisValue::Actual(value),
        });
    }

    pub fn add_counter(&mut self, channel: u8, value: u64) {
        self.entries.push(ObisEntry {
            channel,
            value: ObisValue::Counter(value),
        });
    }
}

/// Wire codec seam for the meter feed and the virtual meter
pub trait MeterCodec: Send + Sync {
    /// `Ok(None)` for well-formed datagrams that are not meter frames
    fn decode(&self, datagram: &[u8]) -> Result<Option<MeterFrame>>;
    fn encode(&self, packet: &EmeterPacket) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedwireCodec;

impl MeterCodec for SpeedwireCodec {
    fn decode(&self, datagram: &[u8]) -> Result<Option<MeterFrame>> {
        if datagram.len() < SIGNATURE.len() || &datagram[..4] != SIGNATURE {
            return Err(EmeterError::decode("missing SMA signature"));
        }
        let mut buf = &datagram[4..];
        loop {
            need(&buf, 4, "tag header")?;
            let len = buf.get_u16() as usize;
            let tag = buf.get_u16();
            if len == 0 && tag == 0 {
                return Ok(None);
            }
            need(&buf, len, "tag body")?;
            if tag == TAG_DATA {
                return decode_payload(&buf[..len]);
            }
            buf.advance(len);
        }
    }

    fn encode(&self, packet: &EmeterPacket) -> Result<Vec<u8>> {
        let mut payload = BytesMut::new();
        payload.put_u16(PROTOCOL_EMETER);
        payload.put_u16(packet.susy_id);
        payload.put_u32(packet.serial);
        payload.put_u32(packet.ticker_ms);
        for entry in &packet.entries {
            match entry.value {
                ObisValue::Actual(v) => {
                    payload.put_slice(&[0, entry.channel, KIND_ACTUAL, 0]);
                    payload.put_u32(v);
                }
                ObisValue::Counter(v) => {
                    payload.put_slice(&[0, entry.channel, KIND_COUNTER, 0]);
                    payload.put_u64(v);
                }
            }
        }
        let data_len = u16::try_from(payload.len()).map_err(|_| {
            EmeterError::encode(format!("payload of {} bytes too large", payload.len()))
        })?;

        let mut out = BytesMut::with_capacity(payload.len() + 24);
        out.put_slice(SIGNATURE);
        out.put_u16(4);
        out.put_u16(TAG_GROUP);
        out.put_u32(GROUP_DEFAULT);
        out.put_u16(data_len);
        out.put_u16(TAG_DATA);
        out.put_slice(&payload);
        out.put_u32(0);
        Ok(out.to_vec())
    }
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(EmeterError::decode(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn decode_payload(mut buf: &[u8]) -> Result<Option<MeterFrame>> {
    need(&buf, 2, "protocol id")?;
    if buf.get_u16() != PROTOCOL_EMETER {
        return Ok(None);
    }
    need(&buf, 10, "meter header")?;
    let _susy_id = buf.get_u16();
    let serial = buf.get_u32();
    let _ticker = buf.get_u32();

    let mut frame = MeterFrame::new(serial.to_string());
    while buf.has_remaining() {
        need(&buf, 4, "OBIS header")?;
        let header = [buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8()];
        if header == [0; 4] {
            break;
        }
        if header[0] == CHANNEL_VERSION {
            need(&buf, 4, "version")?;
            buf.advance(4);
            continue;
        }
        let (channel, kind) = (header[1], header[2]);
        let raw = match kind {
            KIND_ACTUAL => {
                need(&buf, 4, "measurement")?;
                buf.get_u32() as f64
            }
            KIND_COUNTER => {
                need(&buf, 8, "counter")?;
                buf.get_u64() as f64
            }
            other => {
                return Err(EmeterError::decode(format!(
                    "unknown OBIS kind {other} on channel {channel}"
                )))
            }
        };
        if let Some((name, scale)) = field_name(channel, kind == KIND_COUNTER) {
            frame.fields.insert(name, raw / scale);
        }
    }
    Ok(Some(frame))
}

/// Field name and divisor for a channel, following the usual
/// `pconsume`/`psupplycounter`/`u1`/`cosphi2` naming.
fn field_name(ch: u8, counter: bool) -> Option<(String, f64)> {
    let (phase, base) = match ch {
        1..=20 => (String::new(), ch),
        21..=80 => (((ch - 1) / 20).to_string(), (ch - 1) % 20 + 1),
        _ => return None,
    };
    let direction = |prefix: &str, suffix: &str| {
        if counter {
            Some((format!("{prefix}{phase}{suffix}counter"), 3_600_000.0))
        } else {
            Some((format!("{prefix}{phase}{suffix}"), 10.0))
        }
    };
    match base {
        channel::POSITIVE_ACTIVE => direction("p", "consume"),
        channel::NEGATIVE_ACTIVE => direction("p", "supply"),
        channel::POSITIVE_REACTIVE => direction("q", "consume"),
        channel::NEGATIVE_REACTIVE => direction("q", "supply"),
        channel::POSITIVE_APPARENT => direction("s", "consume"),
        channel::NEGATIVE_APPARENT => direction("s", "supply"),
        _ if counter => None,
        channel::CURRENT => Some((format!("i{phase}"), 1000.0)),
        channel::VOLTAGE => Some((format!("u{phase}"), 1000.0)),
        channel::POWER_FACTOR => Some((format!("cosphi{phase}"), 1000.0)),
        channel::FREQUENCY if phase.is_empty() => Some(("frequency".to_string(), 1000.0)),
        _ => None,
    }
}
