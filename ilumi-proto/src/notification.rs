//! Bulb → host notifications
//!
//! ```text
//! opcode: u8 | status: u8 | body_len: u16 LE | body...
//! ```

use serde::Serialize;

use crate::command::Color;
use crate::error::{DecodeError, Reader};
use crate::{DialectError, Generation, MacAddress, Opcode};

pub const NOTIFY_HEADER_LEN: usize = 4;

/// Status byte echoed by the bulb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Failed,
    /// The packet's sequence was not newer than the last one accepted
    StaleSequence,
    Other(u8),
}

impl Status {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Ok,
            1 => Status::Failed,
            2 => Status::StaleSequence,
            other => Status::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Failed => 1,
            Status::StaleSequence => 2,
            Status::Other(v) => v,
        }
    }
}

/// GET_DEVICE_INFO reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub firmware_version: u16,
    pub bootloader_version: u16,
    pub commission_status: u8,
    pub model_number: u8,
    pub reset_reason: u16,
    pub ble_stack_version: u16,
}

impl DeviceInfo {
    pub const WIRE_LEN: usize = 10;

    pub fn generation(&self) -> Generation {
        Generation::from_model_number(self.model_number)
    }
}

/// One neighbour from a QUERY_ROUTING reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub address: MacAddress,
    pub hops: u8,
    pub rssi: i8,
}

impl RouteEntry {
    pub const WIRE_LEN: usize = 8;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Body {
    Empty,
    Color(Color),
    DeviceInfo(DeviceInfo),
    Routing(Vec<RouteEntry>),
    /// Reply from another bulb, relayed by the connected one
    Relayed { opcode: Opcode, payload: Vec<u8> },
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub opcode: Opcode,
    pub status: Status,
    pub body: Body,
}

impl Notification {
    pub fn ack(opcode: Opcode, status: Status) -> Self {
        Self { opcode, status, body: Body::Empty }
    }

    /// Color carried directly or relayed through a proxy
    pub fn color(&self) -> Option<Color> {
        match &self.body {
            Body::Color(color) => Some(*color),
            Body::Relayed { opcode: Opcode::GetBulbColor, payload } if payload.len() >= 5 => {
                Some(Color::rgbw(payload[0], payload[1], payload[2], payload[3], payload[4]))
            }
            _ => None,
        }
    }

    pub fn to_bytes(&self, generation: Generation) -> Result<Vec<u8>, DialectError> {
        let code = generation.require(self.opcode)?;

        let mut body = Vec::new();
        match &self.body {
            Body::Empty => {}
            Body::Color(c) => body.extend_from_slice(&[c.r, c.g, c.b, c.w, c.brightness]),
            Body::DeviceInfo(info) => {
                body.extend_from_slice(&info.firmware_version.to_le_bytes());
                body.extend_from_slice(&info.bootloader_version.to_le_bytes());
                body.push(info.commission_status);
                body.push(info.model_number);
                body.extend_from_slice(&info.reset_reason.to_le_bytes());
                body.extend_from_slice(&info.ble_stack_version.to_le_bytes());
            }
            Body::Routing(entries) => {
                for entry in entries {
                    body.extend_from_slice(&entry.address.to_le_bytes());
                    body.push(entry.hops);
                    body.push(entry.rssi as u8);
                }
            }
            Body::Relayed { opcode, payload } => {
                let inner_len = (1 + payload.len()) as u16;
                body.extend_from_slice(&[0, 1]);
                body.extend_from_slice(&inner_len.to_le_bytes());
                body.extend_from_slice(&inner_len.to_le_bytes());
                body.push(generation.require(*opcode)?);
                body.extend_from_slice(payload);
            }
            Body::Raw(raw) => body.extend_from_slice(raw),
        }

        let mut buf = Vec::with_capacity(NOTIFY_HEADER_LEN + body.len());
        buf.push(code);
        buf.push(self.status.to_u8());
        buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

/// Parse one notification received on the API characteristic
pub fn decode(bytes: &[u8], generation: Generation) -> Result<Notification, DecodeError> {
    if bytes.len() < NOTIFY_HEADER_LEN {
        return Err(DecodeError::Truncated { needed: NOTIFY_HEADER_LEN, got: bytes.len() });
    }

    let mut r = Reader::new(bytes);
    let code = r.u8()?;
    let opcode = generation
        .opcode(code)
        .ok_or(DecodeError::UnknownOpcode { code, generation })?;
    let status = Status::from_u8(r.u8()?);
    let body_len = r.u16()? as usize;
    let mut body = Reader::new(r.take(body_len)?);

    if status != Status::Ok {
        let raw = body.rest();
        let body = if raw.is_empty() { Body::Empty } else { Body::Raw(raw.to_vec()) };
        return Ok(Notification { opcode, status, body });
    }

    let body = match opcode {
        Opcode::GetBulbColor => {
            let [red, green, blue, white, brightness] = body.array()?;
            Body::Color(Color::rgbw(red, green, blue, white, brightness))
        }
        Opcode::GetDeviceInfo => Body::DeviceInfo(DeviceInfo {
            firmware_version: body.u16()?,
            bootloader_version: body.u16()?,
            commission_status: body.u8()?,
            model_number: body.u8()?,
            reset_reason: body.u16()?,
            ble_stack_version: body.u16()?,
        }),
        Opcode::QueryRouting => {
            let mut entries = Vec::with_capacity(body_len / RouteEntry::WIRE_LEN);
            while body.remaining() >= RouteEntry::WIRE_LEN {
                entries.push(RouteEntry {
                    address: MacAddress::from_le_bytes(body.array()?),
                    hops: body.u8()?,
                    rssi: body.u8()? as i8,
                });
            }
            Body::Routing(entries)
        }
        Opcode::ProxyMessage => {
            // ttl, address count, data length, then the relayed reply
            body.take(4)?;
            let inner_len = body.u16()? as usize;
            if inner_len == 0 {
                Body::Empty
            } else {
                let inner = body.take(inner_len)?;
                let inner_opcode = generation
                    .opcode(inner[0])
                    .ok_or(DecodeError::UnknownOpcode { code: inner[0], generation })?;
                Body::Relayed { opcode: inner_opcode, payload: inner[1..].to_vec() }
            }
        }
        _ => {
            let raw = body.rest();
            if raw.is_empty() { Body::Empty } else { Body::Raw(raw.to_vec()) }
        }
    };

    Ok(Notification { opcode, status, body })
}
