//! Host → bulb packet framing
//!
//! Every write to the API characteristic is
//!
//! ```text
//! network_key: u32 LE | sequence: u8 | opcode: u8 | payload...
//! ```
//!
//! Packets longer than [`MAX_WRITE_LEN`] are split into DATA_CHUNK packets,
//! each of which carries its own header.

use serde::{Deserialize, Serialize};

use crate::command::{
    CONFIG_ENTER_BOOTLOADER, Chunk, Color, Command, Fade, Pattern, PatternFrame, Power,
    ProxyMessage, Transition,
};
use crate::error::{DecodeError, Reader};
use crate::{CHUNK_LEN, DialectError, Generation, HEADER_LEN, MAX_WRITE_LEN, MacAddress, Opcode};

/// 32-bit mesh network key assigned at commissioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkKey(pub u32);

impl std::fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-packet header fields that come from the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub network_key: NetworkKey,
    pub sequence: u8,
}

impl Header {
    /// Header for the persisted session counter `counter`
    pub fn new(network_key: NetworkKey, counter: u64) -> Self {
        Self { network_key, sequence: wire_sequence(counter) }
    }
}

/// The bulb compares an even 8-bit counter that advances by two; the host
/// keeps a never-repeating 64-bit counter and derives the wire byte from it.
pub fn wire_sequence(counter: u64) -> u8 {
    (counter.wrapping_mul(2) & 0xFF) as u8
}

/// Encode `command` for a bulb of `generation`.
///
/// Never fails for a constructed command unless the dialect has no such
/// opcode.
pub fn encode(
    command: &Command,
    header: Header,
    generation: Generation,
) -> Result<Vec<u8>, DialectError> {
    let code = generation.require(command.opcode())?;

    let mut buf = Vec::with_capacity(HEADER_LEN + 16);
    buf.extend_from_slice(&header.network_key.0.to_le_bytes());
    buf.push(header.sequence);
    buf.push(code);

    match command {
        Command::SetColor(color) | Command::SetColorAcked(color) | Command::CandleMode(color) => {
            write_color7(&mut buf, color);
        }
        Command::TurnOn(power) | Command::TurnOff(power) => {
            buf.extend_from_slice(&power.delay_ms.to_le_bytes());
            buf.extend_from_slice(&power.transit_ms.to_le_bytes());
        }
        Command::SetColorSmooth(fade) => write_fade(&mut buf, fade, generation),
        Command::DefinePattern(pattern) => write_pattern(&mut buf, pattern),
        Command::StartPattern { scene } => buf.push(*scene),
        Command::GetBulbColor | Command::GetDeviceInfo | Command::QueryRouting => {}
        Command::Commission { network_key, node_id, group_id } => {
            buf.extend_from_slice(&network_key.0.to_le_bytes());
            buf.extend_from_slice(&node_id.to_le_bytes());
            buf.extend_from_slice(&group_id.to_le_bytes());
        }
        Command::EnterBootloader { dfu_key } => {
            buf.push(CONFIG_ENTER_BOOTLOADER);
            buf.extend_from_slice(&dfu_key.to_le_bytes());
        }
        Command::DataChunk(chunk) => {
            buf.extend_from_slice(&chunk.total_len.to_le_bytes());
            buf.extend_from_slice(&chunk.offset.to_le_bytes());
            buf.extend_from_slice(&chunk.data);
        }
        Command::Proxy(proxy) => {
            let data_len = (proxy.targets().len() * 6 + proxy.inner().len()) as u16;
            buf.push(proxy.ttl());
            buf.push(proxy.targets().len() as u8);
            buf.extend_from_slice(&data_len.to_le_bytes());
            for target in proxy.targets() {
                buf.extend_from_slice(&target.to_le_bytes());
            }
            buf.extend_from_slice(proxy.inner());
        }
    }

    Ok(buf)
}

fn write_color7(buf: &mut Vec<u8>, color: &Color) {
    color.write(buf);
    buf.push(0);
}

fn write_fade(buf: &mut Vec<u8>, fade: &Fade, generation: Generation) {
    let (time, unit) = fade.transition.parts();
    match generation {
        Generation::Gen2 => {
            buf.extend_from_slice(&time.to_le_bytes());
            buf.push(unit);
            fade.color.write(buf);
        }
        Generation::Gen1 => {
            fade.color.write(buf);
            buf.extend_from_slice(&time.to_le_bytes());
            buf.push(unit);
        }
    }
    buf.push(fade.delay_s);
}

fn write_pattern(buf: &mut Vec<u8>, pattern: &Pattern) {
    buf.extend_from_slice(&pattern.struct_size().to_le_bytes());
    buf.push(pattern.scene());
    buf.push(pattern.frames().len() as u8);
    buf.push(pattern.repeat());
    buf.push(pattern.scene());
    buf.push(pattern.starts_now() as u8);

    for frame in pattern.frames() {
        frame.color.write(buf);
        buf.extend_from_slice(&frame.sustain_ms.to_le_bytes());
        buf.extend_from_slice(&frame.transit_ms.to_le_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
    }
}

/// Whether `packet` must be sent as DATA_CHUNK fragments
pub fn needs_fragmenting(packet: &[u8]) -> bool {
    packet.len() > MAX_WRITE_LEN
}

/// Split an encoded packet into DATA_CHUNK payloads of [`CHUNK_LEN`] bytes.
///
/// Each chunk still needs its own header (and sequence value) when encoded.
pub fn fragment(packet: &[u8]) -> Vec<Chunk> {
    let total_len = packet.len() as u16;
    packet
        .chunks(CHUNK_LEN)
        .enumerate()
        .map(|(i, part)| {
            let mut data = [0u8; CHUNK_LEN];
            data[..part.len()].copy_from_slice(part);
            Chunk { total_len, offset: (i * CHUNK_LEN) as u16, data }
        })
        .collect()
}

/// Rebuild a packet from its DATA_CHUNK fragments (in any order)
pub fn reassemble(chunks: &[Chunk]) -> Result<Vec<u8>, DecodeError> {
    let first = chunks.first().ok_or(DecodeError::Malformed("no chunks"))?;
    let total = first.total_len as usize;
    let mut out = vec![0u8; total];
    let mut seen = 0usize;

    for chunk in chunks {
        if chunk.total_len as usize != total {
            return Err(DecodeError::Malformed("chunk length disagreement"));
        }
        let start = chunk.offset as usize;
        if start >= total {
            return Err(DecodeError::Malformed("chunk offset past end"));
        }
        let end = (start + CHUNK_LEN).min(total);
        out[start..end].copy_from_slice(&chunk.data[..end - start]);
        seen += end - start;
    }

    if seen != total {
        return Err(DecodeError::Truncated { needed: total, got: seen });
    }
    Ok(out)
}

/// Parse a packet produced by [`encode`].
///
/// The bulb does this in firmware; the host uses it to verify what it sends
/// and to inspect captured traffic.
pub fn parse_command(
    bytes: &[u8],
    generation: Generation,
) -> Result<(Header, Command), DecodeError> {
    let mut r = Reader::new(bytes);
    let network_key = NetworkKey(r.u32()?);
    let sequence = r.u8()?;
    let code = r.u8()?;
    let opcode = generation
        .opcode(code)
        .ok_or(DecodeError::UnknownOpcode { code, generation })?;

    let command = match opcode {
        Opcode::SetColor => Command::SetColor(read_color7(&mut r)?),
        Opcode::SetColorAcked => Command::SetColorAcked(read_color7(&mut r)?),
        Opcode::CandleMode => Command::CandleMode(read_color7(&mut r)?),
        Opcode::TurnOn => Command::TurnOn(read_power(&mut r)?),
        Opcode::TurnOff => Command::TurnOff(read_power(&mut r)?),
        Opcode::SetColorSmooth => Command::SetColorSmooth(read_fade(&mut r, generation)?),
        Opcode::DefinePattern => Command::DefinePattern(read_pattern(&mut r)?),
        Opcode::StartPattern => Command::StartPattern { scene: r.u8()? },
        Opcode::GetBulbColor => Command::GetBulbColor,
        Opcode::GetDeviceInfo => Command::GetDeviceInfo,
        Opcode::QueryRouting => Command::QueryRouting,
        Opcode::CommissionWithId => Command::Commission {
            network_key: NetworkKey(r.u32()?),
            node_id: r.u16()?,
            group_id: r.u16()?,
        },
        Opcode::Config => {
            if r.u8()? != CONFIG_ENTER_BOOTLOADER {
                return Err(DecodeError::Malformed("unknown config sub-command"));
            }
            Command::EnterBootloader { dfu_key: r.u32()? }
        }
        Opcode::DataChunk => Command::DataChunk(Chunk {
            total_len: r.u16()?,
            offset: r.u16()?,
            data: r.array()?,
        }),
        Opcode::ProxyMessage => Command::Proxy(read_proxy(&mut r)?),
        Opcode::TreeMeshProxy => return Err(DecodeError::Unexpected(Opcode::TreeMeshProxy)),
    };

    Ok((Header { network_key, sequence }, command))
}

fn read_color(r: &mut Reader<'_>) -> Result<Color, DecodeError> {
    let [red, green, blue, white, brightness, _] = r.array::<6>()?;
    Ok(Color::rgbw(red, green, blue, white, brightness))
}

fn read_color7(r: &mut Reader<'_>) -> Result<Color, DecodeError> {
    let color = read_color(r)?;
    r.u8()?;
    Ok(color)
}

fn read_power(r: &mut Reader<'_>) -> Result<Power, DecodeError> {
    Ok(Power { delay_ms: r.u16()?, transit_ms: r.u16()? })
}

fn read_transition(r: &mut Reader<'_>) -> Result<Transition, DecodeError> {
    let time = r.u16()?;
    match r.u8()? {
        0 => Ok(Transition::Millis(time)),
        1 => Ok(Transition::Seconds(time)),
        _ => Err(DecodeError::Malformed("unknown time unit")),
    }
}

fn read_fade(r: &mut Reader<'_>, generation: Generation) -> Result<Fade, DecodeError> {
    let (color, transition) = match generation {
        Generation::Gen2 => {
            let transition = read_transition(r)?;
            (read_color(r)?, transition)
        }
        Generation::Gen1 => {
            let color = read_color(r)?;
            (color, read_transition(r)?)
        }
    };
    Ok(Fade { color, transition, delay_s: r.u8()? })
}

fn read_pattern(r: &mut Reader<'_>) -> Result<Pattern, DecodeError> {
    let _struct_size = r.u16()?;
    let scene = r.u8()?;
    let count = r.u8()? as usize;
    let repeat = r.u8()?;
    let _scene_again = r.u8()?;
    let start_now = r.u8()? != 0;

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let color = read_color(r)?;
        let sustain_ms = r.u32()?;
        let transit_ms = r.u32()?;
        r.take(4)?;
        frames.push(PatternFrame { color, sustain_ms, transit_ms });
    }

    Pattern::new(scene, frames, repeat)
        .map(|p| p.start_now(start_now))
        .map_err(|_| DecodeError::Malformed("pattern without frames"))
}

fn read_proxy(r: &mut Reader<'_>) -> Result<ProxyMessage, DecodeError> {
    let ttl = r.u8()?;
    let count = r.u8()? as usize;
    let data_len = r.u16()? as usize;

    let mut targets = Vec::with_capacity(count);
    for _ in 0..count {
        targets.push(MacAddress::from_le_bytes(r.array()?));
    }

    let inner_len = data_len
        .checked_sub(count * 6)
        .ok_or(DecodeError::Malformed("proxy data length shorter than address list"))?;
    if r.remaining() < inner_len {
        return Err(DecodeError::Truncated { needed: inner_len, got: r.remaining() });
    }
    let inner = r.rest().to_vec();
    if inner.len() != inner_len {
        return Err(DecodeError::Malformed("proxy data length disagrees with packet"));
    }

    Ok(ProxyMessage::from_parts(ttl, targets, inner))
}
