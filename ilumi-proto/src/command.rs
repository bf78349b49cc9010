//! Typed commands and their payload building blocks
//!
//! Every numeric field is range-checked when the value is built, so a
//! [`Command`] that exists can always be encoded.

use serde::{Deserialize, Serialize};

use crate::error::ValueOutOfRange;
use crate::{MacAddress, NetworkKey, Opcode};

/// Color and brightness as the bulb understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub w: u8,
    pub brightness: u8,
}

fn channel(field: &'static str, value: i64) -> Result<u8, ValueOutOfRange> {
    ValueOutOfRange::check(field, value, 0, 255).map(|v| v as u8)
}

impl Color {
    /// Build from unchecked caller input, rejecting anything outside 0..=255
    pub fn new(r: i64, g: i64, b: i64, w: i64, brightness: i64) -> Result<Self, ValueOutOfRange> {
        Ok(Self {
            r: channel("r", r)?,
            g: channel("g", g)?,
            b: channel("b", b)?,
            w: channel("w", w)?,
            brightness: channel("brightness", brightness)?,
        })
    }

    pub const fn rgbw(r: u8, g: u8, b: u8, w: u8, brightness: u8) -> Self {
        Self { r, g, b, w, brightness }
    }

    pub const fn off() -> Self {
        Self::rgbw(0, 0, 0, 0, 0)
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[self.r, self.g, self.b, self.w, self.brightness, 0]);
    }
}

/// Duration of a hardware fade as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Millis(u16),
    Seconds(u16),
}

impl Transition {
    pub const INSTANT: Transition = Transition::Millis(0);

    /// Durations that fit in 16 bits of milliseconds stay in milliseconds,
    /// longer ones are truncated to whole seconds.
    pub fn from_millis(ms: u64) -> Result<Self, ValueOutOfRange> {
        if ms < u16::MAX as u64 {
            Ok(Transition::Millis(ms as u16))
        } else {
            let secs =
                ValueOutOfRange::check("duration_s", (ms / 1000) as i64, 0, u16::MAX as i64)?;
            Ok(Transition::Seconds(secs as u16))
        }
    }

    pub fn as_millis(&self) -> u64 {
        match self {
            Transition::Millis(ms) => *ms as u64,
            Transition::Seconds(s) => *s as u64 * 1000,
        }
    }

    pub(crate) fn parts(&self) -> (u16, u8) {
        match self {
            Transition::Millis(v) => (*v, 0),
            Transition::Seconds(v) => (*v, 1),
        }
    }
}

/// Power on/off timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Power {
    pub delay_ms: u16,
    pub transit_ms: u16,
}

/// Hardware-interpolated fade to a color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fade {
    pub color: Color,
    pub transition: Transition,
    pub delay_s: u8,
}

/// Slot on the bulb that holds an uploaded pattern
pub type SceneId = u8;

/// One step of an animation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternFrame {
    pub color: Color,
    pub sustain_ms: u32,
    pub transit_ms: u32,
}

impl PatternFrame {
    pub const WIRE_LEN: usize = 18;

    pub fn new(color: Color, sustain_ms: u32, transit_ms: u32) -> Self {
        Self { color, sustain_ms, transit_ms }
    }
}

/// `repeat` value the firmware treats as "loop forever"
pub const REPEAT_FOREVER: u8 = 255;

/// An ordered animation to upload with DEFINE_PATTERN
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pattern {
    scene: SceneId,
    frames: Vec<PatternFrame>,
    repeat: u8,
    start_now: bool,
}

impl Pattern {
    pub const MAX_FRAMES: usize = 255;

    pub fn new(
        scene: SceneId,
        frames: Vec<PatternFrame>,
        repeat: u8,
    ) -> Result<Self, ValueOutOfRange> {
        ValueOutOfRange::check("frames", frames.len() as i64, 1, Self::MAX_FRAMES as i64)?;
        Ok(Self { scene, frames, repeat, start_now: false })
    }

    /// Ask the bulb to start playback as soon as the upload completes.
    /// A separate START_PATTERN is still sent by the engine.
    pub fn start_now(mut self, start_now: bool) -> Self {
        self.start_now = start_now;
        self
    }

    pub fn scene(&self) -> SceneId {
        self.scene
    }

    pub fn frames(&self) -> &[PatternFrame] {
        &self.frames
    }

    pub fn repeat(&self) -> u8 {
        self.repeat
    }

    pub fn starts_now(&self) -> bool {
        self.start_now
    }

    /// Size field the firmware expects in the scene header
    pub(crate) fn struct_size(&self) -> u16 {
        (13 + self.frames.len() * PatternFrame::WIRE_LEN) as u16
    }
}

/// One DATA_CHUNK fragment of a packet too long for a single write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub total_len: u16,
    pub offset: u16,
    pub data: [u8; crate::CHUNK_LEN],
}

/// A packet the connected bulb relays to other bulbs over the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyMessage {
    ttl: u8,
    targets: Vec<MacAddress>,
    inner: Vec<u8>,
}

/// TTL for inner packets short enough to fit one radio frame
pub const PROXY_TTL_SHORT: u8 = 47;
pub const PROXY_TTL_LONG: u8 = 15;
const PROXY_SHORT_INNER: usize = 17;

impl ProxyMessage {
    /// `inner` is a complete encoded packet (header included)
    pub fn new(targets: Vec<MacAddress>, inner: Vec<u8>) -> Result<Self, ValueOutOfRange> {
        ValueOutOfRange::check("proxy_targets", targets.len() as i64, 1, u8::MAX as i64)?;
        let data_len = targets.len() * 6 + inner.len();
        ValueOutOfRange::check("proxy_data_len", data_len as i64, 0, u16::MAX as i64)?;

        let ttl = if inner.len() <= PROXY_SHORT_INNER { PROXY_TTL_SHORT } else { PROXY_TTL_LONG };
        Ok(Self { ttl, targets, inner })
    }

    pub(crate) fn from_parts(ttl: u8, targets: Vec<MacAddress>, inner: Vec<u8>) -> Self {
        Self { ttl, targets, inner }
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn targets(&self) -> &[MacAddress] {
        &self.targets
    }

    pub fn inner(&self) -> &[u8] {
        &self.inner
    }
}

/// Sub-command of CONFIG that reboots into the DFU bootloader
pub const CONFIG_ENTER_BOOTLOADER: u8 = 2;

/// A command addressed to one bulb
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Instant color, written without response (streaming)
    SetColor(Color),
    /// Instant color, written with response
    SetColorAcked(Color),
    TurnOn(Power),
    TurnOff(Power),
    SetColorSmooth(Fade),
    CandleMode(Color),
    DefinePattern(Pattern),
    StartPattern { scene: SceneId },
    GetBulbColor,
    GetDeviceInfo,
    QueryRouting,
    Commission { network_key: NetworkKey, node_id: u16, group_id: u16 },
    EnterBootloader { dfu_key: u32 },
    DataChunk(Chunk),
    Proxy(ProxyMessage),
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::SetColor(_) => Opcode::SetColor,
            Command::SetColorAcked(_) => Opcode::SetColorAcked,
            Command::TurnOn(_) => Opcode::TurnOn,
            Command::TurnOff(_) => Opcode::TurnOff,
            Command::SetColorSmooth(_) => Opcode::SetColorSmooth,
            Command::CandleMode(_) => Opcode::CandleMode,
            Command::DefinePattern(_) => Opcode::DefinePattern,
            Command::StartPattern { .. } => Opcode::StartPattern,
            Command::GetBulbColor => Opcode::GetBulbColor,
            Command::GetDeviceInfo => Opcode::GetDeviceInfo,
            Command::QueryRouting => Opcode::QueryRouting,
            Command::Commission { .. } => Opcode::CommissionWithId,
            Command::EnterBootloader { .. } => Opcode::Config,
            Command::DataChunk(_) => Opcode::DataChunk,
            Command::Proxy(_) => Opcode::ProxyMessage,
        }
    }

    /// Whether the write expects a link-level acknowledgment
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Command::SetColor(_))
    }

    /// Queries are answered by a notification echoing the same opcode
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Command::GetBulbColor | Command::GetDeviceInfo | Command::QueryRouting
        )
    }

    pub fn fade(color: Color, transition: Transition) -> Self {
        Command::SetColorSmooth(Fade { color, transition, delay_s: 0 })
    }
}
