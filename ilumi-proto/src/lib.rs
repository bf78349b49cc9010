//! ilumi wire protocol - commands, packets and notifications
//!
//! Pure encoding and decoding; nothing in this crate performs I/O or keeps
//! state. Sequence numbers and network keys are supplied by the caller
//! through [`Header`].

mod address;
pub mod ble;
mod command;
mod dialect;
mod error;
mod notification;
mod packet;

pub use address::{MacAddress, ParseAddressError};
pub use command::{
    CONFIG_ENTER_BOOTLOADER, Chunk, Color, Command, Fade, PROXY_TTL_LONG, PROXY_TTL_SHORT, Pattern,
    PatternFrame, Power, ProxyMessage, REPEAT_FOREVER, SceneId, Transition,
};
pub use dialect::{DialectError, Generation, Opcode};
pub use error::{DecodeError, ValueOutOfRange};
pub use notification::{
    Body, DeviceInfo, NOTIFY_HEADER_LEN, Notification, RouteEntry, Status, decode,
};
pub use packet::{
    Header, NetworkKey, encode, fragment, needs_fragmenting, parse_command, reassemble,
    wire_sequence,
};

/// network key (4) + sequence (1) + opcode (1)
pub const HEADER_LEN: usize = 6;

/// Longest packet the bulb accepts in a single write
pub const MAX_WRITE_LEN: usize = 20;

/// Payload bytes carried by one DATA_CHUNK fragment
pub const CHUNK_LEN: usize = 10;
