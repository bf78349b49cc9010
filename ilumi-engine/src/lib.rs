//! ilumi engine - drive many bulbs through one BLE connection at a time
//!
//! This crate owns everything stateful about talking to bulbs: the
//! per-bulb anti-replay sessions, the single connection lease, sequential
//! execution across targets, mesh broadcast through a proxy bulb, and
//! fades and color streams. Packet layouts live in `ilumi-proto`; the
//! radio lives behind the [`Transport`] trait.

mod config;
mod engine;
mod enroll;
mod error;
mod lease;
mod mesh;
mod pattern;
mod result;
mod session;
mod topology;
mod transition;
mod transport;

#[cfg(test)]
mod mock;

pub use config::{CONFIG_FILE, EngineConfig, ilumi_home};
pub use engine::{Engine, IntoBatch};
pub use enroll::{MESH_GROUP_ID, generate_dfu_key, generate_network_key};
pub use error::{
    ConfigError, Error, ErrorKind, Phase, Result, StoreError, TopologyError, TransportError,
};
pub use lease::{ConnectionLease, LeaseSlot, LeaseState, ScopedConnection};
pub use mesh::{Attempt, BroadcastPolicy, BroadcastReport};
pub use pattern::PatternBook;
pub use result::{Delivery, ExecutionResult, TargetOutcome};
pub use session::{
    JsonFileStore, MemoryStore, SESSIONS_FILE, SessionState, SessionStore, Sessions,
};
pub use topology::{BulbRecord, DeviceIdentity, TOPOLOGY_FILE, Target, Topology};
pub use transition::{ColorStream, FadePolicy, FramePacer, Routing};
pub use transport::{Link, Transport, WriteMode};

pub use ilumi_proto as proto;
