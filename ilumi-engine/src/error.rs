//! Error taxonomy for everything the engine does on behalf of a target

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use ilumi_proto::{DecodeError, DialectError, MacAddress, Opcode, SceneId, Status, ValueOutOfRange};
use serde::Serialize;

/// Failure reported by a [`crate::Transport`] implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    NoAdapter,
    #[error("device {0} not found")]
    NotFound(MacAddress),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("API characteristic missing on {0}")]
    MissingCharacteristic(MacAddress),
    #[error("write failed: {0}")]
    Write(String),
    #[error("notification stream failed: {0}")]
    Notify(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("link closed by peer")]
    Closed,
}

/// Session store could not be read or written
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("failed to serialize sessions: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("session store lock poisoned")]
    Poisoned,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("topology file {0} not found; enroll bulbs first")]
    NotFound(PathBuf),
    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("failed to serialize topology: {0}")]
    Serialize(serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory; set ILUMI_HOME")]
    NoHome,
    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

/// Which bounded wait ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connect,
    Write,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connect => "connect",
            Phase::Write => "write",
            Phase::Response => "response",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("{address} rejected sequence {sequence} as stale; re-enroll the bulb")]
    ReplayRejected { address: MacAddress, sequence: u64 },

    #[error(transparent)]
    ValueOutOfRange(#[from] ValueOutOfRange),

    #[error("{phase} on {address} timed out after {after:?}")]
    LeaseTimeout { address: MacAddress, phase: Phase, after: Duration },

    #[error(transparent)]
    Dialect(#[from] DialectError),

    #[error("session store: {0}")]
    Store(#[from] StoreError),

    #[error("pattern {scene} was never uploaded to {address}")]
    PatternNotUploaded { address: MacAddress, scene: SceneId },

    #[error("nothing to send to: no targets")]
    NoTargets,

    #[error("{0:?} cannot be relayed over the mesh")]
    NotRelayable(Opcode),

    #[error("{address} answered {opcode:?} with status {status:?}")]
    Device { address: MacAddress, opcode: Opcode, status: Status },

    #[error("cancelled")]
    Cancelled,

    #[error("topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

/// Stable, machine-readable classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Decode,
    ReplayRejected,
    ValueOutOfRange,
    LeaseTimeout,
    Dialect,
    Store,
    Programming,
    Device,
    Cancelled,
    Setup,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Decode => "decode",
            ErrorKind::ReplayRejected => "replay_rejected",
            ErrorKind::ValueOutOfRange => "value_out_of_range",
            ErrorKind::LeaseTimeout => "lease_timeout",
            ErrorKind::Dialect => "dialect",
            ErrorKind::Store => "store",
            ErrorKind::Programming => "programming",
            ErrorKind::Device => "device",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Setup => "setup",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Decode(_) => ErrorKind::Decode,
            Error::ReplayRejected { .. } => ErrorKind::ReplayRejected,
            Error::ValueOutOfRange(_) => ErrorKind::ValueOutOfRange,
            Error::LeaseTimeout { .. } => ErrorKind::LeaseTimeout,
            Error::Dialect(_) => ErrorKind::Dialect,
            Error::Store(_) => ErrorKind::Store,
            Error::PatternNotUploaded { .. } | Error::NoTargets | Error::NotRelayable(_) => {
                ErrorKind::Programming
            }
            Error::Device { .. } => ErrorKind::Device,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Topology(_) | Error::Config(_) => ErrorKind::Setup,
        }
    }

    /// Failures worth another attempt through the mesh proxy
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::LeaseTimeout)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_timeouts_retry() {
        let addr: MacAddress = "01:02:03:04:05:06".parse().unwrap();
        assert!(Error::Transport(TransportError::Closed).is_retryable());
        let after = Duration::from_secs(1);
        assert!(Error::LeaseTimeout { address: addr, phase: Phase::Connect, after }.is_retryable());
        assert!(!Error::ReplayRejected { address: addr, sequence: 4 }.is_retryable());
        assert!(!Error::PatternNotUploaded { address: addr, scene: 1 }.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn kinds_have_snake_case_codes() {
        let addr: MacAddress = "01:02:03:04:05:06".parse().unwrap();
        let err = Error::ReplayRejected { address: addr, sequence: 9 };
        assert_eq!(err.kind().code(), "replay_rejected");
        assert_eq!(serde_json::to_string(&err.kind()).unwrap(), "\"replay_rejected\"");
        assert_eq!(Error::NotRelayable(Opcode::DefinePattern).kind(), ErrorKind::Programming);
    }
}
