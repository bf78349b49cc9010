//! Engine configuration and the ilumi home directory

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::transition::FadePolicy;

pub const CONFIG_FILE: &str = "engine.json";

/// Directory holding topology, sessions and engine config.
///
/// `$ILUMI_HOME` if set, otherwise `~/.ilumi`. Created if missing.
pub fn ilumi_home() -> Result<PathBuf, ConfigError> {
    let home = match std::env::var_os("ILUMI_HOME") {
        Some(home) => PathBuf::from(home),
        None => dirs::home_dir().ok_or(ConfigError::NoHome)?.join(".ilumi"),
    };

    if !home.exists() {
        fs::create_dir_all(&home).map_err(|source| ConfigError::Io { path: home.clone(), source })?;
    }

    Ok(home)
}

/// Timing and retry knobs. Every field has a default, so a partial
/// `engine.json` is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connect_timeout_ms: u64,
    /// Bound on a single write inside a held lease
    pub command_timeout_ms: u64,
    /// How long a query waits for its reply
    pub response_timeout_ms: u64,
    /// How long an acknowledged write waits for a status notification
    pub ack_settle_ms: u64,
    pub chunk_spacing_ms: u64,
    /// A routing table spans several notifications; stop collecting after
    /// this long without one
    pub routing_idle_ms: u64,
    pub mesh_attempts: u32,
    pub mesh_retry_delay_ms: u64,
    pub fade: FadePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            response_timeout_ms: 5_000,
            ack_settle_ms: 100,
            chunk_spacing_ms: 50,
            routing_idle_ms: 1_500,
            mesh_attempts: 3,
            mesh_retry_delay_ms: 250,
            fade: FadePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, writing the defaults there on first use
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let io = |source| ConfigError::Io { path: path.to_path_buf(), source };

        if path.exists() {
            let data = fs::read_to_string(path).map_err(io)?;
            return serde_json::from_str(&data)
                .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source });
        }

        let config = Self::default();
        let data = serde_json::to_string_pretty(&config)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        fs::write(path, data).map_err(io)?;
        info!(path = %path.display(), "wrote default engine config");
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn ack_settle(&self) -> Duration {
        Duration::from_millis(self.ack_settle_ms)
    }

    pub fn chunk_spacing(&self) -> Duration {
        Duration::from_millis(self.chunk_spacing_ms)
    }

    pub fn routing_idle(&self) -> Duration {
        Duration::from_millis(self.routing_idle_ms)
    }

    pub fn mesh_retry_delay(&self) -> Duration {
        Duration::from_millis(self.mesh_retry_delay_ms)
    }
}
