//! Enrolled bulbs and routing expressions
//!
//! The topology file is written by enrollment; command runs only read it.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use ilumi_proto::{Generation, MacAddress, NetworkKey};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TopologyError;

pub const TOPOLOGY_FILE: &str = "topology.json";

/// Who a bulb is, as far as routing and encoding are concerned
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceIdentity {
    pub address: MacAddress,
    pub name: String,
    pub group: String,
    pub node_id: u16,
    pub generation: Generation,
}

impl DeviceIdentity {
    /// Identity for a bulb that was never enrolled
    pub fn ad_hoc(address: MacAddress) -> Self {
        Self {
            address,
            name: String::new(),
            group: String::new(),
            node_id: 0,
            generation: Generation::default(),
        }
    }

    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulbRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub node_id: u16,
    #[serde(default)]
    pub generation: Generation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub network_key: NetworkKey,
    #[serde(default)]
    pub bulbs: BTreeMap<MacAddress, BulbRecord>,
}

/// A routing expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(MacAddress),
    /// An enrolled name, falling back to `or_address` when no bulb has it
    Name { name: String, or_address: Option<MacAddress> },
    Group(String),
    All,
}

impl Target {
    /// Pick the broadest selector given; with none given, every bulb.
    pub fn select(
        address: Option<MacAddress>,
        name: Option<String>,
        group: Option<String>,
        all: bool,
    ) -> Target {
        if all {
            Target::All
        } else if let Some(group) = group {
            Target::Group(group)
        } else if let Some(name) = name {
            Target::Name { name, or_address: address }
        } else if let Some(address) = address {
            Target::Address(address)
        } else {
            Target::All
        }
    }
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TopologyError::NotFound(path.to_path_buf()));
            }
            Err(source) => return Err(TopologyError::Io { path: path.to_path_buf(), source }),
        };
        serde_json::from_str(&data)
            .map_err(|source| TopologyError::Parse { path: path.to_path_buf(), source })
    }

    /// Write atomically: temp file, fsync, rename
    pub fn save(&self, path: &Path) -> Result<(), TopologyError> {
        let io = |source| TopologyError::Io { path: path.to_path_buf(), source };
        let data = serde_json::to_vec_pretty(self).map_err(TopologyError::Serialize)?;

        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(&data).map_err(io)?;
        file.sync_all().map_err(io)?;
        fs::rename(&tmp, path).map_err(io)
    }

    /// Lowest node id above every enrolled bulb's
    pub fn next_node_id(&self) -> u16 {
        self.bulbs.values().map(|b| b.node_id).max().map_or(1, |id| id.saturating_add(1))
    }

    /// Add or replace `address`, returning the identity it now has
    pub fn enroll(&mut self, address: MacAddress, record: BulbRecord) -> DeviceIdentity {
        self.bulbs.insert(address, record);
        let identity = self.identity(&address);
        identity.unwrap_or_else(|| DeviceIdentity::ad_hoc(address))
    }

    pub fn remove(&mut self, address: &MacAddress) -> Option<BulbRecord> {
        self.bulbs.remove(address)
    }

    pub fn identity(&self, address: &MacAddress) -> Option<DeviceIdentity> {
        self.bulbs.get(address).map(|record| DeviceIdentity {
            address: *address,
            name: record.name.clone(),
            group: record.group.clone(),
            node_id: record.node_id,
            generation: record.generation,
        })
    }

    /// Resolve a routing expression into identities in ascending address order
    pub fn resolve(&self, target: &Target) -> Vec<DeviceIdentity> {
        let matching = |pred: &dyn Fn(&BulbRecord) -> bool| -> Vec<DeviceIdentity> {
            self.bulbs
                .iter()
                .filter(|(_, record)| pred(record))
                .filter_map(|(address, _)| self.identity(address))
                .collect()
        };

        match target {
            Target::All => matching(&|_| true),
            Target::Group(group) => {
                let found = matching(&|r| r.group.eq_ignore_ascii_case(group));
                if found.is_empty() {
                    warn!(%group, "no bulbs in group");
                }
                found
            }
            Target::Name { name, or_address } => {
                let found = matching(&|r| r.name.eq_ignore_ascii_case(name));
                match (found.is_empty(), or_address) {
                    (false, _) => found,
                    (true, Some(address)) => {
                        warn!(%name, %address, "no bulb with that name; using the address");
                        self.resolve(&Target::Address(*address))
                    }
                    (true, None) => {
                        warn!(%name, "no bulb with that name");
                        found
                    }
                }
            }
            Target::Address(address) => {
                let identity = self.identity(address);
                vec![identity.unwrap_or_else(|| DeviceIdentity::ad_hoc(*address))]
            }
        }
    }
}
