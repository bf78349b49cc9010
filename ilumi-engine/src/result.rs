//! Per-target outcomes of a run

use ilumi_proto::{MacAddress, Notification};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::{Error, ErrorKind};

/// How a command reached the bulb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Direct,
    /// Sent to the mesh proxy we were connected to
    Proxy,
    /// Relayed over the mesh; delivery is not confirmed
    Relayed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetOutcome {
    pub success: bool,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub delivery: Delivery,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Notification>,
}

impl TargetOutcome {
    pub fn ok(delivery: Delivery, replies: Vec<Notification>) -> Self {
        Self { success: true, error: None, kind: None, delivery, replies }
    }

    pub fn failed(delivery: Delivery, error: &Error) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            kind: Some(error.kind()),
            delivery,
            replies: Vec::new(),
        }
    }

    pub fn from_result(delivery: Delivery, result: &Result<Vec<Notification>, Error>) -> Self {
        match result {
            Ok(replies) => Self::ok(delivery, replies.clone()),
            Err(e) => Self::failed(delivery, e),
        }
    }
}

/// `address → outcome`, in the order targets were attempted.
///
/// Serializes as a JSON object keyed by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    entries: Vec<(MacAddress, TargetOutcome)>,
}

impl ExecutionResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for `address`. An address keeps its first outcome.
    pub fn record(&mut self, address: MacAddress, outcome: TargetOutcome) -> bool {
        if self.get(&address).is_some() {
            return false;
        }
        self.entries.push((address, outcome));
        true
    }

    pub fn get(&self, address: &MacAddress) -> Option<&TargetOutcome> {
        self.entries.iter().find(|(a, _)| a == address).map(|(_, o)| o)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MacAddress, &TargetOutcome)> {
        self.entries.iter().map(|(a, o)| (a, o))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|(_, o)| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.entries.iter().all(|(_, o)| o.success)
    }
}

impl Serialize for ExecutionResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (address, outcome) in &self.entries {
            map.serialize_entry(address, outcome)?;
        }
        map.end()
    }
}
