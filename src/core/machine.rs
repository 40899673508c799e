//! Types describing virtual machines and the broker connections that point at them.

use crate::core::spec::Protocol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Identifies a machine on the virtualization platform: the node that hosts it plus its numeric
/// ID on that node.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct MachineId {
    pub node: String,
    pub vmid: u32,
}

impl MachineId {
    pub fn new(node: impl Into<String>, vmid: u32) -> Self {
        Self {
            node: node.into(),
            vmid,
        }
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.vmid)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl PowerState {
    /// Returns `true` if the machine is known to be off. [PowerState::Unknown] is not.
    pub fn is_off(self) -> bool {
        matches!(self, PowerState::Stopped)
    }
}

/// A machine as listed by the virtualization platform.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct MachineRecord {
    pub id: MachineId,
    pub name: String,
    pub power: PowerState,
    /// Hardware addresses from the machine's network configuration, as reported by the platform.
    pub hardware_addresses: Vec<String>,
}

/// A broker-assigned connection identifier.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct ConnectionId(pub String);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connection that currently exists in the broker.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ActualConnection {
    pub id: ConnectionId,
    pub name: String,
    pub group: Option<String>,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Hex-encoded SHA-256 of the stored secret.
    pub secret_digest: String,
    pub wake_enabled: bool,
    /// The machine this connection was created for, if the broker recorded it.
    pub source_tag: Option<MachineId>,
    pub created: Option<DateTime<Utc>>,
}

impl ActualConnection {
    /// Returns `true` if this connection belongs to `machine`, either by its stored source tag or,
    /// for connections created before tagging, by its name matching one of `names`.
    pub fn belongs_to(&self, machine: &MachineId, names: &[&str]) -> bool {
        match &self.source_tag {
            Some(tag) => tag == machine,
            None => names.contains(&self.name.as_str()),
        }
    }
}
