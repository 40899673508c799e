//! Finds the IPv4 address of a virtual machine.
//!
//! The platform's guest agent is the best source, but it is often missing: the agent isn't
//! installed, the machine is off, or the agent only reports link-local addresses. The [Resolver]
//! falls back through a chain of weaker techniques, each tagged with a [Confidence], until one
//! produces an address or all of them fail.
//!
//! Submodules:
//! - [arp] reads the local neighbor table and matches hardware addresses.
//! - [probe] is the seam to the host's networking tools.
//! - [sweep] pings a subnet to populate the neighbor table.
//! - [resolver] runs the chain and manages the power state of stopped machines.
//! - [wake] sends wake-on-LAN magic packets.

pub mod arp;
pub mod probe;
pub mod resolver;
pub mod sweep;
pub mod wake;

use crate::core::machine::MachineId;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[doc(inline)]
pub use resolver::Resolver;

/// A 48-bit hardware (MAC) address.
///
/// Parsing accepts `:` or `-` separators and octets missing their leading zero (as printed by
/// some `arp` implementations). Display is always lowercase and colon separated.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(format!("not a hardware address: {s}"));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(format!("not a hardware address: {s}"));
            }
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| format!("not a hardware address: {s}"))?;
        }
        Ok(MacAddress(octets))
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An IPv4 network in CIDR notation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, String> {
        if prefix > 32 {
            return Err(format!("prefix length out of range: {prefix}"));
        }
        let mask = Self::mask(prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(address) & mask),
            prefix,
        })
    }

    /// The /24 that contains `address`.
    pub fn class_c(address: Ipv4Addr) -> Self {
        let [a, b, c, _] = address.octets();
        Self {
            network: Ipv4Addr::new(a, b, c, 0),
            prefix: 24,
        }
    }

    fn mask(prefix: u8) -> u32 {
        match prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        }
    }

    /// Usable host addresses, in ascending order, excluding the network and broadcast addresses
    /// for prefixes shorter than /31.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network);
        let size: u64 = 1 << (32 - u32::from(self.prefix));
        let (first, last) = match self.prefix {
            31 | 32 => (0, size - 1),
            _ => (1, size - 2),
        };
        (first..=last).map(move |offset| Ipv4Addr::from(base + offset as u32))
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask(self.prefix) == u32::from(self.network)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected CIDR notation: {s}"))?;
        let address: Ipv4Addr = address
            .parse()
            .map_err(|_| format!("invalid network address: {s}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("invalid prefix length: {s}"))?;
        Subnet::new(address, prefix)
    }
}

impl Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// How an address was found, strongest first.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Confidence {
    /// Reported by the platform's guest agent.
    AgentReported,
    /// Remembered from an earlier resolution and confirmed to still respond.
    Cached,
    /// Found in the neighbor table by hardware address.
    ArpMatch,
    /// Found in the neighbor table after a ping sweep.
    PingCorrelated,
    Unresolved,
}

/// Where a machine can be reached.
///
/// `address` is `None` exactly when `confidence` is [Confidence::Unresolved].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MachineLocation {
    pub address: Option<Ipv4Addr>,
    pub confidence: Confidence,
    pub hardware_address: Option<MacAddress>,
}

impl MachineLocation {
    pub fn found(
        address: Ipv4Addr,
        confidence: Confidence,
        hardware_address: Option<MacAddress>,
    ) -> Self {
        Self {
            address: Some(address),
            confidence,
            hardware_address,
        }
    }

    pub fn unresolved(hardware_address: Option<MacAddress>) -> Self {
        Self {
            address: None,
            confidence: Confidence::Unresolved,
            hardware_address,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.address.is_some()
    }
}

/// Returns `true` for addresses that can identify a machine on the local network: IPv4 only, and
/// neither loopback, link-local, unspecified, nor broadcast.
pub fn is_usable(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast())
        }
        IpAddr::V6(_) => false,
    }
}

/// Addresses from earlier in the same run, shared read-only between resolution workers.
#[derive(Clone, Debug, Default)]
pub struct LocationCache {
    addresses: HashMap<MachineId, Ipv4Addr>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, machine: MachineId, address: Ipv4Addr) {
        self.addresses.insert(machine, address);
    }

    pub fn get(&self, machine: &MachineId) -> Option<Ipv4Addr> {
        self.addresses.get(machine).copied()
    }
}

/// The caller's cancellation signal fired.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("cancelled")]
pub struct Cancelled;

/// Races `future` against `token`, returning [Cancelled] if the token fires first.
pub async fn or_cancel<F: Future>(
    future: F,
    token: &CancellationToken,
) -> Result<F::Output, Cancelled> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        output = future => Ok(output),
    }
}
