//! Loads the sync configuration from YAML.
//!
//! Every field is optional. A missing file section takes its defaults wholesale, so an empty
//! document is a valid configuration.

use crate::network::resolver::ResolverOptions;
use crate::network::sweep::SweepOptions;
use crate::network::wake::UdpWake;
use crate::network::Subnet;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Key for encrypting secrets in machine notes. Without one, ciphertext cannot be read and
    /// plaintext is left as it is.
    pub encryption_key: Option<String>,
    pub resolver: ResolverConfig,
    pub wake: WakeConfig,
    pub sync: SyncConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// Machines resolved concurrently.
    pub workers: usize,
    pub auto_start: bool,
    pub boot_wait_secs: u64,
    pub subnets: Vec<Subnet>,
    pub sweep_concurrency: usize,
    pub sweep_host_limit: usize,
    pub ping_timeout_ms: u64,
    pub subnet_timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            auto_start: false,
            boot_wait_secs: 30,
            subnets: Vec::new(),
            sweep_concurrency: 32,
            sweep_host_limit: 254,
            ping_timeout_ms: 1000,
            subnet_timeout_secs: 20,
        }
    }
}

impl ResolverConfig {
    pub fn options(&self) -> ResolverOptions {
        ResolverOptions {
            auto_start: self.auto_start,
            boot_wait: Duration::from_secs(self.boot_wait_secs),
            subnets: self.subnets.clone(),
            sweep: SweepOptions {
                concurrency: self.sweep_concurrency,
                host_limit: self.sweep_host_limit,
                ping_timeout: Duration::from_millis(self.ping_timeout_ms),
                subnet_timeout: Duration::from_secs(self.subnet_timeout_secs),
            },
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WakeConfig {
    pub broadcast: Ipv4Addr,
    pub port: u16,
}

impl Default for WakeConfig {
    fn default() -> Self {
        let udp = UdpWake::default();
        Self {
            broadcast: udp.broadcast,
            port: udp.port,
        }
    }
}

impl WakeConfig {
    pub fn transmitter(&self) -> UdpWake {
        UdpWake {
            broadcast: self.broadcast,
            port: self.port,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Write encrypted secrets back to the notes they came from.
    pub persist_migrations: bool,
    pub pull_orphans_into_notes: bool,
    /// Plan and report, but change nothing.
    pub dry_run: bool,
    /// Value of the `{hostname}` placeholder. Defaults to this machine's short host name.
    pub hostname: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            persist_migrations: true,
            pull_orphans_into_notes: false,
            dry_run: false,
            hostname: None,
        }
    }
}

impl Config {
    /// Returns `$HOME/.config/guacsync/config.yaml`, or [None] if the home directory is unknown.
    pub fn default_path() -> Option<PathBuf> {
        let mut path = home::home_dir()?;
        path.push(".config");
        path.push("guacsync");
        path.push("config.yaml");
        Some(path)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        // An empty document deserializes as unit, not as an empty map.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("invalid configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("failed to load {}", path.display()))
    }
}
