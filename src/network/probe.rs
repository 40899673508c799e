//! The seam between address resolution and the host's networking tools.

use super::arp::{self, Neighbor};
use super::Subnet;
use anyhow::{bail, Context};
use async_trait::async_trait;
use regex::Regex;
use shlex::Quoter;
use std::net::Ipv4Addr;
use std::process::{Output, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Reads neighbor tables and pings hosts.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Returns the current contents of the local neighbor table.
    async fn neighbors(&self) -> anyhow::Result<Vec<Neighbor>>;

    /// Sends a single echo request and reports whether a reply arrived within `timeout`.
    async fn ping(&self, address: Ipv4Addr, timeout: Duration) -> bool;

    /// Returns the /24 around the default gateway, for sweeping when no subnets are configured.
    async fn default_subnet(&self) -> Option<Subnet>;
}

/// The production [Probe]: shells out to `ip`, `arp`, `route`, and `ping`.
#[derive(Clone, Debug, Default)]
pub struct SystemProbe;

#[async_trait]
impl Probe for SystemProbe {
    async fn neighbors(&self) -> anyhow::Result<Vec<Neighbor>> {
        let attempts: [(&str, &[&str]); 3] = [
            ("ip", &["-4", "neigh", "show"]),
            ("arp", &["-an"]),
            ("arp", &["-a"]),
        ];

        let mut last_error = None;
        for (cmd, args) in attempts {
            match output(cmd, args).await {
                Ok(stdout) => {
                    let neighbors = arp::parse_neighbors(&stdout);
                    debug!(command = cmd, entries = neighbors.len(), "read neighbor table");
                    return Ok(neighbors);
                }
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e.context("could not read the neighbor table")),
            None => Ok(Vec::new()),
        }
    }

    async fn ping(&self, address: Ipv4Addr, timeout: Duration) -> bool {
        // `-W` takes whole seconds on Linux.
        let wait = timeout.as_secs().max(1).to_string();
        let status = Command::new("ping")
            .args(["-n", "-q", "-c", "1", "-W", &wait])
            .arg(address.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(timeout + Duration::from_millis(500), status).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }

    async fn default_subnet(&self) -> Option<Subnet> {
        for (cmd, args) in [
            ("ip", &["-4", "route", "show", "default"][..]),
            ("route", &["-n", "get", "default"][..]),
        ] {
            if let Ok(stdout) = output(cmd, args).await {
                if let Some(gateway) = parse_gateway(&stdout) {
                    return Some(Subnet::class_c(gateway));
                }
            }
        }
        None
    }
}

fn gateway_regex() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(r"(?:default via|gateway:)\s+(\d{1,3}(?:\.\d{1,3}){3})")
            .expect("BUG: gateway pattern should compile")
    })
}

/// Extracts the default gateway from `ip route show default` or `route -n get default` output.
pub fn parse_gateway(output: &str) -> Option<Ipv4Addr> {
    gateway_regex().captures(output)?[1].parse().ok()
}

// Runs a command to completion and returns its stdout. Fails if the command can't start or exits
// with an error.
async fn output(cmd: &str, args: &[&str]) -> anyhow::Result<String> {
    let command = || {
        let mut components = vec![cmd];
        components.extend_from_slice(args);
        match Quoter::new().join(components.iter().copied()) {
            Ok(s) => s,
            Err(_) => components.join(" "),
        }
    };

    let Output { status, stdout, .. } = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to start command: {}", command()))?;

    if !status.success() {
        let error = match status.code() {
            Some(i) => format!("exit code {i}"),
            None => "error".to_string(),
        };
        bail!("command exited with {error}: {}", command());
    }
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}
